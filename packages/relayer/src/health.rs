//! Per-chain, per-component health
//!
//! Components report state changes over an unbounded channel; a single
//! registry task folds them into a [`HealthSnapshot`] published through a
//! `watch` channel, which the API and the coordinator read.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::types::ChainId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded(String),
    Halted(String),
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }

    fn severity(&self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Degraded(_) => 1,
            HealthState::Halted(_) => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Watcher,
    Router,
    Submitter,
    Tracker,
    Executor,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Watcher => "watcher",
            Component::Router => "router",
            Component::Submitter => "submitter",
            Component::Tracker => "tracker",
            Component::Executor => "executor",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthUpdate {
    pub chain_id: ChainId,
    pub component: Component,
    pub state: HealthState,
}

/// Handle a component uses to report its health
#[derive(Debug, Clone)]
pub struct HealthReporter {
    chain_id: ChainId,
    tx: Option<mpsc::UnboundedSender<HealthUpdate>>,
}

impl HealthReporter {
    /// A reporter whose updates go nowhere
    pub fn disconnected(chain_id: ChainId) -> Self {
        Self { chain_id, tx: None }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn report(&self, component: Component, state: HealthState) {
        if let Some(tx) = &self.tx {
            // The registry outlives every component; a closed channel only
            // happens during shutdown.
            let _ = tx.send(HealthUpdate {
                chain_id: self.chain_id,
                component,
                state,
            });
        }
    }

    pub fn healthy(&self, component: Component) {
        self.report(component, HealthState::Healthy);
    }

    pub fn degraded(&self, component: Component, reason: impl Into<String>) {
        self.report(component, HealthState::Degraded(reason.into()));
    }

    pub fn halted(&self, component: Component, reason: impl Into<String>) {
        self.report(component, HealthState::Halted(reason.into()));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainHealth {
    pub components: BTreeMap<Component, HealthState>,
}

impl ChainHealth {
    /// Worst state across components
    pub fn overall(&self) -> HealthState {
        self.components
            .values()
            .max_by_key(|s| s.severity())
            .cloned()
            .unwrap_or(HealthState::Healthy)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub chains: BTreeMap<ChainId, ChainHealth>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.chains.values().all(|c| c.overall().is_healthy())
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&ChainHealth> {
        self.chains.get(&chain_id)
    }

    /// Apply an update; returns true if anything changed
    pub fn apply(&mut self, update: HealthUpdate) -> bool {
        let chain = self.chains.entry(update.chain_id).or_default();
        // Halted is sticky until the unit is restarted
        if let Some(HealthState::Halted(_)) = chain.components.get(&update.component) {
            if !matches!(update.state, HealthState::Halted(_)) {
                return false;
            }
        }
        chain.components.insert(update.component, update.state.clone()) != Some(update.state)
    }
}

/// Collects health updates and publishes snapshots
pub struct HealthRegistry {
    tx: mpsc::UnboundedSender<HealthUpdate>,
    rx: mpsc::UnboundedReceiver<HealthUpdate>,
    snapshot: watch::Sender<HealthSnapshot>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(HealthSnapshot::default());
        Self { tx, rx, snapshot }
    }

    pub fn reporter(&self, chain_id: ChainId) -> HealthReporter {
        // Register the chain so it shows up before its first report
        self.snapshot.send_modify(|s| {
            s.chains.entry(chain_id).or_default();
        });
        HealthReporter {
            chain_id,
            tx: Some(self.tx.clone()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.snapshot.subscribe()
    }

    /// Fold updates until every reporter is dropped
    pub async fn run(self) {
        let HealthRegistry {
            tx,
            mut rx,
            snapshot,
        } = self;
        drop(tx);

        while let Some(update) = rx.recv().await {
            let chain_id = update.chain_id;
            let component = update.component;
            match &update.state {
                HealthState::Healthy => {
                    debug!(chain_id = %chain_id, %component, "Component healthy")
                }
                HealthState::Degraded(reason) => {
                    warn!(chain_id = %chain_id, %component, reason = %reason, "Component degraded")
                }
                HealthState::Halted(reason) => {
                    error!(chain_id = %chain_id, %component, reason = %reason, "Component halted")
                }
            }

            snapshot.send_if_modified(|s| {
                let changed = s.apply(update);
                if changed {
                    if let Some(chain) = s.chain(chain_id) {
                        metrics::set_chain_health(chain_id, &chain.overall());
                    }
                }
                changed
            });
        }

        info!("Health registry stopped");
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_is_worst_component() {
        let mut snapshot = HealthSnapshot::default();
        snapshot.apply(HealthUpdate {
            chain_id: ChainId(1),
            component: Component::Watcher,
            state: HealthState::Healthy,
        });
        assert!(snapshot.is_healthy());

        snapshot.apply(HealthUpdate {
            chain_id: ChainId(1),
            component: Component::Tracker,
            state: HealthState::Degraded("rpc down".into()),
        });
        assert_eq!(
            snapshot.chain(ChainId(1)).unwrap().overall(),
            HealthState::Degraded("rpc down".into())
        );
        assert!(!snapshot.is_healthy());
    }

    #[test]
    fn test_halted_is_sticky() {
        let mut snapshot = HealthSnapshot::default();
        let halt = HealthUpdate {
            chain_id: ChainId(2),
            component: Component::Watcher,
            state: HealthState::Halted("reorg".into()),
        };
        assert!(snapshot.apply(halt));
        assert!(!snapshot.apply(HealthUpdate {
            chain_id: ChainId(2),
            component: Component::Watcher,
            state: HealthState::Healthy,
        }));
        assert!(matches!(
            snapshot.chain(ChainId(2)).unwrap().overall(),
            HealthState::Halted(_)
        ));
    }

    #[tokio::test]
    async fn test_registry_publishes_updates() {
        let registry = HealthRegistry::new();
        let reporter = registry.reporter(ChainId(3));
        let mut rx = registry.subscribe();
        let handle = tokio::spawn(registry.run());

        reporter.degraded(Component::Executor, "slow");
        rx.changed().await.unwrap();
        assert!(!rx.borrow().is_healthy());

        drop(reporter);
        handle.await.unwrap();
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut snapshot = HealthSnapshot::default();
        snapshot.apply(HealthUpdate {
            chain_id: ChainId(5),
            component: Component::Watcher,
            state: HealthState::Degraded("x".into()),
        });
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["chains"]["5"]["components"]["watcher"]["status"], "degraded");
    }
}
