//! Wires watchers, routers and destination pipelines together
//!
//! Every source chain gets an [`EventWatcher`] feeding a router task over a
//! bounded channel; the router fans records out by destination chain over
//! unbounded channels, so a stalled destination never blocks a source.
//! Every destination chain gets a [`DestinationPipeline`]. Each of these is a
//! separately supervised task: one failing is reported and logged while the
//! rest keep running.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{RelayerError, Result};
use crate::health::{Component, HealthRegistry, HealthReporter, HealthSnapshot};
use crate::metrics;
use crate::pipeline::{DestinationPipeline, PipelineConfig, PipelineStats};
use crate::shutdown;
use crate::types::{ChainDescriptor, ChainId, DepositRecord};
use crate::watchers::{EventWatcher, WatcherConfig, WatcherStatus};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub watcher: WatcherConfig,
    pub pipeline: PipelineConfig,
    /// Capacity of each watcher → router channel
    pub deposit_buffer: usize,
    /// How long units get to stop before they are aborted
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            watcher: WatcherConfig::default(),
            pipeline: PipelineConfig::default(),
            deposit_buffer: 1_024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// A supervised task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Watcher(ChainId),
    Router(ChainId),
    Pipeline(ChainId),
}

impl Unit {
    pub fn chain_id(&self) -> ChainId {
        match self {
            Unit::Watcher(id) | Unit::Router(id) | Unit::Pipeline(id) => *id,
        }
    }

    fn component(&self) -> Component {
        match self {
            Unit::Watcher(_) => Component::Watcher,
            Unit::Router(_) => Component::Router,
            // Pipeline-level failures are attributed to its submitter
            Unit::Pipeline(_) => Component::Submitter,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Watcher(id) => write!(f, "watcher[{}]", id),
            Unit::Router(id) => write!(f, "router[{}]", id),
            Unit::Pipeline(id) => write!(f, "pipeline[{}]", id),
        }
    }
}

/// Live progress receivers for every unit, read by the status endpoint
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    watchers: BTreeMap<ChainId, watch::Receiver<WatcherStatus>>,
    pipelines: BTreeMap<ChainId, watch::Receiver<PipelineStats>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub watchers: BTreeMap<ChainId, WatcherStatus>,
    pub pipelines: BTreeMap<ChainId, PipelineStats>,
}

impl StatusBoard {
    pub fn snapshot(&self) -> StatusReport {
        StatusReport {
            watchers: self
                .watchers
                .iter()
                .map(|(id, rx)| (*id, rx.borrow().clone()))
                .collect(),
            pipelines: self
                .pipelines
                .iter()
                .map(|(id, rx)| (*id, rx.borrow().clone()))
                .collect(),
        }
    }
}

type UnitResult = (Unit, Result<()>);

pub struct Coordinator {
    units: JoinSet<UnitResult>,
    stops: HashMap<ChainId, watch::Sender<bool>>,
    reporters: HashMap<ChainId, HealthReporter>,
    health: watch::Receiver<HealthSnapshot>,
    registry: Option<JoinHandle<()>>,
    status: StatusBoard,
    shutdown_timeout: Duration,
}

fn spawn_unit<F>(units: &mut JoinSet<UnitResult>, unit: Unit, task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    units.spawn(async move {
        let result = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(RelayerError::TaskFailed(format!("{} panicked", unit))),
        };
        (unit, result)
    });
}

/// Fan one source chain's deposits out to destination pipelines
async fn route(
    source: ChainId,
    mut deposits: mpsc::Receiver<DepositRecord>,
    routes: HashMap<ChainId, mpsc::UnboundedSender<DepositRecord>>,
    store: Arc<dyn CheckpointStore>,
    health: HealthReporter,
) -> Result<()> {
    health.healthy(Component::Router);

    while let Some(record) = deposits.recv().await {
        let destination = record.destination_chain_id;
        let nonce = record.deposit_nonce;
        match routes.get(&destination) {
            Some(tx) => {
                if tx.send(record).is_err() {
                    warn!(
                        source_chain = %source,
                        dest_chain = %destination,
                        nonce,
                        "Destination pipeline stopped, deposit left pending"
                    );
                    metrics::record_unrouted_deposit(source, destination);
                }
            }
            None => {
                warn!(
                    source_chain = %source,
                    dest_chain = %destination,
                    nonce,
                    "No pipeline for destination chain, dropping deposit"
                );
                metrics::record_unrouted_deposit(source, destination);
                if let Err(e) = store.complete_deposit(&record.proposal_key()).await {
                    warn!(
                        source_chain = %source,
                        nonce,
                        error = %e,
                        "Failed to clear pending deposit"
                    );
                    metrics::record_error(source, "persistence");
                }
            }
        }
    }

    debug!(source_chain = %source, "Router stopped");
    Ok(())
}

fn report_exit(unit: Unit, result: Result<()>, reporters: &HashMap<ChainId, HealthReporter>) {
    match result {
        Ok(()) => info!(%unit, "Unit stopped"),
        Err(e) => {
            error!(%unit, error = %e, "Unit failed");
            metrics::record_error(unit.chain_id(), e.kind());
            if let Some(reporter) = reporters.get(&unit.chain_id()) {
                reporter.halted(unit.component(), e.to_string());
            }
        }
    }
}

impl Coordinator {
    /// Spawn every unit. Must be called from within a tokio runtime.
    pub fn start(
        chains: Vec<ChainDescriptor>,
        store: Arc<dyn CheckpointStore>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for chain in &chains {
            if !seen.insert(chain.chain_id) {
                return Err(RelayerError::Config(format!(
                    "duplicate chain id {}",
                    chain.chain_id
                )));
            }
        }

        let registry = HealthRegistry::new();
        let mut reporters = HashMap::new();
        let mut stops = HashMap::new();
        let mut stop_rxs = HashMap::new();
        for chain in &chains {
            reporters.insert(chain.chain_id, registry.reporter(chain.chain_id));
            let (tx, rx) = watch::channel(false);
            stops.insert(chain.chain_id, tx);
            stop_rxs.insert(chain.chain_id, rx);
        }
        let health = registry.subscribe();

        let mut units = JoinSet::new();
        let mut status = StatusBoard::default();
        let mut routes = HashMap::new();

        for chain in chains.iter().filter(|c| c.role.is_destination()) {
            let id = chain.chain_id;
            let (tx, rx) = mpsc::unbounded_channel();
            routes.insert(id, tx);

            let pipeline = DestinationPipeline::new(
                chain,
                config.pipeline.clone(),
                store.clone(),
                reporters[&id].clone(),
            );
            status.pipelines.insert(id, pipeline.stats());
            spawn_unit(
                &mut units,
                Unit::Pipeline(id),
                pipeline.run(rx, stop_rxs[&id].clone()),
            );
        }

        for chain in chains.iter().filter(|c| c.role.is_source()) {
            let id = chain.chain_id;
            let (tx, rx) = mpsc::channel(config.deposit_buffer.max(1));

            let watcher = EventWatcher::new(
                chain,
                store.clone(),
                config.watcher.clone(),
                reporters[&id].clone(),
            );
            status.watchers.insert(id, watcher.status());
            spawn_unit(
                &mut units,
                Unit::Watcher(id),
                watcher.run(tx, stop_rxs[&id].clone()),
            );
            spawn_unit(
                &mut units,
                Unit::Router(id),
                route(id, rx, routes.clone(), store.clone(), reporters[&id].clone()),
            );
        }

        info!(
            chains = chains.len(),
            sources = status.watchers.len(),
            destinations = status.pipelines.len(),
            "Coordinator started"
        );

        Ok(Self {
            units,
            stops,
            reporters,
            health,
            registry: Some(tokio::spawn(registry.run())),
            status,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn health(&self) -> watch::Receiver<HealthSnapshot> {
        self.health.clone()
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    /// Units still running
    pub fn running(&self) -> usize {
        self.units.len()
    }

    /// Tear down every unit of one chain; the rest keep running
    pub fn stop_chain(&self, chain_id: ChainId) -> bool {
        match self.stops.get(&chain_id) {
            Some(stop) => {
                info!(chain_id = %chain_id, "Stopping chain units");
                stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Supervise units until shutdown is requested or all of them exit
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown::requested(&mut shutdown) => {
                    info!("Shutdown requested, stopping all units");
                    break;
                }
                joined = self.units.join_next() => match joined {
                    Some(Ok((unit, result))) => report_exit(unit, result, &self.reporters),
                    Some(Err(e)) => error!(error = %e, "Unit task aborted"),
                    None => {
                        info!("All units exited");
                        break;
                    }
                },
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Signal every unit, wait for in-flight work, then abort stragglers
    async fn drain(mut self) {
        for stop in self.stops.values() {
            stop.send_replace(true);
        }

        let timeout = self.shutdown_timeout;
        let Coordinator {
            units, reporters, ..
        } = &mut self;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = units.join_next().await {
                match joined {
                    Ok((unit, result)) => report_exit(unit, result, reporters),
                    Err(e) => error!(error = %e, "Unit task aborted"),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.units.len(),
                "Units did not stop in time, aborting"
            );
            self.units.shutdown().await;
        }

        // The registry exits once every reporter is gone
        self.reporters.clear();
        if let Some(registry) = self.registry.take() {
            if tokio::time::timeout(Duration::from_secs(5), registry)
                .await
                .is_err()
            {
                warn!("Health registry did not stop in time");
            }
        }
        info!("Coordinator stopped");
    }
}
