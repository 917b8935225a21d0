//! Prometheus metrics for the bridge relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge,
    GaugeVec, TextEncoder,
};

use crate::health::HealthState;
use crate::types::ChainId;

lazy_static! {
    // Block processing metrics
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "bridge_relayer_blocks_processed_total",
        "Total number of confirmed blocks processed",
        &["chain"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "bridge_relayer_latest_confirmed_block",
        "Latest confirmed block height processed",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "bridge_relayer_chain_head",
        "Latest block height observed on the subscription",
        &["chain"]
    ).unwrap();

    // Deposit metrics
    pub static ref DEPOSITS_DETECTED: CounterVec = register_counter_vec!(
        "bridge_relayer_deposits_detected_total",
        "Total number of confirmed deposit events emitted",
        &["chain"]
    ).unwrap();

    pub static ref DEPOSITS_UNROUTED: CounterVec = register_counter_vec!(
        "bridge_relayer_deposits_unrouted_total",
        "Deposits dropped because their destination chain is not configured",
        &["source", "destination"]
    ).unwrap();

    // Transaction metrics
    pub static ref VOTES_SUBMITTED: CounterVec = register_counter_vec!(
        "bridge_relayer_votes_submitted_total",
        "Vote submissions by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref EXECUTIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "bridge_relayer_executions_submitted_total",
        "Execute submissions by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref TX_CONFIRMATIONS: CounterVec = register_counter_vec!(
        "bridge_relayer_tx_confirmations_total",
        "Final status of submitted transactions",
        &["chain", "kind", "status"]
    ).unwrap();

    // Proposal tracking
    pub static ref TRACKED_PROPOSALS: GaugeVec = register_gauge_vec!(
        "bridge_relayer_tracked_proposals",
        "Number of proposals being tracked",
        &["chain"]
    ).unwrap();

    pub static ref PROPOSAL_TRANSITIONS: CounterVec = register_counter_vec!(
        "bridge_relayer_proposal_transitions_total",
        "Observed proposal status transitions",
        &["chain", "status"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "bridge_relayer_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "bridge_relayer_consecutive_failures",
        "Number of consecutive failures (circuit breaker)",
        &["chain", "component"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "bridge_relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();

    pub static ref CHAIN_HEALTH: GaugeVec = register_gauge_vec!(
        "bridge_relayer_chain_health",
        "Per-chain health: 0 healthy, 1 degraded, 2 halted",
        &["chain"]
    ).unwrap();
}

fn label(chain: ChainId) -> String {
    chain.to_string()
}

/// Record a processed range of confirmed blocks
pub fn record_blocks_processed(chain: ChainId, count: u64, latest: u64) {
    let chain = label(chain);
    BLOCKS_PROCESSED
        .with_label_values(&[chain.as_str()])
        .inc_by(count as f64);
    LATEST_BLOCK
        .with_label_values(&[chain.as_str()])
        .set(latest as f64);
}

pub fn set_chain_head(chain: ChainId, height: u64) {
    CHAIN_HEAD
        .with_label_values(&[label(chain).as_str()])
        .set(height as f64);
}

/// Record a deposit detected
pub fn record_deposit_detected(chain: ChainId) {
    DEPOSITS_DETECTED.with_label_values(&[label(chain).as_str()]).inc();
}

pub fn record_unrouted_deposit(source: ChainId, destination: ChainId) {
    DEPOSITS_UNROUTED
        .with_label_values(&[label(source).as_str(), label(destination).as_str()])
        .inc();
}

/// Record a vote submission outcome (`submitted`, `duplicate`, `already_final`, `failed`)
pub fn record_vote(chain: ChainId, outcome: &str) {
    VOTES_SUBMITTED
        .with_label_values(&[label(chain).as_str(), outcome])
        .inc();
}

/// Record an execute submission outcome
pub fn record_execution(chain: ChainId, outcome: &str) {
    EXECUTIONS_SUBMITTED
        .with_label_values(&[label(chain).as_str(), outcome])
        .inc();
}

pub fn record_tx_confirmation(chain: ChainId, kind: &str, status: &str) {
    TX_CONFIRMATIONS
        .with_label_values(&[label(chain).as_str(), kind, status])
        .inc();
}

pub fn set_tracked_proposals(chain: ChainId, count: usize) {
    TRACKED_PROPOSALS
        .with_label_values(&[label(chain).as_str()])
        .set(count as f64);
}

pub fn record_proposal_transition(chain: ChainId, status: &str) {
    PROPOSAL_TRANSITIONS
        .with_label_values(&[label(chain).as_str(), status])
        .inc();
}

/// Record an error
pub fn record_error(chain: ChainId, error_type: &str) {
    ERRORS.with_label_values(&[label(chain).as_str(), error_type]).inc();
}

/// Update consecutive failures (circuit breaker)
pub fn set_consecutive_failures(chain: ChainId, component: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[label(chain).as_str(), component])
        .set(count as f64);
}

pub fn set_chain_health(chain: ChainId, state: &HealthState) {
    let value = match state {
        HealthState::Healthy => 0.0,
        HealthState::Degraded(_) => 1.0,
        HealthState::Halted(_) => 2.0,
    };
    CHAIN_HEALTH.with_label_values(&[label(chain).as_str()]).set(value);
}

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
