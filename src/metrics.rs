use metrics::{describe_counter, describe_gauge, gauge, increment_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::consensus::types::RoundStepType;

static COMMITTED_BLOCKS: AtomicU64 = AtomicU64::new(0);
static LAST_COMMITTED_HEIGHT: AtomicU64 = AtomicU64::new(0);
static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static DROPPED_MESSAGES: AtomicU64 = AtomicU64::new(0);
static EVIDENCE_ADDED: AtomicU64 = AtomicU64::new(0);

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

pub fn init_metrics() {
    START_TIME.get_or_init(Instant::now);

    describe_counter!("reimint_committed_blocks_total", "Blocks committed by this node");
    describe_gauge!("reimint_height", "Current consensus height");
    describe_gauge!("reimint_round", "Current consensus round");
    describe_counter!("reimint_step_transitions_total", "Round step transitions by step");
    describe_counter!("reimint_timeouts_total", "Timeouts handled by step");
    describe_counter!("reimint_dropped_messages_total", "Messages shed by a full state machine queue");
    describe_counter!("reimint_evidence_added_total", "Evidence accepted into the pool");
}

/// Serves the Prometheus scrape endpoint. Must run inside a tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

pub fn record_committed_block(height: u64) {
    COMMITTED_BLOCKS.fetch_add(1, Ordering::SeqCst);
    LAST_COMMITTED_HEIGHT.fetch_max(height, Ordering::SeqCst);
    increment_counter!("reimint_committed_blocks_total");
}

pub fn record_height_round(height: u64, round: u32) {
    gauge!("reimint_height", height as f64);
    gauge!("reimint_round", f64::from(round));
}

pub fn record_step(step: RoundStepType) {
    increment_counter!("reimint_step_transitions_total", "step" => step.as_str());
}

pub fn record_timeout(step: RoundStepType) {
    TIMEOUTS.fetch_add(1, Ordering::SeqCst);
    increment_counter!("reimint_timeouts_total", "step" => step.as_str());
}

pub fn record_dropped_message() {
    DROPPED_MESSAGES.fetch_add(1, Ordering::SeqCst);
    increment_counter!("reimint_dropped_messages_total");
}

pub fn record_evidence_added() {
    EVIDENCE_ADDED.fetch_add(1, Ordering::SeqCst);
    increment_counter!("reimint_evidence_added_total");
}

pub fn get_metrics() -> serde_json::Value {
    let uptime = START_TIME.get().map_or(0, |start| start.elapsed().as_secs());

    serde_json::json!({
        "committed_blocks": COMMITTED_BLOCKS.load(Ordering::SeqCst),
        "last_committed_height": LAST_COMMITTED_HEIGHT.load(Ordering::SeqCst),
        "timeouts": TIMEOUTS.load(Ordering::SeqCst),
        "dropped_messages": DROPPED_MESSAGES.load(Ordering::SeqCst),
        "evidence_added": EVIDENCE_ADDED.load(Ordering::SeqCst),
        "uptime_seconds": uptime
    })
}
