use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the process-wide Prometheus recorder. Idempotent; callers that
/// embed the core into a larger service with its own recorder can skip this.
pub fn install_recorder() -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| anyhow!("failed to initialise prometheus recorder: {err}"))?;
    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Counters owned by one sessionizer instance. Exported with delta
/// semantics: each `export` drains the counters into the `metrics` facade
/// under the configured prefix.
#[derive(Debug, Default)]
pub struct JoinStats {
    loglines_total: AtomicU64,
    loglines_invalid: AtomicU64,
    joined_sessions: AtomicU64,
    joined_queries: AtomicU64,
    joined_item_visits: AtomicU64,
}

impl JoinStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_loglines_total(&self) {
        self.loglines_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_loglines_invalid(&self) {
        self.loglines_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_joined_sessions(&self) {
        self.joined_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Incremented by join targets, one per joined query.
    pub fn add_joined_queries(&self, count: u64) {
        self.joined_queries.fetch_add(count, Ordering::Relaxed);
    }

    /// Incremented by join targets, one per joined item visit.
    pub fn add_joined_item_visits(&self, count: u64) {
        self.joined_item_visits.fetch_add(count, Ordering::Relaxed);
    }

    pub fn loglines_total(&self) -> u64 {
        self.loglines_total.load(Ordering::Relaxed)
    }

    pub fn loglines_invalid(&self) -> u64 {
        self.loglines_invalid.load(Ordering::Relaxed)
    }

    pub fn joined_sessions(&self) -> u64 {
        self.joined_sessions.load(Ordering::Relaxed)
    }

    pub fn joined_queries(&self) -> u64 {
        self.joined_queries.load(Ordering::Relaxed)
    }

    pub fn joined_item_visits(&self) -> u64 {
        self.joined_item_visits.load(Ordering::Relaxed)
    }

    /// Registers counter descriptions under `prefix`.
    pub fn describe(prefix: &str) {
        describe_counter!(
            format!("{prefix}_loglines_total"),
            "Total number of log lines offered to the sessionizer."
        );
        describe_counter!(
            format!("{prefix}_loglines_invalid"),
            "Log lines or stored event records that failed to parse."
        );
        describe_counter!(
            format!("{prefix}_joined_sessions"),
            "Sessions finalized and handed to the join target."
        );
        describe_counter!(
            format!("{prefix}_joined_queries"),
            "Query events joined by the target."
        );
        describe_counter!(
            format!("{prefix}_joined_item_visits"),
            "Item visit events joined by the target."
        );
    }

    /// Drains every counter and feeds the deltas to the `metrics` facade.
    pub fn export(&self, prefix: &str) {
        for (name, cell) in [
            ("loglines_total", &self.loglines_total),
            ("loglines_invalid", &self.loglines_invalid),
            ("joined_sessions", &self.joined_sessions),
            ("joined_queries", &self.joined_queries),
            ("joined_item_visits", &self.joined_item_visits),
        ] {
            let delta = cell.swap(0, Ordering::Relaxed);
            counter!(format!("{prefix}_{name}"), delta);
        }
    }
}
