use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters accumulated across pipeline runs.
#[derive(Default, Debug)]
pub struct Telemetry {
    runs: AtomicU64,
    documents_fetched: AtomicU64,
    entities_skipped: AtomicU64,
    rate_limit_retries: AtomicU64,
    malformed_cells: AtomicU64,
    skipped_pivot_cells: AtomicU64,
}

impl Telemetry {
    pub fn record_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_documents_fetched(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.documents_fetched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_entities_skipped(&self, count: u64) {
        self.entities_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rate_limit_retries(&self, count: u64) {
        self.rate_limit_retries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_malformed_cells(&self, count: u64) {
        self.malformed_cells.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_skipped_pivot_cells(&self, count: u64) {
        self.skipped_pivot_cells.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            documents_fetched: self.documents_fetched.load(Ordering::Relaxed),
            entities_skipped: self.entities_skipped.load(Ordering::Relaxed),
            rate_limit_retries: self.rate_limit_retries.load(Ordering::Relaxed),
            malformed_cells: self.malformed_cells.load(Ordering::Relaxed),
            skipped_pivot_cells: self.skipped_pivot_cells.load(Ordering::Relaxed),
        }
    }

    pub fn log_snapshot(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "censustab::metrics",
            runs = snapshot.runs,
            documents_fetched = snapshot.documents_fetched,
            entities_skipped = snapshot.entities_skipped,
            rate_limit_retries = snapshot.rate_limit_retries,
            malformed_cells = snapshot.malformed_cells,
            skipped_pivot_cells = snapshot.skipped_pivot_cells,
            "pipeline metrics snapshot"
        );
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub runs: u64,
    pub documents_fetched: u64,
    pub entities_skipped: u64,
    pub rate_limit_retries: u64,
    pub malformed_cells: u64,
    pub skipped_pivot_cells: u64,
}
