use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Counters and gauges for the ingestion subsystem.
#[derive(Clone, Default)]
pub struct IngestMetrics {
    pub ads_processed: Arc<AtomicU64>,
    pub ads_failed: Arc<AtomicU64>,
    pub multihashes_indexed: Arc<AtomicU64>,
    pub multihashes_removed: Arc<AtomicU64>,
    /// Last observed value-store size, refreshed by the metrics ticker.
    pub value_store_size: Arc<AtomicU64>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_store_size(&self, size: u64) {
        self.value_store_size.store(size, Ordering::Relaxed);
        info!(value_store_size = size, "Value store size updated");
    }

    pub fn report(&self) {
        info!(
            ads_processed = self.ads_processed.load(Ordering::Relaxed),
            ads_failed = self.ads_failed.load(Ordering::Relaxed),
            multihashes_indexed = self.multihashes_indexed.load(Ordering::Relaxed),
            multihashes_removed = self.multihashes_removed.load(Ordering::Relaxed),
            value_store_size = self.value_store_size.load(Ordering::Relaxed),
            "Ingest metrics"
        );
    }
}
