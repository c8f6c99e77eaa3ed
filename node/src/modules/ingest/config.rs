use crate::modules::ingest::error::IngestError;
use crate::modules::ingest::subscriber::RecursionLimit;
use crate::utils::env::{env_duration_secs, env_string, env_u64, env_usize};
use std::time::Duration;

/// Configuration for the ingestion subsystem, consumed at startup.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Gossip topic advertisements are announced on.
    pub pubsub_topic: String,

    /// Default recursion limit for advertisement-chain traversal.
    /// `0` means unlimited.
    pub ad_depth_limit: u64,

    /// Recursion limit for entry-chunk traversal. `0` means unlimited.
    pub entries_depth_limit: u64,

    /// Per-sync deadline.
    pub sync_timeout: Duration,

    /// Worker pool size. Startup fails if zero.
    pub ingest_worker_count: usize,

    /// Value-store write batch size.
    pub store_batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            pubsub_topic: "/indexer/ingest/mainnet".to_string(),
            ad_depth_limit: 33_554_432,
            entries_depth_limit: 65_536,
            sync_timeout: Duration::from_secs(2 * 60 * 60),
            ingest_worker_count: 10,
            store_batch_size: 4096,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pubsub_topic: env_string("INGEST_PUBSUB_TOPIC", &defaults.pubsub_topic),
            ad_depth_limit: env_u64("INGEST_AD_DEPTH_LIMIT", defaults.ad_depth_limit),
            entries_depth_limit: env_u64("INGEST_ENTRIES_DEPTH_LIMIT", defaults.entries_depth_limit),
            sync_timeout: env_duration_secs(
                "INGEST_SYNC_TIMEOUT_SECS",
                defaults.sync_timeout.as_secs(),
            ),
            ingest_worker_count: env_usize(
                "INGEST_WORKER_COUNT",
                defaults.ingest_worker_count,
            ),
            store_batch_size: env_usize("INGEST_STORE_BATCH_SIZE", defaults.store_batch_size),
        }
    }

    /// Validate startup invariants.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.ingest_worker_count == 0 {
            return Err(IngestError::BadArgument(
                "ingest worker count must be > 0".to_string(),
            ));
        }
        if self.store_batch_size == 0 {
            return Err(IngestError::BadArgument(
                "store batch size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Recursion limit for advertisement-chain traversal.
    pub fn ad_recursion_limit(&self) -> RecursionLimit {
        RecursionLimit::from_depth(self.ad_depth_limit)
    }

    /// Recursion limit for entry-chunk traversal.
    pub fn entries_recursion_limit(&self) -> RecursionLimit {
        RecursionLimit::from_depth(self.entries_depth_limit)
    }
}
