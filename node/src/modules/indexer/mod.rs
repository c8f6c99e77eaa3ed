//! Value store interface.
//!
//! The value store is the component that answers "who can serve this
//! multihash?". Ingestion only needs three operations from it: `put`,
//! `remove`, and `size`. A memory-backed implementation is provided for
//! embedding and tests; production deployments plug in their own backend.

use errors::AppError;
use libp2p::PeerId;
use multihash::Multihash;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};
use tracing::debug;

/// The payload stored against each multihash.
///
/// Two values are considered the same mapping when their provider and context
/// ID match; metadata is an opaque payload carried along and replaced on
/// re-put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexValue {
    /// Identity of the provider that can serve the content.
    pub provider: PeerId,
    /// Provider-chosen grouping key for this batch of content.
    pub context_id: Vec<u8>,
    /// Opaque retrieval metadata.
    pub metadata: Vec<u8>,
}

impl IndexValue {
    /// Whether `other` refers to the same (provider, context) mapping.
    pub fn same_mapping(&self, other: &IndexValue) -> bool {
        self.provider == other.provider && self.context_id == other.context_id
    }
}

/// Errors surfaced by value store implementations.
#[derive(Debug, thiserror::Error)]
pub enum ValueStoreError {
    #[error("Value store error: {0}")]
    Storage(String),
}

impl From<ValueStoreError> for AppError {
    fn from(err: ValueStoreError) -> Self {
        AppError::Storage(Box::new(err))
    }
}

/// Storage of multihash → provider mappings.
pub trait ValueStore: Send + Sync {
    /// Associate `value` with every multihash in `mhs`.
    fn put(&self, mhs: &[Multihash<64>], value: &IndexValue) -> Result<(), ValueStoreError>;

    /// Remove the mapping matching `value` from every multihash in `mhs`.
    /// Removing an absent mapping is a no-op.
    fn remove(&self, mhs: &[Multihash<64>], value: &IndexValue) -> Result<(), ValueStoreError>;

    /// Approximate number of stored multihash entries.
    fn size(&self) -> Result<u64, ValueStoreError>;
}

/// In-memory [`ValueStore`].
///
/// Keeps an exact entry count so `size` is cheap.
#[derive(Default)]
pub struct MemoryValueStore {
    entries: RwLock<HashMap<Multihash<64>, Vec<IndexValue>>>,
    count: AtomicU64,
}

impl MemoryValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values currently associated with `mh`.
    pub fn get(&self, mh: &Multihash<64>) -> Vec<IndexValue> {
        self.entries
            .read()
            .expect("value store lock poisoned")
            .get(mh)
            .cloned()
            .unwrap_or_default()
    }
}

impl ValueStore for MemoryValueStore {
    fn put(&self, mhs: &[Multihash<64>], value: &IndexValue) -> Result<(), ValueStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ValueStoreError::Storage("lock poisoned".to_string()))?;

        for mh in mhs {
            let values = entries.entry(*mh).or_insert_with(|| {
                self.count.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            });
            match values.iter_mut().find(|v| v.same_mapping(value)) {
                Some(existing) => existing.metadata = value.metadata.clone(),
                None => values.push(value.clone()),
            }
        }

        debug!(count = mhs.len(), provider = %value.provider, "Stored multihash mappings");
        Ok(())
    }

    fn remove(&self, mhs: &[Multihash<64>], value: &IndexValue) -> Result<(), ValueStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ValueStoreError::Storage("lock poisoned".to_string()))?;

        for mh in mhs {
            if let Some(values) = entries.get_mut(mh) {
                values.retain(|v| !v.same_mapping(value));
                if values.is_empty() {
                    entries.remove(mh);
                    self.count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        Ok(())
    }

    fn size(&self) -> Result<u64, ValueStoreError> {
        Ok(self.count.load(Ordering::Relaxed))
    }
}
