//! Batched writes against the value store.
//!
//! One writer exists per advertisement being ingested. Multihashes are
//! buffered and applied in chunks of the configured batch size; any error
//! aborts the advertisement (its processed flag is never set, so a later
//! sync retries).

use crate::modules::indexer::{IndexValue, ValueStore};
use crate::modules::ingest::error::IngestError;
use multihash::Multihash;
use tracing::debug;

pub struct IndexerWriter<'a> {
    store: &'a dyn ValueStore,
    value: IndexValue,
    remove: bool,
    batch_size: usize,
    pending: Vec<Multihash<64>>,
    written: usize,
}

impl<'a> IndexerWriter<'a> {
    pub fn new(
        store: &'a dyn ValueStore,
        value: IndexValue,
        remove: bool,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            value,
            remove,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            written: 0,
        }
    }

    /// Queue multihashes, flushing every full batch.
    pub fn push(&mut self, multihashes: Vec<Multihash<64>>) -> Result<(), IngestError> {
        self.pending.extend(multihashes);
        while self.pending.len() >= self.batch_size {
            let rest = self.pending.split_off(self.batch_size);
            let batch = std::mem::replace(&mut self.pending, rest);
            self.apply(&batch)?;
        }
        Ok(())
    }

    /// Write any remainder and return the total number of multihashes
    /// applied.
    pub fn flush(&mut self) -> Result<usize, IngestError> {
        if !self.pending.is_empty() {
            let batch = std::mem::take(&mut self.pending);
            self.apply(&batch)?;
        }
        Ok(self.written)
    }

    fn apply(&mut self, batch: &[Multihash<64>]) -> Result<(), IngestError> {
        if self.remove {
            self.store.remove(batch, &self.value)?;
        } else {
            self.store.put(batch, &self.value)?;
        }
        self.written += batch.len();
        debug!(
            count = batch.len(),
            total = self.written,
            remove = self.remove,
            provider = %self.value.provider,
            "Applied value store batch"
        );
        Ok(())
    }
}
