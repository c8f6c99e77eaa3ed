//! Datastore facade for ingestion bookkeeping.
//!
//! Namespaces layered over the [`KvStore`]:
//!
//! - `/sync/<publisher>` — latest fully-processed advertisement per publisher
//! - `/adProcessed/<adCID>` — per-advertisement processed flag
//!   (`0x01` processed, `0x00` marked for reprocess)
//! - `/admap/<entryCID>` — transient entry → owning-ad mapping, live only
//!   while a sync is in flight
//! - `/blocks/<cid>` — fetched advertisement and entry-chunk nodes, held
//!   until the owning advertisement is finalized

use crate::modules::ingest::error::IngestError;
use crate::modules::storage::kv::KvStore;
use cid::Cid;
use libp2p::PeerId;
use std::sync::Arc;
use tracing::{debug, warn};

const SYNC_PREFIX: &str = "/sync/";
const AD_PROCESSED_PREFIX: &str = "/adProcessed/";
const ADMAP_PREFIX: &str = "/admap/";
const BLOCKS_PREFIX: &str = "/blocks/";

/// State of an advertisement's processed flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedState {
    /// Never seen.
    Unknown,
    /// Explicitly marked for reprocessing.
    Reprocess,
    /// Fully processed.
    Processed,
}

/// Thin, namespace-aware view over the key-value store.
#[derive(Clone)]
pub struct IngestDatastore {
    store: Arc<dyn KvStore>,
}

impl IngestDatastore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn sync_key(publisher: &PeerId) -> Vec<u8> {
        format!("{}{}", SYNC_PREFIX, publisher).into_bytes()
    }

    fn processed_key(ad: &Cid) -> Vec<u8> {
        format!("{}{}", AD_PROCESSED_PREFIX, ad).into_bytes()
    }

    fn admap_key(entry: &Cid) -> Vec<u8> {
        format!("{}{}", ADMAP_PREFIX, entry).into_bytes()
    }

    fn block_key(cid: &Cid) -> Vec<u8> {
        format!("{}{}", BLOCKS_PREFIX, cid).into_bytes()
    }

    /// Latest fully-processed advertisement for `publisher`, if any.
    pub fn checkpoint(&self, publisher: &PeerId) -> Result<Option<Cid>, IngestError> {
        let Some(bytes) = self.store.get(&Self::sync_key(publisher))? else {
            return Ok(None);
        };
        match Cid::try_from(bytes.as_slice()) {
            Ok(cid) => Ok(Some(cid)),
            Err(e) => {
                // A corrupt checkpoint only costs a re-sync; treat as absent.
                warn!(publisher = %publisher, error = %e, "Stored checkpoint is not a CID, ignoring");
                Ok(None)
            }
        }
    }

    pub fn set_checkpoint(&self, publisher: &PeerId, ad: &Cid) -> Result<(), IngestError> {
        self.store.put(&Self::sync_key(publisher), &ad.to_bytes())?;
        debug!(publisher = %publisher, ad = %ad, "Persisted latest sync");
        Ok(())
    }

    /// All persisted `(publisher, checkpoint)` pairs.
    ///
    /// Undecodable entries are logged and skipped, never fatal: a corrupt
    /// checkpoint only costs a re-sync of that publisher's chain.
    pub fn checkpoints(&self) -> Result<Vec<(PeerId, Cid)>, IngestError> {
        let mut restored = Vec::new();
        for (key, value) in self.store.scan_prefix(SYNC_PREFIX.as_bytes())? {
            let publisher = match std::str::from_utf8(&key[SYNC_PREFIX.len()..])
                .ok()
                .and_then(|s| s.parse::<PeerId>().ok())
            {
                Some(p) => p,
                None => {
                    warn!("Failed to decode publisher ID of persisted checkpoint, skipping");
                    continue;
                }
            };
            let cid = match Cid::try_from(value.as_slice()) {
                Ok(c) => c,
                Err(e) => {
                    warn!(publisher = %publisher, error = %e, "Failed to decode checkpoint CID, skipping");
                    continue;
                }
            };
            restored.push((publisher, cid));
        }
        Ok(restored)
    }

    /// The processed flag for an advertisement.
    pub fn processed(&self, ad: &Cid) -> Result<ProcessedState, IngestError> {
        Ok(match self.store.get(&Self::processed_key(ad))? {
            Some(v) if v.first() == Some(&1) => ProcessedState::Processed,
            Some(_) => ProcessedState::Reprocess,
            None => ProcessedState::Unknown,
        })
    }

    pub fn set_processed(&self, ad: &Cid, processed: bool) -> Result<(), IngestError> {
        let flag = [if processed { 1u8 } else { 0u8 }];
        self.store.put(&Self::processed_key(ad), &flag)?;
        Ok(())
    }

    /// Record that `entry` belongs to advertisement `ad` for the duration of
    /// the current sync.
    pub fn put_ad_mapping(&self, entry: &Cid, ad: &Cid) -> Result<(), IngestError> {
        self.store.put(&Self::admap_key(entry), &ad.to_bytes())?;
        Ok(())
    }

    /// Owning advertisement of an entry chunk, if a mapping is live.
    pub fn ad_mapping(&self, entry: &Cid) -> Result<Option<Cid>, IngestError> {
        let Some(bytes) = self.store.get(&Self::admap_key(entry))? else {
            return Ok(None);
        };
        let cid = Cid::try_from(bytes.as_slice()).map_err(|e| IngestError::Decode {
            cid: *entry,
            reason: format!("stored ad mapping is not a CID: {}", e),
        })?;
        Ok(Some(cid))
    }

    /// Drop the mappings for a set of entry chunks in one batch.
    pub fn delete_ad_mappings(&self, entries: &[Cid]) -> Result<(), IngestError> {
        let keys: Vec<Vec<u8>> = entries.iter().map(Self::admap_key).collect();
        self.store.delete_batch(&keys)?;
        Ok(())
    }

    /// Remove every entry → ad mapping.
    ///
    /// Run at startup: mappings are only meaningful while a sync is in
    /// flight, so anything found here was left by an unclean shutdown.
    /// Idempotent.
    pub fn clear_ad_mappings(&self) -> Result<usize, IngestError> {
        let entries = self.store.scan_prefix(ADMAP_PREFIX.as_bytes())?;
        let keys: Vec<Vec<u8>> = entries.into_iter().map(|(k, _)| k).collect();
        let count = keys.len();
        self.store.delete_batch(&keys)?;
        if count > 0 {
            warn!(count, "Cleaned up stale entry-to-ad mappings");
        }
        Ok(count)
    }

    /// A transiently-stored advertisement or entry-chunk block.
    pub fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, IngestError> {
        Ok(self.store.get(&Self::block_key(cid))?)
    }

    pub fn put_block(&self, cid: &Cid, data: &[u8]) -> Result<(), IngestError> {
        self.store.put(&Self::block_key(cid), data)?;
        Ok(())
    }

    /// Drop a set of blocks in one batch, used when an advertisement is
    /// finalized.
    pub fn delete_blocks(&self, cids: &[Cid]) -> Result<(), IngestError> {
        let keys: Vec<Vec<u8>> = cids.iter().map(Self::block_key).collect();
        self.store.delete_batch(&keys)?;
        Ok(())
    }
}
