//! Entry-chunk traversal.
//!
//! Walks the `Entries → Next → …` linked list of an advertisement, yielding
//! each chunk's multihashes in traversal order. Chunks not held locally are
//! fetched through the subscriber. The walk is restartable: nothing here
//! mutates the chain, and a failed attempt leaves fetched blocks in place for
//! the retry.

use crate::modules::ingest::datastore::IngestDatastore;
use crate::modules::ingest::error::IngestError;
use crate::modules::ingest::schema::EntryChunk;
use crate::modules::ingest::subscriber::{RecursionLimit, Subscriber, SubscriberError};
use cid::Cid;
use libp2p::PeerId;
use multihash::Multihash;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct EntryWalker {
    ds: IngestDatastore,
    sub: Arc<dyn Subscriber>,
    limit: RecursionLimit,
}

impl EntryWalker {
    pub fn new(ds: IngestDatastore, sub: Arc<dyn Subscriber>, limit: RecursionLimit) -> Self {
        Self { ds, sub, limit }
    }

    /// Walk the chunk list starting at `entries`, invoking `on_batch` with
    /// each chunk's multihashes.
    ///
    /// Before a chunk is fetched its entry → ad mapping is recorded, so a
    /// crash mid-walk leaves only mappings (cleaned at startup), never an
    /// orphaned chunk. Returns the CIDs of all visited chunks.
    ///
    /// The depth limit caps how many chunks are visited; hitting it ends the
    /// walk without error, leaving the remaining chunks unindexed.
    pub async fn walk<F>(
        &self,
        publisher: PeerId,
        ad: Cid,
        entries: Cid,
        mut on_batch: F,
    ) -> Result<Vec<Cid>, IngestError>
    where
        F: FnMut(Vec<Multihash<64>>) -> Result<(), IngestError>,
    {
        let mut visited = Vec::new();
        let mut next = Some(entries);
        let mut depth: u64 = 0;

        while let Some(cid) = next {
            if !self.limit.allows(depth) {
                debug!(ad = %ad, depth, "Entry recursion limit reached, stopping walk");
                break;
            }

            self.ds.put_ad_mapping(&cid, &ad)?;
            let bytes = self.chunk_bytes(publisher, cid).await?;
            let chunk = EntryChunk::decode(&cid, &bytes)?;
            visited.push(cid);

            let multihashes = chunk.multihashes(&cid)?;
            trace!(ad = %ad, chunk = %cid, count = multihashes.len(), "Visited entry chunk");
            on_batch(multihashes)?;

            next = chunk.next;
            depth += 1;
        }

        Ok(visited)
    }

    async fn chunk_bytes(&self, publisher: PeerId, cid: Cid) -> Result<Vec<u8>, IngestError> {
        if let Some(bytes) = self.ds.get_block(&cid)? {
            return Ok(bytes);
        }
        let bytes = self
            .sub
            .fetch_block(publisher, cid)
            .await
            .map_err(|e| match e {
                SubscriberError::NotFound(c) => IngestError::Missing(c),
                // Transport failures are transient for the walk too.
                _ => IngestError::Missing(cid),
            })?;
        self.ds.put_block(&cid, &bytes)?;
        Ok(bytes)
    }
}
