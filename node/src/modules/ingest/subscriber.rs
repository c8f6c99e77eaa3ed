//! The interface ingestion consumes from the pub/sub transport.
//!
//! The transport itself (gossip mesh, dialing, link loading) lives outside
//! this crate. Ingestion only needs: a stream of "chain sync finished"
//! events, a synchronous chain fetch, a single-block fetch primitive, and a
//! way to seed the transport's notion of the latest already-synced head at
//! startup.

use async_trait::async_trait;
use cid::Cid;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Recursion limit for a chain traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursionLimit {
    /// No limit.
    None,
    /// At most this many nodes are visited.
    Depth(u64),
}

impl RecursionLimit {
    /// `0` means unlimited, anything else is an explicit depth.
    pub fn from_depth(depth: u64) -> Self {
        if depth == 0 {
            RecursionLimit::None
        } else {
            RecursionLimit::Depth(depth)
        }
    }

    /// Whether a node at `depth` (0-based) may still be visited.
    pub fn allows(&self, depth: u64) -> bool {
        match self {
            RecursionLimit::None => true,
            RecursionLimit::Depth(max) => depth < *max,
        }
    }
}

/// Selector controlling how far a chain sync walks.
///
/// Traversal proceeds from the head along `PreviousID` links and stops when
/// the limit is exhausted, the chain ends, or `stop_at` is reached
/// (exclusive).
#[derive(Debug, Clone)]
pub struct ChainSelector {
    pub limit: RecursionLimit,
    pub stop_at: Option<Cid>,
}

/// Emitted by the subscriber when a chain sync completes.
#[derive(Debug, Clone)]
pub struct SyncFinished {
    /// Gossip identity the chain was fetched from.
    pub publisher: PeerId,
    /// Head CID the sync reached.
    pub head: Cid,
    /// Advertisement CIDs newly fetched during the sync, newest first.
    pub synced_cids: Vec<Cid>,
}

/// Result of an explicit chain sync.
#[derive(Debug, Clone)]
pub struct SyncResult {
    /// The resolved head of the publisher's chain.
    pub head: Cid,
    /// Advertisement CIDs fetched during this sync, newest first. Empty when
    /// everything up to the head was already held locally.
    pub synced_cids: Vec<Cid>,
}

/// Errors surfaced by subscriber implementations.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("block {0} not found at publisher")]
    NotFound(Cid),

    #[error("publisher has no advertisements")]
    EmptyChain,

    #[error("transport error: {0}")]
    Network(String),
}

/// The pub/sub transport surface consumed by ingestion.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Register a listener for finished chain syncs. Every call returns a
    /// fresh channel; [`Subscriber::cancel_sync_events`] closes all of them.
    fn on_sync_finished(&self) -> mpsc::Receiver<SyncFinished>;

    /// Stop delivering sync events to all registered listeners. Idempotent.
    fn cancel_sync_events(&self);

    /// Fetch the publisher's chain from its current head according to
    /// `selector`, storing fetched advertisement blocks locally.
    ///
    /// A `selector` of `None` requests the default traversal: stop at the
    /// subscriber's latest known head for this publisher, record the new
    /// head, and deliver a [`SyncFinished`] event to registered listeners.
    /// With an explicit selector neither happens; the caller owns follow-up.
    async fn sync(
        &self,
        publisher: PeerId,
        addr: Option<Multiaddr>,
        selector: Option<ChainSelector>,
    ) -> Result<SyncResult, SubscriberError>;

    /// Fetch a single block from the publisher. Used for lazy entry-chunk
    /// retrieval during advertisement processing.
    async fn fetch_block(&self, publisher: PeerId, cid: Cid) -> Result<Vec<u8>, SubscriberError>;

    /// Seed the subscriber's latest-synced head for a publisher, so default
    /// traversals stop there. Called at startup from persisted checkpoints.
    fn set_latest_sync(&self, publisher: PeerId, head: Cid);
}
