//! Publisher admission policy.
//!
//! The registry decides which gossip identities may feed advertisements into
//! the indexer. Ingestion consults it for every incoming sync event and every
//! explicit sync request.

use libp2p::PeerId;
use std::collections::HashSet;
use std::sync::RwLock;
use tracing::debug;

/// Policy deciding whether a publisher is allowed to be ingested from.
pub trait PublisherPolicy: Send + Sync {
    fn allowed(&self, publisher: &PeerId) -> bool;
}

/// Admits every publisher.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PublisherPolicy for AllowAll {
    fn allowed(&self, _publisher: &PeerId) -> bool {
        true
    }
}

/// Admits only an explicit set of publishers.
#[derive(Debug, Default)]
pub struct AllowList {
    peers: RwLock<HashSet<PeerId>>,
}

impl AllowList {
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            peers: RwLock::new(peers.into_iter().collect()),
        }
    }

    pub fn allow(&self, publisher: PeerId) {
        let inserted = self
            .peers
            .write()
            .expect("allow list lock poisoned")
            .insert(publisher);
        if inserted {
            debug!(publisher = %publisher, "Publisher added to allow list");
        }
    }

    pub fn revoke(&self, publisher: &PeerId) {
        self.peers
            .write()
            .expect("allow list lock poisoned")
            .remove(publisher);
    }
}

impl PublisherPolicy for AllowList {
    fn allowed(&self, publisher: &PeerId) -> bool {
        self.peers
            .read()
            .expect("allow list lock poisoned")
            .contains(publisher)
    }
}
