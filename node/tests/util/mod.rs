//! Shared helpers for ingestion integration tests: deterministic in-memory
//! chains and a subscriber that serves them the way the pub/sub transport
//! would.

use async_trait::async_trait;
use cid::Cid;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use multihash::Multihash;
use node::modules::indexer::{MemoryValueStore, ValueStore};
use node::modules::ingest::schema::sha256_multihash;
use node::modules::ingest::subscriber::SubscriberError;
use node::modules::ingest::{
    Advertisement, ChainSelector, EntryChunk, IngestConfig, IngestDatastore, Ingester,
    RecursionLimit, Subscriber, SyncFinished, SyncResult,
};
use node::modules::registry::AllowAll;
use node::modules::storage::kv::{KvStore, MemoryKvStore};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A publisher's advertisement chain held "remotely", block by block.
#[derive(Default, Clone)]
pub struct TestChain {
    pub blocks: HashMap<Cid, Vec<u8>>,
    /// Advertisement CIDs, oldest to newest.
    pub ads: Vec<Cid>,
}

/// Everything needed to append one advertisement to a chain.
pub struct AdSpec<'a> {
    pub provider: &'a Keypair,
    pub multihashes: Vec<Multihash<64>>,
    /// Multihashes per entry chunk.
    pub chunk_size: usize,
    pub context_id: Vec<u8>,
    pub metadata: Vec<u8>,
    pub is_rm: bool,
    pub corrupt_signature: bool,
}

impl<'a> AdSpec<'a> {
    pub fn put(provider: &'a Keypair, multihashes: Vec<Multihash<64>>) -> Self {
        Self {
            provider,
            multihashes,
            chunk_size: 16,
            context_id: b"ctx".to_vec(),
            metadata: b"meta".to_vec(),
            is_rm: false,
            corrupt_signature: false,
        }
    }
}

impl TestChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Cid {
        *self.ads.last().expect("chain has no advertisements")
    }

    /// Append an advertisement, linking it to the current head.
    pub fn push_ad(&mut self, spec: AdSpec<'_>) -> Cid {
        let entries = self.push_chunks(&spec.multihashes, spec.chunk_size);

        let mut ad = Advertisement {
            previous_id: self.ads.last().copied(),
            provider: spec.provider.public().to_peer_id().to_string(),
            addresses: vec!["/ip4/127.0.0.1/tcp/9999".to_string()],
            signature: Vec::new(),
            entries,
            context_id: spec.context_id,
            metadata: spec.metadata,
            is_rm: spec.is_rm,
        };
        ad.sign(spec.provider).expect("signing test advertisement");
        if spec.corrupt_signature {
            ad.signature[0] ^= 0xFF;
        }

        let (cid, bytes) = ad.encode().expect("encoding test advertisement");
        self.blocks.insert(cid, bytes);
        self.ads.push(cid);
        cid
    }

    fn push_chunks(&mut self, multihashes: &[Multihash<64>], chunk_size: usize) -> Cid {
        let mut next = None;
        for group in multihashes.chunks(chunk_size).rev() {
            let chunk = EntryChunk {
                entries: group
                    .iter()
                    .map(|mh| serde_bytes::ByteBuf::from(mh.to_bytes()))
                    .collect(),
                next,
            };
            let (cid, bytes) = chunk.encode().expect("encoding test entry chunk");
            self.blocks.insert(cid, bytes);
            next = Some(cid);
        }
        next.expect("advertisement needs at least one entry chunk")
    }
}

/// `n` distinct random multihashes.
pub fn random_multihashes(n: usize) -> Vec<Multihash<64>> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| {
            let mut data = [0u8; 32];
            rng.fill_bytes(&mut data);
            sha256_multihash(&data)
        })
        .collect()
}

pub fn keypair() -> Keypair {
    Keypair::generate_ed25519()
}

/// Poll until `cond` holds or the timeout elapses.
pub async fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// In-memory stand-in for the pub/sub transport.
///
/// Serves per-publisher [`TestChain`]s, walks `PreviousID` links the way the
/// link-loading layer does, stores fetched blocks through the datastore
/// facade, and delivers [`SyncFinished`] events for default-selector syncs.
pub struct TestSubscriber {
    ds: IngestDatastore,
    remotes: Mutex<HashMap<PeerId, TestChain>>,
    listeners: Mutex<Vec<mpsc::Sender<SyncFinished>>>,
    latest: Mutex<HashMap<PeerId, Cid>>,
    default_limit: RecursionLimit,
}

impl TestSubscriber {
    pub fn new(ds: IngestDatastore) -> Arc<Self> {
        Arc::new(Self {
            ds,
            remotes: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            latest: Mutex::new(HashMap::new()),
            default_limit: RecursionLimit::None,
        })
    }

    pub fn set_chain(&self, publisher: PeerId, chain: TestChain) {
        self.remotes.lock().unwrap().insert(publisher, chain);
    }

    /// Mutate a publisher's chain in place (e.g. append new ads).
    pub fn update_chain(&self, publisher: PeerId, f: impl FnOnce(&mut TestChain)) {
        let mut remotes = self.remotes.lock().unwrap();
        f(remotes.entry(publisher).or_default());
    }

    /// Simulate a gossip announcement: run a default-selector sync, which
    /// also delivers the `SyncFinished` event to listeners.
    pub async fn announce(&self, publisher: PeerId) -> Result<SyncResult, SubscriberError> {
        self.sync(publisher, None, None).await
    }

    pub fn latest_sync(&self, publisher: &PeerId) -> Option<Cid> {
        self.latest.lock().unwrap().get(publisher).copied()
    }
}

#[async_trait]
impl Subscriber for TestSubscriber {
    fn on_sync_finished(&self) -> mpsc::Receiver<SyncFinished> {
        let (tx, rx) = mpsc::channel(16);
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    fn cancel_sync_events(&self) {
        self.listeners.lock().unwrap().clear();
    }

    async fn sync(
        &self,
        publisher: PeerId,
        _addr: Option<Multiaddr>,
        selector: Option<ChainSelector>,
    ) -> Result<SyncResult, SubscriberError> {
        let (limit, stop_at, is_default) = match selector {
            Some(sel) => (sel.limit, sel.stop_at, false),
            None => (
                self.default_limit,
                self.latest.lock().unwrap().get(&publisher).copied(),
                true,
            ),
        };

        let (head, synced) = {
            let remotes = self.remotes.lock().unwrap();
            let chain = remotes
                .get(&publisher)
                .ok_or_else(|| SubscriberError::Network("unknown publisher".to_string()))?;
            let head = *chain.ads.last().ok_or(SubscriberError::EmptyChain)?;

            let mut synced = Vec::new();
            let mut cursor = Some(head);
            let mut depth = 0u64;
            while let Some(cid) = cursor {
                if Some(cid) == stop_at || !limit.allows(depth) {
                    break;
                }
                let bytes = chain.blocks.get(&cid).ok_or(SubscriberError::NotFound(cid))?;
                self.ds
                    .put_block(&cid, bytes)
                    .map_err(|e| SubscriberError::Network(e.to_string()))?;
                let ad = Advertisement::decode(&cid, bytes)
                    .map_err(|e| SubscriberError::Network(e.to_string()))?;
                synced.push(cid);
                cursor = ad.previous_id;
                depth += 1;
            }
            (head, synced)
        };

        if is_default {
            self.latest.lock().unwrap().insert(publisher, head);
            let event = SyncFinished {
                publisher,
                head,
                synced_cids: synced.clone(),
            };
            let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
            for tx in listeners {
                let _ = tx.send(event.clone()).await;
            }
        }

        Ok(SyncResult {
            head,
            synced_cids: synced,
        })
    }

    async fn fetch_block(&self, publisher: PeerId, cid: Cid) -> Result<Vec<u8>, SubscriberError> {
        self.remotes
            .lock()
            .unwrap()
            .get(&publisher)
            .and_then(|chain| chain.blocks.get(&cid))
            .cloned()
            .ok_or(SubscriberError::NotFound(cid))
    }

    fn set_latest_sync(&self, publisher: PeerId, head: Cid) {
        self.latest.lock().unwrap().insert(publisher, head);
    }
}

/// A fully wired ingester over in-memory stores.
pub struct TestHarness {
    pub ds: IngestDatastore,
    pub store: Arc<MemoryValueStore>,
    pub sub: Arc<TestSubscriber>,
    pub ing: Arc<Ingester>,
}

impl TestHarness {
    pub async fn new(cfg: IngestConfig) -> Self {
        Self::with_value_store(cfg, Arc::new(MemoryValueStore::new())).await
    }

    pub async fn with_value_store(cfg: IngestConfig, store: Arc<MemoryValueStore>) -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let ds = IngestDatastore::new(Arc::clone(&kv));
        let sub = TestSubscriber::new(ds.clone());
        let value_store: Arc<dyn ValueStore> = Arc::clone(&store);
        let subscriber: Arc<dyn Subscriber> = sub.clone();
        let ing = Ingester::new(cfg, Arc::clone(&kv), value_store, subscriber, Arc::new(AllowAll))
            .await
            .expect("starting test ingester");

        Self { ds, store, sub, ing }
    }
}
