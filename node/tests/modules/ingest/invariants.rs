//! Cross-cutting invariants: per-provider serialization, the
//! monotonic-processed property, and multi-provider chains.

use crate::util::{keypair, random_multihashes, wait_for, AdSpec, TestChain, TestSubscriber};
use cid::Cid;
use libp2p::PeerId;
use node::modules::indexer::{IndexValue, MemoryValueStore, ValueStore, ValueStoreError};
use node::modules::ingest::schema::dag_cbor_cid;
use node::modules::ingest::{IngestConfig, IngestDatastore, Ingester, ProcessedState, Subscriber};
use node::modules::registry::AllowAll;
use node::modules::storage::kv::{KvStore, MemoryKvStore};
use multihash::Multihash;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(10);

/// Value store that records concurrent writes for the same provider.
struct SerializationProbe {
    inner: MemoryValueStore,
    active: Mutex<HashSet<PeerId>>,
    violations: AtomicUsize,
}

impl SerializationProbe {
    fn new() -> Self {
        Self {
            inner: MemoryValueStore::new(),
            active: Mutex::new(HashSet::new()),
            violations: AtomicUsize::new(0),
        }
    }

    fn enter(&self, provider: PeerId) {
        if !self.active.lock().unwrap().insert(provider) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        // Widen the window so overlap would actually be observed.
        std::thread::sleep(Duration::from_millis(2));
    }

    fn exit(&self, provider: &PeerId) {
        self.active.lock().unwrap().remove(provider);
    }
}

impl ValueStore for SerializationProbe {
    fn put(&self, mhs: &[Multihash<64>], value: &IndexValue) -> Result<(), ValueStoreError> {
        self.enter(value.provider);
        let result = self.inner.put(mhs, value);
        self.exit(&value.provider);
        result
    }

    fn remove(&self, mhs: &[Multihash<64>], value: &IndexValue) -> Result<(), ValueStoreError> {
        self.enter(value.provider);
        let result = self.inner.remove(mhs, value);
        self.exit(&value.provider);
        result
    }

    fn size(&self) -> Result<u64, ValueStoreError> {
        self.inner.size()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_provider_never_processed_concurrently() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let ds = IngestDatastore::new(Arc::clone(&kv));
    let sub = TestSubscriber::new(ds.clone());
    let probe = Arc::new(SerializationProbe::new());

    let provider = keypair();
    let p1 = keypair().public().to_peer_id();
    let p2 = keypair().public().to_peer_id();

    // Two publishers, each announcing a chain for the same provider.
    for publisher in [p1, p2] {
        let mut chain = TestChain::new();
        for _ in 0..5 {
            chain.push_ad(AdSpec::put(&provider, random_multihashes(2)));
        }
        sub.set_chain(publisher, chain);
    }

    let value_store: Arc<dyn ValueStore> = Arc::clone(&probe);
    let subscriber: Arc<dyn Subscriber> = sub.clone();
    let ing = Ingester::new(
        IngestConfig {
            ingest_worker_count: 4,
            store_batch_size: 2,
            ..Default::default()
        },
        Arc::clone(&kv),
        value_store,
        subscriber,
        Arc::new(AllowAll),
    )
    .await
    .unwrap();

    let (r1, r2) = tokio::join!(sub.announce(p1), sub.announce(p2));
    let head1 = r1.unwrap().head;
    let head2 = r2.unwrap().head;

    assert!(
        wait_for(
            || {
                ds.checkpoint(&p1).unwrap() == Some(head1)
                    && ds.checkpoint(&p2).unwrap() == Some(head2)
            },
            SETTLE
        )
        .await,
        "both chains should finish"
    );

    assert_eq!(
        probe.violations.load(Ordering::SeqCst),
        0,
        "two workers held the same provider concurrently"
    );
    // Final state matches a serial interleaving: every multihash indexed.
    assert_eq!(probe.size().unwrap(), 20);

    ing.close().await.unwrap();
}

#[tokio::test]
async fn test_multi_provider_chain_grouped_by_provider() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let ds = IngestDatastore::new(Arc::clone(&kv));
    let sub = TestSubscriber::new(ds.clone());
    let store = Arc::new(MemoryValueStore::new());

    let q1 = keypair();
    let q2 = keypair();
    let publisher = keypair().public().to_peer_id();

    // One publisher carrying advertisements for two providers.
    let mut chain = TestChain::new();
    let q1_mhs = random_multihashes(3);
    let q2_mhs = random_multihashes(3);
    chain.push_ad(AdSpec::put(&q1, q1_mhs.clone()));
    chain.push_ad(AdSpec::put(&q2, q2_mhs.clone()));
    chain.push_ad(AdSpec::put(&q1, random_multihashes(2)));
    let head = chain.head();
    sub.set_chain(publisher, chain);

    let value_store: Arc<dyn ValueStore> = Arc::clone(&store);
    let subscriber: Arc<dyn Subscriber> = sub.clone();
    let ing = Ingester::new(
        IngestConfig {
            ingest_worker_count: 2,
            ..Default::default()
        },
        Arc::clone(&kv),
        value_store,
        subscriber,
        Arc::new(AllowAll),
    )
    .await
    .unwrap();

    sub.announce(publisher).await.unwrap();

    assert!(
        wait_for(|| ds.checkpoint(&publisher).unwrap() == Some(head), SETTLE).await
    );

    for mh in &q1_mhs {
        assert_eq!(store.get(mh)[0].provider, q1.public().to_peer_id());
    }
    for mh in &q2_mhs {
        assert_eq!(store.get(mh)[0].provider, q2.public().to_peer_id());
    }
    assert_eq!(store.size().unwrap(), 8);

    ing.close().await.unwrap();
}

proptest! {
    /// Marking a chain for reprocess runs newest to oldest, so stopping at
    /// any point must leave processed flags forming a prefix of the chain:
    /// if an ad is processed, every older ad is too.
    #[test]
    fn prop_partial_unprocess_keeps_monotonic_invariant(
        chain_len in 1usize..24,
        marked in 0usize..24,
    ) {
        let ds = IngestDatastore::new(Arc::new(MemoryKvStore::new()));

        // Oldest to newest.
        let cids: Vec<Cid> = (0..chain_len)
            .map(|i| dag_cbor_cid(format!("ad-{}", i).as_bytes()))
            .collect();
        for cid in &cids {
            ds.set_processed(cid, true).unwrap();
        }

        // Reprocess marking interrupted after `marked` ads, newest first.
        for cid in cids.iter().rev().take(marked) {
            ds.set_processed(cid, false).unwrap();
        }

        // Walking oldest to newest, once an unprocessed ad appears no later
        // ad may be processed.
        let mut seen_unprocessed = false;
        for cid in &cids {
            let processed = ds.processed(cid).unwrap() == ProcessedState::Processed;
            if seen_unprocessed {
                prop_assert!(!processed, "processed ad newer than an unprocessed one");
            }
            if !processed {
                seen_unprocessed = true;
            }
        }
    }

    /// The checkpoint always refers to a processed ad: replaying any prefix
    /// of per-ad finalizations leaves the checkpoint pointing at an ad whose
    /// flag is set.
    #[test]
    fn prop_checkpoint_refers_to_processed_ad(
        chain_len in 1usize..24,
        completed in 1usize..24,
    ) {
        let ds = IngestDatastore::new(Arc::new(MemoryKvStore::new()));
        let publisher = keypair().public().to_peer_id();

        let cids: Vec<Cid> = (0..chain_len)
            .map(|i| dag_cbor_cid(format!("ad-{}", i).as_bytes()))
            .collect();

        // Finalization order is oldest first; the flag is set before the
        // checkpoint advances, mirroring the ingest path.
        for cid in cids.iter().take(completed) {
            ds.set_processed(cid, true).unwrap();
            ds.set_checkpoint(&publisher, cid).unwrap();
        }

        let checkpoint = ds.checkpoint(&publisher).unwrap().unwrap();
        prop_assert_eq!(
            ds.processed(&checkpoint).unwrap(),
            ProcessedState::Processed
        );
    }
}
