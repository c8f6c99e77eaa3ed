//! Advertisement ingestion.
//!
//! Follows each publisher's advertisement chain from its latest head back to
//! the last advertisement already processed, walks the entry chunks of every
//! new advertisement, and writes the contained multihashes into the value
//! store. Processing is resumable and exactly-once per advertisement:
//! per-advertisement processed flags and a per-publisher checkpoint are
//! persisted, and a provider's chain is never processed concurrently with
//! itself while distinct providers proceed in parallel.

pub mod config;
pub mod datastore;
pub mod entries;
pub mod error;
pub mod events;
pub mod loader;
pub mod metrics;
pub mod schema;
pub mod subscriber;
pub mod writer;

pub use config::IngestConfig;
pub use datastore::{IngestDatastore, ProcessedState};
pub use error::IngestError;
pub use events::{AdEventFanout, AdProcessedSubscription};
pub use metrics::IngestMetrics;
pub use schema::{Advertisement, EntryChunk};
pub use subscriber::{ChainSelector, RecursionLimit, Subscriber, SyncFinished, SyncResult};

use crate::modules::indexer::{IndexValue, ValueStore};
use crate::modules::registry::PublisherPolicy;
use crate::modules::storage::kv::KvStore;
use cid::Cid;
use entries::EntryWalker;
use errors::AppError;
use libp2p::{Multiaddr, PeerId};
use loader::AdLoader;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use writer::IndexerWriter;

const METRICS_TICK: Duration = Duration::from_secs(60);

/// One provider's stack of freshly-synced advertisement CIDs, newest first.
#[derive(Debug)]
struct WorkerMsg {
    provider: PeerId,
    publisher: PeerId,
    cids: Vec<Cid>,
}

/// The ingestion subsystem.
///
/// Construct with [`Ingester::new`]; it spawns the sync driver, the worker
/// pool, the event distributor, and the metrics ticker. [`Ingester::close`]
/// shuts everything down and is idempotent.
pub struct Ingester {
    cfg: IngestConfig,
    ds: IngestDatastore,
    value_store: Arc<dyn ValueStore>,
    sub: Arc<dyn Subscriber>,
    policy: Arc<dyn PublisherPolicy>,
    loader: AdLoader,
    metrics: IngestMetrics,
    events: Arc<AdEventFanout>,

    /// Per-provider serializer: a worker holds the provider's lock for the
    /// whole of one advertisement's processing. Entries are never removed;
    /// the map is bounded by the number of distinct providers ever seen.
    providers_being_processed: Mutex<HashMap<PeerId, Arc<AsyncMutex<()>>>>,

    to_workers: mpsc::Sender<WorkerMsg>,
    /// Processed notifications on their way to the distributor. Taken on
    /// close so the distributor's input ends.
    in_events: Mutex<Option<mpsc::Sender<(PeerId, Cid)>>>,
    sig_update: Mutex<Option<mpsc::Sender<()>>>,

    close_workers_tx: watch::Sender<bool>,
    close_workers_rx: watch::Receiver<bool>,
    close_pending_tx: watch::Sender<bool>,
    close_pending_rx: watch::Receiver<bool>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    distributor_task: Mutex<Option<JoinHandle<()>>>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
    pending_syncs: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Ingester {
    /// Create and start an ingester.
    ///
    /// Cleans up stale entry → ad mappings, restores persisted checkpoints
    /// into the subscriber, and spawns the background tasks.
    pub async fn new(
        cfg: IngestConfig,
        store: Arc<dyn KvStore>,
        value_store: Arc<dyn ValueStore>,
        sub: Arc<dyn Subscriber>,
        policy: Arc<dyn PublisherPolicy>,
    ) -> Result<Arc<Self>, IngestError> {
        cfg.validate()?;

        let ds = IngestDatastore::new(store);

        // Mappings are only meaningful while a sync is in flight; leftovers
        // mean an unclean shutdown. Failure to clean them is not fatal.
        if let Err(e) = ds.clear_ad_mappings() {
            error!(error = %e, "Error cleaning temporary entry-to-ad mappings");
        }

        let restored = ds.checkpoints()?;
        let restored_count = restored.len();
        for (publisher, head) in restored {
            debug!(publisher = %publisher, ad = %head, "Restored latest sync");
            sub.set_latest_sync(publisher, head);
        }
        info!(count = restored_count, "Loaded latest sync for publishers");

        let (to_workers, worker_rx) = mpsc::channel(cfg.ingest_worker_count);
        let (in_events, events_rx) = mpsc::channel(1);
        let (sig_update, sig_rx) = mpsc::channel(1);
        let (close_workers_tx, close_workers_rx) = watch::channel(false);
        let (close_pending_tx, close_pending_rx) = watch::channel(false);

        let loader = AdLoader::new(ds.clone(), Arc::clone(&sub));

        let ing = Arc::new(Self {
            cfg,
            ds,
            value_store,
            sub,
            policy,
            loader,
            metrics: IngestMetrics::new(),
            events: Arc::new(AdEventFanout::new()),
            providers_being_processed: Mutex::new(HashMap::new()),
            to_workers,
            in_events: Mutex::new(Some(in_events)),
            sig_update: Mutex::new(Some(sig_update)),
            close_workers_tx,
            close_workers_rx,
            close_pending_tx,
            close_pending_rx,
            tasks: Mutex::new(Vec::new()),
            distributor_task: Mutex::new(None),
            metrics_task: Mutex::new(None),
            pending_syncs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        ing.start_workers(worker_rx);
        ing.start_sync_driver();
        ing.start_distributor(events_rx);
        ing.start_metrics_ticker(sig_rx);

        info!(
            workers = ing.cfg.ingest_worker_count,
            topic = %ing.cfg.pubsub_topic,
            "Ingester started"
        );
        Ok(ing)
    }

    /// Latest fully-processed advertisement for a publisher.
    pub fn latest_sync(&self, publisher: &PeerId) -> Result<Option<Cid>, IngestError> {
        self.ds.checkpoint(publisher)
    }

    /// Register for processed-advertisement notifications from `publisher`.
    ///
    /// A manual sync does not always produce a notification: an
    /// advertisement that was already processed is not reprocessed.
    pub fn on_ad_processed(&self, publisher: PeerId) -> AdProcessedSubscription {
        self.events.subscribe(publisher)
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Signal that the value-store size gauge should be refreshed on the
    /// next tick. Idempotent.
    pub fn signal_metrics_update(&self) {
        if let Some(tx) = self.sig_update.lock().expect("signal lock poisoned").as_ref() {
            // A full buffer means an update is already pending.
            let _ = tx.try_send(());
        }
    }

    /// Explicitly sync advertisements from a publisher, up to its latest
    /// head.
    ///
    /// `depth` may be `-1` for no limit, `0` for the configured default, or
    /// an explicit positive limit. With `ignore_latest` the traversal does
    /// not stop at the current checkpoint.
    ///
    /// A non-default selector (`depth != 0 || ignore_latest`) is a *resync*:
    /// every advertisement it fetches is force-marked unprocessed and
    /// re-ingested through the normal pipeline.
    ///
    /// The returned channel yields the resolved head CID once the head has
    /// been fully processed, and closes without a value on failure,
    /// shutdown, or cancellation. Dropping the receiver cancels the wait.
    pub fn sync(
        self: &Arc<Self>,
        publisher: PeerId,
        addr: Option<Multiaddr>,
        depth: i64,
        ignore_latest: bool,
    ) -> Result<mpsc::Receiver<Cid>, IngestError> {
        if depth < -1 {
            return Err(IngestError::BadArgument(format!(
                "recursion depth limit must not be less than -1; got {}",
                depth
            )));
        }
        if !self.policy.allowed(&publisher) {
            return Err(IngestError::Unauthorized(publisher));
        }
        if *self.close_pending_rx.borrow() {
            return Err(IngestError::Cancelled);
        }

        debug!(publisher = %publisher, depth, ignore_latest, "Explicitly syncing the latest advertisement from publisher");

        let (out_tx, out_rx) = mpsc::channel(1);
        let ing = Arc::clone(self);
        let handle = tokio::spawn(async move {
            ing.run_explicit_sync(publisher, addr, depth, ignore_latest, out_tx)
                .await;
        });

        let mut pending = self.pending_syncs.lock().expect("pending syncs lock poisoned");
        pending.retain(|h| !h.is_finished());
        pending.push(handle);

        Ok(out_rx)
    }

    /// Shut down the ingester. Idempotent.
    pub async fn close(&self) -> Result<(), AppError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing ingester");

        // The event stream must end before the workers stop, otherwise the
        // sync driver can wedge sending to a pool nobody drains.
        self.sub.cancel_sync_events();

        let _ = self.close_workers_tx.send(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .drain(..)
            .collect();
        for handle in tasks {
            if let Err(e) = handle.await {
                error!(error = %e, "Ingest task ended abnormally");
            }
        }

        let _ = self.close_pending_tx.send(true);
        let pending: Vec<_> = self
            .pending_syncs
            .lock()
            .expect("pending syncs lock poisoned")
            .drain(..)
            .collect();
        for handle in pending {
            if let Err(e) = handle.await {
                error!(error = %e, "Explicit sync task ended abnormally");
            }
        }

        // With the workers gone no more events can arrive; ending the input
        // lets the distributor drain and exit.
        self.in_events.lock().expect("events lock poisoned").take();
        if let Some(handle) = self
            .distributor_task
            .lock()
            .expect("distributor lock poisoned")
            .take()
        {
            let _ = handle.await;
        }
        self.events.close();

        self.sig_update.lock().expect("signal lock poisoned").take();
        if let Some(handle) = self
            .metrics_task
            .lock()
            .expect("metrics task lock poisoned")
            .take()
        {
            let _ = handle.await;
        }

        info!("Ingester closed");
        Ok(())
    }

    fn start_workers(self: &Arc<Self>, worker_rx: mpsc::Receiver<WorkerMsg>) {
        let worker_rx = Arc::new(AsyncMutex::new(worker_rx));
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        for id in 0..self.cfg.ingest_worker_count {
            let ing = Arc::clone(self);
            let rx = Arc::clone(&worker_rx);
            tasks.push(tokio::spawn(async move {
                ing.ingest_worker(id, rx).await;
            }));
        }
    }

    fn start_sync_driver(self: &Arc<Self>) {
        let mut events = self.sub.on_sync_finished();
        let ing = Arc::clone(self);
        self.tasks
            .lock()
            .expect("tasks lock poisoned")
            .push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    ing.dispatch_sync(event).await;
                }
                debug!("Sync event stream ended");
            }));
    }

    fn start_distributor(self: &Arc<Self>, mut events_rx: mpsc::Receiver<(PeerId, Cid)>) {
        let fanout = Arc::clone(&self.events);
        let handle = tokio::spawn(async move {
            while let Some((publisher, ad)) = events_rx.recv().await {
                fanout.publish(publisher, ad);
            }
        });
        *self
            .distributor_task
            .lock()
            .expect("distributor lock poisoned") = Some(handle);
    }

    fn start_metrics_ticker(self: &Arc<Self>, mut sig_rx: mpsc::Receiver<()>) {
        let ing = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut has_update = true;
            let mut ticker = tokio::time::interval(METRICS_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    sig = sig_rx.recv() => match sig {
                        Some(()) => has_update = true,
                        None => return,
                    },
                    _ = ticker.tick() => {
                        if has_update {
                            match ing.value_store.size() {
                                Ok(size) => {
                                    ing.metrics.record_store_size(size);
                                    has_update = false;
                                }
                                Err(e) => error!(error = %e, "Error getting value store size"),
                            }
                        }
                    }
                }
            }
        });
        *self.metrics_task.lock().expect("metrics task lock poisoned") = Some(handle);
    }

    /// Group a finished sync's advertisements by provider and hand each
    /// stack to the worker pool.
    async fn dispatch_sync(&self, event: SyncFinished) {
        if !self.policy.allowed(&event.publisher) {
            warn!(publisher = %event.publisher, "Ignoring sync from unauthorized publisher");
            return;
        }

        // Most publishers publish for a single provider, but one chain may
        // carry several; newest-first order is preserved within each group.
        let mut grouped: HashMap<PeerId, Vec<Cid>> = HashMap::new();
        for ad_cid in &event.synced_cids {
            let ad = match self.loader.load(event.publisher, *ad_cid, true).await {
                Ok(ad) => ad,
                Err(e) => {
                    error!(ad = %ad_cid, error = %e, "Failed to load advertisement, skipping");
                    continue;
                }
            };
            let provider = match ad.provider_id() {
                Ok(p) => p,
                Err(e) => {
                    error!(ad = %ad_cid, error = %e, "Failed to get provider from advertisement, skipping");
                    continue;
                }
            };
            // Bind the first entry chunk to its advertisement before any
            // chunk is fetched.
            if let Err(e) = self.ds.put_ad_mapping(&ad.entries, ad_cid) {
                error!(ad = %ad_cid, error = %e, "Failed to record entry-to-ad mapping, skipping");
                continue;
            }
            grouped.entry(provider).or_default().push(*ad_cid);
        }

        for (provider, cids) in grouped {
            // Make sure the serializer has a lock for this provider before
            // any worker touches the stack.
            self.provider_lock(&provider);
            let msg = WorkerMsg {
                provider,
                publisher: event.publisher,
                cids,
            };
            let mut close_rx = self.close_workers_rx.clone();
            tokio::select! {
                _ = close_rx.wait_for(|closed| *closed) => return,
                res = self.to_workers.send(msg) => {
                    if res.is_err() {
                        warn!("Worker channel closed, dropping ad stack");
                        return;
                    }
                }
            }
        }
    }

    async fn ingest_worker(&self, id: usize, rx: Arc<AsyncMutex<mpsc::Receiver<WorkerMsg>>>) {
        let mut close_rx = self.close_workers_rx.clone();
        loop {
            let msg = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = close_rx.wait_for(|closed| *closed) => {
                        debug!(worker = id, "Ingest worker stopping");
                        return;
                    }
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                }
            };
            if let Some(head) = msg.cids.first() {
                info!(worker = id, head = %head, publisher = %msg.publisher, "Running worker on ad stack");
            }
            self.process_ad_stack(msg).await;
        }
    }

    /// Process one provider's stack oldest-first, stopping at the first
    /// already-processed advertisement: if an ad is processed, every older
    /// ad in the chain is too.
    async fn process_ad_stack(&self, msg: WorkerMsg) {
        for ad_cid in msg.cids.iter().rev() {
            let lock = self.provider_lock(&msg.provider);
            let _guard = lock.lock().await;

            match self.ds.processed(ad_cid) {
                Ok(ProcessedState::Processed) => {
                    debug!(ad = %ad_cid, provider = %msg.provider, "Advertisement already processed, stack done");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(ad = %ad_cid, error = %e, "Failed to read processed flag, abandoning stack");
                    break;
                }
            }

            if let Err(e) = self.ingest_ad(msg.publisher, *ad_cid).await {
                self.metrics.ads_failed.fetch_add(1, Ordering::Relaxed);
                error!(ad = %ad_cid, publisher = %msg.publisher, error = %e, "Error while ingesting advertisement");
            }
        }
    }

    /// Load, verify, walk, and index one advertisement, then persist its
    /// processed flag and advance the publisher checkpoint.
    ///
    /// Any error returns before the flag is set, so a later sync retries the
    /// advertisement; the checkpoint never moves past a failure.
    async fn ingest_ad(&self, publisher: PeerId, ad_cid: Cid) -> Result<(), IngestError> {
        let ad = self.loader.load(publisher, ad_cid, true).await?;
        let provider = ad.provider_id()?;
        let is_rm = ad.is_rm;

        let value = IndexValue {
            provider,
            context_id: ad.context_id.clone(),
            metadata: ad.metadata.clone(),
        };
        let walker = EntryWalker::new(
            self.ds.clone(),
            Arc::clone(&self.sub),
            self.cfg.entries_recursion_limit(),
        );
        let mut writer = IndexerWriter::new(
            self.value_store.as_ref(),
            value,
            is_rm,
            self.cfg.store_batch_size,
        );

        let visited = walker
            .walk(publisher, ad_cid, ad.entries, |mhs| writer.push(mhs))
            .await?;
        let written = writer.flush()?;

        self.ds.set_processed(&ad_cid, true)?;
        self.ds.delete_ad_mappings(&visited)?;
        self.ds.set_checkpoint(&publisher, &ad_cid)?;

        // The advertisement and its chunks have served their purpose.
        let mut blocks = visited;
        blocks.push(ad_cid);
        self.ds.delete_blocks(&blocks)?;
        self.loader.evict(&ad_cid);

        self.metrics.ads_processed.fetch_add(1, Ordering::Relaxed);
        if is_rm {
            self.metrics
                .multihashes_removed
                .fetch_add(written as u64, Ordering::Relaxed);
        } else {
            self.metrics
                .multihashes_indexed
                .fetch_add(written as u64, Ordering::Relaxed);
        }
        self.signal_metrics_update();

        let tx = self
            .in_events
            .lock()
            .expect("events lock poisoned")
            .clone();
        if let Some(tx) = tx {
            let _ = tx.send((publisher, ad_cid)).await;
        }

        info!(
            ad = %ad_cid,
            publisher = %publisher,
            provider = %provider,
            multihashes = written,
            remove = is_rm,
            "Advertisement processed"
        );
        Ok(())
    }

    async fn run_explicit_sync(
        &self,
        publisher: PeerId,
        addr: Option<Multiaddr>,
        depth: i64,
        ignore_latest: bool,
        out_tx: mpsc::Sender<Cid>,
    ) {
        // A non-default selector means this is a resync.
        let is_resync = depth != 0 || ignore_latest;
        let selector = if is_resync {
            match self.chain_selector(&publisher, depth, ignore_latest) {
                Ok(sel) => Some(sel),
                Err(e) => {
                    error!(publisher = %publisher, error = %e, "Failed to construct selector for explicit sync");
                    return;
                }
            }
        } else {
            None
        };

        // Register before the sync starts so no processed event is missed.
        let mut processed_events = self.events.subscribe(publisher);

        let latest = match self.ds.checkpoint(&publisher) {
            Ok(latest) => latest,
            Err(e) => {
                error!(publisher = %publisher, error = %e, "Failed to get latest sync");
                return;
            }
        };

        let result = match tokio::time::timeout(
            self.cfg.sync_timeout,
            self.sub.sync(publisher, addr, selector),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(publisher = %publisher, error = %e, "Failed to sync with publisher");
                return;
            }
            Err(_) => {
                error!(publisher = %publisher, timeout = ?self.cfg.sync_timeout, "Sync timed out");
                return;
            }
        };

        // A resync reprocesses everything it fetched: later ads can change
        // meaning in the context of earlier ones, so partial re-ingestion is
        // not sound. Marking runs newest to oldest so a crash partway leaves
        // only a contiguous unprocessed suffix.
        if is_resync && !result.synced_cids.is_empty() {
            if let Err(e) = self.mark_ad_chain_unprocessed(&result.synced_cids) {
                error!(publisher = %publisher, error = %e, "Failed to mark ad chain for reprocessing");
                return;
            }
            let event = SyncFinished {
                publisher,
                head: result.synced_cids[0],
                synced_cids: result.synced_cids.clone(),
            };
            self.dispatch_sync(event).await;
        }

        let head = result.head;
        if latest == Some(head) && !is_resync {
            info!(ad = %head, publisher = %publisher, "Latest advertisement already processed");
            let _ = out_tx.send(head).await;
            return;
        }

        debug!(ad = %head, publisher = %publisher, "Syncing advertisements up to latest");
        let mut close_rx = self.close_pending_rx.clone();
        // Fanout channels are capacity-1 and may drop under bursts, so the
        // durable processed flag is polled as a backstop.
        let mut recheck = tokio::time::interval(Duration::from_millis(100));
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let done = tokio::select! {
                processed = processed_events.recv() => match processed {
                    Some(ad) => {
                        debug!(ad = %ad, "Synced advertisement");
                        ad == head
                    }
                    None => return,
                },
                _ = recheck.tick() => {
                    matches!(self.ds.processed(&head), Ok(ProcessedState::Processed))
                }
                _ = out_tx.closed() => {
                    debug!(publisher = %publisher, "Explicit sync caller went away, cancelling");
                    return;
                }
                _ = close_rx.wait_for(|closed| *closed) => {
                    warn!(publisher = %publisher, "Sync cancelled because of close");
                    return;
                }
            };
            if done {
                let _ = out_tx.send(head).await;
                self.signal_metrics_update();
                return;
            }
        }
    }

    fn chain_selector(
        &self,
        publisher: &PeerId,
        depth: i64,
        ignore_latest: bool,
    ) -> Result<ChainSelector, IngestError> {
        let limit = match depth {
            -1 => RecursionLimit::None,
            0 => self.cfg.ad_recursion_limit(),
            d => RecursionLimit::Depth(d as u64),
        };
        let stop_at = if ignore_latest {
            None
        } else {
            self.ds.checkpoint(publisher)?
        };
        Ok(ChainSelector { limit, stop_at })
    }

    /// Mark a chain of advertisements for reprocessing, newest to oldest.
    fn mark_ad_chain_unprocessed(&self, cids: &[Cid]) -> Result<(), IngestError> {
        for cid in cids {
            self.ds.set_processed(cid, false)?;
        }
        Ok(())
    }

    fn provider_lock(&self, provider: &PeerId) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .providers_being_processed
            .lock()
            .expect("serializer lock poisoned");
        Arc::clone(map.entry(*provider).or_default())
    }
}
