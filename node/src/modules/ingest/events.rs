//! Per-advertisement "processed" notifications.
//!
//! Subscribers register per publisher and receive the CID of each
//! advertisement whose entries have been fully indexed. Channels are
//! buffered with capacity 1 and the distributor never blocks while holding
//! the fanout lock: an event that finds a subscriber's buffer full is
//! dropped with a warning, so slow readers must drain promptly or
//! resubscribe.

use cid::Cid;
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct FanoutChannel {
    id: u64,
    sender: mpsc::Sender<Cid>,
}

#[derive(Default)]
struct FanoutState {
    channels: HashMap<PeerId, Vec<FanoutChannel>>,
    next_id: u64,
    closed: bool,
}

/// Delivers processed-advertisement events to any number of subscribers,
/// scoped by publisher.
#[derive(Default)]
pub struct AdEventFanout {
    state: Mutex<FanoutState>,
}

impl AdEventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for processed events from `publisher`.
    ///
    /// Dropping the returned subscription deregisters it.
    pub fn subscribe(self: &Arc<Self>, publisher: PeerId) -> AdProcessedSubscription {
        let (sender, receiver) = mpsc::channel(1);
        let mut state = self.state.lock().expect("fanout lock poisoned");
        let id = state.next_id;
        state.next_id += 1;
        if state.closed {
            // Dropping the sender right away hands the caller an
            // already-closed channel.
            drop(sender);
        } else {
            state
                .channels
                .entry(publisher)
                .or_default()
                .push(FanoutChannel { id, sender });
            debug!(publisher = %publisher, "Registered processed-event subscriber");
        }

        AdProcessedSubscription {
            receiver,
            fanout: Arc::clone(self),
            publisher,
            id,
        }
    }

    /// Deliver an event to every subscriber of `publisher`.
    pub fn publish(&self, publisher: PeerId, ad: Cid) {
        let mut state = self.state.lock().expect("fanout lock poisoned");
        let Some(channels) = state.channels.get_mut(&publisher) else {
            return;
        };
        channels.retain(|ch| match ch.sender.try_send(ad) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(publisher = %publisher, ad = %ad, "Subscriber not draining processed events, dropping");
                true
            }
            // Receiver gone without deregistering.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if channels.is_empty() {
            state.channels.remove(&publisher);
        }
    }

    /// Close every subscriber channel. Subsequent subscriptions receive
    /// nothing.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("fanout lock poisoned");
        state.channels.clear();
        state.closed = true;
    }

    fn remove(&self, publisher: &PeerId, id: u64) {
        let mut state = self.state.lock().expect("fanout lock poisoned");
        if let Some(channels) = state.channels.get_mut(publisher) {
            channels.retain(|ch| ch.id != id);
            if channels.is_empty() {
                state.channels.remove(publisher);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, publisher: &PeerId) -> usize {
        self.state
            .lock()
            .unwrap()
            .channels
            .get(publisher)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

/// Handle for receiving processed-advertisement events.
pub struct AdProcessedSubscription {
    receiver: mpsc::Receiver<Cid>,
    fanout: Arc<AdEventFanout>,
    publisher: PeerId,
    id: u64,
}

impl AdProcessedSubscription {
    /// Receive the next processed advertisement CID. Returns `None` once the
    /// fanout is closed.
    pub async fn recv(&mut self) -> Option<Cid> {
        self.receiver.recv().await
    }
}

impl Drop for AdProcessedSubscription {
    fn drop(&mut self) {
        self.fanout.remove(&self.publisher, self.id);
    }
}
