use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use dashmap::DashMap;
use tracing::trace;

use crate::error::{ExecutionError, FenceError, FenceResult};
use crate::events::TransitionEvent;

/// Identifier of one event subscription.
pub type SubscriptionId = u64;

/// Fan-out of transition events to bounded per-subscriber channels.
///
/// Publishing never blocks the evaluation loop: a full subscriber loses the
/// event and the loss is counted.
#[derive(Debug)]
pub(crate) struct EventHub {
    subscribers: DashMap<SubscriptionId, Sender<TransitionEvent>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> EventStream {
        let subscription_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.insert(subscription_id, tx);
        EventStream::new(subscription_id, rx, Arc::clone(self))
    }

    pub(crate) fn unsubscribe(&self, subscription_id: SubscriptionId) {
        self.subscribers.remove(&subscription_id);
    }

    pub(crate) fn publish(&self, event: &TransitionEvent) {
        let mut disconnected = Vec::new();
        for entry in &self.subscribers {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(subscription_id = *entry.key(), "event stream full; dropping event");
                }
                Err(TrySendError::Disconnected(_)) => disconnected.push(*entry.key()),
            }
        }
        for id in disconnected {
            self.subscribers.remove(&id);
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// A subscription stream of transition events.
///
/// Dropping this stream unregisters it.
#[derive(Debug)]
pub struct EventStream {
    subscription_id: SubscriptionId,
    rx: Receiver<TransitionEvent>,
    hub: Arc<EventHub>,
    unregistered: AtomicBool,
}

fn disconnected() -> FenceError {
    FenceError::Execution(ExecutionError::Disconnected {
        path: "event_stream".to_string(),
    })
}

impl EventStream {
    fn new(subscription_id: SubscriptionId, rx: Receiver<TransitionEvent>, hub: Arc<EventHub>) -> Self {
        Self {
            subscription_id,
            rx,
            hub,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The subscription id backing this stream.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Explicit unregistration. Idempotent; already buffered events stay readable.
    pub fn unsubscribe(&self) {
        if !self.unregistered.swap(true, Ordering::AcqRel) {
            self.hub.unsubscribe(self.subscription_id);
        }
    }

    /// Next buffered event, if any.
    ///
    /// # Errors
    /// `Disconnected` once unsubscribed and drained.
    pub fn try_recv(&self) -> FenceResult<Option<TransitionEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }

    /// Receive the next event with a timeout.
    ///
    /// Blocks the calling thread; from async code prefer [`EventStream::try_recv`].
    ///
    /// # Errors
    /// `Timeout` when nothing arrived in time, `Disconnected` once unsubscribed.
    pub fn recv_timeout(&self, timeout: Duration) -> FenceResult<TransitionEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => FenceError::timeout("event_stream.recv", timeout),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Every event buffered right now, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<TransitionEvent> {
        self.rx.try_iter().collect()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
