//! Bounded in-memory history of captured exchanges with live fan-out.
//!
//! The ordered history and the subscriber registry sit behind independent
//! locks. `append` holds the history write lock while it fans the new record
//! out, which keeps every subscriber's view in append order; delivery uses
//! `try_send` so a slow consumer can never stall the producer.

use super::record::CaptureRecord;
use dashmap::DashMap;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

pub type SubscriberId = u64;

type Registry = DashMap<SubscriberId, mpsc::Sender<Arc<CaptureRecord>>>;

pub struct CaptureStore {
    records: RwLock<VecDeque<Arc<CaptureRecord>>>,
    capacity: usize,
    subscribers: Arc<Registry>,
    next_subscriber: AtomicU64,
    subscriber_buffer: usize,
}

impl CaptureStore {
    /// Create a store holding at most `capacity` records. A capacity of zero
    /// falls back to [`DEFAULT_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        Self::with_subscriber_buffer(capacity, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_subscriber_buffer(capacity: usize, subscriber_buffer: usize) -> Self {
        let capacity = if capacity == 0 {
            tracing::warn!(
                "Capture capacity of 0 requested, using default of {}",
                DEFAULT_CAPACITY
            );
            DEFAULT_CAPACITY
        } else {
            capacity
        };

        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(1),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a finished record, evicting the oldest one if the store is full,
    /// and deliver it to every current subscriber.
    pub fn append(&self, record: CaptureRecord) -> Arc<CaptureRecord> {
        let record = Arc::new(record);

        let mut records = self.write_records();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        self.fan_out(&record);
        drop(records);

        record
    }

    fn fan_out(&self, record: &Arc<CaptureRecord>) {
        let senders: Vec<_> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, sender) in senders {
            match sender.try_send(record.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(subscriber = id, "Subscriber queue full, dropping record");
                }
                Err(TrySendError::Closed(_)) => {
                    self.subscribers.remove(&id);
                }
            }
        }
    }

    /// Snapshot of the whole history in append order.
    pub fn all(&self) -> Vec<Arc<CaptureRecord>> {
        self.read_records().iter().cloned().collect()
    }

    /// The last `n` records in append order. `0`, or anything larger than the
    /// current size, returns the whole history.
    pub fn recent(&self, n: usize) -> Vec<Arc<CaptureRecord>> {
        let records = self.read_records();
        let n = if n == 0 || n > records.len() {
            records.len()
        } else {
            n
        };
        records.iter().skip(records.len() - n).cloned().collect()
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<CaptureRecord>> {
        self.read_records()
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Drop the whole history. Subscriptions stay registered.
    pub fn clear(&self) {
        self.write_records().clear();
    }

    pub fn count(&self) -> usize {
        self.read_records().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Register a live subscriber. Only records appended after this call
    /// returns are delivered to it.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.subscriber_buffer);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        // Registering under the history lock orders this against in-flight appends.
        let _records = self.read_records();
        self.subscribers.insert(id, sender);

        tracing::debug!(subscriber = id, "Subscriber registered");

        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Deregister a subscriber and close its queue. Records already queued can
    /// still be drained, after which the consumer sees end-of-stream.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let _records = self.read_records();
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = id, "Subscriber removed");
        }
        removed
    }

    fn read_records(&self) -> RwLockReadGuard<'_, VecDeque<Arc<CaptureRecord>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, VecDeque<Arc<CaptureRecord>>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiving end of a live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<CaptureRecord>>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next delivered record, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Arc<CaptureRecord>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Arc<CaptureRecord>, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Stream for Subscription {
    type Item = Arc<CaptureRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
