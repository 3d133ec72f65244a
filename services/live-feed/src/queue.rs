//! Bounded record queue with end-of-stream and terminate sentinels
//!
//! The queue is the only state shared between the unit that decodes
//! records and the unit that dispatches them. It is a single-producer,
//! single-consumer FIFO: records come out in exactly the order they went
//! in. When the queue is full the producer either waits for room (the
//! default, which throttles decoding and therefore socket reads) or, when
//! configured with [`OverflowPolicy::DropNewest`], discards the incoming
//! record and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::FeedError;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5000;

/// What the producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the consumer to make room.
    #[default]
    Block,
    /// Drop the record being offered.
    DropNewest,
}

/// Queue sizing and overflow behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// An entry in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem<T> {
    Record(T),
    /// The producing connection ended. Always the last item of its segment.
    EndOfStream,
    /// The producing unit has shut down for good.
    Terminate,
}

/// The queue has no consumer (or, for takes, no producer) left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("record queue closed")]
pub struct QueueClosed;

impl From<QueueClosed> for FeedError {
    fn from(_: QueueClosed) -> Self {
        FeedError::QueueClosed
    }
}

/// Failure of a non-blocking put; the record is handed back.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum TryPutError<T> {
    #[error("record queue full")]
    Full(T),
    #[error("record queue closed")]
    Closed(T),
}

/// Outcome of [`RecordProducer::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offered {
    Enqueued,
    Dropped,
}

/// Outcome of a timed take.
#[derive(Debug, PartialEq, Eq)]
pub enum Polled<T> {
    Item(QueueItem<T>),
    TimedOut,
    Closed,
}

#[derive(Debug)]
struct QueueStats {
    capacity: usize,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
}

/// Create a queue, returning its producing and consuming halves.
pub fn bounded<T>(config: &QueueConfig) -> (RecordProducer<T>, RecordConsumer<T>) {
    let capacity = config.capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(QueueStats {
        capacity,
        overflow: config.overflow,
        dropped: AtomicU64::new(0),
    });

    debug!(capacity, overflow = ?config.overflow, "Record queue created");

    (
        RecordProducer {
            tx,
            stats: Arc::clone(&stats),
        },
        RecordConsumer { rx, stats },
    )
}

/// Producing half. Not `Clone`: a queue has exactly one producer, which is
/// what makes "end-of-stream is the last item" hold.
#[derive(Debug)]
pub struct RecordProducer<T> {
    tx: mpsc::Sender<QueueItem<T>>,
    stats: Arc<QueueStats>,
}

impl<T> RecordProducer<T> {
    /// Enqueue a record, waiting while the queue is full.
    pub async fn put(&self, record: T) -> Result<(), QueueClosed> {
        self.tx
            .send(QueueItem::Record(record))
            .await
            .map_err(|_| QueueClosed)
    }

    /// Enqueue a record only if there is room right now.
    pub fn try_put(&self, record: T) -> Result<(), TryPutError<T>> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(QueueItem::Record(record));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => Err(TryPutError::Full(record)),
            Err(mpsc::error::TrySendError::Closed(())) => Err(TryPutError::Closed(record)),
        }
    }

    /// Enqueue a record according to the configured overflow policy.
    pub async fn offer(&self, record: T) -> Result<Offered, QueueClosed> {
        match self.stats.overflow {
            OverflowPolicy::Block => self.put(record).await.map(|()| Offered::Enqueued),
            OverflowPolicy::DropNewest => match self.try_put(record) {
                Ok(()) => Ok(Offered::Enqueued),
                Err(TryPutError::Full(_)) => {
                    let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 || dropped % 1000 == 0 {
                        warn!(
                            capacity = self.stats.capacity,
                            dropped,
                            "Record queue full, dropping newest record"
                        );
                    }
                    Ok(Offered::Dropped)
                }
                Err(TryPutError::Closed(_)) => Err(QueueClosed),
            },
        }
    }

    /// Close this connection's segment with the end-of-stream sentinel.
    pub async fn finish(self) -> Result<(), QueueClosed> {
        self.tx
            .send(QueueItem::EndOfStream)
            .await
            .map_err(|_| QueueClosed)
    }

    /// Tell the consumer no further records will ever arrive. Never waits:
    /// returns `Ok(false)` when the queue is full and the sentinel was not
    /// enqueued.
    pub fn try_terminate(&self) -> Result<bool, QueueClosed> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(QueueItem::Terminate);
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Full(())) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(())) => Err(QueueClosed),
        }
    }

    /// Items currently buffered.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.stats.capacity
    }
}

/// Consuming half.
#[derive(Debug)]
pub struct RecordConsumer<T> {
    rx: mpsc::Receiver<QueueItem<T>>,
    stats: Arc<QueueStats>,
}

impl<T> RecordConsumer<T> {
    /// Wait for the next item. `None` once the producer is gone and the
    /// queue is drained.
    pub async fn take(&mut self) -> Option<QueueItem<T>> {
        self.rx.recv().await
    }

    /// Wait at most `timeout` for the next item.
    pub async fn take_timeout(&mut self, timeout: Duration) -> Polled<T> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Polled::Item(item),
            Ok(None) => Polled::Closed,
            Err(_) => Polled::TimedOut,
        }
    }

    /// Items currently buffered.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.stats.capacity
    }
}
