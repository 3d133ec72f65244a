//! Consumption and processing units of the split pipeline
//!
//! The consumption unit is an ordinary [`IngestConnector`] whose callback
//! is a [`QueueingCallback`]: every decoded record is offered to a queue
//! shared with a [`RecordProcessingJob`], which drains it on its own task
//! and hands each record to a [`RecordProcessor`].
//!
//! [`IngestConnector`]: crate::connector::IngestConnector
//! [`RecordProcessor`]: crate::dispatcher::RecordProcessor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feed_types::ids::ConnectionId;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, FeedCallback};
use crate::metrics::PipelineMetrics;
use crate::queue::{Offered, Polled, QueueItem, RecordConsumer, RecordProducer};

/// Default interval between termination checks of an idle processing job.
pub const DEFAULT_PROCESSING_POLL: Duration = Duration::from_secs(5);

/// Feed callback that forwards records into the shared queue.
pub struct QueueingCallback<T> {
    producer: RecordProducer<T>,
    metrics: Arc<PipelineMetrics>,
}

impl<T> QueueingCallback<T> {
    pub fn new(producer: RecordProducer<T>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { producer, metrics }
    }
}

#[async_trait]
impl<T: Send + 'static> FeedCallback<T> for QueueingCallback<T> {
    async fn connected(&self, connection: ConnectionId) {
        debug!(connection_id = %connection, depth = self.producer.depth(), "Consumption connected");
    }

    async fn received(&self, record: T) -> anyhow::Result<()> {
        match self.producer.offer(record).await? {
            Offered::Enqueued => {}
            Offered::Dropped => self.metrics.record_dropped(),
        }
        Ok(())
    }

    async fn disconnected(&self, connection: ConnectionId) {
        debug!(connection_id = %connection, depth = self.producer.depth(), "Consumption disconnected");
    }

    async fn terminated(&self) {
        // Runs after poison, so it must not wait for room. Without the
        // sentinel the job still ends on its shutdown flag, or once this
        // producer is dropped and the queue drains.
        match self.producer.try_terminate() {
            Ok(true) => {}
            Ok(false) => warn!(
                capacity = self.producer.capacity(),
                "Record queue full, terminate sentinel not enqueued"
            ),
            Err(_) => debug!("Processing job gone before terminate sentinel"),
        }
    }
}

/// Drains the shared queue and dispatches each record.
pub struct RecordProcessingJob<T> {
    consumer: RecordConsumer<T>,
    dispatcher: Dispatcher<T>,
    poll: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<T: Send + 'static> RecordProcessingJob<T> {
    pub fn new(consumer: RecordConsumer<T>, dispatcher: Dispatcher<T>, poll: Duration) -> Self {
        Self {
            consumer,
            dispatcher,
            poll,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the job on `runtime`.
    pub fn spawn_on(self, runtime: &Handle) -> ProcessingHandle {
        let shutdown = Arc::clone(&self.shutdown);
        let task = runtime.spawn(self.run());
        ProcessingHandle { shutdown, task }
    }

    async fn run(mut self) {
        info!(capacity = self.consumer.capacity(), "Processing job started");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                if self.consumer.depth() > 0 {
                    warn!(abandoned = self.consumer.depth(), "Processing job terminated with records queued");
                }
                break;
            }

            match self.consumer.take_timeout(self.poll).await {
                Polled::Item(QueueItem::Record(record)) => {
                    self.dispatcher.dispatch(record).await;
                }
                Polled::Item(QueueItem::EndOfStream) => {
                    debug!("End of stream marker skipped");
                }
                Polled::Item(QueueItem::Terminate) => {
                    debug!("Terminate sentinel received");
                    break;
                }
                Polled::TimedOut => {}
                Polled::Closed => {
                    debug!("Record queue closed");
                    break;
                }
            }
        }
        info!("Processing job terminated");
    }
}

/// Control handle for a spawned processing job.
#[derive(Debug)]
pub struct ProcessingHandle {
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ProcessingHandle {
    /// Ask the job to stop at its next loop iteration. Returns `true` only
    /// for the call that set the flag.
    pub fn terminate(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait up to `timeout` for the job to end. Returns `false` if it is
    /// still running. Do not call again after `true`.
    pub async fn join_timeout(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "Processing task ended abnormally");
                true
            }
            Err(_) => false,
        }
    }
}
