//! Callback dispatch with per-record failure isolation
//!
//! Every record reaches application code through a [`Dispatcher`]. An
//! `Err` returned by the callback, or a panic inside it, is logged and
//! counted; the next record is dispatched as usual.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use feed_types::ids::ConnectionId;
use futures::FutureExt;
use tracing::{error, warn};

use crate::metrics::PipelineMetrics;

/// Application callbacks driven by the connector.
///
/// Per connection attempt the order is `connected`, zero or more
/// `received`, then `disconnected`. `terminated` fires once, after the
/// last `disconnected`, when the connector leaves its loop for good.
#[async_trait]
pub trait FeedCallback<T>: Send + Sync {
    async fn connected(&self, _connection: ConnectionId) {}

    async fn received(&self, record: T) -> anyhow::Result<()>;

    async fn disconnected(&self, _connection: ConnectionId) {}

    async fn terminated(&self) {}
}

/// Per-record processing contract of the split pipeline.
#[async_trait]
pub trait RecordProcessor<T>: Send + Sync {
    async fn process(&self, record: T) -> anyhow::Result<()>;
}

/// Presents a [`RecordProcessor`] as a [`FeedCallback`], so the processing
/// job and the direct modes share one dispatch path.
pub struct ProcessorCallback<T> {
    processor: Arc<dyn RecordProcessor<T>>,
}

impl<T> ProcessorCallback<T> {
    pub fn new(processor: Arc<dyn RecordProcessor<T>>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl<T: Send + 'static> FeedCallback<T> for ProcessorCallback<T> {
    async fn received(&self, record: T) -> anyhow::Result<()> {
        self.processor.process(record).await
    }
}

/// Delivers records and connection events to a callback.
pub struct Dispatcher<T> {
    callback: Arc<dyn FeedCallback<T>>,
    metrics: Arc<PipelineMetrics>,
    forwarding: bool,
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn new(callback: Arc<dyn FeedCallback<T>>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            callback,
            metrics,
            forwarding: false,
        }
    }

    /// Mark the callback as a hand-off to another dispatcher (the split
    /// pipeline's queue). Successful hand-offs are then not counted as
    /// dispatched, since the downstream dispatcher counts them.
    pub fn into_forwarding(mut self) -> Self {
        self.forwarding = true;
        self
    }

    /// Hand one record to the callback. Returns whether it was processed
    /// without error.
    pub async fn dispatch(&self, record: T) -> bool {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.callback.received(record))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                if !self.forwarding {
                    self.metrics
                        .record_dispatched(start.elapsed().as_nanos() as u64);
                }
                true
            }
            Ok(Err(err)) => {
                self.metrics.record_processing_failure();
                warn!(error = %err, "Record processing failed, continuing");
                false
            }
            Err(panic) => {
                self.metrics.record_processing_failure();
                warn!(panic = %panic_message(panic.as_ref()), "Record processing panicked, continuing");
                false
            }
        }
    }

    pub async fn connected(&self, connection: ConnectionId) {
        self.notify("connected", self.callback.connected(connection))
            .await;
    }

    pub async fn disconnected(&self, connection: ConnectionId) {
        self.notify("disconnected", self.callback.disconnected(connection))
            .await;
    }

    pub async fn terminated(&self) {
        self.notify("terminated", self.callback.terminated()).await;
    }

    async fn notify<F>(&self, event: &'static str, fut: F)
    where
        F: std::future::Future<Output = ()>,
    {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            error!(event, panic = %panic_message(panic.as_ref()), "Feed callback panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Picky {
        seen: Mutex<Vec<u32>>,
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl FeedCallback<u32> for Picky {
        async fn connected(&self, _connection: ConnectionId) {
            self.events.lock().unwrap().push("connected");
        }

        async fn received(&self, record: u32) -> anyhow::Result<()> {
            match record {
                13 => anyhow::bail!("unlucky record"),
                666 => panic!("cursed record"),
                _ => {
                    self.seen.lock().unwrap().push(record);
                    Ok(())
                }
            }
        }

        async fn disconnected(&self, _connection: ConnectionId) {
            panic!("disconnect handler blew up");
        }
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_record() {
        let callback = Arc::new(Picky::default());
        let metrics = Arc::new(PipelineMetrics::new());
        let dispatcher = Dispatcher::<u32>::new(callback.clone(), metrics.clone());

        assert!(dispatcher.dispatch(1).await);
        assert!(!dispatcher.dispatch(13).await);
        assert!(!dispatcher.dispatch(666).await);
        assert!(dispatcher.dispatch(2).await);

        assert_eq!(*callback.seen.lock().unwrap(), vec![1, 2]);
        let exported = metrics.export();
        assert_eq!(exported["records_dispatched"], 2);
        assert_eq!(exported["processing_failures"], 2);
    }

    #[tokio::test]
    async fn test_event_panics_are_contained() {
        let callback = Arc::new(Picky::default());
        let dispatcher = Dispatcher::<u32>::new(callback.clone(), Arc::new(PipelineMetrics::new()));

        let connection = ConnectionId::new();
        dispatcher.connected(connection).await;
        dispatcher.disconnected(connection).await;
        dispatcher.terminated().await;

        assert_eq!(*callback.events.lock().unwrap(), vec!["connected"]);
    }

    struct Doubler {
        out: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl RecordProcessor<u32> for Doubler {
        async fn process(&self, record: u32) -> anyhow::Result<()> {
            self.out.lock().unwrap().push(record * 2);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_processor_callback_adapter() {
        let processor = Arc::new(Doubler {
            out: Mutex::new(Vec::new()),
        });
        let callback = Arc::new(ProcessorCallback::<u32>::new(processor.clone()));
        let dispatcher = Dispatcher::new(callback, Arc::new(PipelineMetrics::new()));

        dispatcher.dispatch(4).await;
        dispatcher.dispatch(5).await;

        assert_eq!(*processor.out.lock().unwrap(), vec![8, 10]);
    }

    #[tokio::test]
    async fn test_forwarding_dispatch_is_not_counted() {
        let callback = Arc::new(Picky::default());
        let metrics = Arc::new(PipelineMetrics::new());
        let dispatcher =
            Dispatcher::<u32>::new(callback.clone(), metrics.clone()).into_forwarding();

        assert!(dispatcher.dispatch(1).await);
        assert!(!dispatcher.dispatch(13).await);

        let exported = metrics.export();
        assert_eq!(exported["records_dispatched"], 0);
        assert_eq!(exported["processing_failures"], 1);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
