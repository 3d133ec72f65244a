//! Start/stop supervision of the split pipeline
//!
//! A [`PipelineLifecycle`] owns exactly two execution units: the
//! consumption unit (a connector feeding the shared queue) and the
//! processing unit (a job draining it). `start` spawns both with a fresh
//! queue; `stop` signals and joins each in turn, never waiting longer than
//! the join timeout per unit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::connector::{ConnectionState, ConnectorConfig, ConnectorHandle, IngestConnector};
use crate::decoder::DecoderFactory;
use crate::dispatcher::{Dispatcher, ProcessorCallback, RecordProcessor};
use crate::jobs::{ProcessingHandle, QueueingCallback, RecordProcessingJob, DEFAULT_PROCESSING_POLL};
use crate::metrics::PipelineMetrics;
use crate::queue::{self, QueueConfig};
use crate::source::ByteStreamSource;

/// Default bound on each join during `stop`.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub queue: QueueConfig,
    pub connector: ConnectorConfig,
    pub processing_poll: Duration,
    pub join_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            connector: ConnectorConfig::default(),
            processing_poll: DEFAULT_PROCESSING_POLL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Default)]
struct Units {
    consumption: Option<ConnectorHandle>,
    processing: Option<ProcessingHandle>,
}

impl Units {
    fn any_alive(&self) -> bool {
        self.consumption.as_ref().is_some_and(|c| !c.is_finished())
            || self.processing.as_ref().is_some_and(|p| !p.is_finished())
    }

    fn all_alive(&self) -> bool {
        self.consumption.as_ref().is_some_and(|c| !c.is_finished())
            && self.processing.as_ref().is_some_and(|p| !p.is_finished())
    }
}

struct Inner {
    state: LifecycleState,
    units: Units,
    stop_in_flight: bool,
}

/// Runs a consumption unit and a processing unit as a pair.
pub struct PipelineLifecycle<T> {
    source: Arc<dyn ByteStreamSource>,
    decoders: Arc<dyn DecoderFactory<T>>,
    processor: Arc<dyn RecordProcessor<T>>,
    config: LifecycleConfig,
    runtime: Handle,
    metrics: Arc<PipelineMetrics>,
    inner: Mutex<Inner>,
}

impl<T: Send + 'static> PipelineLifecycle<T> {
    pub fn new(
        source: Arc<dyn ByteStreamSource>,
        decoders: Arc<dyn DecoderFactory<T>>,
        processor: Arc<dyn RecordProcessor<T>>,
        config: LifecycleConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            source,
            decoders,
            processor,
            config,
            runtime,
            metrics: Arc::new(PipelineMetrics::new()),
            inner: Mutex::new(Inner {
                state: LifecycleState::Stopped,
                units: Units::default(),
                stop_in_flight: false,
            }),
        }
    }

    /// Record into shared metrics instead of a private set.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn both units. A no-op while either unit from a previous start is
    /// still alive.
    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.stop_in_flight {
            warn!("Pipeline is stopping, start ignored");
            return;
        }
        if inner.units.any_alive() {
            info!(state = ?inner.state, "Pipeline already running, start ignored");
            return;
        }
        inner.state = LifecycleState::Starting;

        let (producer, consumer) = queue::bounded(&self.config.queue);

        let queueing = Arc::new(QueueingCallback::new(producer, Arc::clone(&self.metrics)));
        let consumption = IngestConnector::with_metrics(
            Arc::clone(&self.source),
            Arc::clone(&self.decoders),
            queueing,
            self.config.connector.clone(),
            Arc::clone(&self.metrics),
        )
        .forwarding()
        .spawn_on(&self.runtime);

        let processing_callback = Arc::new(ProcessorCallback::new(Arc::clone(&self.processor)));
        let processing = RecordProcessingJob::new(
            consumer,
            Dispatcher::new(processing_callback, Arc::clone(&self.metrics)),
            self.config.processing_poll,
        )
        .spawn_on(&self.runtime);

        inner.units = Units {
            consumption: Some(consumption),
            processing: Some(processing),
        };
        inner.state = LifecycleState::Running;
        info!(
            source = %self.source.describe(),
            capacity = self.config.queue.capacity,
            "Pipeline started"
        );
    }

    /// Signal and join the consumption unit, then the processing unit.
    /// Each join waits at most the join timeout; a unit that does not stop
    /// in time is logged and kept, so `is_running` keeps reporting it.
    pub async fn stop(&self) {
        let mut units = {
            let mut inner = self.lock();
            if inner.units.consumption.is_none() && inner.units.processing.is_none() {
                return;
            }
            inner.state = LifecycleState::Stopping;
            inner.stop_in_flight = true;
            std::mem::take(&mut inner.units)
        };
        let timeout = self.config.join_timeout;
        info!(?timeout, "Stopping pipeline");

        if let Some(mut consumption) = units.consumption.take() {
            consumption.poison();
            if !consumption.join_timeout(timeout).await {
                error!(?timeout, "Consumption unit did not stop in time");
                units.consumption = Some(consumption);
            }
        }

        if let Some(mut processing) = units.processing.take() {
            processing.terminate();
            if !processing.join_timeout(timeout).await {
                error!(?timeout, "Processing unit did not stop in time");
                units.processing = Some(processing);
            }
        }

        let mut inner = self.lock();
        let clean = units.consumption.is_none() && units.processing.is_none();
        inner.units = units;
        inner.stop_in_flight = false;
        if clean {
            inner.state = LifecycleState::Stopped;
            info!("Pipeline stopped");
        } else {
            warn!("Pipeline stop incomplete, units still alive");
        }
    }

    /// True iff both units are alive. Once a stop has begun, true until
    /// every unit has actually ended, so a unit that outlived its join
    /// timeout is still reported.
    pub fn is_running(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            LifecycleState::Stopping => inner.stop_in_flight || inner.units.any_alive(),
            _ => inner.units.all_alive(),
        }
    }

    /// Whether each unit is alive, as `(consumption, processing)`.
    pub fn units_alive(&self) -> (bool, bool) {
        let inner = self.lock();
        (
            inner.units.consumption.as_ref().is_some_and(|c| !c.is_finished()),
            inner.units.processing.as_ref().is_some_and(|p| !p.is_finished()),
        )
    }

    /// Current state. A pipeline left in `Stopping` by a timed-out join
    /// settles to `Stopped` once its straggling units have ended.
    pub fn state(&self) -> LifecycleState {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Stopping
            && !inner.stop_in_flight
            && !inner.units.any_alive()
        {
            inner.state = LifecycleState::Stopped;
            info!("Straggling units ended, pipeline stopped");
        }
        inner.state
    }

    /// Connection state of the consumption unit, if one has been started.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.lock()
            .units
            .consumption
            .as_ref()
            .map(ConnectorHandle::state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{encode_frame, LengthPrefixedJsonFactory};
    use crate::source::ReplayByteSource;
    use async_trait::async_trait;
    use feed_types::record::MarketDataRecord;
    use tokio::sync::Notify;

    struct Sink;

    #[async_trait]
    impl RecordProcessor<MarketDataRecord> for Sink {
        async fn process(&self, _record: MarketDataRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl RecordProcessor<MarketDataRecord> for Stuck {
        async fn process(&self, _record: MarketDataRecord) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Waits on the gate for every record.
    #[derive(Default)]
    struct Gated {
        gate: Notify,
    }

    #[async_trait]
    impl RecordProcessor<MarketDataRecord> for Gated {
        async fn process(&self, _record: MarketDataRecord) -> anyhow::Result<()> {
            self.gate.notified().await;
            Ok(())
        }
    }

    fn lifecycle(
        replays: usize,
        processor: Arc<dyn RecordProcessor<MarketDataRecord>>,
    ) -> PipelineLifecycle<MarketDataRecord> {
        lifecycle_with(1, replays, QueueConfig::default(), processor)
    }

    fn lifecycle_with(
        records: u64,
        replays: usize,
        queue: QueueConfig,
        processor: Arc<dyn RecordProcessor<MarketDataRecord>>,
    ) -> PipelineLifecycle<MarketDataRecord> {
        let mut frames = Vec::new();
        for seq in 1..=records {
            frames.extend(encode_frame(&MarketDataRecord::new("AAPL.O", seq, 0)).unwrap());
        }
        let config = LifecycleConfig {
            queue,
            connector: ConnectorConfig {
                reconnect_backoff: Duration::from_secs(3600),
                ..ConnectorConfig::default()
            },
            processing_poll: Duration::from_millis(50),
            join_timeout: Duration::from_millis(500),
            ..LifecycleConfig::default()
        };
        PipelineLifecycle::new(
            Arc::new(ReplayByteSource::from_bytes(frames, replays)),
            Arc::new(LengthPrefixedJsonFactory::<MarketDataRecord>::default()),
            processor,
            config,
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let pipeline = lifecycle(1, Arc::new(Sink));
        pipeline.stop().await;
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.state(), LifecycleState::Stopped);
        assert_eq!(pipeline.connection_state(), None);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_joins() {
        let pipeline = lifecycle(1, Arc::new(Sink));

        pipeline.start();
        pipeline.start();
        assert!(pipeline.is_running());
        assert_eq!(pipeline.state(), LifecycleState::Running);

        pipeline.stop().await;
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.units_alive(), (false, false));
        assert_eq!(pipeline.state(), LifecycleState::Stopped);

        // Restartable after a clean stop.
        pipeline.start();
        assert!(pipeline.is_running());
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_bounded_with_stuck_processor() {
        let pipeline = lifecycle(1, Arc::new(Stuck));
        pipeline.start();

        // Let the single record reach the stuck processor.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        pipeline.stop().await;
        assert!(started.elapsed() < Duration::from_secs(3));

        // Consumption stopped; the stuck processing unit keeps the
        // pipeline reported as running.
        assert_eq!(pipeline.units_alive(), (false, true));
        assert!(pipeline.is_running());
        assert_eq!(pipeline.state(), LifecycleState::Stopping);

        // A start while a unit is still alive is ignored.
        pipeline.start();
        assert_eq!(pipeline.units_alive(), (false, true));
    }

    #[tokio::test]
    async fn test_stop_releases_consumption_blocked_on_full_queue() {
        let queue = QueueConfig {
            capacity: 1,
            ..QueueConfig::default()
        };
        let pipeline = lifecycle_with(3, 1, queue, Arc::new(Stuck));
        pipeline.start();

        // One record held by the processor, one queued, one blocked in put.
        tokio::time::sleep(Duration::from_millis(50)).await;

        pipeline.stop().await;
        assert_eq!(pipeline.units_alive(), (false, true));
        assert_eq!(pipeline.state(), LifecycleState::Stopping);
    }

    #[tokio::test]
    async fn test_state_settles_once_straggler_exits() {
        let processor = Arc::new(Gated::default());
        let pipeline = lifecycle(1, processor.clone());
        pipeline.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        pipeline.stop().await;
        assert_eq!(pipeline.state(), LifecycleState::Stopping);
        assert!(pipeline.is_running());

        // The processor returns, the job sees its shutdown flag and exits.
        processor.gate.notify_one();
        let mut settled = false;
        for _ in 0..200 {
            if pipeline.units_alive() == (false, false) {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled);
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.state(), LifecycleState::Stopped);

        pipeline.start();
        assert!(pipeline.is_running());
        processor.gate.notify_one();
        pipeline.stop().await;
    }
}
