//! Reconnect state machine
//!
//! An [`IngestConnector`] keeps a feed connection alive forever: prepare,
//! connect, read until the stream ends or fails, disconnect, back off,
//! repeat. Only a poison signal, or a source that reports itself
//! permanently exhausted, ends the loop.
//!
//! ```text
//! Idle → Preparing → Connecting → Connected → Reading → Disconnecting → Idle
//!   └──────────────────────── any state ───────────────────────→ Poisoned
//! ```
//!
//! Poisoning is observed at every suspension point through `select!`, so
//! a read that is blocked on a silent peer, a queue put that is blocked on
//! a full queue, or a backoff sleep is abandoned immediately. Abandoning a
//! read drops the decoder and with it the stream, which closes the socket.

use std::sync::Arc;
use std::time::Duration;

use feed_types::ids::ConnectionId;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::decoder::{DecoderFactory, RecordDecoder};
use crate::dispatcher::{Dispatcher, FeedCallback};
use crate::error::{DecodeError, FeedError};
use crate::metrics::PipelineMetrics;
use crate::queue::{self, Offered, QueueConfig, QueueItem, RecordProducer};
use crate::source::{ByteStream, ByteStreamSource};

/// Default delay between connection attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(1000);

/// What a read phase does with a record that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeErrorPolicy {
    /// End the read phase and reconnect.
    #[default]
    StreamFatal,
    /// Log and skip records whose frame was consumed intact. Framing and
    /// I/O errors still end the read phase.
    SkipAndContinue,
}

/// Settings for the reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub reconnect_backoff: Duration,
    pub decode_errors: DecodeErrorPolicy,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            decode_errors: DecodeErrorPolicy::StreamFatal,
        }
    }
}

/// Where the connector is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Preparing,
    Connecting,
    Connected,
    Reading,
    Disconnecting,
    /// Terminal.
    Poisoned,
}

/// How records get from the decoder to the callback.
#[derive(Debug, Clone)]
pub enum ReadMode {
    /// The connector task decodes and dispatches each record before
    /// reading the next one.
    Inline,
    /// A decode task on `pool` fills a fresh queue per connection; the
    /// connector task drains it and dispatches.
    Pipelined { pool: Handle, queue: QueueConfig },
}

/// One-way shutdown signal shared by every holder of a connector handle.
#[derive(Debug, Clone)]
pub struct PoisonSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl PoisonSignal {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Poison the connector. Returns `true` only for the call that made
    /// the transition; every later call is a no-op.
    pub fn poison(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_poisoned(&self) -> bool {
        *self.tx.borrow()
    }
}

enum ReadOutcome {
    EndOfStream,
    Failed(FeedError),
    Poisoned,
}

/// The reconnect loop, ready to be spawned.
pub struct IngestConnector<T> {
    source: Arc<dyn ByteStreamSource>,
    decoders: Arc<dyn DecoderFactory<T>>,
    dispatcher: Dispatcher<T>,
    config: ConnectorConfig,
    read_mode: ReadMode,
    metrics: Arc<PipelineMetrics>,
}

impl<T: Send + 'static> IngestConnector<T> {
    pub fn new(
        source: Arc<dyn ByteStreamSource>,
        decoders: Arc<dyn DecoderFactory<T>>,
        callback: Arc<dyn FeedCallback<T>>,
        config: ConnectorConfig,
    ) -> Self {
        Self::with_metrics(source, decoders, callback, config, Arc::new(PipelineMetrics::new()))
    }

    /// Like [`IngestConnector::new`], recording into shared metrics.
    pub fn with_metrics(
        source: Arc<dyn ByteStreamSource>,
        decoders: Arc<dyn DecoderFactory<T>>,
        callback: Arc<dyn FeedCallback<T>>,
        config: ConnectorConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            source,
            decoders,
            dispatcher: Dispatcher::new(callback, Arc::clone(&metrics)),
            config,
            read_mode: ReadMode::Inline,
            metrics,
        }
    }

    /// Treat the callback as a hand-off to a downstream dispatcher.
    pub fn forwarding(mut self) -> Self {
        self.dispatcher = self.dispatcher.into_forwarding();
        self
    }

    /// Select inline or pipelined reading. Defaults to inline.
    pub fn read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    /// Spawn the loop on the current runtime.
    pub fn spawn(self) -> ConnectorHandle {
        self.spawn_on(&Handle::current())
    }

    /// Spawn the loop on `runtime`.
    pub fn spawn_on(self, runtime: &Handle) -> ConnectorHandle {
        let (signal, poison_rx) = PoisonSignal::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let task = runtime.spawn(self.run(signal.clone(), poison_rx, state_tx));

        ConnectorHandle {
            signal,
            state: state_rx,
            task,
        }
    }

    async fn run(
        self,
        signal: PoisonSignal,
        mut poison: watch::Receiver<bool>,
        state: watch::Sender<ConnectionState>,
    ) {
        let source = self.source.describe();
        info!(source = %source, "Connector started");

        while !signal.is_poisoned() {
            transition(&state, ConnectionState::Preparing);
            let prepared = tokio::select! {
                biased;
                _ = poisoned(&mut poison) => break,
                result = self.source.prepare() => result,
            };

            let opened = match prepared {
                Ok(()) => {
                    transition(&state, ConnectionState::Connecting);
                    tokio::select! {
                        biased;
                        _ = poisoned(&mut poison) => break,
                        result = self.source.open() => result,
                    }
                }
                Err(err) => Err(err),
            };

            let stream = match opened {
                Ok(stream) => stream,
                Err(err) if err.is_permanent() => {
                    info!(source = %source, reason = %err, "Source permanently unavailable, poisoning connector");
                    signal.poison();
                    break;
                }
                Err(err) => {
                    self.metrics.record_connect_failure();
                    warn!(source = %source, error = %err, "Connection attempt failed");
                    transition(&state, ConnectionState::Idle);
                    if !self.backoff(&mut poison).await {
                        break;
                    }
                    continue;
                }
            };

            let connection = ConnectionId::new();
            transition(&state, ConnectionState::Connected);
            self.metrics.record_connect();
            info!(connection_id = %connection, source = %source, "Connection established");
            self.dispatcher.connected(connection).await;

            transition(&state, ConnectionState::Reading);
            let outcome = match &self.read_mode {
                ReadMode::Inline => self.read_inline(stream, &mut poison).await,
                ReadMode::Pipelined { pool, queue } => {
                    self.read_pipelined(stream, pool, queue, &mut poison).await
                }
            };

            // The read phase has dropped the stream by now.
            transition(&state, ConnectionState::Disconnecting);
            let stop = match &outcome {
                ReadOutcome::EndOfStream => {
                    info!(connection_id = %connection, "Feed stream ended");
                    false
                }
                ReadOutcome::Failed(err) => {
                    warn!(connection_id = %connection, error = %err, "Read phase failed");
                    self.source.on_read_error(err);
                    false
                }
                ReadOutcome::Poisoned => {
                    info!(connection_id = %connection, "Connection closed by poison");
                    true
                }
            };
            self.metrics.record_disconnect();
            self.dispatcher.disconnected(connection).await;

            if stop {
                break;
            }
            transition(&state, ConnectionState::Idle);
            if !self.backoff(&mut poison).await {
                break;
            }
        }

        transition(&state, ConnectionState::Poisoned);
        self.dispatcher.terminated().await;
        info!(source = %source, "Connector terminated");
    }

    /// Decode and dispatch on this task, one record at a time.
    async fn read_inline(
        &self,
        stream: ByteStream,
        poison: &mut watch::Receiver<bool>,
    ) -> ReadOutcome {
        let mut decoder = self.decoders.new_decoder(stream);
        loop {
            let next = tokio::select! {
                biased;
                _ = poisoned(poison) => return ReadOutcome::Poisoned,
                next = decoder.read_record() => next,
            };

            match next {
                Ok(Some(record)) => {
                    self.metrics.record_decoded();
                    tokio::select! {
                        biased;
                        _ = poisoned(poison) => {
                            warn!("Poisoned during dispatch, in-flight record abandoned");
                            return ReadOutcome::Poisoned;
                        }
                        _ = self.dispatcher.dispatch(record) => {}
                    }
                }
                Ok(None) => return ReadOutcome::EndOfStream,
                Err(err) => {
                    if !skip_decode_error(self.config.decode_errors, &err, &self.metrics) {
                        return ReadOutcome::Failed(err.into());
                    }
                }
            }
        }
    }

    /// Decode on the pool into a fresh queue; drain and dispatch here.
    async fn read_pipelined(
        &self,
        stream: ByteStream,
        pool: &Handle,
        queue: &QueueConfig,
        poison: &mut watch::Receiver<bool>,
    ) -> ReadOutcome {
        let (producer, mut consumer) = queue::bounded(queue);
        let decoder = self.decoders.new_decoder(stream);
        let mut decode_task = pool.spawn(decode_into_queue(
            decoder,
            producer,
            self.config.decode_errors,
            Arc::clone(&self.metrics),
        ));

        loop {
            let item = tokio::select! {
                biased;
                _ = poisoned(poison) => break,
                item = consumer.take() => item,
            };

            match item {
                Some(QueueItem::Record(record)) => {
                    tokio::select! {
                        biased;
                        _ = poisoned(poison) => {
                            warn!("Poisoned during dispatch, in-flight record abandoned");
                            break;
                        }
                        _ = self.dispatcher.dispatch(record) => {}
                    }
                }
                // The decode task has finished (or died); its result says why.
                Some(QueueItem::EndOfStream) | Some(QueueItem::Terminate) | None => {
                    return match (&mut decode_task).await {
                        Ok(Ok(())) => ReadOutcome::EndOfStream,
                        Ok(Err(err)) => ReadOutcome::Failed(err),
                        Err(join) => ReadOutcome::Failed(FeedError::TaskFailed(join.to_string())),
                    };
                }
            }
        }

        // Poisoned: cancel the decode task, which drops the stream.
        decode_task.abort();
        let _ = decode_task.await;
        ReadOutcome::Poisoned
    }

    async fn backoff(&self, poison: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            biased;
            _ = poisoned(poison) => false,
            _ = tokio::time::sleep(self.config.reconnect_backoff) => true,
        }
    }
}

/// Body of the pipelined-mode decode task. Always closes its queue
/// segment with `EndOfStream` unless the consumer is gone.
async fn decode_into_queue<T: Send + 'static>(
    mut decoder: Box<dyn RecordDecoder<T>>,
    producer: RecordProducer<T>,
    policy: DecodeErrorPolicy,
    metrics: Arc<PipelineMetrics>,
) -> Result<(), FeedError> {
    let result = loop {
        match decoder.read_record().await {
            Ok(Some(record)) => {
                metrics.record_decoded();
                match producer.offer(record).await {
                    Ok(Offered::Enqueued) => {}
                    Ok(Offered::Dropped) => metrics.record_dropped(),
                    Err(closed) => break Err(closed.into()),
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => {
                if !skip_decode_error(policy, &err, &metrics) {
                    break Err(err.into());
                }
            }
        }
    };

    drop(decoder);
    if producer.finish().await.is_err() {
        debug!("Queue consumer gone before end-of-stream");
    }
    result
}

/// Apply the decode-error policy. Returns `true` when reading continues.
fn skip_decode_error(
    policy: DecodeErrorPolicy,
    err: &DecodeError,
    metrics: &PipelineMetrics,
) -> bool {
    if matches!(err, DecodeError::Io(_)) {
        return false;
    }

    let skip = policy == DecodeErrorPolicy::SkipAndContinue && err.is_recoverable();
    metrics.record_decode_error(skip);
    if skip {
        warn!(error = %err, "Skipping undecodable record");
    }
    skip
}

async fn poisoned(poison: &mut watch::Receiver<bool>) {
    // A closed channel means every signal holder is gone; treat as poison.
    let _ = poison.wait_for(|poisoned| *poisoned).await;
}

fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let prev = state.send_replace(next);
    debug!(from = ?prev, to = ?next, "Connection state transition");
}

/// Read-only view of a spawned connector's state.
#[derive(Debug, Clone)]
pub struct ConnectorStatus {
    state: watch::Receiver<ConnectionState>,
}

impl ConnectorStatus {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ConnectionState::Poisoned
    }
}

/// Control handle for a spawned connector.
#[derive(Debug)]
pub struct ConnectorHandle {
    signal: PoisonSignal,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl ConnectorHandle {
    /// Poison the connector. Returns `true` only for the call that made
    /// the transition.
    pub fn poison(&self) -> bool {
        self.signal.poison()
    }

    /// A clonable signal for poisoning from elsewhere.
    pub fn poison_signal(&self) -> PoisonSignal {
        self.signal.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Read-only view for observers that must not control the connector.
    pub fn status(&self) -> ConnectorStatus {
        ConnectorStatus {
            state: self.state.clone(),
        }
    }

    /// Wait until the connector is observed in `target`. Returns `false`
    /// if it terminated without being seen there.
    ///
    /// Only the latest state is observable, so this is reliable for states
    /// the connector rests in (`Reading`, `Idle` during backoff,
    /// `Poisoned`). A passing state such as `Connected` can be overwritten
    /// before the waiter runs, and the wait then lasts until termination.
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        self.state
            .clone()
            .wait_for(|state| *state == target)
            .await
            .is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait up to `timeout` for the connector task to end. Returns
    /// `false` if it is still running. Do not call again after `true`.
    pub async fn join_timeout(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "Connector task ended abnormally");
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for the connector task to end.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(error = %err, "Connector task ended abnormally");
        }
    }
}
