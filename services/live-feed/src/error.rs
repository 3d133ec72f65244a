//! Error taxonomy for the feed pipeline
//!
//! Transient connection errors and decode errors end a read phase and are
//! recovered by the reconnect loop. Only `SourceExhausted` is permanent.
//! Processing errors raised by application callbacks never appear here;
//! the dispatcher isolates them per record.

use std::io;
use std::time::Duration;

use feed_types::errors::RecordError;
use thiserror::Error;

/// Errors raised while turning bytes into records.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error while decoding: {0}")]
    Io(#[from] io::Error),

    #[error("truncated frame: expected {expected} bytes, stream ended after {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("frame length {length} exceeds limit {limit}")]
    FrameTooLarge { length: usize, limit: usize },

    #[error("malformed record payload: {0}")]
    Malformed(String),

    #[error("invalid record: {0}")]
    Invalid(#[from] RecordError),
}

impl DecodeError {
    /// Whether the stream is still positioned on a frame boundary, so the
    /// next `read_record` can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::Malformed(_) | DecodeError::Invalid(_))
    }
}

/// Errors raised by byte-stream sources and the connector.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("could not resolve {endpoint}")]
    Unresolved { endpoint: String },

    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("no data received within the heartbeat window")]
    HeartbeatTimeout,

    #[error("decode error: {0}")]
    Decode(DecodeError),

    #[error("source exhausted: {0}")]
    SourceExhausted(String),

    #[error("record queue closed")]
    QueueClosed,

    #[error("decode task failed: {0}")]
    TaskFailed(String),
}

impl FeedError {
    /// Permanent errors poison the connector instead of scheduling a retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FeedError::SourceExhausted(_))
    }
}

impl From<DecodeError> for FeedError {
    fn from(err: DecodeError) -> Self {
        match err {
            // Heartbeat-guarded streams report a silent peer as TimedOut.
            DecodeError::Io(e) if e.kind() == io::ErrorKind::TimedOut => FeedError::HeartbeatTimeout,
            other => FeedError::Decode(other),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
