//! Live Feed Service
//!
//! Ingests a continuous stream of market-data records from an external
//! feed and keeps a last-value cache of it:
//! - Pluggable byte-stream sources (TCP with heartbeat, capture replay)
//! - Pluggable record decoders (length-prefixed JSON ships by default)
//! - A reconnect state machine that retries forever until poisoned
//! - Bounded-queue backpressure between decoding and processing
//! - Per-record failure isolation in dispatch
//! - Start/stop supervision with bounded joins
//!
//! # Architecture
//!
//! ```text
//!   ByteStreamSource
//!          │ open()
//!    ┌─────▼──────┐
//!    │  Decoder   │  ← fresh per connection
//!    └─────┬──────┘
//!          │ read_record()
//!  ┌───────▼────────┐   connected / disconnected
//!  │ IngestConnector│ ─────────────────────────┐
//!  └───────┬────────┘                          │
//!          │ offer()                           │
//!  ┌───────▼────────┐                          │
//!  │ BoundedQueue   │  ← Record | EndOfStream | Terminate
//!  └───────┬────────┘                          │
//!          │ take_timeout()                    │
//!  ┌───────▼────────┐                          │
//!  │ ProcessingJob  │ → Dispatcher → processor │
//!  └───────┬────────┘                          │
//!          │                                   │
//!  ┌───────▼────────┐                  ┌───────▼──────┐
//!  │ LiveValueStore │ ◄──── reads ──── │  Management  │
//!  └────────────────┘                  └──────────────┘
//! ```
//!
//! Inline and pipelined modes skip the shared queue: the connector hands
//! records straight to a callback, decoding either on its own task or on
//! a worker pool through a per-connection queue.

pub mod config;
pub mod connector;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod jobs;
pub mod lifecycle;
pub mod management;
pub mod metrics;
pub mod queue;
pub mod source;
pub mod store;

pub use config::{DispatchMode, FeedConfig, SourceConfig};
pub use connector::{ConnectionState, ConnectorHandle, IngestConnector, ReadMode};
pub use dispatcher::{FeedCallback, RecordProcessor};
pub use error::{DecodeError, FeedError};
pub use lifecycle::PipelineLifecycle;
pub use store::LiveValueStore;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
