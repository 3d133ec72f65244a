//! Service configuration
//!
//! `FeedConfig` is loaded from a JSON file. Every field has a default, so
//! a config file only needs to name what differs, and tests build configs
//! with struct update syntax.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::connector::{ConnectorConfig, DecodeErrorPolicy};
use crate::decoder::DEFAULT_MAX_FRAME_LEN;
use crate::error::ConfigError;
use crate::lifecycle::LifecycleConfig;
use crate::queue::{OverflowPolicy, QueueConfig};

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    150_000
}

fn default_replays() -> usize {
    1
}

/// Where the raw feed bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Live TCP feed.
    Tcp {
        host: String,
        port: u16,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
        /// A read that sees no byte for this long fails and forces a reconnect.
        #[serde(default = "default_heartbeat_timeout_ms")]
        heartbeat_timeout_ms: u64,
    },
    /// Previously captured feed bytes, replayed `replays` times.
    Replay {
        path: PathBuf,
        #[serde(default = "default_replays")]
        replays: usize,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Tcp {
            host: "127.0.0.1".to_string(),
            port: 9000,
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

/// How decoded records reach the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// The connector task decodes and dispatches each record in turn.
    Inline,
    /// A decode task on the worker pool feeds a per-connection queue that
    /// the connector task drains.
    Pipelined,
    /// Independent consumption and processing units sharing one queue.
    #[default]
    Split,
}

/// Top-level configuration for the `live-feed` service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub source: SourceConfig,
    pub mode: DispatchMode,
    pub queue: QueueConfig,
    pub decode_errors: DecodeErrorPolicy,
    /// Fixed delay between connection attempts.
    pub reconnect_backoff_ms: u64,
    /// Largest frame the decoder accepts.
    pub max_frame_len: usize,
    /// Timed-take interval of the processing job.
    pub processing_poll_ms: u64,
    /// Bound on each join during `stop()`.
    pub join_timeout_ms: u64,
    /// Bind address of the management HTTP surface.
    pub management_addr: SocketAddr,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            mode: DispatchMode::default(),
            queue: QueueConfig::default(),
            decode_errors: DecodeErrorPolicy::default(),
            reconnect_backoff_ms: 1_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            processing_poll_ms: 5_000,
            join_timeout_ms: 10_000,
            management_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
        }
    }
}

impl FeedConfig {
    /// Load and validate a config file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), mode = ?config.mode, "Loaded feed config");
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: FeedConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be at least 1".into()));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Invalid("max_frame_len must be at least 1".into()));
        }
        if self.processing_poll_ms == 0 {
            return Err(ConfigError::Invalid("processing_poll_ms must be at least 1".into()));
        }
        match &self.source {
            SourceConfig::Tcp {
                host,
                port,
                connect_timeout_ms,
                heartbeat_timeout_ms,
            } => {
                if host.is_empty() {
                    return Err(ConfigError::Invalid("source.host is empty".into()));
                }
                if *port == 0 {
                    return Err(ConfigError::Invalid("source.port must be non-zero".into()));
                }
                if *connect_timeout_ms == 0 || *heartbeat_timeout_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "source timeouts must be non-zero".into(),
                    ));
                }
            }
            SourceConfig::Replay { replays, .. } => {
                if *replays == 0 {
                    return Err(ConfigError::Invalid("source.replays must be at least 1".into()));
                }
            }
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn processing_poll(&self) -> Duration {
        Duration::from_millis(self.processing_poll_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Settings for the reconnect loop.
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            reconnect_backoff: self.reconnect_backoff(),
            decode_errors: self.decode_errors,
        }
    }

    /// Settings for the consumption/processing pair.
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            queue: self.queue.clone(),
            connector: self.connector_config(),
            processing_poll: self.processing_poll(),
            join_timeout: self.join_timeout(),
        }
    }
}
