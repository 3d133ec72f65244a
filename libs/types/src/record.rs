//! Decoded market-data records
//!
//! A record is one application-level unit of market data: the latest
//! field values for a single instrument key. Records are produced by a
//! decoder, travel through the pipeline by value and end up in the live
//! value store, which only ever keeps the last record seen per key.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::RecordError;

/// Behaviour the live value store and the management surface need from a
/// record type.
pub trait LiveRecord: Clone + Send + Sync + 'static {
    /// Identifier the record is cached under.
    fn key(&self) -> &str;

    /// Whether this record marks the end of the initial state-of-the-world
    /// load rather than carrying a value.
    fn is_snapshot_marker(&self) -> bool {
        false
    }

    /// Flattened `field -> value` pairs, used for CSV export.
    fn field_values(&self) -> BTreeMap<String, String>;

    /// Reject records that decoded but cannot be stored.
    fn validate(&self) -> Result<(), RecordError> {
        Ok(())
    }
}

/// What a record represents in the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Full image of the instrument, sent during the initial load.
    Image,
    /// Incremental change to an instrument already imaged.
    #[default]
    Update,
    /// End of the initial load. Carries no fields.
    SnapshotComplete,
}

/// A market-data record for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataRecord {
    /// Instrument identifier (e.g., "AAPL.O", "BTC/USDT")
    pub key: String,
    /// Feed sequence number assigned by the publisher
    pub sequence: u64,
    /// Unix nanoseconds timestamp from the publisher clock
    pub timestamp: i64,
    #[serde(default)]
    pub kind: RecordKind,
    /// Field values keyed by field name (BID, ASK, LAST, VOLUME, ...)
    #[serde(default)]
    pub fields: BTreeMap<String, Decimal>,
}

impl MarketDataRecord {
    /// Create an update record with no fields.
    pub fn new(key: impl Into<String>, sequence: u64, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            sequence,
            timestamp,
            kind: RecordKind::Update,
            fields: BTreeMap::new(),
        }
    }

    /// Create the end-of-snapshot marker.
    pub fn snapshot_complete(sequence: u64, timestamp: i64) -> Self {
        Self {
            key: String::new(),
            sequence,
            timestamp,
            kind: RecordKind::SnapshotComplete,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style setter for the record kind.
    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builder-style setter for a single field.
    pub fn with_field(mut self, name: impl Into<String>, value: Decimal) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Value of a field, if present.
    pub fn field(&self, name: &str) -> Option<Decimal> {
        self.fields.get(name).copied()
    }
}

impl LiveRecord for MarketDataRecord {
    fn key(&self) -> &str {
        &self.key
    }

    fn is_snapshot_marker(&self) -> bool {
        self.kind == RecordKind::SnapshotComplete
    }

    fn field_values(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(name, value)| (name.clone(), value.normalize().to_string()))
            .collect()
    }

    fn validate(&self) -> Result<(), RecordError> {
        if self.is_snapshot_marker() {
            if !self.fields.is_empty() {
                return Err(RecordError::MarkerWithFields {
                    count: self.fields.len(),
                });
            }
            return Ok(());
        }

        if self.key.is_empty() {
            return Err(RecordError::EmptyKey);
        }
        if self.key.chars().any(char::is_control) {
            return Err(RecordError::InvalidKey {
                key: self.key.clone(),
            });
        }
        if self.fields.keys().any(String::is_empty) {
            return Err(RecordError::EmptyFieldName {
                key: self.key.clone(),
            });
        }
        Ok(())
    }
}
