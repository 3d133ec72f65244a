//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use feed_types::ids::ConnectionId;
use feed_types::record::MarketDataRecord;
use live_feed::decoder::encode_frame;
use live_feed::dispatcher::FeedCallback;
use rust_decimal::Decimal;

/// One observed callback, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    Received(String, u64),
    Disconnected,
    Terminated,
}

/// Records every callback the connector makes.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl FeedCallback<MarketDataRecord> for Recorder {
    async fn connected(&self, _connection: ConnectionId) {
        self.push(Event::Connected);
    }

    async fn received(&self, record: MarketDataRecord) -> anyhow::Result<()> {
        self.push(Event::Received(record.key.clone(), record.sequence));
        Ok(())
    }

    async fn disconnected(&self, _connection: ConnectionId) {
        self.push(Event::Disconnected);
    }

    async fn terminated(&self) {
        self.push(Event::Terminated);
    }
}

pub fn quote(key: &str, seq: u64, last: i64) -> MarketDataRecord {
    MarketDataRecord::new(key, seq, 1_708_123_456_789_000_000 + seq as i64)
        .with_field("LAST", Decimal::new(last, 2))
}

/// Encode records back to back, as a capture.
pub fn capture(records: &[MarketDataRecord]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for record in records {
        bytes.extend(encode_frame(record).unwrap());
    }
    bytes
}

pub fn received(key: &str, seq: u64) -> Event {
    Event::Received(key.to_string(), seq)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
