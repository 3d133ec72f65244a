//! Replay determinism tests
//!
//! A captured byte sequence must produce the same callback sequence every
//! time it is replayed, in every read mode, whether it comes from memory
//! or from a capture file.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{capture, quote, received, Event, Recorder};
use feed_types::ids::ConnectionId;
use feed_types::record::MarketDataRecord;
use live_feed::config::SourceConfig;
use live_feed::connector::{ConnectorConfig, IngestConnector, ReadMode};
use live_feed::decoder::LengthPrefixedJsonFactory;
use live_feed::queue::QueueConfig;
use live_feed::source::{self, ByteStreamSource, ReplayByteSource};
use tokio::runtime::Handle;

fn fast_backoff() -> ConnectorConfig {
    ConnectorConfig {
        reconnect_backoff: Duration::from_millis(10),
        ..ConnectorConfig::default()
    }
}

async fn run_to_exhaustion(source: Arc<dyn ByteStreamSource>, mode: ReadMode) -> Vec<Event> {
    let recorder = Arc::new(Recorder::default());
    let handle = IngestConnector::<MarketDataRecord>::new(
        source,
        Arc::new(LengthPrefixedJsonFactory::<MarketDataRecord>::default()),
        recorder.clone(),
        fast_backoff(),
    )
    .read_mode(mode)
    .spawn();

    tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("replay should terminate once exhausted");
    recorder.events()
}

fn expected_twice() -> Vec<Event> {
    vec![
        Event::Connected,
        received("A", 1),
        received("B", 2),
        Event::Disconnected,
        Event::Connected,
        received("A", 1),
        received("B", 2),
        Event::Disconnected,
        Event::Terminated,
    ]
}

#[tokio::test]
async fn test_replay_twice_inline() {
    let bytes = capture(&[quote("A", 1, 100), quote("B", 2, 200)]);
    let source = Arc::new(ReplayByteSource::from_bytes(bytes, 2));

    let events = run_to_exhaustion(source, ReadMode::Inline).await;
    assert_eq!(events, expected_twice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_twice_pipelined() {
    let bytes = capture(&[quote("A", 1, 100), quote("B", 2, 200)]);
    let source = Arc::new(ReplayByteSource::from_bytes(bytes, 2));
    let mode = ReadMode::Pipelined {
        pool: Handle::current(),
        queue: QueueConfig {
            capacity: 1,
            ..QueueConfig::default()
        },
    };

    let events = run_to_exhaustion(source, mode).await;
    assert_eq!(events, expected_twice());
}

#[tokio::test]
async fn test_replay_from_capture_file() {
    let path = std::env::temp_dir().join(format!("live-feed-capture-{}.bin", ConnectionId::new()));
    std::fs::write(&path, capture(&[quote("A", 1, 100), quote("B", 2, 200)])).unwrap();

    let source = source::from_config(&SourceConfig::Replay {
        path: path.clone(),
        replays: 2,
    });
    let events = run_to_exhaustion(source, ReadMode::Inline).await;
    std::fs::remove_file(&path).unwrap();

    assert_eq!(events, expected_twice());
}

#[tokio::test]
async fn test_identical_runs_produce_identical_sequences() {
    let records: Vec<MarketDataRecord> = (1..=200)
        .map(|seq| quote(if seq % 3 == 0 { "MSFT.O" } else { "AAPL.O" }, seq, 10_000 + seq as i64))
        .collect();
    let bytes = capture(&records);

    let first = run_to_exhaustion(
        Arc::new(ReplayByteSource::from_bytes(bytes.clone(), 1)),
        ReadMode::Inline,
    )
    .await;
    let second = run_to_exhaustion(
        Arc::new(ReplayByteSource::from_bytes(bytes, 1)),
        ReadMode::Pipelined {
            pool: Handle::current(),
            queue: QueueConfig {
                capacity: 8,
                ..QueueConfig::default()
            },
        },
    )
    .await;

    assert_eq!(first, second);
    assert_eq!(first.len(), records.len() + 3);
}
