use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use streamstore::driver::{AppendInput, AppendOutcome, DriverError, RawPage, StorageDriver};
use streamstore::notifier::PollingNotifier;
use streamstore::types::{
    Direction, ExpectedVersion, PersistedMessage, Position, StreamId, StreamInfo,
    StreamMetadataInput, StreamMetadataResult,
};
use streamstore::{GapDetectionConfig, RetryPolicy, StreamStore};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("flaky driver error")]
struct FlakyError;

fn message_at(position: u64) -> PersistedMessage {
    PersistedMessage {
        stream_id: StreamId::from("irrelevant"),
        message_id: Uuid::new_v4(),
        r#type: "t".into(),
        data: serde_json::Value::Null,
        metadata: serde_json::Value::Null,
        stream_version: position,
        position: Position::new(position),
        created_at: chrono::Utc::now(),
    }
}

/// Returns a gappy page (`3, 5, 6, 7, 8` — a hole at 4) on the first call,
/// and `second_page` on every call after, modeling a message at position 4
/// that either commits before the reload (`second_page` fills the hole) or
/// never shows up within the retry budget (`second_page` stays short of a
/// full page, which the gap reader treats as "no more data yet").
struct FlakyAllDriver {
    calls: AtomicUsize,
    second_page: Vec<u64>,
}

#[async_trait]
impl StorageDriver for FlakyAllDriver {
    type Error = FlakyError;

    async fn append(&self, _input: AppendInput<'_>) -> Result<AppendOutcome, DriverError<Self::Error>> {
        unimplemented!()
    }

    async fn read_stream(&self, _stream_id: &StreamId, _from_inclusive: u64, _count: u64, _direction: Direction) -> Result<RawPage, Self::Error> {
        unimplemented!()
    }

    async fn read_stream_info(&self, _stream_id: &StreamId) -> Result<Option<StreamInfo>, Self::Error> {
        unimplemented!()
    }

    async fn read_all(&self, _from_position: Position, _count: u64, _direction: Direction) -> Result<RawPage, Self::Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let positions: &[u64] = if call == 0 { &[3, 5, 6, 7, 8] } else { &self.second_page };
        Ok(RawPage { messages: positions.iter().copied().map(message_at).collect() })
    }

    async fn read_head_position(&self) -> Result<Position, Self::Error> {
        Ok(Position::new(8))
    }

    async fn delete_stream(&self, _stream_id: &StreamId, _expected_version: ExpectedVersion, _now: chrono::DateTime<chrono::Utc>) -> Result<(), DriverError<Self::Error>> {
        unimplemented!()
    }

    async fn delete_message(&self, _stream_id: &StreamId, _message_id: Uuid) -> Result<(), Self::Error> {
        unimplemented!()
    }

    async fn get_stream_metadata(&self, _stream_id: &StreamId) -> Result<StreamMetadataResult, Self::Error> {
        unimplemented!()
    }

    async fn set_stream_metadata(&self, _stream_id: &StreamId, _expected_version: ExpectedVersion, _input: StreamMetadataInput, _now: chrono::DateTime<chrono::Utc>) -> Result<AppendOutcome, DriverError<Self::Error>> {
        unimplemented!()
    }
}

fn gap_config() -> GapDetectionConfig {
    GapDetectionConfig { gap_reload_delay: Duration::from_millis(1), gap_reload_times: 1 }
}

#[tokio::test(start_paused = true)]
async fn gap_fills_in_through_the_public_read_all_api() {
    let driver = Arc::new(FlakyAllDriver { calls: AtomicUsize::new(0), second_page: vec![3, 4, 5, 6] });
    let notifier = PollingNotifier::spawn(Arc::clone(&driver), Duration::from_secs(3600));
    let store = StreamStore::with_options(driver, notifier, gap_config(), RetryPolicy::default());

    let result = store.read_all(Position::new(3), 4, Direction::Forward).await.expect("read should succeed");
    let positions: Vec<u64> = result.messages.iter().map(|m| m.position.get()).collect();
    assert_eq!(positions, vec![3, 4, 5, 6]);
    assert!(result.is_end);

    store.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn persistent_gap_is_accepted_after_retries_exhausted() {
    let driver = Arc::new(FlakyAllDriver { calls: AtomicUsize::new(0), second_page: vec![3, 5, 6] });
    let notifier = PollingNotifier::spawn(Arc::clone(&driver), Duration::from_secs(3600));
    let store = StreamStore::with_options(driver, notifier, gap_config(), RetryPolicy::default());

    let result = store.read_all(Position::new(3), 4, Direction::Forward).await.expect("read should succeed");
    let positions: Vec<u64> = result.messages.iter().map(|m| m.position.get()).collect();
    assert_eq!(positions, vec![3, 5, 6]);
    assert!(result.is_end);

    store.dispose().await;
}
