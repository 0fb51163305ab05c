use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use streamstore::driver::{AppendInput, AppendOutcome, DriverError, RawPage, StorageDriver};
use streamstore::inmemory::InMemoryDriver;
use streamstore::notifier::PollingNotifier;
use streamstore::types::{
    Direction, ExpectedVersion, NewMessage, Position, StreamId, StreamInfo, StreamMetadataInput,
    StreamMetadataResult,
};
use streamstore::{Error, StreamStore};
use tokio::sync::Notify;
use uuid::Uuid;

/// Wraps [`InMemoryDriver`] and blocks the first `append` until released,
/// so a test can observe `dispose()` waiting on an in-flight write.
struct BlockingDriver {
    inner: InMemoryDriver,
    released: Notify,
}

#[async_trait]
impl StorageDriver for BlockingDriver {
    type Error = <InMemoryDriver as StorageDriver>::Error;

    async fn append(&self, input: AppendInput<'_>) -> Result<AppendOutcome, DriverError<Self::Error>> {
        self.released.notified().await;
        self.inner.append(input).await
    }

    async fn read_stream(&self, stream_id: &StreamId, from_inclusive: u64, count: u64, direction: Direction) -> Result<RawPage, Self::Error> {
        self.inner.read_stream(stream_id, from_inclusive, count, direction).await
    }

    async fn read_stream_info(&self, stream_id: &StreamId) -> Result<Option<StreamInfo>, Self::Error> {
        self.inner.read_stream_info(stream_id).await
    }

    async fn read_all(&self, from_position: Position, count: u64, direction: Direction) -> Result<RawPage, Self::Error> {
        self.inner.read_all(from_position, count, direction).await
    }

    async fn read_head_position(&self) -> Result<Position, Self::Error> {
        self.inner.read_head_position().await
    }

    async fn delete_stream(&self, stream_id: &StreamId, expected_version: ExpectedVersion, now: chrono::DateTime<chrono::Utc>) -> Result<(), DriverError<Self::Error>> {
        self.inner.delete_stream(stream_id, expected_version, now).await
    }

    async fn delete_message(&self, stream_id: &StreamId, message_id: Uuid) -> Result<(), Self::Error> {
        self.inner.delete_message(stream_id, message_id).await
    }

    async fn get_stream_metadata(&self, stream_id: &StreamId) -> Result<StreamMetadataResult, Self::Error> {
        self.inner.get_stream_metadata(stream_id).await
    }

    async fn set_stream_metadata(&self, stream_id: &StreamId, expected_version: ExpectedVersion, input: StreamMetadataInput, now: chrono::DateTime<chrono::Utc>) -> Result<AppendOutcome, DriverError<Self::Error>> {
        self.inner.set_stream_metadata(stream_id, expected_version, input, now).await
    }
}

#[tokio::test]
async fn dispose_waits_for_an_in_flight_append_then_rejects_new_writes() {
    let driver = Arc::new(BlockingDriver { inner: InMemoryDriver::new(), released: Notify::new() });
    let notifier = PollingNotifier::spawn(Arc::clone(&driver), Duration::from_secs(3600));
    let store = StreamStore::new(Arc::clone(&driver), notifier);

    let blocked_append = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .append_to_stream(
                    "S5",
                    ExpectedVersion::Empty,
                    vec![NewMessage::new(Uuid::new_v4(), "ItemAdded", json!({}))],
                )
                .await
        })
    };

    // Give the spawned append a chance to reach the blocking point before
    // we start disposing.
    tokio::task::yield_now().await;

    let disposing = {
        let store = store.clone();
        tokio::spawn(async move { store.dispose().await })
    };

    // dispose() must not complete while the append is still blocked.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!disposing.is_finished(), "dispose() resolved before the in-flight append did");

    driver.released.notify_one();

    blocked_append.await.expect("task should not panic").expect("blocked append should still succeed");
    disposing.await.expect("dispose task should not panic");

    let error = store
        .append_to_stream("S5", ExpectedVersion::Any, vec![NewMessage::new(Uuid::new_v4(), "ItemAdded", json!({}))])
        .await
        .expect_err("writes after dispose must be rejected");
    assert!(matches!(error, Error::Disposed));
}
