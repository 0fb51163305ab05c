//! The notifier abstraction: a hint channel that wakes subscribers when new
//! data may be durable. A tick is never a message delivery — subscribers
//! always re-read through the store.
//!
//! [`PollingNotifier`] is the default, storage-agnostic implementation.
//! The Postgres `LISTEN`/`NOTIFY` variant lives in `streamstore-postgres`
//! and implements the same [`Notifier`] trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::driver::StorageDriver;

/// A tick receiver. Ticks are coalesced: a receiver that misses
/// intermediate generations still observes the latest one on the next
/// `changed()`.
pub type TickReceiver = watch::Receiver<u64>;

/// Emits ticks when new data may exist, and supports orderly shutdown.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Registers a new listener. Each call returns an independent receiver
    /// tracking the same underlying tick generation counter.
    fn subscribe(&self) -> TickReceiver;

    /// Stops emitting further ticks and releases resources. Idempotent.
    async fn dispose(&self);
}

/// Polls `readHeadPosition()` on a fixed interval (default 500ms) and emits
/// one tick whenever the observed head changes. A single timer drives the
/// poll; because the loop is sequential, at most one poll is ever
/// in-flight.
pub struct PollingNotifier {
    tx: watch::Sender<u64>,
    generation: AtomicU64,
    cancel: tokio_util::sync::CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PollingNotifier {
    /// Spawns the polling loop against the given driver.
    pub fn spawn<D: StorageDriver>(driver: Arc<D>, interval: Duration) -> Arc<Self> {
        let (tx, _rx) = watch::channel(0u64);
        let cancel = tokio_util::sync::CancellationToken::new();

        let this = Arc::new(Self {
            tx,
            generation: AtomicU64::new(0),
            cancel: cancel.clone(),
            task: std::sync::Mutex::new(None),
        });

        let loop_this = Arc::clone(&this);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_head = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {},
                }

                match driver.read_head_position().await {
                    Ok(head) => {
                        if last_head != Some(head) {
                            last_head = Some(head);
                            let generation = loop_this.generation.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = loop_this.tx.send(generation);
                        }
                    },
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_err, "polling notifier failed to read head position");
                    },
                }
            }
        });

        *this.task.lock().unwrap() = Some(handle);
        this
    }
}

#[async_trait]
impl Notifier for PollingNotifier {
    fn subscribe(&self) -> TickReceiver {
        self.tx.subscribe()
    }

    async fn dispose(&self) {
        self.cancel.cancel();

        let handle = self.task.lock().unwrap().take();

        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{AppendInput, AppendOutcome, DriverError, RawPage};
    use crate::types::{
        Direction, ExpectedVersion, Position, StreamId, StreamInfo, StreamMetadataInput,
        StreamMetadataResult,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64 as Counter, Ordering as O};
    use uuid::Uuid;

    #[derive(Debug, thiserror::Error)]
    #[error("test driver error")]
    struct TestError;

    struct CountingHeadDriver {
        head: Counter,
    }

    #[async_trait]
    impl StorageDriver for CountingHeadDriver {
        type Error = TestError;

        async fn append(&self, _input: AppendInput<'_>) -> Result<AppendOutcome, DriverError<Self::Error>> {
            unimplemented!()
        }

        async fn read_stream(
            &self,
            _stream_id: &StreamId,
            _from_inclusive: u64,
            _count: u64,
            _direction: Direction,
        ) -> Result<RawPage, Self::Error> {
            unimplemented!()
        }

        async fn read_stream_info(&self, _stream_id: &StreamId) -> Result<Option<StreamInfo>, Self::Error> {
            unimplemented!()
        }

        async fn read_all(&self, _from_position: Position, _count: u64, _direction: Direction) -> Result<RawPage, Self::Error> {
            unimplemented!()
        }

        async fn read_head_position(&self) -> Result<Position, Self::Error> {
            Ok(Position::new(self.head.load(O::SeqCst)))
        }

        async fn delete_stream(
            &self,
            _stream_id: &StreamId,
            _expected_version: ExpectedVersion,
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), DriverError<Self::Error>> {
            unimplemented!()
        }

        async fn delete_message(&self, _stream_id: &StreamId, _message_id: Uuid) -> Result<(), Self::Error> {
            unimplemented!()
        }

        async fn get_stream_metadata(&self, _stream_id: &StreamId) -> Result<StreamMetadataResult, Self::Error> {
            unimplemented!()
        }

        async fn set_stream_metadata(
            &self,
            _stream_id: &StreamId,
            _expected_version: ExpectedVersion,
            _input: StreamMetadataInput,
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<AppendOutcome, DriverError<Self::Error>> {
            unimplemented!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_one_tick_per_head_change() {
        let driver = Arc::new(CountingHeadDriver { head: Counter::new(0) });
        let notifier = PollingNotifier::spawn(Arc::clone(&driver), Duration::from_millis(10));
        let mut rx = notifier.subscribe();

        driver.head.store(1, O::SeqCst);
        tokio::time::advance(Duration::from_millis(15)).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);

        // No change: advancing time further must not produce another tick.
        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(tokio::time::timeout(Duration::from_millis(1), rx.changed())
            .await
            .is_err());

        notifier.dispose().await;
    }
}
