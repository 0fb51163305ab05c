//! [`StreamStore`]: the public surface over a [`StorageDriver`]. Owns input
//! validation, the append retry policy, the subscription registry and the
//! notifier, and coordinates all three with [`DuplexLatch`] on dispose.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::driver::{AppendInput, DriverError, StorageDriver};
use crate::error::{Error, Result};
use crate::gap_reader::{GapDetectingAllReader, GapDetectionConfig};
use crate::latch::DuplexLatch;
use crate::notifier::{Notifier, TickReceiver};
use crate::subscription::{
    self, AllSubscriptionOptions, Processor, Registry, StreamSubscriptionOptions, Subscription,
    SubscriptionIdGen, SubscriptionSource,
};
use crate::types::{
    Direction, ExpectedVersion, NewMessage, Position, ReadAllResult, ReadStreamResult,
    StreamId, StreamMetadataInput, StreamMetadataResult,
};

/// Exponential backoff applied to appends that hit a concurrency conflict
/// with `ExpectedVersion::Any`. All other conflicts fail immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            factor: 1.05,
            max_delay: Duration::from_millis(50),
            max_attempts: 200,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let ms = (self.factor.powi(attempt as i32) - 1.0).clamp(0.0, max_ms);
        Duration::from_millis(ms as u64)
    }
}

struct Inner<D: StorageDriver> {
    driver: Arc<D>,
    notifier: Arc<dyn Notifier>,
    gap_reader: GapDetectingAllReader<D>,
    latch: DuplexLatch,
    disposing: AtomicBool,
    registry: Registry,
    id_gen: SubscriptionIdGen,
    retry: RetryPolicy,
}

/// The Stream Store: append-only messages over named streams, a global
/// position ordering, and live subscriptions over both.
///
/// Cheaply cloneable; every clone shares the same underlying driver,
/// notifier, subscription registry and dispose latch.
pub struct StreamStore<D: StorageDriver> {
    inner: Arc<Inner<D>>,
}

impl<D: StorageDriver> Clone for StreamStore<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: StorageDriver> StreamStore<D> {
    pub fn new(driver: Arc<D>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_options(driver, notifier, GapDetectionConfig::default(), RetryPolicy::default())
    }

    pub fn with_options(
        driver: Arc<D>,
        notifier: Arc<dyn Notifier>,
        gap_config: GapDetectionConfig,
        retry: RetryPolicy,
    ) -> Self {
        let gap_reader = GapDetectingAllReader::new(Arc::clone(&driver), gap_config);

        Self {
            inner: Arc::new(Inner {
                driver,
                notifier,
                gap_reader,
                latch: DuplexLatch::default(),
                disposing: AtomicBool::new(false),
                registry: Registry::default(),
                id_gen: SubscriptionIdGen::default(),
                retry,
            }),
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, messages), fields(stream_id = %stream_id.as_ref())))]
    pub async fn append_to_stream(
        &self,
        stream_id: impl AsRef<str>,
        expected_version: ExpectedVersion,
        messages: Vec<NewMessage>,
    ) -> Result<crate::types::AppendResult> {
        let stream_id = validate_stream_id(stream_id.as_ref())?;
        validate_messages(&messages)?;
        self.check_not_disposing()?;

        let _guard = self.inner.latch.enter();
        let now = chrono::Utc::now();

        let mut attempt = 0u32;
        loop {
            let input = AppendInput {
                stream_id: &stream_id,
                expected_version,
                now,
                messages: &messages,
            };

            match self.inner.driver.append(input).await {
                Ok(outcome) => {
                    return Ok(crate::types::AppendResult {
                        stream_version: outcome.stream_version,
                        stream_position: outcome.position,
                    })
                },
                Err(DriverError::Concurrency) if expected_version.is_any() && attempt < self.inner.retry.max_attempts => {
                    let delay = self.inner.retry.delay_for(attempt);
                    attempt += 1;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, ?delay, "retrying append after concurrency conflict");
                    tokio::time::sleep(delay).await;
                    continue;
                },
                Err(DriverError::Concurrency) if expected_version.is_any() => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(attempt, "exhausted retries on concurrency conflict");
                    return Err(Error::Concurrency);
                },
                Err(DriverError::Concurrency) => return Err(Error::Concurrency),
                Err(DriverError::Duplicate(id)) => return Err(Error::DuplicateMessage(id)),
                Err(DriverError::Other(e)) => return Err(Error::StorageFault(e.into())),
            }
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), fields(stream_id = %stream_id.as_ref())))]
    pub async fn read_stream(
        &self,
        stream_id: impl AsRef<str>,
        from_inclusive: u64,
        count: u64,
        direction: Direction,
    ) -> Result<ReadStreamResult> {
        let stream_id = validate_stream_id_allow_operational(stream_id.as_ref())?;
        self.read_stream_impl(&stream_id, from_inclusive, count, direction).await
    }

    async fn read_stream_impl(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        count: u64,
        direction: Direction,
    ) -> Result<ReadStreamResult> {
        let probe = count.saturating_add(1);

        let page = self
            .inner
            .driver
            .read_stream(stream_id, from_inclusive, probe, direction)
            .await
            .map_err(|e| Error::StorageFault(e.into()))?;

        let mut messages = page.messages;
        let is_end = (messages.len() as u64) <= count;
        if !is_end {
            messages.truncate(count as usize);
        }

        // Read after messages: a concurrent append lands at or after what
        // we already captured, never before it.
        let info = self
            .inner
            .driver
            .read_stream_info(stream_id)
            .await
            .map_err(|e| Error::StorageFault(e.into()))?;

        let (stream_version, stream_position) = match info {
            Some(info) => (info.stream_version, info.position),
            None => (0, Position::start()),
        };

        let next_version = match direction {
            Direction::Forward => {
                if is_end {
                    stream_version + 1
                } else {
                    messages.last().map(|m| m.stream_version + 1).unwrap_or(0)
                }
            },
            Direction::Backward => {
                let base = if is_end { 0 } else { messages.last().map(|m| m.stream_version).unwrap_or(0) };
                base.saturating_sub(1)
            },
        };

        Ok(ReadStreamResult {
            stream_id: stream_id.clone(),
            stream_version,
            stream_position,
            next_version,
            is_end,
            messages,
        })
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn read_all(&self, from_position: Position, count: u64, direction: Direction) -> Result<ReadAllResult> {
        let probe = count.saturating_add(1);

        let page = match direction {
            Direction::Forward => self
                .inner
                .gap_reader
                .read_forward(from_position, probe)
                .await
                .map_err(|e| Error::StorageFault(e.into()))?,
            Direction::Backward => self
                .inner
                .driver
                .read_all(from_position, probe, direction)
                .await
                .map_err(|e| Error::StorageFault(e.into()))?,
        };

        let mut messages = page.messages;
        let is_end = (messages.len() as u64) <= count;
        if !is_end {
            messages.truncate(count as usize);
        }

        let next_position = match direction {
            Direction::Forward => match messages.last() {
                Some(last) => last.position.next_forward(),
                None => from_position,
            },
            Direction::Backward => match messages.last() {
                Some(last) => last.position.next_backward(),
                None => Position::start(),
            },
        };

        Ok(ReadAllResult { messages, next_position, is_end })
    }

    pub async fn read_head_position(&self) -> Result<Position> {
        self.inner.driver.read_head_position().await.map_err(|e| Error::StorageFault(e.into()))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), fields(stream_id = %stream_id.as_ref())))]
    pub async fn get_stream_metadata(&self, stream_id: impl AsRef<str>) -> Result<StreamMetadataResult> {
        let stream_id = validate_stream_id(stream_id.as_ref())?;
        self.inner
            .driver
            .get_stream_metadata(&stream_id)
            .await
            .map_err(|e| Error::StorageFault(e.into()))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, input), fields(stream_id = %stream_id.as_ref())))]
    pub async fn set_stream_metadata(
        &self,
        stream_id: impl AsRef<str>,
        expected_version: ExpectedVersion,
        input: StreamMetadataInput,
    ) -> Result<crate::types::AppendResult> {
        let stream_id = validate_stream_id(stream_id.as_ref())?;
        self.check_not_disposing()?;

        let _guard = self.inner.latch.enter();
        let now = chrono::Utc::now();

        match self.inner.driver.set_stream_metadata(&stream_id, expected_version, input, now).await {
            Ok(outcome) => Ok(crate::types::AppendResult {
                stream_version: outcome.stream_version,
                stream_position: outcome.position,
            }),
            Err(DriverError::Concurrency) => Err(Error::Concurrency),
            Err(DriverError::Duplicate(id)) => Err(Error::DuplicateMessage(id)),
            Err(DriverError::Other(e)) => Err(Error::StorageFault(e.into())),
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), fields(stream_id = %stream_id.as_ref())))]
    pub async fn delete_stream(&self, stream_id: impl AsRef<str>, expected_version: ExpectedVersion) -> Result<()> {
        let stream_id = validate_stream_id(stream_id.as_ref())?;
        self.check_not_disposing()?;

        let _guard = self.inner.latch.enter();
        let now = chrono::Utc::now();

        let mut attempt = 0u32;
        loop {
            match self.inner.driver.delete_stream(&stream_id, expected_version, now).await {
                Ok(()) => return Ok(()),
                Err(DriverError::Concurrency) if expected_version.is_any() && attempt < self.inner.retry.max_attempts => {
                    let delay = self.inner.retry.delay_for(attempt);
                    attempt += 1;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, ?delay, "retrying delete_stream after concurrency conflict");
                    tokio::time::sleep(delay).await;
                    continue;
                },
                Err(DriverError::Concurrency) if expected_version.is_any() => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(attempt, "exhausted retries on concurrency conflict");
                    return Err(Error::Concurrency);
                },
                Err(DriverError::Concurrency) => return Err(Error::Concurrency),
                Err(DriverError::Duplicate(id)) => return Err(Error::DuplicateMessage(id)),
                Err(DriverError::Other(e)) => return Err(Error::StorageFault(e.into())),
            }
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), fields(stream_id = %stream_id.as_ref())))]
    pub async fn delete_message(&self, stream_id: impl AsRef<str>, message_id: Uuid) -> Result<()> {
        let stream_id = validate_stream_id(stream_id.as_ref())?;
        self.check_not_disposing()?;

        let _guard = self.inner.latch.enter();
        self.inner
            .driver
            .delete_message(&stream_id, message_id)
            .await
            .map_err(|e| Error::StorageFault(e.into()))
    }

    /// Starts a subscription over a single stream. Returns immediately; the
    /// subscription's own task drives catch-up and live delivery.
    pub fn subscribe_to_stream(
        &self,
        stream_id: impl AsRef<str>,
        processor: Processor,
        options: StreamSubscriptionOptions,
    ) -> Subscription {
        let stream_id = StreamId::from(stream_id.as_ref());
        let id = self.inner.id_gen.next();
        let source = Arc::new(self.clone());
        let (subscription, shared) = subscription::spawn_stream(source, id, stream_id, options, processor);
        self.inner.registry.track(id, shared);
        subscription
    }

    /// Starts a subscription over the all-stream.
    pub fn subscribe_to_all(&self, processor: Processor, options: AllSubscriptionOptions) -> Subscription {
        let id = self.inner.id_gen.next();
        let source = Arc::new(self.clone());
        let (subscription, shared) = subscription::spawn_all(source, id, options, processor);
        self.inner.registry.track(id, shared);
        subscription
    }

    /// Tears the store down: marks it disposing, disposes every tracked
    /// subscription, disposes the notifier, drains in-flight writes, then
    /// releases the storage driver.
    pub async fn dispose(&self) {
        self.inner.disposing.store(true, Ordering::SeqCst);
        self.inner.registry.dispose_all().await;
        self.inner.notifier.dispose().await;
        self.inner.latch.wait().await;
        self.inner.driver.dispose().await;
    }

    fn check_not_disposing(&self) -> Result<()> {
        if self.inner.disposing.load(Ordering::SeqCst) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<D: StorageDriver> SubscriptionSource for StreamStore<D> {
    async fn read_stream_page(&self, stream_id: &StreamId, from_inclusive: u64, count: u64) -> Result<ReadStreamResult> {
        self.read_stream_impl(stream_id, from_inclusive, count, Direction::Forward).await
    }

    async fn read_all_page(&self, from_position: Position, count: u64) -> Result<ReadAllResult> {
        self.read_all(from_position, count, Direction::Forward).await
    }

    async fn read_head_position(&self) -> Result<Position> {
        self.read_head_position().await
    }

    fn subscribe_ticks(&self) -> TickReceiver {
        self.inner.notifier.subscribe()
    }
}

fn validate_stream_id(raw: &str) -> Result<StreamId> {
    if raw.is_empty() {
        return Err(Error::invalid_parameter("streamId"));
    }
    if raw.starts_with('$') {
        return Err(Error::InvalidParameter(format!("streamId '{raw}' is reserved for operational use")));
    }
    Ok(StreamId::from(raw))
}

/// Like [`validate_stream_id`], but permits `$`-prefixed ids — used by reads,
/// which are allowed to inspect operational streams (`$deleted`, metadata
/// streams) even though writes to them are rejected.
fn validate_stream_id_allow_operational(raw: &str) -> Result<StreamId> {
    if raw.is_empty() {
        return Err(Error::invalid_parameter("streamId"));
    }
    Ok(StreamId::from(raw))
}

fn validate_messages(messages: &[NewMessage]) -> Result<()> {
    for message in messages {
        if message.message_id.is_nil() {
            return Err(Error::invalid_uuid("messageId"));
        }
        if message.r#type.is_empty() {
            return Err(Error::invalid_parameter("type"));
        }
        if message.data.is_null() {
            return Err(Error::invalid_parameter("data"));
        }
    }
    Ok(())
}
