//! The [`StorageDriver`] trait: the storage-agnostic collaborator the store
//! talks to. The SQL schema, stored procedures and connection pool behind
//! an implementation are out of scope for this crate;
//! [`crate::inmemory::InMemoryDriver`] and, in the sibling
//! `streamstore-postgres` crate, `PostgresDriver` are its two
//! implementations.

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{
    Direction, ExpectedVersion, PersistedMessage, Position, StreamId, StreamInfo,
    StreamMetadataInput, StreamMetadataResult,
};

/// A raw, unclassified conflict signal from the driver, or a passthrough
/// driver-specific error. The driver is responsible for recognizing its own
/// conflict shapes (a sentinel return value, a unique-constraint violation
/// tagged by name, a structured `SqlState`); the [`crate::StreamStore`] is
/// responsible for the retry *policy* built on top of this classification.
#[derive(Debug)]
pub enum DriverError<E> {
    /// Two appends raced, or `expectedVersion` did not match.
    Concurrency,
    /// A `messageId` already existed somewhere in the store.
    Duplicate(Uuid),
    /// Any other, unclassified failure.
    Other(E),
}

/// Inputs to a single append call, covering both user streams and the
/// `$$<streamId>` metadata stream (metadata appends reuse the same
/// primitive with `type = "$streamMetadata"`).
#[derive(Debug, Clone)]
pub struct AppendInput<'a> {
    pub stream_id: &'a StreamId,
    pub expected_version: ExpectedVersion,
    pub now: chrono::DateTime<chrono::Utc>,
    pub messages: &'a [crate::types::NewMessage],
}

/// Successful outcome of an append.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub stream_version: u64,
    pub position: Position,
    pub max_age: Option<std::time::Duration>,
    pub max_count: Option<u64>,
}

/// One page of raw rows from a stream or all-stream read, before the store
/// applies the "read N+1, drop the probe row" `isEnd` trick.
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    pub messages: Vec<PersistedMessage>,
}

/// Storage Driver contract: five primitive operations (append,
/// read-stream, read-all, read-head, delete) plus metadata get/set,
/// executed atomically by the implementation.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Driver-specific failure type, already stripped of conflict/duplicate
    /// classification (those are reported via [`DriverError`]).
    type Error: std::error::Error + Send + Sync + 'static;

    async fn append(
        &self,
        input: AppendInput<'_>,
    ) -> Result<AppendOutcome, DriverError<Self::Error>>;

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        count: u64,
        direction: Direction,
    ) -> Result<RawPage, Self::Error>;

    async fn read_stream_info(
        &self,
        stream_id: &StreamId,
    ) -> Result<Option<StreamInfo>, Self::Error>;

    async fn read_all(
        &self,
        from_position: Position,
        count: u64,
        direction: Direction,
    ) -> Result<RawPage, Self::Error>;

    async fn read_head_position(&self) -> Result<Position, Self::Error>;

    async fn delete_stream(
        &self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), DriverError<Self::Error>>;

    async fn delete_message(
        &self,
        stream_id: &StreamId,
        message_id: Uuid,
    ) -> Result<(), Self::Error>;

    async fn get_stream_metadata(
        &self,
        stream_id: &StreamId,
    ) -> Result<StreamMetadataResult, Self::Error>;

    async fn set_stream_metadata(
        &self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        input: StreamMetadataInput,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<AppendOutcome, DriverError<Self::Error>>;

    /// Releases any resources (connection pool, background tasks) held by
    /// the driver. Called last in `dispose()`, after all writes have
    /// drained. Default no-op for drivers without pooled resources.
    async fn dispose(&self) {}
}
