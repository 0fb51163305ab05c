//! Core data types shared by the store, the storage driver trait and the
//! subscription drivers: stream identifiers, positions, expected-version
//! sentinels and the message shapes that cross the storage boundary.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum value a [`Position`] can hold, matching the `9223372036854775807`
/// (`i64::MAX`) sentinel the wire format uses for `Position.End`.
pub const POSITION_END: u64 = i64::MAX as u64;

/// Name of the operational stream that records `$streamDeleted` messages.
pub const DELETED_STREAM_ID: &str = "$deleted";

/// Message type used for the latest-wins metadata message appended to a
/// stream's companion metadata stream.
pub const STREAM_METADATA_TYPE: &str = "$streamMetadata";

/// Message type appended to [`DELETED_STREAM_ID`] when a stream is deleted.
pub const STREAM_DELETED_TYPE: &str = "$streamDeleted";

/// Identifier of a stream. Non-empty; a leading `$` marks it as an
/// operational stream, reserved from caller-initiated appends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Builds a `StreamId` without validating it. Used internally for
    /// operational ids (`$deleted`, `$$<id>`) that are allowed to start
    /// with `$`.
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_operational(&self) -> bool {
        self.0.starts_with('$')
    }

    /// Id of this stream's companion metadata stream, `$$<streamId>`.
    pub fn metadata_stream_id(&self) -> StreamId {
        StreamId::new_unchecked(format!("$${}", self.0))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        StreamId(value)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        StreamId(value.to_owned())
    }
}

/// Direction of a range read over a stream or the all-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Concurrency-check sentinel supplied to `append`/`delete`/`setMetadata`.
///
/// `Any = -2` and `Empty = -1` on the wire; any non-negative integer is an
/// exact expected version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No optimistic check: always append, retried internally on conflict.
    Any,
    /// The stream must not exist yet (version `-1`, i.e. about to become `0`).
    Empty,
    /// The stream's current version must equal this value exactly.
    Exact(u64),
}

impl ExpectedVersion {
    pub const ANY_SENTINEL: i64 = -2;
    pub const EMPTY_SENTINEL: i64 = -1;

    pub fn from_sentinel(value: i64) -> Result<Self, String> {
        match value {
            Self::ANY_SENTINEL => Ok(Self::Any),
            Self::EMPTY_SENTINEL => Ok(Self::Empty),
            v if v >= 0 => Ok(Self::Exact(v as u64)),
            _ => Err("expectedVersion must be >= -2".to_owned()),
        }
    }

    pub fn to_sentinel(self) -> i64 {
        match self {
            Self::Any => Self::ANY_SENTINEL,
            Self::Empty => Self::EMPTY_SENTINEL,
            Self::Exact(v) => v as i64,
        }
    }

    pub fn is_any(self) -> bool {
        matches!(self, Self::Any)
    }
}

/// Global, monotonically increasing but possibly-sparse position in the
/// all-stream. Carried as a decimal string at the JSON/wire boundary; an
/// unsigned 64-bit integer internally, which covers the same practical
/// range as the `bigint` column backing it (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    pub const fn start() -> Self {
        Position(0)
    }

    pub const fn end() -> Self {
        Position(POSITION_END)
    }

    pub const fn new(raw: u64) -> Self {
        Position(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn next_forward(self) -> Self {
        Position(self.0.saturating_add(1))
    }

    pub fn next_backward(self) -> Self {
        Position(self.0.saturating_sub(1).max(0))
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Position {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Position(s.parse()?))
    }
}

impl Serialize for Position {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A message to be appended, supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_id: Uuid,
    pub r#type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NewMessage {
    pub fn new(message_id: Uuid, r#type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message_id,
            r#type: r#type.into(),
            data,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A message as read back from the store: a [`NewMessage`] plus the
/// position information the store assigned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub stream_id: StreamId,
    pub message_id: Uuid,
    pub r#type: String,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_version: u64,
    pub position: Position,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Result of `readStream`.
#[derive(Debug, Clone)]
pub struct ReadStreamResult {
    pub stream_id: StreamId,
    pub stream_version: u64,
    pub stream_position: Position,
    pub next_version: u64,
    pub is_end: bool,
    pub messages: Vec<PersistedMessage>,
}

/// Result of `readAll`.
#[derive(Debug, Clone)]
pub struct ReadAllResult {
    pub messages: Vec<PersistedMessage>,
    pub next_position: Position,
    pub is_end: bool,
}

/// Result of `appendToStream` / `setStreamMetadata` / `deleteStream` (when
/// the latter is expressed as an append to `$deleted`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub stream_version: u64,
    pub stream_position: Position,
}

/// Retention hints observed on append and surfaced through
/// `getStreamMetadata`/`setStreamMetadata`. Scavenging itself is out of
/// scope here; these fields are preserved end-to-end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionHints {
    pub max_age: Option<Duration>,
    pub max_count: Option<u64>,
}

/// User-supplied metadata to attach to a stream via `setStreamMetadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetadataInput {
    pub metadata: serde_json::Value,
    pub max_age: Option<Duration>,
    pub max_count: Option<u64>,
}

/// Result of `getStreamMetadata`.
#[derive(Debug, Clone)]
pub struct StreamMetadataResult {
    pub metadata: serde_json::Value,
    pub metadata_stream_version: Option<u64>,
    pub max_age: Option<Duration>,
    pub max_count: Option<u64>,
}

impl Default for StreamMetadataResult {
    fn default() -> Self {
        Self {
            metadata: serde_json::Value::Null,
            metadata_stream_version: None,
            max_age: None,
            max_count: None,
        }
    }
}

/// Last-known state of a stream, as tracked by the `streams` metadata row.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub stream_version: u64,
    pub position: Position,
    pub max_age: Option<Duration>,
    pub max_count: Option<u64>,
}
