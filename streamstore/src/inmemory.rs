//! A `Mutex`-guarded, process-local [`StorageDriver`]. Not meant for
//! production use — it exists so the store and subscription drivers can be
//! exercised without a database, in this crate's tests and in callers'.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::driver::{AppendInput, AppendOutcome, DriverError, RawPage, StorageDriver};
use crate::types::{
    Direction, ExpectedVersion, PersistedMessage, Position, StreamId, StreamInfo,
    StreamMetadataInput, StreamMetadataResult, DELETED_STREAM_ID, STREAM_DELETED_TYPE,
    STREAM_METADATA_TYPE,
};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {}

#[derive(Debug, Clone, Copy)]
struct StreamState {
    version: u64,
    position: Position,
    max_age: Option<std::time::Duration>,
    max_count: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    log: Vec<PersistedMessage>,
    streams: HashMap<StreamId, StreamState>,
    message_ids: std::collections::HashSet<Uuid>,
    next_position: u64,
    deleted_stream_version: u64,
}

/// In-memory [`StorageDriver`]. Cheap to construct; one instance models one
/// store.
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    state: Mutex<State>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    type Error = InMemoryError;

    async fn append(&self, input: AppendInput<'_>) -> Result<AppendOutcome, DriverError<Self::Error>> {
        let mut state = self.state.lock().unwrap();

        for message in input.messages {
            if state.message_ids.contains(&message.message_id) {
                return Err(DriverError::Duplicate(message.message_id));
            }
        }

        let current = state.streams.get(input.stream_id).copied();
        let current_version = current.map(|s| s.version);

        let satisfied = match input.expected_version {
            ExpectedVersion::Any => true,
            ExpectedVersion::Empty => current.is_none(),
            ExpectedVersion::Exact(v) => current_version == Some(v),
        };

        if !satisfied {
            return Err(DriverError::Concurrency);
        }

        if input.messages.is_empty() {
            return Ok(AppendOutcome {
                stream_version: current_version.unwrap_or(0),
                position: current.map(|s| s.position).unwrap_or(Position::start()),
                max_age: current.and_then(|s| s.max_age),
                max_count: current.and_then(|s| s.max_count),
            });
        }

        let mut version = current_version.map(|v| v + 1).unwrap_or(0);
        let mut last_position = Position::start();

        for message in input.messages {
            let position = Position::new(state.next_position);
            state.next_position += 1;
            state.message_ids.insert(message.message_id);
            state.log.push(PersistedMessage {
                stream_id: input.stream_id.clone(),
                message_id: message.message_id,
                r#type: message.r#type.clone(),
                data: message.data.clone(),
                metadata: message.metadata.clone(),
                stream_version: version,
                position,
                created_at: input.now,
            });

            last_position = position;
            version += 1;
        }

        let final_version = version - 1;
        let max_age = current.and_then(|s| s.max_age);
        let max_count = current.and_then(|s| s.max_count);

        state.streams.insert(
            input.stream_id.clone(),
            StreamState { version: final_version, position: last_position, max_age, max_count },
        );

        Ok(AppendOutcome { stream_version: final_version, position: last_position, max_age, max_count })
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        count: u64,
        direction: Direction,
    ) -> Result<RawPage, Self::Error> {
        let state = self.state.lock().unwrap();
        let mut messages: Vec<_> = state.log.iter().filter(|m| &m.stream_id == stream_id).cloned().collect();

        match direction {
            Direction::Forward => {
                messages.retain(|m| m.stream_version >= from_inclusive);
                messages.sort_by_key(|m| m.stream_version);
            },
            Direction::Backward => {
                messages.retain(|m| m.stream_version <= from_inclusive);
                messages.sort_by_key(|m| std::cmp::Reverse(m.stream_version));
            },
        }

        messages.truncate(count as usize);
        Ok(RawPage { messages })
    }

    async fn read_stream_info(&self, stream_id: &StreamId) -> Result<Option<StreamInfo>, Self::Error> {
        let state = self.state.lock().unwrap();
        Ok(state.streams.get(stream_id).map(|s| StreamInfo {
            stream_version: s.version,
            position: s.position,
            max_age: s.max_age,
            max_count: s.max_count,
        }))
    }

    async fn read_all(&self, from_position: Position, count: u64, direction: Direction) -> Result<RawPage, Self::Error> {
        let state = self.state.lock().unwrap();
        let mut messages = state.log.clone();

        match direction {
            Direction::Forward => {
                messages.retain(|m| m.position >= from_position);
                messages.sort_by_key(|m| m.position);
            },
            Direction::Backward => {
                messages.retain(|m| m.position <= from_position);
                messages.sort_by_key(|m| std::cmp::Reverse(m.position));
            },
        }

        messages.truncate(count as usize);
        Ok(RawPage { messages })
    }

    async fn read_head_position(&self) -> Result<Position, Self::Error> {
        let state = self.state.lock().unwrap();
        Ok(state.log.iter().map(|m| m.position).max().unwrap_or(Position::start()))
    }

    async fn delete_stream(
        &self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), DriverError<Self::Error>> {
        let mut state = self.state.lock().unwrap();

        let current = state.streams.get(stream_id).copied();
        let current_version = current.map(|s| s.version);

        let satisfied = match expected_version {
            ExpectedVersion::Any => true,
            ExpectedVersion::Empty => current.is_none(),
            ExpectedVersion::Exact(v) => current_version == Some(v),
        };

        if !satisfied {
            return Err(DriverError::Concurrency);
        }

        state.log.retain(|m| &m.stream_id != stream_id);
        state.streams.remove(stream_id);

        let marker_id = Uuid::new_v4();
        let position = Position::new(state.next_position);
        state.next_position += 1;
        state.message_ids.insert(marker_id);

        let deleted_version = state.deleted_stream_version;
        state.deleted_stream_version += 1;

        state.log.push(PersistedMessage {
            stream_id: StreamId::new_unchecked(DELETED_STREAM_ID),
            message_id: marker_id,
            r#type: STREAM_DELETED_TYPE.to_owned(),
            data: serde_json::json!({ "streamId": stream_id.as_str() }),
            metadata: serde_json::Value::Null,
            stream_version: deleted_version,
            position,
            created_at: now,
        });

        Ok(())
    }

    async fn delete_message(&self, stream_id: &StreamId, message_id: Uuid) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.log.retain(|m| !(m.message_id == message_id && &m.stream_id == stream_id));
        Ok(())
    }

    async fn get_stream_metadata(&self, stream_id: &StreamId) -> Result<StreamMetadataResult, Self::Error> {
        let state = self.state.lock().unwrap();
        let meta_id = stream_id.metadata_stream_id();

        match state.streams.get(&meta_id) {
            Some(meta_state) => {
                let latest = state.log.iter().rev().find(|m| m.stream_id == meta_id && m.r#type == STREAM_METADATA_TYPE);
                Ok(StreamMetadataResult {
                    metadata: latest.map(|m| m.data.clone()).unwrap_or(serde_json::Value::Null),
                    metadata_stream_version: Some(meta_state.version),
                    max_age: meta_state.max_age,
                    max_count: meta_state.max_count,
                })
            },
            None => Ok(StreamMetadataResult::default()),
        }
    }

    async fn set_stream_metadata(
        &self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        input: StreamMetadataInput,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<AppendOutcome, DriverError<Self::Error>> {
        let mut state = self.state.lock().unwrap();
        let meta_id = stream_id.metadata_stream_id();

        let current = state.streams.get(&meta_id).copied();
        let current_version = current.map(|s| s.version);

        let satisfied = match expected_version {
            ExpectedVersion::Any => true,
            ExpectedVersion::Empty => current.is_none(),
            ExpectedVersion::Exact(v) => current_version == Some(v),
        };

        if !satisfied {
            return Err(DriverError::Concurrency);
        }

        let version = current_version.map(|v| v + 1).unwrap_or(0);
        let position = Position::new(state.next_position);
        state.next_position += 1;

        let message_id = Uuid::new_v4();
        state.message_ids.insert(message_id);
        state.log.push(PersistedMessage {
            stream_id: meta_id.clone(),
            message_id,
            r#type: STREAM_METADATA_TYPE.to_owned(),
            data: input.metadata.clone(),
            metadata: serde_json::Value::Null,
            stream_version: version,
            position,
            created_at: now,
        });

        state.streams.insert(
            meta_id,
            StreamState { version, position, max_age: input.max_age, max_count: input.max_count },
        );

        // The hints live on the target stream's own state too, so a plain
        // append doesn't need a second lookup to observe them.
        if let Some(target) = state.streams.get_mut(stream_id) {
            target.max_age = input.max_age;
            target.max_count = input.max_count;
        }

        Ok(AppendOutcome { stream_version: version, position, max_age: input.max_age, max_count: input.max_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewMessage;
    use serde_json::json;

    fn message(n: u8) -> NewMessage {
        NewMessage::new(Uuid::new_v4(), "test-event", json!({ "n": n }))
    }

    #[tokio::test]
    async fn append_then_read_back_in_order() {
        let driver = InMemoryDriver::new();
        let stream_id = StreamId::from("orders-1");

        let outcome = driver
            .append(AppendInput {
                stream_id: &stream_id,
                expected_version: ExpectedVersion::Empty,
                now: chrono::Utc::now(),
                messages: &[message(0), message(1), message(2)],
            })
            .await
            .unwrap();
        assert_eq!(outcome.stream_version, 2);

        let page = driver.read_stream(&stream_id, 0, 100, Direction::Forward).await.unwrap();
        let versions: Vec<u64> = page.messages.iter().map(|m| m.stream_version).collect();
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn exact_version_conflict_is_reported() {
        let driver = InMemoryDriver::new();
        let stream_id = StreamId::from("orders-2");

        driver
            .append(AppendInput {
                stream_id: &stream_id,
                expected_version: ExpectedVersion::Empty,
                now: chrono::Utc::now(),
                messages: &[message(0)],
            })
            .await
            .unwrap();

        let result = driver
            .append(AppendInput {
                stream_id: &stream_id,
                expected_version: ExpectedVersion::Exact(5),
                now: chrono::Utc::now(),
                messages: &[message(1)],
            })
            .await;

        assert!(matches!(result, Err(DriverError::Concurrency)));
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let driver = InMemoryDriver::new();
        let stream_id = StreamId::from("orders-3");
        let duplicate = message(0);

        driver
            .append(AppendInput {
                stream_id: &stream_id,
                expected_version: ExpectedVersion::Any,
                now: chrono::Utc::now(),
                messages: std::slice::from_ref(&duplicate),
            })
            .await
            .unwrap();

        let result = driver
            .append(AppendInput {
                stream_id: &stream_id,
                expected_version: ExpectedVersion::Any,
                now: chrono::Utc::now(),
                messages: std::slice::from_ref(&duplicate),
            })
            .await;

        assert!(matches!(result, Err(DriverError::Duplicate(id)) if id == duplicate.message_id));
    }
}
