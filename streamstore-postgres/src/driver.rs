//! PostgreSQL-backed [`streamstore::StorageDriver`] implementation using
//! `tokio-postgres` through a `bb8` connection pool.

use std::ops::DerefMut;

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{Row, Socket};
use uuid::Uuid;

use streamstore::driver::{AppendInput, AppendOutcome, DriverError, RawPage, StorageDriver};
use streamstore::types::{
    Direction, ExpectedVersion, PersistedMessage, Position, StreamId, StreamInfo,
    StreamMetadataInput, StreamMetadataResult, STREAM_METADATA_TYPE,
};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("src/migrations");
}

pub type PgPool<Tls> = Pool<PostgresConnectionManager<Tls>>;

/// Error type returned by [`PostgresDriver`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("postgres client returned an error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool returned an error: {0}")]
    Pool(#[from] bb8::RunError<tokio_postgres::Error>),
}

fn is_unique_violation(err: &tokio_postgres::Error, constraint: &str) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
        && err.as_db_error().and_then(|e| e.constraint()) == Some(constraint)
}

/// The part of a stream id before its first `-`, e.g. `order-123` ->
/// `order`. Persisted on the stream row for observability; `streamType`
/// mismatch enforcement is reserved, not implemented here.
fn stream_category(stream_id: &str) -> &str {
    stream_id.split('-').next().unwrap_or(stream_id)
}

/// Applies a database migration, bringing a fresh or existing database up
/// to the schema this driver expects.
pub async fn migrate<Tls>(pool: &PgPool<Tls>) -> anyhow::Result<()>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let mut connection = pool.get().await?;
    embedded::migrations::runner().run_async(connection.deref_mut()).await?;
    Ok(())
}

/// A [`StorageDriver`] backed by a PostgreSQL database, reachable through a
/// pooled `tokio-postgres` connection.
pub struct PostgresDriver<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    pool: PgPool<Tls>,
}

impl<Tls> PostgresDriver<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    pub fn new(pool: PgPool<Tls>) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &Row) -> PersistedMessage {
        let position: i64 = row.get("position");
        let stream_version: i64 = row.get("stream_version");

        PersistedMessage {
            stream_id: StreamId::new_unchecked(row.get::<_, String>("stream_id")),
            message_id: row.get("message_id"),
            r#type: row.get("type"),
            data: row.get("data"),
            metadata: row.get("metadata"),
            stream_version: stream_version as u64,
            position: Position::new(position as u64),
            created_at: row.get::<_, DateTime<Utc>>("created_at"),
        }
    }
}

#[async_trait]
impl<Tls> StorageDriver for PostgresDriver<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    type Error = Error;

    #[cfg_attr(feature = "with-tracing", tracing::instrument(skip(self, input), err))]
    async fn append(&self, input: AppendInput<'_>) -> Result<AppendOutcome, DriverError<Self::Error>> {
        let mut conn = self.pool.get().await.map_err(|e| DriverError::Other(e.into()))?;
        let tx = conn.transaction().await.map_err(|e| DriverError::Other(e.into()))?;

        let current = tx
            .query_opt(
                "SELECT stream_version, position, max_age_ms, max_count FROM streams WHERE id = $1",
                &[&input.stream_id.as_str()],
            )
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        let current_version = current.as_ref().map(|r| r.get::<_, i64>(0));

        match input.expected_version {
            ExpectedVersion::Any => {},
            ExpectedVersion::Empty if current.is_none() => {},
            ExpectedVersion::Exact(v) if current_version == Some(v as i64) => {},
            _ => return Err(DriverError::Concurrency),
        }

        if input.messages.is_empty() {
            let current_position: Option<i64> = current.as_ref().map(|r| r.get(1));
            let max_age_ms: Option<i64> = current.as_ref().and_then(|r| r.get(2));
            let max_count: Option<i64> = current.as_ref().and_then(|r| r.get(3));
            return Ok(AppendOutcome {
                stream_version: current_version.unwrap_or(0) as u64,
                position: Position::new(current_position.unwrap_or(0) as u64),
                max_age: max_age_ms.map(|ms| std::time::Duration::from_millis(ms as u64)),
                max_count: max_count.map(|c| c as u64),
            });
        }

        let mut version = current_version.map(|v| v + 1).unwrap_or(0);
        let final_version = version + input.messages.len() as i64 - 1;
        let max_age_ms: Option<i64> = current.as_ref().and_then(|r| r.get(2));
        let max_count: Option<i64> = current.as_ref().and_then(|r| r.get(3));

        // The streams row must exist before the messages loop below: `messages.stream_id`
        // carries a foreign key to `streams.id`, so a brand-new stream's first insert
        // would otherwise fail with an FK violation instead of a classified conflict.
        // `position` is only known once Postgres assigns it per-message, so it's patched
        // in with a follow-up UPDATE after the loop.
        let upsert_result = if current.is_none() {
            let stream_type = stream_category(input.stream_id.as_str());
            tx.execute(
                "INSERT INTO streams (id, stream_type, stream_version, position, max_age_ms, max_count)
                 VALUES ($1, $2, $3, 0, $4, $5)",
                &[&input.stream_id.as_str(), &stream_type, &final_version, &max_age_ms, &max_count],
            )
            .await
        } else {
            tx.execute(
                "UPDATE streams SET stream_version = $2 WHERE id = $1 AND stream_version = $3",
                &[&input.stream_id.as_str(), &final_version, &current_version.unwrap()],
            )
            .await
        };

        match upsert_result {
            Ok(rows) if current.is_some() && rows == 0 => return Err(DriverError::Concurrency),
            Ok(_) => {},
            Err(e) if is_unique_violation(&e, "stream_id_key") => return Err(DriverError::Concurrency),
            Err(e) => return Err(DriverError::Other(e.into())),
        }

        let mut last_position = 0i64;

        for message in input.messages {
            let row = tx
                .query_one(
                    "INSERT INTO messages (stream_id, message_id, type, data, metadata, stream_version, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     RETURNING position",
                    &[
                        &input.stream_id.as_str(),
                        &message.message_id,
                        &message.r#type,
                        &message.data,
                        &message.metadata,
                        &version,
                        &input.now,
                    ],
                )
                .await
                .map_err(|e| {
                    if is_unique_violation(&e, "message_message_id_key") {
                        DriverError::Duplicate(message.message_id)
                    } else if is_unique_violation(&e, "message_stream_id_internal_stream_version_unique") {
                        DriverError::Concurrency
                    } else {
                        DriverError::Other(e.into())
                    }
                })?;

            last_position = row.get(0);
            version += 1;
        }

        tx.execute(
            "UPDATE streams SET position = $2 WHERE id = $1",
            &[&input.stream_id.as_str(), &last_position],
        )
        .await
        .map_err(|e| DriverError::Other(e.into()))?;

        tx.commit().await.map_err(|e| DriverError::Other(e.into()))?;

        Ok(AppendOutcome {
            stream_version: final_version as u64,
            position: Position::new(last_position as u64),
            max_age: max_age_ms.map(|ms| std::time::Duration::from_millis(ms as u64)),
            max_count: max_count.map(|c| c as u64),
        })
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        count: u64,
        direction: Direction,
    ) -> Result<RawPage, Self::Error> {
        let conn = self.pool.get().await?;

        let query = match direction {
            Direction::Forward => {
                "SELECT stream_id, message_id, type, data, metadata, stream_version, position, created_at
                 FROM messages WHERE stream_id = $1 AND stream_version >= $2
                 ORDER BY stream_version ASC LIMIT $3"
            },
            Direction::Backward => {
                "SELECT stream_id, message_id, type, data, metadata, stream_version, position, created_at
                 FROM messages WHERE stream_id = $1 AND stream_version <= $2
                 ORDER BY stream_version DESC LIMIT $3"
            },
        };

        let rows = conn
            .query(query, &[&stream_id.as_str(), &(from_inclusive as i64), &(count as i64)])
            .await?;

        Ok(RawPage { messages: rows.iter().map(Self::row_to_message).collect() })
    }

    async fn read_stream_info(&self, stream_id: &StreamId) -> Result<Option<StreamInfo>, Self::Error> {
        let conn = self.pool.get().await?;

        let row = conn
            .query_opt(
                "SELECT stream_version, position, max_age_ms, max_count FROM streams WHERE id = $1",
                &[&stream_id.as_str()],
            )
            .await?;

        Ok(row.map(|row| {
            let stream_version: i64 = row.get(0);
            let position: i64 = row.get(1);
            let max_age_ms: Option<i64> = row.get(2);
            let max_count: Option<i64> = row.get(3);

            StreamInfo {
                stream_version: stream_version as u64,
                position: Position::new(position as u64),
                max_age: max_age_ms.map(|ms| std::time::Duration::from_millis(ms as u64)),
                max_count: max_count.map(|c| c as u64),
            }
        }))
    }

    async fn read_all(&self, from_position: Position, count: u64, direction: Direction) -> Result<RawPage, Self::Error> {
        let conn = self.pool.get().await?;

        let query = match direction {
            Direction::Forward => {
                "SELECT stream_id, message_id, type, data, metadata, stream_version, position, created_at
                 FROM messages WHERE position >= $1 ORDER BY position ASC LIMIT $2"
            },
            Direction::Backward => {
                "SELECT stream_id, message_id, type, data, metadata, stream_version, position, created_at
                 FROM messages WHERE position <= $1 ORDER BY position DESC LIMIT $2"
            },
        };

        let rows = conn.query(query, &[&(from_position.get() as i64), &(count as i64)]).await?;

        Ok(RawPage { messages: rows.iter().map(Self::row_to_message).collect() })
    }

    async fn read_head_position(&self) -> Result<Position, Self::Error> {
        let conn = self.pool.get().await?;
        let row = conn.query_one("SELECT COALESCE(MAX(position), 0) FROM messages", &[]).await?;
        let head: i64 = row.get(0);
        Ok(Position::new(head as u64))
    }

    async fn delete_stream(
        &self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<(), DriverError<Self::Error>> {
        let mut conn = self.pool.get().await.map_err(|e| DriverError::Other(e.into()))?;
        let tx = conn.transaction().await.map_err(|e| DriverError::Other(e.into()))?;

        let current = tx
            .query_opt("SELECT stream_version FROM streams WHERE id = $1", &[&stream_id.as_str()])
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        let current_version = current.as_ref().map(|r| r.get::<_, i64>(0));

        match expected_version {
            ExpectedVersion::Any => {},
            ExpectedVersion::Empty if current.is_none() => {},
            ExpectedVersion::Exact(v) if current_version == Some(v as i64) => {},
            _ => return Err(DriverError::Concurrency),
        }

        tx.execute("DELETE FROM messages WHERE stream_id = $1", &[&stream_id.as_str()])
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        tx.execute("DELETE FROM streams WHERE id = $1", &[&stream_id.as_str()])
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        let marker_id = Uuid::new_v4();
        let deleted_stream = streamstore::types::DELETED_STREAM_ID;

        tx.execute(
            "INSERT INTO streams (id, stream_type, stream_version, position)
             VALUES ($1, $2, 0, 0)
             ON CONFLICT ON CONSTRAINT stream_id_key DO NOTHING",
            &[&deleted_stream, &streamstore::types::STREAM_DELETED_TYPE],
        )
        .await
        .map_err(|e| DriverError::Other(e.into()))?;

        let next_version = tx
            .query_opt("SELECT stream_version FROM streams WHERE id = $1", &[&deleted_stream])
            .await
            .map_err(|e| DriverError::Other(e.into()))?
            .map(|r| r.get::<_, i64>(0) + 1)
            .unwrap_or(0);

        let row = tx
            .query_one(
                "INSERT INTO messages (stream_id, message_id, type, data, metadata, stream_version, created_at)
                 VALUES ($1, $2, $3, $4, '{}'::jsonb, $5, $6)
                 RETURNING position",
                &[
                    &deleted_stream,
                    &marker_id,
                    &streamstore::types::STREAM_DELETED_TYPE,
                    &serde_json::json!({ "streamId": stream_id.as_str() }),
                    &next_version,
                    &now,
                ],
            )
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        let marker_position: i64 = row.get(0);

        tx.execute(
            "UPDATE streams SET stream_version = $2, position = $3 WHERE id = $1",
            &[&deleted_stream, &next_version, &marker_position],
        )
        .await
        .map_err(|e| DriverError::Other(e.into()))?;

        tx.commit().await.map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn delete_message(&self, stream_id: &StreamId, message_id: Uuid) -> Result<(), Self::Error> {
        let conn = self.pool.get().await?;
        conn.execute(
            "DELETE FROM messages WHERE stream_id = $1 AND message_id = $2",
            &[&stream_id.as_str(), &message_id],
        )
        .await?;
        Ok(())
    }

    async fn get_stream_metadata(&self, stream_id: &StreamId) -> Result<StreamMetadataResult, Self::Error> {
        let conn = self.pool.get().await?;
        let meta_id = stream_id.metadata_stream_id();

        let info = conn
            .query_opt(
                "SELECT stream_version, max_age_ms, max_count FROM streams WHERE id = $1",
                &[&meta_id.as_str()],
            )
            .await?;

        let Some(info) = info else {
            return Ok(StreamMetadataResult::default());
        };

        let latest: Option<Value> = conn
            .query_opt(
                "SELECT data FROM messages WHERE stream_id = $1 AND type = $2 ORDER BY stream_version DESC LIMIT 1",
                &[&meta_id.as_str(), &STREAM_METADATA_TYPE],
            )
            .await?
            .map(|row| row.get(0));

        let stream_version: i64 = info.get(0);
        let max_age_ms: Option<i64> = info.get(1);
        let max_count: Option<i64> = info.get(2);

        Ok(StreamMetadataResult {
            metadata: latest.unwrap_or(Value::Null),
            metadata_stream_version: Some(stream_version as u64),
            max_age: max_age_ms.map(|ms| std::time::Duration::from_millis(ms as u64)),
            max_count: max_count.map(|c| c as u64),
        })
    }

    async fn set_stream_metadata(
        &self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        input: StreamMetadataInput,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, DriverError<Self::Error>> {
        let meta_id = stream_id.metadata_stream_id();
        let max_age_ms = input.max_age.map(|d| d.as_millis() as i64);

        let message = streamstore::types::NewMessage::new(Uuid::new_v4(), STREAM_METADATA_TYPE, input.metadata);

        let append_input = AppendInput {
            stream_id: &meta_id,
            expected_version,
            now,
            messages: std::slice::from_ref(&message),
        };

        let outcome = self.append(append_input).await?;

        let mut conn = self.pool.get().await.map_err(|e| DriverError::Other(e.into()))?;
        let tx = conn.transaction().await.map_err(|e| DriverError::Other(e.into()))?;
        tx.execute(
            "UPDATE streams SET max_age_ms = $2, max_count = $3 WHERE id = $1",
            &[&stream_id.as_str(), &max_age_ms, &input.max_count.map(|c| c as i64)],
        )
        .await
        .map_err(|e| DriverError::Other(e.into()))?;
        tx.commit().await.map_err(|e| DriverError::Other(e.into()))?;

        Ok(AppendOutcome {
            stream_version: outcome.stream_version,
            position: outcome.position,
            max_age: input.max_age,
            max_count: input.max_count,
        })
    }

    async fn dispose(&self) {
        // bb8 has no explicit pool-close; idle connections drop with it.
    }
}
