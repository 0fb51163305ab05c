#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]

//! Core engine for an event/stream store layered over a relational
//! database: append-only streams with optimistic concurrency, a global
//! position ordering with gap detection, and live subscriptions over both.
//!
//! This crate is storage-agnostic — it talks to a [`StorageDriver`]
//! implementation, not a database directly. [`inmemory::InMemoryDriver`] is
//! provided for tests and local development; `streamstore-postgres` (a
//! sibling crate) is the production Postgres-backed driver.
//!
//! ```no_run
//! # async fn run() -> streamstore::error::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use streamstore::inmemory::InMemoryDriver;
//! use streamstore::notifier::PollingNotifier;
//! use streamstore::types::{ExpectedVersion, NewMessage};
//! use streamstore::StreamStore;
//!
//! let driver = Arc::new(InMemoryDriver::new());
//! let notifier = PollingNotifier::spawn(Arc::clone(&driver), Duration::from_millis(500));
//! let store = StreamStore::new(driver, notifier);
//!
//! let message = NewMessage::new(uuid::Uuid::new_v4(), "OrderPlaced", serde_json::json!({}));
//! store.append_to_stream("order-1", ExpectedVersion::Empty, vec![message]).await?;
//! store.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod error;
mod gap_reader;
pub mod inmemory;
mod latch;
pub mod notifier;
pub mod store;
pub mod subscription;
pub mod types;

pub use driver::StorageDriver;
pub use error::{Error, Result};
pub use gap_reader::GapDetectionConfig;
pub use store::{RetryPolicy, StreamStore};
pub use subscription::{
    AllSubscriptionOptions, DropReason, OnCaughtUp, OnDispose, OnDropped, OnEstablished,
    Processor, StreamSubscriptionOptions, Subscription, SubscriptionBackoff, SubscriptionId,
};
