#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]

//! PostgreSQL-backed [`streamstore::StorageDriver`] and
//! [`streamstore::notifier::Notifier`] implementations, plus the
//! `streamstore-pg` schema bootstrapper binary.

pub mod config;
pub mod driver;
pub mod notifier;

pub use config::Config;
pub use driver::{migrate, Error, PgPool, PostgresDriver};
pub use notifier::PgNotifyNotifier;
