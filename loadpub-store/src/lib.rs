//! Persistence for the loadpub telemetry receiver.
//!
//! Sessions write through a [`Gateway`] obtained from a [`StoreProvider`].
//! The production provider keeps one SQLite database per result set; the
//! [`testing`] module records statements instead.

pub mod gateway;
pub mod provider;
pub mod schema;
pub mod seal;
pub mod sqlite;
pub mod testing;

pub use gateway::{AuditedGateway, Gateway, Row, SqlValue, Statement, StoreError};
pub use provider::{ConnectionDescriptor, SqliteProvider, StoreProvider};
pub use seal::SecretSealer;
pub use sqlite::SqliteGateway;
