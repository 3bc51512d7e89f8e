//! Shared building blocks for the loadpub telemetry receiver.
//!
//! - [`protocol`]: the line-delimited JSON events agents publish
//! - [`types`]: session and result-set identifiers
//! - [`render`] and [`util`]: locale-independent rendering and escaping
//! - [`config`] and [`logging`]: ambient daemon setup

pub mod config;
pub mod logging;
pub mod protocol;
pub mod render;
pub mod testing;
pub mod types;
pub mod util;

pub use config::{ConfigError, DaemonConfig, LoadedConfig};
pub use logging::{LogConfig, LoggingError, LoggingGuards, init_logging};
pub use protocol::{DecodeError, Event, EventHeader, decode_line};
pub use types::{Readiness, ResultSetId, SessionKey};
