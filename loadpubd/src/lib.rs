//! loadpub receiver daemon.
//!
//! Agents stream JSON events over TCP; the [`listener`] decodes them into the
//! [`queue`], a single dispatcher hands them to the [`registry`], and every
//! [`session`] persists its own events in order, with [`retry`].

#![forbid(unsafe_code)]

pub mod daemon;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod session;

pub use daemon::Daemon;
pub use listener::Listener;
pub use queue::{BatchConsumer, InboundQueue};
pub use registry::Registry;
pub use session::{SessionContext, SessionError, SessionSettings};
