//! Test helpers shared by the loadpub crates.

mod log;

pub use log::init_test_logging;
