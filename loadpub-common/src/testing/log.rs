//! Structured test logging for CI debugging.
//!
//! Call [`init_test_logging`] at the top of a test (or from a shared
//! `tests/common` module). It is safe to call from every test; the global
//! subscriber is installed once.
//!
//! # Environment Variables
//!
//! - `LOADPUB_TEST_LOG_LEVEL`: filter for the loadpub crates (default: `debug`)
//! - `LOADPUB_TEST_LOG_FILE`: also append JSONL to this file

use std::path::PathBuf;
use std::sync::{Mutex, Once};
use tracing_subscriber::prelude::*;

static INIT: Once = Once::new();

/// Install a JSON test-writer subscriber once per test binary.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var("LOADPUB_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "loadpubd={level},loadpub_store={level},loadpub_common={level},warn"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let test_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json();

        let file_layer = create_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        });

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(test_layer)
            .with(file_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_log_file() -> Option<std::fs::File> {
    let path = PathBuf::from(std::env::var("LOADPUB_TEST_LOG_FILE").ok()?);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

/// Log a test milestone through `tracing` with the test name attached.
#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "loadpub_common::testing", $($arg)*)
    };
}
