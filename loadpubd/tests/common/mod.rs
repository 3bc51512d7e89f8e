#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use loadpub_common::config::DaemonConfig;
use loadpub_store::SqliteProvider;
use loadpubd::Daemon;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub use loadpub_common::testing::init_test_logging;

/// Start a daemon on an ephemeral port storing into `data_dir`, with retry
/// sleeps disabled.
pub async fn start_daemon(data_dir: &Path) -> Daemon {
    let mut config = DaemonConfig::default();
    config.listener.bind = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.store.data_dir = data_dir.to_path_buf();

    let provider = Arc::new(SqliteProvider::new(data_dir));
    Daemon::start_with(&config, provider, |settings| {
        settings.with_sleep(Arc::new(|_: Duration| {}))
    })
    .await
    .unwrap()
}

/// Wait until the daemon queued `expected` events.
pub async fn wait_for_events(daemon: &Daemon, expected: u64) {
    for _ in 0..500 {
        if daemon.queue().enqueued() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} events, daemon queued {}",
        daemon.queue().enqueued()
    );
}

/// A connected agent publishing into one result set.
pub struct Agent {
    stream: TcpStream,
    pub result_set: String,
    pub host: String,
    pub port: u16,
    pub is_master: bool,
}

impl Agent {
    pub async fn connect(daemon: &Daemon, result_set: &str, host: &str, port: u16) -> Self {
        Self {
            stream: TcpStream::connect(daemon.local_addr()).await.unwrap(),
            result_set: result_set.to_string(),
            host: host.to_string(),
            port,
            is_master: false,
        }
    }

    pub fn line(&self, kind: &str, extra: Value) -> String {
        let mut value = json!({
            "PublishItemType": kind,
            "ResultSetId": self.result_set,
            "AgentHost": self.host,
            "AgentPort": self.port,
            "AgentVersion": "2.1",
            "AgentChannel": "Stable",
            "AgentIsMaster": self.is_master,
            "PublishItemTimestampInMillisecondsSinceEpochUtc": 1_700_000_000_000_i64,
        });
        if let (Value::Object(target), Value::Object(fields)) = (&mut value, extra) {
            target.extend(fields);
        }
        value.to_string()
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.stream.write_all(raw.as_bytes()).await.unwrap();
        self.stream.write_all(b"\n").await.unwrap();
    }

    pub async fn send(&mut self, kind: &str, extra: Value) {
        let line = self.line(kind, extra);
        self.send_raw(&line).await;
    }

    pub async fn test_event(&mut self, kind: &str, at_ms: i64, params: &[(&str, &str)]) {
        let parameters: Vec<Value> = params
            .iter()
            .map(|(k, v)| json!({ "Key": k, "Value": v }))
            .collect();
        self.send(
            "TestEvent",
            json!({
                "TestEventType": kind,
                "AtInMillisecondsSinceEpochUtc": at_ms,
                "Parameters": parameters,
            }),
        )
        .await;
    }
}
