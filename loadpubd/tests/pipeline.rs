//! Agents publishing over TCP into result-set databases on disk.

mod common;

use common::{Agent, init_test_logging, start_daemon, wait_for_events};
use loadpub_common::types::ResultSetId;
use loadpub_store::SqliteProvider;
use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;
use tracing::info;

const STARTED: i64 = 1_700_000_001_000;
const STOPPED: i64 = 1_700_000_061_500;

fn open(dir: &TempDir, result_set: &str) -> Connection {
    let path = SqliteProvider::new(dir.path()).database_path(&ResultSetId::new(result_set));
    Connection::open(path).unwrap()
}

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}

async fn publish_run(agent: &mut Agent, requests: u32) -> u64 {
    agent
        .send(
            "StressTestConfiguration",
            json!({
                "StressTest": "Checkout",
                "Description": "nightly soak",
                "Tags": ["soak", "eu"],
                "ConnectionString": "Server=db;Pwd=secret",
                "Concurrencies": [5],
                "Runs": 1,
            }),
        )
        .await;
    agent.test_event("TestStarted", STARTED, &[]).await;
    agent
        .test_event("ConcurrencyStarted", STARTED, &[("Concurrency", "5")])
        .await;
    agent
        .test_event("RunInitializedFirstTime", STARTED, &[("Run", "1")])
        .await;
    agent.test_event("RunStarted", STARTED, &[]).await;
    for n in 0..requests {
        agent
            .send(
                "RequestResults",
                json!({
                    "VirtualUser": "vu-1",
                    "UserAction": "login",
                    "RequestIndex": format!("0.{n}"),
                    "Request": format!("GET /item/{n}"),
                    "TimeToLastByteInTicks": 1200,
                }),
            )
            .await;
    }
    agent.test_event("RunStopped", STOPPED, &[]).await;
    agent.test_event("ConcurrencyStopped", STOPPED, &[]).await;
    agent
        .test_event("TestStopped", STOPPED, &[("Status", "OK"), ("StatusMessage", "done")])
        .await;
    8 + u64::from(requests)
}

#[tokio::test]
async fn test_full_run_is_persisted() {
    init_test_logging();
    info!("TEST START: test_full_run_is_persisted");

    let dir = TempDir::new().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let mut agent = Agent::connect(&daemon, "rs-soak", "agent-a", 1337).await;

    let sent = publish_run(&mut agent, 3).await;
    wait_for_events(&daemon, sent).await;
    daemon.shutdown().await;

    let conn = open(&dir, "rs-soak");
    let (name, sealed): (String, String) = conn
        .query_row("SELECT stress_test, connection_string FROM stress_tests", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(name, "Checkout");
    assert!(!sealed.contains("secret"));

    let (started, stopped, status, message): (String, String, String, String) = conn
        .query_row(
            "SELECT started_at, stopped_at, status, status_message FROM stress_test_results",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(started, "2023-11-14 22:13:21.000000");
    assert_eq!(stopped, "2023-11-14 22:14:21.500000");
    assert_eq!((status.as_str(), message.as_str()), ("OK", "done"));

    let (run, total): (i64, i64) = conn
        .query_row("SELECT run, total_request_count FROM run_results", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!((run, total), (1, 3));
    assert_eq!(count(&conn, "request_results"), 3);
    assert_eq!(count(&conn, "tags"), 2);
    assert_eq!(count(&conn, "agent_instances"), 1);

    info!("TEST PASS: test_full_run_is_persisted");
}

#[tokio::test]
async fn test_agents_of_one_result_set_share_a_database() {
    init_test_logging();
    info!("TEST START: test_agents_of_one_result_set_share_a_database");

    let dir = TempDir::new().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let mut first = Agent::connect(&daemon, "rs-dist", "agent-a", 1337).await;
    let mut second = Agent::connect(&daemon, "rs-dist", "agent-b", 1337).await;

    let mut sent = publish_run(&mut first, 2).await;
    sent += publish_run(&mut second, 4).await;
    wait_for_events(&daemon, sent).await;
    daemon.shutdown().await;

    let conn = open(&dir, "rs-dist");
    assert_eq!(count(&conn, "agent_instances"), 2);
    assert_eq!(count(&conn, "stress_tests"), 2);
    assert_eq!(count(&conn, "request_results"), 6);

    let mut totals: Vec<i64> = conn
        .prepare("SELECT total_request_count FROM run_results")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    totals.sort_unstable();
    assert_eq!(totals, vec![2, 4]);

    info!("TEST PASS: test_agents_of_one_result_set_share_a_database");
}

#[tokio::test]
async fn test_monitor_results_and_readiness() {
    init_test_logging();
    info!("TEST START: test_monitor_results_and_readiness");

    let dir = TempDir::new().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let mut agent = Agent::connect(&daemon, "rs-mon", "agent-m", 1400).await;
    agent.is_master = true;

    agent
        .send("StressTestConfiguration", json!({ "StressTest": "Browse" }))
        .await;
    agent
        .send(
            "MonitorConfiguration",
            json!({ "Monitor": "db01", "MonitorSource": "wmi", "ConnectionString": "Pwd=pw" }),
        )
        .await;
    agent
        .send("MonitorEvent", json!({ "MonitorEventType": "MonitorAfterTestStarted" }))
        .await;
    for (at, cpu) in [(STARTED, 12.5), (STOPPED, 40.0)] {
        agent
            .send(
                "MonitorMetrics",
                json!({
                    "Monitor": "db01",
                    "AtInMillisecondsSinceEpochUtc": at,
                    "Headers": ["cpu", "up"],
                    "Values": [cpu, true],
                }),
            )
            .await;
    }
    agent
        .send("MonitorEvent", json!({ "MonitorEventType": "MonitorAfterTestDone" }))
        .await;
    wait_for_events(&daemon, 6).await;
    daemon.shutdown().await;

    let conn = open(&dir, "rs-mon");
    let headers: String = conn
        .query_row("SELECT result_headers FROM monitors", [], |row| row.get(0))
        .unwrap();
    assert_eq!(headers, "Timestamp; cpu; up");

    let values: Vec<String> = conn
        .prepare("SELECT value FROM monitor_results ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(values, vec!["12.5; 1".to_string(), "40; 1".to_string()]);

    let state: String = conn
        .query_row("SELECT state FROM results_ready_state", [], |row| row.get(0))
        .unwrap();
    assert_eq!(state, "Ready");

    info!("TEST PASS: test_monitor_results_and_readiness");
}

#[tokio::test]
async fn test_garbage_lines_are_skipped() {
    init_test_logging();
    info!("TEST START: test_garbage_lines_are_skipped");

    let dir = TempDir::new().unwrap();
    let daemon = start_daemon(dir.path()).await;
    let mut agent = Agent::connect(&daemon, "rs-noise", "agent-n", 1).await;

    agent.send_raw("{\"PublishItemType\":").await;
    agent.send_raw("{\"PublishItemType\":\"Unheard\"}").await;
    agent.send("Poll", json!({})).await;
    agent
        .send("StressTestConfiguration", json!({ "StressTest": "After noise" }))
        .await;
    wait_for_events(&daemon, 2).await;
    daemon.shutdown().await;

    let conn = open(&dir, "rs-noise");
    let name: String = conn
        .query_row("SELECT stress_test FROM stress_tests", [], |row| row.get(0))
        .unwrap();
    assert_eq!(name, "After noise");

    info!("TEST PASS: test_garbage_lines_are_skipped");
}
