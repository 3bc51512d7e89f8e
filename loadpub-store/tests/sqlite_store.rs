//! Provisioning, writing and reading back a result set on disk.

mod common;

use common::init_test_logging;
use loadpub_common::types::ResultSetId;
use loadpub_store::{SecretSealer, SqlValue, SqliteProvider, Statement, StoreProvider};
use tempfile::TempDir;
use tracing::info;

#[test]
fn test_result_set_survives_reconnect() {
    init_test_logging();
    info!("TEST START: test_result_set_survives_reconnect");

    let dir = TempDir::new().unwrap();
    let provider = SqliteProvider::new(dir.path());
    provider.check().unwrap();

    let descriptor = provider.provision(&ResultSetId::new("soak-7")).unwrap();
    let sealer = SecretSealer::shared().unwrap();

    {
        let mut gateway = provider.connect(&descriptor).unwrap();
        let instance = gateway
            .insert(
                &Statement::new(
                    "INSERT INTO agent_instances(host_name, ip, port, version, channel, is_master) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind("agent-a")
                .bind("")
                .bind(1337_u16)
                .bind("2.1")
                .bind("Stable")
                .bind(true),
            )
            .unwrap();
        let test_id = gateway
            .insert(
                &Statement::new(
                    "INSERT INTO stress_tests(agent_instance_id, stress_test, run_synchronization, connection, \
                     connection_proxy, connection_string, scenarios, scenario_rule_set, concurrencies, runs, \
                     initial_minimum_delay_ms, initial_maximum_delay_ms, minimum_delay_ms, maximum_delay_ms, \
                     shuffle, action_distribution, maximum_number_of_user_actions, monitor_before_minutes, \
                     monitor_after_minutes, use_parallel_execution_of_requests, maximum_persistent_connections, \
                     persistent_connections_per_hostname) \
                     VALUES (?, 'Checkout', 'None', '', '', '', '', '', '5', 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0)",
                )
                .bind(instance),
            )
            .unwrap();
        gateway
            .execute(
                &Statement::new("INSERT INTO monitors(stress_test_id, monitor, monitor_source, connection_string, machine_configuration, result_headers) VALUES (?, ?, ?, ?, ?, ?)")
                    .bind(test_id)
                    .bind("cpu")
                    .bind("wmi")
                    .bind(sealer.seal("Pwd=secret").unwrap())
                    .bind("")
                    .bind(""),
            )
            .unwrap();
    }

    let mut reopened = provider.connect(&provider.provision(&ResultSetId::new("soak-7")).unwrap()).unwrap();
    let rows = reopened
        .query(&Statement::new("SELECT host_name, port FROM agent_instances"))
        .unwrap();
    assert_eq!(
        rows,
        vec![vec![SqlValue::Text("agent-a".into()), SqlValue::Integer(1337)]]
    );

    let sealed = reopened
        .query(&Statement::new("SELECT connection_string FROM monitors"))
        .unwrap();
    let sealed = sealed[0][0].as_str().unwrap();
    assert_eq!(sealer.open(sealed).unwrap(), "Pwd=secret");

    info!("TEST PASS: test_result_set_survives_reconnect");
}

#[test]
fn test_result_sets_are_isolated() {
    init_test_logging();

    let dir = TempDir::new().unwrap();
    let provider = SqliteProvider::new(dir.path());

    let mut a = provider.connect(&provider.provision(&ResultSetId::new("a")).unwrap()).unwrap();
    let mut b = provider.connect(&provider.provision(&ResultSetId::new("b")).unwrap()).unwrap();

    a.execute(&Statement::new("INSERT INTO tags(tag) VALUES (?)").bind("only-a"))
        .unwrap();
    let rows = b.query(&Statement::new("SELECT tag FROM tags")).unwrap();
    assert!(rows.is_empty());
}
