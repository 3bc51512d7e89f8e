//! Statements issued by the session handlers.

use loadpub_common::protocol::{EventHeader, RequestResults, ScenarioWeight, StressTestSettings};
use loadpub_common::render::{OPEN_ENDED_TIMESTAMP, render_monitor_headers};
use loadpub_common::types::Readiness;
use loadpub_store::Statement;

pub(crate) fn find_agent_instance(header: &EventHeader) -> Statement {
    Statement::new(
        "SELECT id FROM agent_instances \
         WHERE host_name = ? AND port = ? AND version = ? AND channel = ? AND is_master = ? \
         ORDER BY id LIMIT 1",
    )
    .bind(&header.agent_host)
    .bind(header.agent_port)
    .bind(&header.agent_version)
    .bind(&header.agent_channel)
    .bind(header.agent_is_master)
}

/// Agents only report their host; it doubles as the address.
pub(crate) fn insert_agent_instance(header: &EventHeader) -> Statement {
    Statement::new(
        "INSERT INTO agent_instances(host_name, ip, port, version, channel, is_master) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&header.agent_host)
    .bind(&header.agent_host)
    .bind(header.agent_port)
    .bind(&header.agent_version)
    .bind(&header.agent_channel)
    .bind(header.agent_is_master)
}

pub(crate) fn delete_descriptions() -> Statement {
    Statement::new("DELETE FROM descriptions")
}

pub(crate) fn insert_description(description: &str) -> Statement {
    Statement::new("INSERT INTO descriptions(description) VALUES (?)").bind(description)
}

pub(crate) fn delete_tags() -> Statement {
    Statement::new("DELETE FROM tags")
}

/// One multi-row insert for all tags. `tags` must not be empty.
pub(crate) fn insert_tags(tags: &[String]) -> Statement {
    let placeholders = vec!["(?)"; tags.len()].join(", ");
    tags.iter().fold(
        Statement::new(format!("INSERT INTO tags(tag) VALUES {placeholders}")),
        |statement, tag| statement.bind(tag),
    )
}

fn join_scenarios(scenarios: &[ScenarioWeight]) -> String {
    scenarios
        .iter()
        .map(|s| format!("{}:{}", s.key, s.value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_concurrencies(concurrencies: &[i64]) -> String {
    concurrencies
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// `sealed_connection_string` must already be sealed.
pub(crate) fn insert_stress_test(
    instance_id: i64,
    name: &str,
    run_synchronization: &str,
    settings: &StressTestSettings,
    sealed_connection_string: &str,
) -> Statement {
    Statement::new(
        "INSERT INTO stress_tests(agent_instance_id, stress_test, run_synchronization, connection, \
         connection_proxy, connection_string, scenarios, scenario_rule_set, concurrencies, runs, \
         initial_minimum_delay_ms, initial_maximum_delay_ms, minimum_delay_ms, maximum_delay_ms, \
         shuffle, action_distribution, maximum_number_of_user_actions, monitor_before_minutes, \
         monitor_after_minutes, use_parallel_execution_of_requests, maximum_persistent_connections, \
         persistent_connections_per_hostname) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(instance_id)
    .bind(name)
    .bind(run_synchronization)
    .bind(&settings.connection)
    .bind(&settings.connection_proxy)
    .bind(sealed_connection_string)
    .bind(join_scenarios(&settings.scenarios_and_weights))
    .bind(&settings.scenario_rule_set)
    .bind(join_concurrencies(&settings.concurrencies))
    .bind(settings.runs)
    .bind(settings.initial_minimum_delay_in_milliseconds)
    .bind(settings.initial_maximum_delay_in_milliseconds)
    .bind(settings.minimum_delay_in_milliseconds)
    .bind(settings.maximum_delay_in_milliseconds)
    .bind(settings.shuffle)
    .bind(settings.action_distribution)
    .bind(settings.maximum_number_of_user_actions)
    .bind(settings.monitor_before_in_minutes)
    .bind(settings.monitor_after_in_minutes)
    .bind(settings.use_parallel_execution_of_requests)
    .bind(settings.maximum_persistent_connections)
    .bind(settings.persistent_connections_per_hostname)
}

pub(crate) fn stress_test_visible(test_id: i64) -> Statement {
    Statement::new("SELECT id FROM stress_tests WHERE id = ?").bind(test_id)
}

pub(crate) fn insert_stress_test_result(test_id: i64, started_at: &str) -> Statement {
    Statement::new(
        "INSERT INTO stress_test_results(stress_test_id, started_at, stopped_at, status, status_message) \
         VALUES (?, ?, ?, 'OK', '')",
    )
    .bind(test_id)
    .bind(started_at)
    .bind(OPEN_ENDED_TIMESTAMP)
}

pub(crate) fn finish_stress_test_result(
    id: i64,
    stopped_at: &str,
    status: &str,
    status_message: &str,
) -> Statement {
    Statement::new(
        "UPDATE stress_test_results SET stopped_at = ?, status = ?, status_message = ? WHERE id = ?",
    )
    .bind(stopped_at)
    .bind(status)
    .bind(status_message)
    .bind(id)
}

pub(crate) fn insert_concurrency_result(
    stress_test_result_id: i64,
    concurrency: i64,
    started_at: &str,
) -> Statement {
    Statement::new(
        "INSERT INTO concurrency_results(stress_test_result_id, concurrency, started_at, stopped_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(stress_test_result_id)
    .bind(concurrency)
    .bind(started_at)
    .bind(OPEN_ENDED_TIMESTAMP)
}

pub(crate) fn finish_concurrency_result(id: i64, stopped_at: &str) -> Statement {
    Statement::new("UPDATE concurrency_results SET stopped_at = ? WHERE id = ?")
        .bind(stopped_at)
        .bind(id)
}

pub(crate) fn insert_run_result(concurrency_result_id: i64, run: i64, started_at: &str) -> Statement {
    Statement::new(
        "INSERT INTO run_results(concurrency_result_id, run, total_request_count, rerun_count, started_at, stopped_at) \
         VALUES (?, ?, 0, 0, ?, ?)",
    )
    .bind(concurrency_result_id)
    .bind(run)
    .bind(started_at)
    .bind(OPEN_ENDED_TIMESTAMP)
}

pub(crate) fn finish_run_result(id: i64, total_request_count: u64, stopped_at: &str) -> Statement {
    Statement::new("UPDATE run_results SET total_request_count = ?, stopped_at = ? WHERE id = ?")
        .bind(total_request_count)
        .bind(stopped_at)
        .bind(id)
}

pub(crate) fn insert_message(instance_id: i64, timestamp: &str, level: i64, message: &str) -> Statement {
    Statement::new(
        "INSERT INTO messages(agent_instance_id, timestamp, level, message) VALUES (?, ?, ?, ?)",
    )
    .bind(instance_id)
    .bind(timestamp)
    .bind(level)
    .bind(message)
}

/// Tick values are stored as received, without time-zone conversion.
pub(crate) fn insert_request_result(
    run_result_id: i64,
    virtual_user: &str,
    result: &RequestResults,
) -> Statement {
    Statement::new(
        "INSERT INTO request_results(run_result_id, virtual_user, user_action, request_index, \
         same_as_request_index, request, in_parallel_with_previous, sent_at_ticks_utc, \
         time_to_last_byte_ticks, meta, delay_ms, error, rerun) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(run_result_id)
    .bind(virtual_user)
    .bind(&result.user_action)
    .bind(&result.request_index)
    .bind(&result.same_as_request_index)
    .bind(&result.request)
    .bind(result.in_parallel_with_previous)
    .bind(result.sent_at_in_ticks_since_epoch_utc)
    .bind(result.time_to_last_byte_in_ticks)
    .bind(&result.meta)
    .bind(result.delay_in_milliseconds)
    .bind(&result.error)
    .bind(result.rerun)
}

pub(crate) fn insert_monitor(
    test_id: i64,
    monitor: &str,
    monitor_source: &str,
    sealed_connection_string: &str,
    machine_configuration: &str,
) -> Statement {
    Statement::new(
        "INSERT INTO monitors(stress_test_id, monitor, monitor_source, connection_string, \
         machine_configuration, result_headers) VALUES (?, ?, ?, ?, ?, '')",
    )
    .bind(test_id)
    .bind(monitor)
    .bind(monitor_source)
    .bind(sealed_connection_string)
    .bind(machine_configuration)
}

pub(crate) fn set_monitor_headers(monitor_id: i64, headers: &[String]) -> Statement {
    Statement::new("UPDATE monitors SET result_headers = ? WHERE id = ?")
        .bind(render_monitor_headers(headers))
        .bind(monitor_id)
}

pub(crate) fn insert_monitor_result(monitor_id: i64, timestamp: &str, value: &str) -> Statement {
    Statement::new("INSERT INTO monitor_results(monitor_id, timestamp, value) VALUES (?, ?, ?)")
        .bind(monitor_id)
        .bind(timestamp)
        .bind(value)
}

/// Replace the single readiness row.
pub(crate) fn set_readiness(readiness: Readiness) -> [Statement; 2] {
    [
        Statement::new("DELETE FROM results_ready_state"),
        Statement::new("INSERT INTO results_ready_state(state) VALUES (?)").bind(readiness.as_stored()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadpub_store::SqlValue;

    #[test]
    fn tags_use_one_placeholder_each() {
        let statement = insert_tags(&["a".to_string(), "b".to_string()]);
        assert_eq!(statement.sql, "INSERT INTO tags(tag) VALUES (?), (?)");
        assert_eq!(statement.params.len(), 2);
    }

    #[test]
    fn stress_test_binds_every_column() {
        let settings = StressTestSettings {
            concurrencies: vec![5, 10],
            scenarios_and_weights: vec![ScenarioWeight {
                key: "login".into(),
                value: 3,
            }],
            ..Default::default()
        };
        let statement = insert_stress_test(1, "Checkout", "None", &settings, "sealed");
        assert_eq!(statement.sql.matches('?').count(), statement.params.len());
        assert_eq!(statement.params[6], SqlValue::Text("login:3".into()));
        assert_eq!(statement.params[8], SqlValue::Text("5, 10".into()));
    }

    #[test]
    fn readiness_replaces_the_row() {
        let [delete, insert] = set_readiness(Readiness::NotReady);
        assert_eq!(delete.sql, "DELETE FROM results_ready_state");
        assert_eq!(insert.params, vec![SqlValue::Text("Not ready".into())]);
    }

    #[test]
    fn open_ended_rows_use_the_minimum_timestamp() {
        let statement = insert_run_result(4, 2, "2024-01-01 00:00:00.000000");
        assert_eq!(statement.params[3], SqlValue::Text(OPEN_ENDED_TIMESTAMP.into()));
        assert_eq!(
            statement.render(),
            "INSERT INTO run_results(concurrency_result_id, run, total_request_count, rerun_count, started_at, stopped_at) \
             VALUES (4, 2, 0, 0, '2024-01-01 00:00:00.000000', '0001-01-01 00:00:00.000000')"
        );
    }
}
