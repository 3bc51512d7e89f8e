//! Table layout of the result-set databases and the catalog.

use rusqlite::Connection;

/// Schema of one result-set database.
pub const RESULT_SET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_name TEXT NOT NULL,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    version TEXT NOT NULL,
    channel TEXT NOT NULL,
    is_master INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS descriptions (
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tags (
    tag TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stress_tests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_instance_id INTEGER NOT NULL REFERENCES agent_instances(id),
    stress_test TEXT NOT NULL,
    run_synchronization TEXT NOT NULL,
    connection TEXT NOT NULL,
    connection_proxy TEXT NOT NULL,
    connection_string TEXT NOT NULL,
    scenarios TEXT NOT NULL,
    scenario_rule_set TEXT NOT NULL,
    concurrencies TEXT NOT NULL,
    runs INTEGER NOT NULL,
    initial_minimum_delay_ms INTEGER NOT NULL,
    initial_maximum_delay_ms INTEGER NOT NULL,
    minimum_delay_ms INTEGER NOT NULL,
    maximum_delay_ms INTEGER NOT NULL,
    shuffle INTEGER NOT NULL,
    action_distribution INTEGER NOT NULL,
    maximum_number_of_user_actions INTEGER NOT NULL,
    monitor_before_minutes INTEGER NOT NULL,
    monitor_after_minutes INTEGER NOT NULL,
    use_parallel_execution_of_requests INTEGER NOT NULL,
    maximum_persistent_connections INTEGER NOT NULL,
    persistent_connections_per_hostname INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stress_test_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stress_test_id INTEGER NOT NULL REFERENCES stress_tests(id),
    started_at TEXT NOT NULL,
    stopped_at TEXT NOT NULL,
    status TEXT NOT NULL,
    status_message TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS concurrency_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stress_test_result_id INTEGER NOT NULL REFERENCES stress_test_results(id),
    concurrency INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    stopped_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    concurrency_result_id INTEGER NOT NULL REFERENCES concurrency_results(id),
    run INTEGER NOT NULL,
    total_request_count INTEGER NOT NULL,
    rerun_count INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    stopped_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS request_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_result_id INTEGER NOT NULL REFERENCES run_results(id),
    virtual_user TEXT NOT NULL,
    user_action TEXT NOT NULL,
    request_index TEXT NOT NULL,
    same_as_request_index TEXT NOT NULL,
    request TEXT NOT NULL,
    in_parallel_with_previous INTEGER NOT NULL,
    sent_at_ticks_utc INTEGER NOT NULL,
    time_to_last_byte_ticks INTEGER NOT NULL,
    meta TEXT NOT NULL,
    delay_ms INTEGER NOT NULL,
    error TEXT NOT NULL,
    rerun INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_request_results_run ON request_results(run_result_id);

CREATE TABLE IF NOT EXISTS monitors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stress_test_id INTEGER NOT NULL REFERENCES stress_tests(id),
    monitor TEXT NOT NULL,
    monitor_source TEXT NOT NULL,
    connection_string TEXT NOT NULL,
    machine_configuration TEXT NOT NULL,
    result_headers TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS monitor_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    monitor_id INTEGER NOT NULL REFERENCES monitors(id),
    timestamp TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_monitor_results_monitor ON monitor_results(monitor_id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_instance_id INTEGER NOT NULL REFERENCES agent_instances(id),
    timestamp TEXT NOT NULL,
    level INTEGER NOT NULL,
    message TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS results_ready_state (
    state TEXT NOT NULL
);
"#;

/// Schema of the catalog of provisioned result sets.
pub const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS result_sets (
    result_set_id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Create every result-set table that does not exist yet.
pub fn apply_result_set_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(RESULT_SET_SCHEMA)
}

pub fn apply_catalog_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CATALOG_SCHEMA)
}
