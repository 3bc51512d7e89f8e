//! In-memory gateway and provider that record what the daemon asks of them.
//!
//! Every gateway created from a [`RecordingStore`] shares its log, so tests can
//! hand the provider to the daemon and inspect the statements afterwards.
//! Failures are injected by SQL substring.

use crate::gateway::{Gateway, Row, Statement, StoreError};
use crate::provider::{ConnectionDescriptor, StoreProvider};
use loadpub_common::types::ResultSetId;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    /// Which gateway issued the statement (1-based, in connect order).
    pub connection: usize,
    pub statement: Statement,
}

#[derive(Debug)]
struct Failure {
    pattern: String,
    remaining: Option<u32>,
}

#[derive(Debug)]
struct QueryResponse {
    pattern: String,
    empty_polls: u32,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    statements: Vec<RecordedStatement>,
    attempts: Vec<String>,
    failures: Vec<Failure>,
    responses: Vec<QueryResponse>,
    next_id: i64,
    connect_failures: u32,
    connections_opened: usize,
    connections_released: usize,
    unreachable: bool,
}

impl State {
    /// Consume one matching failure rule, if any.
    fn take_failure(&mut self, sql: &str) -> Option<String> {
        let failure = self
            .failures
            .iter_mut()
            .find(|f| sql.contains(&f.pattern) && f.remaining != Some(0))?;
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(failure.pattern.clone())
    }
}

/// Shared log and behavior of recording gateways.
#[derive(Debug, Clone, Default)]
pub struct RecordingStore {
    state: Arc<Mutex<State>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New gateway sharing this store's log.
    pub fn gateway(&self) -> RecordingGateway {
        let mut state = self.lock();
        state.connections_opened += 1;
        RecordingGateway {
            store: self.clone(),
            connection: state.connections_opened,
            last_id: 0,
        }
    }

    /// Fail the next `times` statements whose SQL contains `pattern`.
    pub fn fail_next(&self, pattern: &str, times: u32) {
        self.lock().failures.push(Failure {
            pattern: pattern.to_string(),
            remaining: Some(times),
        });
    }

    /// Fail every statement whose SQL contains `pattern`.
    pub fn fail_always(&self, pattern: &str) {
        self.lock().failures.push(Failure {
            pattern: pattern.to_string(),
            remaining: None,
        });
    }

    /// Answer queries containing `pattern` with `rows`.
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.respond_after(pattern, 0, rows);
    }

    /// Answer queries containing `pattern` with nothing for `empty_polls`
    /// calls, then with `rows`.
    pub fn respond_after(&self, pattern: &str, empty_polls: u32, rows: Vec<Row>) {
        self.lock().responses.push(QueryResponse {
            pattern: pattern.to_string(),
            empty_polls,
            rows,
        });
    }

    /// Fail the next `times` provider connects.
    pub fn fail_connects(&self, times: u32) {
        self.lock().connect_failures = times;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Statements that succeeded, in execution order.
    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.lock().statements.clone()
    }

    pub fn statements_matching(&self, pattern: &str) -> Vec<Statement> {
        self.lock()
            .statements
            .iter()
            .filter(|r| r.statement.sql.contains(pattern))
            .map(|r| r.statement.clone())
            .collect()
    }

    /// Attempts (successful or not) whose SQL contains `pattern`.
    pub fn attempts_matching(&self, pattern: &str) -> usize {
        self.lock()
            .attempts
            .iter()
            .filter(|sql| sql.contains(pattern))
            .count()
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn connections_released(&self) -> usize {
        self.lock().connections_released
    }
}

/// Gateway that records statements into its [`RecordingStore`].
#[derive(Debug)]
pub struct RecordingGateway {
    store: RecordingStore,
    connection: usize,
    last_id: i64,
}

impl RecordingGateway {
    fn run(&mut self, statement: &Statement) -> Result<(), StoreError> {
        let mut state = self.store.lock();
        state.attempts.push(statement.sql.clone());
        if state.unreachable {
            return Err(StoreError::Unavailable("store unreachable".to_string()));
        }
        if let Some(pattern) = state.take_failure(&statement.sql) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for '{pattern}'"
            )));
        }
        if statement.sql.trim_start().to_ascii_uppercase().starts_with("INSERT") {
            state.next_id += 1;
            self.last_id = state.next_id;
        }
        state.statements.push(RecordedStatement {
            connection: self.connection,
            statement: statement.clone(),
        });
        Ok(())
    }
}

impl Gateway for RecordingGateway {
    fn can_connect(&mut self) -> bool {
        !self.store.lock().unreachable
    }

    fn execute(&mut self, statement: &Statement) -> Result<(), StoreError> {
        self.run(statement)
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        self.run(statement)?;
        let mut state = self.store.lock();
        let Some(response) = state
            .responses
            .iter_mut()
            .find(|r| statement.sql.contains(&r.pattern))
        else {
            return Ok(Vec::new());
        };
        if response.empty_polls > 0 {
            response.empty_polls -= 1;
            return Ok(Vec::new());
        }
        Ok(response.rows.clone())
    }

    fn last_inserted_id(&mut self) -> Result<i64, StoreError> {
        Ok(self.last_id)
    }
}

impl Drop for RecordingGateway {
    fn drop(&mut self) {
        self.store.lock().connections_released += 1;
    }
}

/// Provider handing out [`RecordingGateway`]s.
#[derive(Debug, Default)]
pub struct RecordingProvider {
    store: RecordingStore,
    provisioned: Mutex<Vec<ResultSetId>>,
    provision_failures: Mutex<u32>,
}

impl RecordingProvider {
    pub fn new(store: RecordingStore) -> Self {
        Self {
            store,
            provisioned: Mutex::new(Vec::new()),
            provision_failures: Mutex::new(0),
        }
    }

    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    /// Fail the next `times` provisioning calls.
    pub fn fail_provisioning(&self, times: u32) {
        *self
            .provision_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = times;
    }

    /// Every successful provisioning call, in order.
    pub fn provisioned(&self) -> Vec<ResultSetId> {
        self.provisioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StoreProvider for RecordingProvider {
    fn check(&self) -> Result<(), StoreError> {
        if self.store.lock().unreachable {
            return Err(StoreError::Unavailable("store unreachable".to_string()));
        }
        Ok(())
    }

    fn provision(&self, result_set: &ResultSetId) -> Result<ConnectionDescriptor, StoreError> {
        let mut failures = self
            .provision_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *failures > 0 {
            *failures -= 1;
            return Err(StoreError::Unavailable("injected provisioning failure".to_string()));
        }
        drop(failures);

        self.provisioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result_set.clone());
        Ok(ConnectionDescriptor {
            result_set: result_set.clone(),
            path: PathBuf::from(format!("memory://{result_set}")),
        })
    }

    fn connect(&self, _descriptor: &ConnectionDescriptor) -> Result<Box<dyn Gateway>, StoreError> {
        {
            let mut state = self.store.lock();
            if state.unreachable {
                return Err(StoreError::Unavailable("store unreachable".to_string()));
            }
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(StoreError::Unavailable("injected connect failure".to_string()));
            }
        }
        Ok(Box::new(self.store.gateway()))
    }
}
