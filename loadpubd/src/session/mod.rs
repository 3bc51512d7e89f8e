//! Session state machine.
//!
//! Each session owns one worker thread that consumes its FIFO in order and
//! runs every event through the handlers under the retry policy. Store
//! operations block that thread only; other sessions and the dispatcher keep
//! running.

mod handlers;
mod statements;

pub use handlers::DISTRIBUTED_TEST_NAME;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use loadpub_common::config::RetryConfig;
use loadpub_common::protocol::Event;
use loadpub_common::types::{ResultSetId, SessionKey};
use loadpub_common::util::mask_credentials;
use loadpub_store::{
    AuditedGateway, ConnectionDescriptor, Gateway, SecretSealer, StoreError, StoreProvider,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::retry::{RetryPolicy, SleepFn, run_with_retry, thread_sleep};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("parameter {name} is missing")]
    MissingParameter { name: &'static str },

    #[error("parameter {name} has invalid value '{value}'")]
    InvalidParameter { name: &'static str, value: String },

    #[error("stress test {test_id} not visible after {polls} polls")]
    NotVisible { test_id: i64, polls: u32 },
}

/// Per-session state rebuilt from lifecycle events.
///
/// Lower levels of the test → concurrency → run hierarchy are only
/// meaningful while the level above is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub instance_id: Option<i64>,
    pub test_id: Option<i64>,
    pub stress_test_result_id: Option<i64>,
    pub concurrency_result_id: Option<i64>,
    pub run_result_id: Option<i64>,
    /// Run number announced by `RunInitializedFirstTime`.
    pub pending_run: Option<i64>,
    /// Request results counted in the current run.
    pub request_count: u64,
    pub monitors_missing_headers: HashSet<String>,
    pub monitor_ids: HashMap<String, i64>,
}

/// Behavior shared by every session worker.
#[derive(Clone)]
pub struct SessionSettings {
    pub retry: RetryPolicy,
    pub visibility_interval: Duration,
    /// `None` waits until the row shows up.
    pub visibility_limit: Option<u32>,
    pub sleep: SleepFn,
    pub sealer: SecretSealer,
}

impl std::fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSettings")
            .field("retry", &self.retry)
            .field("visibility_interval", &self.visibility_interval)
            .field("visibility_limit", &self.visibility_limit)
            .finish_non_exhaustive()
    }
}

impl SessionSettings {
    pub fn new(retry: &RetryConfig, sealer: SecretSealer) -> Self {
        Self {
            retry: RetryPolicy::from(retry),
            visibility_interval: Duration::from_millis(retry.visibility_poll_interval_ms),
            visibility_limit: retry.visibility_poll_limit,
            sleep: thread_sleep(),
            sealer,
        }
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }
}

/// Millisecond clock relative to a fixed origin, shared by the registry and
/// its workers.
#[derive(Debug, Clone, Copy)]
pub struct ActivityClock {
    origin: Instant,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn millis_at(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.origin).as_millis()).unwrap_or(u64::MAX)
    }

    pub fn now_millis(&self) -> u64 {
        self.millis_at(Instant::now())
    }
}

/// Connection descriptors of every result set provisioned so far, shared by
/// all workers. Never swept; result sets outlive their sessions.
#[derive(Debug, Clone, Default)]
pub(crate) struct DescriptorCache {
    inner: Arc<Mutex<HashMap<ResultSetId, ConnectionDescriptor>>>,
}

impl DescriptorCache {
    /// Descriptor for `result_set`, provisioning it on first use. The lock is
    /// held across provisioning so sibling sessions provision a result set once.
    pub(crate) fn resolve(
        &self,
        provider: &dyn StoreProvider,
        result_set: &ResultSetId,
    ) -> Result<ConnectionDescriptor, StoreError> {
        let mut descriptors = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(descriptor) = descriptors.get(result_set) {
            return Ok(descriptor.clone());
        }
        let descriptor = provider.provision(result_set)?;
        info!(result_set = %result_set, store = %descriptor, "Result set provisioned");
        descriptors.insert(result_set.clone(), descriptor.clone());
        Ok(descriptor)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Registry-side handle to a running session worker.
pub(crate) struct SessionHandle {
    sender: mpsc::UnboundedSender<Event>,
    last_activity: Arc<AtomicU64>,
    thread: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn spawn(
        key: SessionKey,
        result_set: ResultSetId,
        descriptors: DescriptorCache,
        provider: Arc<dyn StoreProvider>,
        settings: Arc<SessionSettings>,
        clock: ActivityClock,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let last_activity = Arc::new(AtomicU64::new(clock.now_millis()));

        let worker = SessionWorker {
            key: key.clone(),
            result_set,
            descriptors,
            provider,
            settings,
            clock,
            last_activity: last_activity.clone(),
            gateway: None,
            context: SessionContext::default(),
            failed_statement: None,
        };
        let thread = std::thread::Builder::new()
            .name(format!("session-{}", thread_label(&key)))
            .spawn(move || worker.run(receiver))?;

        Ok(Self {
            sender,
            last_activity,
            thread,
        })
    }

    /// Queue `event` behind everything already submitted.
    pub(crate) fn submit(&self, event: Event) -> Result<(), Event> {
        self.sender.send(event).map_err(|mpsc::error::SendError(event)| event)
    }

    pub(crate) fn touch(&self, now_millis: u64) {
        self.last_activity.fetch_max(now_millis, Ordering::Relaxed);
    }

    pub(crate) fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Close the FIFO. The worker drains what it accepted, releases its
    /// gateway and exits; the returned handle joins it.
    pub(crate) fn dispose(self) -> JoinHandle<()> {
        drop(self.sender);
        self.thread
    }
}

/// Thread names are truncated by the OS; keep the tail, which carries host and port.
fn thread_label(key: &SessionKey) -> String {
    let chars: Vec<char> = key.as_str().chars().collect();
    let start = chars.len().saturating_sub(24);
    chars[start..].iter().collect()
}

struct SessionWorker {
    key: SessionKey,
    result_set: ResultSetId,
    descriptors: DescriptorCache,
    provider: Arc<dyn StoreProvider>,
    settings: Arc<SessionSettings>,
    clock: ActivityClock,
    last_activity: Arc<AtomicU64>,
    gateway: Option<Box<dyn Gateway>>,
    context: SessionContext,
    /// Rendered SQL of the last statement rejected while processing the
    /// current event.
    failed_statement: Option<String>,
}

impl SessionWorker {
    fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Event>) {
        debug!(session_id = %self.key, result_set = %self.result_set, "Session started");
        let mut processed: u64 = 0;

        while let Some(event) = receiver.blocking_recv() {
            self.touch();
            self.process(&event);
            self.touch();
            processed += 1;
        }

        if self.gateway.take().is_some() {
            trace!(session_id = %self.key, "Gateway released");
        }
        debug!(session_id = %self.key, processed, "Session stopped");
    }

    fn touch(&self) {
        self.last_activity
            .fetch_max(self.clock.now_millis(), Ordering::Relaxed);
    }

    fn process(&mut self, event: &Event) {
        if !handlers::persists(event) {
            trace!(session_id = %self.key, kind = event.type_name(), "No-op event");
            return;
        }

        self.failed_statement = None;
        let settings = Arc::clone(&self.settings);
        let result = run_with_retry(event.type_name(), &settings.retry, &*settings.sleep, |_| {
            self.attempt(event)
        });

        if let Err(exhausted) = result {
            error!(
                session_id = %self.key,
                attempts = exhausted.attempts,
                error = %exhausted.last_error,
                event = %mask_credentials(&event.to_log_string()),
                statement = %mask_credentials(self.failed_statement.as_deref().unwrap_or_default()),
                "Dropping event after exhausting retries"
            );
        }
    }

    fn attempt(&mut self, event: &Event) -> Result<(), SessionError> {
        let gateway = match self.gateway.take() {
            Some(gateway) => gateway,
            None => {
                let descriptor = self
                    .descriptors
                    .resolve(self.provider.as_ref(), &self.result_set)?;
                let gateway = self.provider.connect(&descriptor)?;
                trace!(session_id = %self.key, "Gateway connected");
                gateway
            }
        };
        let gateway = self.gateway.insert(gateway);

        let mut audited = AuditedGateway::new(gateway.as_mut());
        let result = handlers::apply(&mut self.context, &mut audited, &self.settings, event);
        if let Some(statement) = audited.into_failed_statement() {
            self.failed_statement = Some(statement);
        }
        if matches!(result, Err(SessionError::Store(_))) && !gateway.can_connect() {
            debug!(session_id = %self.key, "Store unreachable, dropping gateway");
            self.gateway = None;
        }
        result
    }
}
