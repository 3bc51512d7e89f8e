//! Session registry: routes events to per-session workers and evicts idle
//! sessions.
//!
//! The registry is owned by the dispatcher task, so lookup, creation and
//! eviction never race each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use loadpub_common::protocol::Event;
use loadpub_common::types::SessionKey;
use loadpub_store::StoreProvider;
use tracing::{debug, error, info, trace, warn};

use crate::queue::BatchConsumer;
use crate::session::{ActivityClock, DescriptorCache, SessionHandle, SessionSettings};

pub struct Registry {
    provider: Arc<dyn StoreProvider>,
    settings: Arc<SessionSettings>,
    idle_timeout: Duration,
    clock: ActivityClock,
    /// Filled by the workers, which provision under their retry policy.
    descriptors: DescriptorCache,
    sessions: HashMap<SessionKey, SessionHandle>,
    /// Workers of disposed sessions that may still be draining.
    retired: Vec<JoinHandle<()>>,
}

impl Registry {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        settings: SessionSettings,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            settings: Arc::new(settings),
            idle_timeout,
            clock: ActivityClock::new(),
            descriptors: DescriptorCache::default(),
            sessions: HashMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Route every event of `batch` to its session, then evict idle sessions.
    pub fn dispatch(&mut self, batch: Vec<Event>) {
        for event in batch {
            self.route(event);
        }
        self.sweep();
    }

    fn route(&mut self, event: Event) {
        if event.is_heartbeat() {
            trace!(kind = event.type_name(), "Heartbeat");
            return;
        }
        let (Some(key), Some(result_set)) = (event.session_key(), event.header().result_set())
        else {
            return;
        };

        let now = self.clock.now_millis();
        let event = match self.sessions.get(&key) {
            Some(handle) => {
                handle.touch(now);
                match handle.submit(event) {
                    Ok(()) => return,
                    Err(event) => {
                        warn!(session_id = %key, "Session worker gone, restarting session");
                        if let Some(dead) = self.sessions.remove(&key) {
                            self.retired.push(dead.dispose());
                        }
                        event
                    }
                }
            }
            None => event,
        };

        let handle = match SessionHandle::spawn(
            key.clone(),
            result_set,
            self.descriptors.clone(),
            self.provider.clone(),
            self.settings.clone(),
            self.clock,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                error!(session_id = %key, error = %e, "Failed to start session worker, event dropped");
                return;
            }
        };
        debug!(session_id = %key, sessions = self.sessions.len() + 1, "Session created");
        if handle.submit(event).is_err() {
            error!(session_id = %key, "New session rejected its first event");
        }
        self.sessions.insert(key, handle);
    }

    /// Evict sessions idle longer than the threshold as of now.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Evict sessions whose last activity is older than the idle threshold at
    /// `now`. Returns how many were evicted.
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let now = self.clock.millis_at(now);
        let threshold = u64::try_from(self.idle_timeout.as_millis()).unwrap_or(u64::MAX);

        let idle: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, handle)| now.saturating_sub(handle.last_activity()) > threshold)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &idle {
            if let Some(handle) = self.sessions.remove(key) {
                debug!(session_id = %key, "Idle session evicted");
                self.retired.push(handle.dispose());
            }
        }
        self.reap();

        if !idle.is_empty() {
            info!(evicted = idle.len(), remaining = self.sessions.len(), "Idle sweep");
        }
        idle.len()
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(JoinHandle::is_finished);
        self.retired = running;
        for handle in finished {
            if handle.join().is_err() {
                error!("Session worker panicked");
            }
        }
    }

    /// Dispose every session and wait for all workers to drain.
    pub fn shutdown(&mut self) {
        let count = self.sessions.len();
        for (_, handle) in self.sessions.drain() {
            self.retired.push(handle.dispose());
        }
        for handle in self.retired.drain(..) {
            if handle.join().is_err() {
                error!("Session worker panicked");
            }
        }
        info!(sessions = count, "Sessions shut down");
    }
}

impl BatchConsumer for Registry {
    fn on_batch(&mut self, batch: Vec<Event>) {
        self.dispatch(batch);
    }

    fn on_tick(&mut self) {
        self.sweep();
    }

    fn on_close(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadpub_common::config::RetryConfig;
    use loadpub_common::protocol::decode_line;
    use loadpub_common::types::ResultSetId;
    use loadpub_store::SecretSealer;
    use loadpub_store::testing::{RecordingProvider, RecordingStore};

    fn event(result_set: &str, host: &str, port: u16, kind: &str) -> Event {
        decode_line(&format!(
            r#"{{"PublishItemType":"{kind}","ResultSetId":"{result_set}","AgentHost":"{host}","AgentPort":{port},"StressTest":"t"}}"#
        ))
        .unwrap()
    }

    fn config(result_set: &str, host: &str, port: u16) -> Event {
        event(result_set, host, port, "StressTestConfiguration")
    }

    fn test_started(result_set: &str, host: &str, port: u16) -> Event {
        decode_line(&format!(
            r#"{{"PublishItemType":"TestEvent","ResultSetId":"{result_set}","AgentHost":"{host}","AgentPort":{port},"TestEventType":"TestStarted"}}"#
        ))
        .unwrap()
    }

    fn registry(idle: Duration) -> (Registry, RecordingStore, Arc<RecordingProvider>) {
        let store = RecordingStore::new();
        let provider = Arc::new(RecordingProvider::new(store.clone()));
        let settings = SessionSettings::new(&RetryConfig::default(), SecretSealer::shared().unwrap())
            .with_sleep(Arc::new(|_: Duration| {}));
        let registry = Registry::new(provider.clone(), settings, idle);
        (registry, store, provider)
    }

    fn key(result_set: &str, host: &str, port: u16) -> SessionKey {
        SessionKey::derive(&ResultSetId::new(result_set), host, port)
    }

    #[test]
    fn heartbeats_never_create_sessions() {
        let (mut registry, _, provider) = registry(Duration::from_secs(3600));
        registry.dispatch(vec![
            decode_line(r#"{"PublishItemType":"Poll","ResultSetId":"rs","AgentHost":"a","AgentPort":1}"#)
                .unwrap(),
            decode_line(r#"{"PublishItemType":"TestEvent","AgentHost":"a","AgentPort":1,"TestEventType":"TestStarted"}"#)
                .unwrap(),
        ]);
        assert_eq!(registry.session_count(), 0);
        assert!(provider.provisioned().is_empty());
        registry.shutdown();
    }

    #[test]
    fn sessions_are_keyed_by_result_set_host_and_port() {
        let (mut registry, _, _) = registry(Duration::from_secs(3600));
        registry.dispatch(vec![
            config("rs-1", "a", 1),
            config("rs-1", "a", 1),
            config("rs-1", "a", 2),
            config("rs-1", "b", 1),
            config("rs-2", "a", 1),
        ]);

        assert_eq!(registry.session_count(), 4);
        assert!(registry.contains(&key("rs-1", "a", 1)));
        assert!(registry.contains(&key("rs-2", "a", 1)));
        registry.shutdown();
    }

    #[test]
    fn descriptors_are_cached_per_result_set() {
        let (mut registry, _, provider) = registry(Duration::from_secs(3600));
        registry.dispatch(vec![config("rs-1", "a", 1), config("rs-1", "b", 2)]);
        registry.dispatch(vec![config("rs-1", "c", 3)]);

        assert_eq!(provider.provisioned(), vec![ResultSetId::new("rs-1")]);
        registry.shutdown();
    }

    #[test]
    fn transient_provisioning_failure_keeps_the_run() {
        let (mut registry, store, provider) = registry(Duration::from_secs(3600));
        provider.fail_provisioning(1);

        registry.dispatch(vec![config("rs-1", "a", 1), test_started("rs-1", "a", 1)]);
        assert_eq!(registry.session_count(), 1);
        registry.shutdown();

        assert_eq!(provider.provisioned(), vec![ResultSetId::new("rs-1")]);
        assert_eq!(store.statements_matching("INSERT INTO stress_tests").len(), 1);
        assert_eq!(store.statements_matching("INSERT INTO stress_test_results").len(), 1);
    }

    #[test]
    fn persistent_provisioning_failure_drops_events_not_the_session() {
        let (mut registry, store, provider) = registry(Duration::from_secs(3600));
        provider.fail_provisioning(10);

        registry.dispatch(vec![config("rs-1", "a", 1)]);
        registry.dispatch(vec![config("rs-1", "a", 1)]);
        assert_eq!(registry.session_count(), 1);
        registry.shutdown();

        assert_eq!(store.statements_matching("INSERT INTO stress_tests").len(), 1);
    }

    #[test]
    fn idle_sessions_are_evicted_and_recreated_fresh() {
        let (mut registry, store, _) = registry(Duration::from_secs(60));
        registry.dispatch(vec![config("rs-1", "a", 1), config("rs-1", "b", 1)]);
        assert_eq!(registry.session_count(), 2);

        assert_eq!(registry.sweep_at(Instant::now()), 0);
        assert_eq!(registry.sweep_at(Instant::now() + Duration::from_secs(61)), 2);
        assert_eq!(registry.session_count(), 0);

        registry.dispatch(vec![config("rs-1", "a", 1)]);
        assert!(registry.contains(&key("rs-1", "a", 1)));

        registry.shutdown();
        assert_eq!(store.connections_opened(), 3);
        assert_eq!(store.connections_released(), 3);
    }

    #[test]
    fn activity_postpones_eviction() {
        let (mut registry, _, _) = registry(Duration::from_secs(60));
        registry.dispatch(vec![config("rs-1", "a", 1)]);

        // Well inside the threshold for a session touched just now.
        assert_eq!(registry.sweep_at(Instant::now() + Duration::from_secs(59)), 0);
        assert_eq!(registry.session_count(), 1);
        registry.shutdown();
    }

    #[test]
    fn shutdown_drains_accepted_events() {
        let (mut registry, store, _) = registry(Duration::from_secs(3600));
        let batch: Vec<Event> = (0..20).map(|_| config("rs-1", "a", 1)).collect();
        registry.dispatch(batch);
        registry.shutdown();

        assert_eq!(registry.session_count(), 0);
        assert_eq!(store.statements_matching("INSERT INTO stress_tests").len(), 20);
        assert_eq!(store.connections_released(), 1);
    }
}
