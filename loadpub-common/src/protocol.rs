//! Wire protocol for agent telemetry.
//!
//! Agents send one JSON object per line. The `PublishItemType` field selects
//! the concrete [`Event`] variant; the remaining fields are decoded into that
//! variant's payload. Every payload flattens an [`EventHeader`] carrying the
//! session-identifying fields.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::types::{ResultSetId, SessionKey};

/// Name of the JSON field that carries the event type tag.
pub const TYPE_TAG: &str = "PublishItemType";

/// Errors produced while decoding an inbound line.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The line contained nothing but whitespace.
    #[error("empty line")]
    Empty,

    /// The line is not a JSON object.
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The line has no type tag.
    #[error("missing PublishItemType field")]
    MissingTag,

    /// The type tag names an event this receiver does not know.
    #[error("unknown event type '{0}'")]
    UnknownType(String),

    /// The tag is known but the payload does not match it.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one line of agent output into an [`Event`].
///
/// Tag inspection happens on a generic JSON value first so unknown types and
/// malformed payloads produce distinct errors.
pub fn decode_line(line: &str) -> Result<Event, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    let value: serde_json::Value = serde_json::from_str(trimmed).map_err(DecodeError::Malformed)?;
    let kind = match value.get(TYPE_TAG) {
        Some(serde_json::Value::String(kind)) => kind.clone(),
        _ => return Err(DecodeError::MissingTag),
    };
    if !Event::TYPE_NAMES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload { kind, source })
}

/// Fields shared by every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    #[serde(rename = "ResultSetId", default)]
    pub result_set_id: Option<String>,
    #[serde(rename = "AgentHost", alias = "vApusHost", default)]
    pub agent_host: String,
    #[serde(rename = "AgentPort", alias = "vApusPort", default)]
    pub agent_port: u16,
    #[serde(rename = "AgentVersion", alias = "vApusVersion", default)]
    pub agent_version: String,
    #[serde(rename = "AgentChannel", alias = "vApusChannel", default)]
    pub agent_channel: String,
    #[serde(rename = "AgentIsMaster", alias = "vApusIsMaster", default)]
    pub agent_is_master: bool,
    #[serde(rename = "PublishItemTimestampInMillisecondsSinceEpochUtc", default)]
    pub published_at_ms: i64,
}

impl EventHeader {
    /// The result-set identifier, if present and non-empty.
    pub fn result_set(&self) -> Option<ResultSetId> {
        self.result_set_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(ResultSetId::new)
    }
}

/// One key/value pair as serialized by the agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// A scenario and its relative weight in a stress test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScenarioWeight {
    pub key: String,
    #[serde(default)]
    pub value: u32,
}

/// Heartbeat sent by idle agents. Never reaches a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    #[serde(flatten)]
    pub header: EventHeader,
}

/// Payload of the event types that are accepted but not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ignored {
    #[serde(flatten)]
    pub header: EventHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DistributedTestConfiguration {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_run_synchronization")]
    pub run_synchronization: String,
}

/// Settings shared by single and tile stress-test configurations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StressTestSettings {
    #[serde(default)]
    pub connection: String,
    #[serde(default)]
    pub connection_proxy: String,
    /// Confidential; sealed before storage.
    #[serde(default)]
    pub connection_string: String,
    #[serde(default)]
    pub scenarios_and_weights: Vec<ScenarioWeight>,
    #[serde(default)]
    pub scenario_rule_set: String,
    #[serde(default)]
    pub concurrencies: Vec<i64>,
    #[serde(default)]
    pub runs: i64,
    #[serde(default)]
    pub initial_minimum_delay_in_milliseconds: i64,
    #[serde(default)]
    pub initial_maximum_delay_in_milliseconds: i64,
    #[serde(default)]
    pub minimum_delay_in_milliseconds: i64,
    #[serde(default)]
    pub maximum_delay_in_milliseconds: i64,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub action_distribution: bool,
    #[serde(default)]
    pub maximum_number_of_user_actions: i64,
    #[serde(default)]
    pub monitor_before_in_minutes: i64,
    #[serde(default)]
    pub monitor_after_in_minutes: i64,
    #[serde(default)]
    pub use_parallel_execution_of_requests: bool,
    #[serde(default)]
    pub maximum_persistent_connections: i64,
    #[serde(default)]
    pub persistent_connections_per_hostname: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StressTestConfiguration {
    #[serde(flatten)]
    pub header: EventHeader,
    pub stress_test: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub settings: StressTestSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TileStressTestConfiguration {
    #[serde(flatten)]
    pub header: EventHeader,
    pub tile_stress_test: String,
    #[serde(default = "default_run_synchronization")]
    pub run_synchronization: String,
    #[serde(flatten)]
    pub settings: StressTestSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(rename = "TestEventType")]
    pub kind: TestEventKind,
    #[serde(rename = "AtInMillisecondsSinceEpochUtc", default)]
    pub at_ms: i64,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl TestEvent {
    /// First value for `key`, compared case-insensitively.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.key.eq_ignore_ascii_case(key))
            .map(|p| p.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestResults {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default)]
    pub virtual_user: Option<String>,
    #[serde(default)]
    pub user_action: String,
    #[serde(default)]
    pub request_index: String,
    #[serde(default)]
    pub same_as_request_index: String,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub in_parallel_with_previous: bool,
    /// UTC ticks; stored as received.
    #[serde(default)]
    pub sent_at_in_ticks_since_epoch_utc: i64,
    #[serde(default)]
    pub time_to_last_byte_in_ticks: i64,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub delay_in_milliseconds: i64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub rerun: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorConfiguration {
    #[serde(flatten)]
    pub header: EventHeader,
    pub monitor: String,
    #[serde(default)]
    pub monitor_source: String,
    /// Confidential; sealed before storage.
    #[serde(default)]
    pub connection_string: String,
    #[serde(default)]
    pub hardware_configuration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(rename = "MonitorEventType")]
    pub kind: MonitorEventKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorMetrics {
    #[serde(flatten)]
    pub header: EventHeader,
    pub monitor: String,
    #[serde(rename = "AtInMillisecondsSinceEpochUtc", default)]
    pub at_ms: i64,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
}

fn default_run_synchronization() -> String {
    "None".to_string()
}

/// One decoded telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "PublishItemType")]
pub enum Event {
    Poll(Poll),
    DistributedTestConfiguration(DistributedTestConfiguration),
    StressTestConfiguration(StressTestConfiguration),
    TileStressTestConfiguration(TileStressTestConfiguration),
    TestEvent(TestEvent),
    RequestResults(RequestResults),
    MonitorConfiguration(MonitorConfiguration),
    MonitorEvent(MonitorEvent),
    MonitorMetrics(MonitorMetrics),
    FastConcurrencyResults(Ignored),
    FastRunResults(Ignored),
    ClientMonitorMetrics(Ignored),
    ApplicationLogEntry(Ignored),
}

impl Event {
    /// Every accepted value of the type tag.
    pub const TYPE_NAMES: &'static [&'static str] = &[
        "Poll",
        "DistributedTestConfiguration",
        "StressTestConfiguration",
        "TileStressTestConfiguration",
        "TestEvent",
        "RequestResults",
        "MonitorConfiguration",
        "MonitorEvent",
        "MonitorMetrics",
        "FastConcurrencyResults",
        "FastRunResults",
        "ClientMonitorMetrics",
        "ApplicationLogEntry",
    ];

    pub fn header(&self) -> &EventHeader {
        match self {
            Self::Poll(e) => &e.header,
            Self::DistributedTestConfiguration(e) => &e.header,
            Self::StressTestConfiguration(e) => &e.header,
            Self::TileStressTestConfiguration(e) => &e.header,
            Self::TestEvent(e) => &e.header,
            Self::RequestResults(e) => &e.header,
            Self::MonitorConfiguration(e) => &e.header,
            Self::MonitorEvent(e) => &e.header,
            Self::MonitorMetrics(e) => &e.header,
            Self::FastConcurrencyResults(e)
            | Self::FastRunResults(e)
            | Self::ClientMonitorMetrics(e)
            | Self::ApplicationLogEntry(e) => &e.header,
        }
    }

    /// The value of the type tag for this event.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Poll(_) => "Poll",
            Self::DistributedTestConfiguration(_) => "DistributedTestConfiguration",
            Self::StressTestConfiguration(_) => "StressTestConfiguration",
            Self::TileStressTestConfiguration(_) => "TileStressTestConfiguration",
            Self::TestEvent(_) => "TestEvent",
            Self::RequestResults(_) => "RequestResults",
            Self::MonitorConfiguration(_) => "MonitorConfiguration",
            Self::MonitorEvent(_) => "MonitorEvent",
            Self::MonitorMetrics(_) => "MonitorMetrics",
            Self::FastConcurrencyResults(_) => "FastConcurrencyResults",
            Self::FastRunResults(_) => "FastRunResults",
            Self::ClientMonitorMetrics(_) => "ClientMonitorMetrics",
            Self::ApplicationLogEntry(_) => "ApplicationLogEntry",
        }
    }

    /// Heartbeats and events without a result set never reach a session.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Poll(_)) || self.header().result_set().is_none()
    }

    /// Session key for this event, `None` for heartbeats.
    pub fn session_key(&self) -> Option<SessionKey> {
        if matches!(self, Self::Poll(_)) {
            return None;
        }
        let header = self.header();
        header
            .result_set()
            .map(|rs| SessionKey::derive(&rs, &header.agent_host, header.agent_port))
    }

    /// Compact JSON rendering for logs. Falls back to the type name.
    pub fn to_log_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.type_name().to_string())
    }
}

macro_rules! ordinal_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal, [$($variant:ident),+ $(,)?]) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// All kinds in wire ordinal order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }

            /// Look a kind up by wire ordinal.
            pub fn from_ordinal(ordinal: u64) -> Option<Self> {
                usize::try_from(ordinal).ok().and_then(|i| Self::ALL.get(i).copied())
            }

            /// Look a kind up by name, ignoring ASCII case.
            pub fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|k| k.as_str().eq_ignore_ascii_case(name))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                match KindRepr::deserialize(deserializer)? {
                    KindRepr::Ordinal(n) => Self::from_ordinal(n).ok_or_else(|| {
                        de::Error::custom(format!("unknown {} ordinal {}", $label, n))
                    }),
                    KindRepr::Name(name) => Self::from_name(&name).ok_or_else(|| {
                        de::Error::custom(format!("unknown {} '{}'", $label, name))
                    }),
                }
            }
        }
    };
}

/// Kinds may arrive as ordinals or as names.
#[derive(Deserialize)]
#[serde(untagged)]
enum KindRepr {
    Ordinal(u64),
    Name(String),
}

ordinal_enum!(
    /// Lifecycle step reported by a test event.
    TestEventKind,
    "test event type",
    [
        TestInitialized,
        TestStarted,
        ConcurrencyStarted,
        RunInitializedFirstTime,
        RunStarted,
        RunDoneOnce,
        RerunDone,
        RunStopped,
        ConcurrencyStopped,
        TestStopped,
        TestMessage,
        TestValue,
        MasterListeningError,
    ]
);

ordinal_enum!(
    /// Lifecycle step reported by a monitor.
    MonitorEventKind,
    "monitor event type",
    [
        MonitorInitialized,
        MonitorStarted,
        MonitorBeforeTestStarted,
        MonitorBeforeTestDone,
        MonitorAfterTestStarted,
        MonitorAfterTestDone,
        MonitorStopped,
    ]
);

#[cfg(test)]
mod tests {
    use super::*;

    fn header_json() -> &'static str {
        r#""ResultSetId":"rs-1","AgentHost":"agent-a","AgentPort":1337,"PublishItemTimestampInMillisecondsSinceEpochUtc":1500000000000"#
    }

    #[test]
    fn decodes_test_event_by_name() {
        let line = format!(
            r#"{{"PublishItemType":"TestEvent",{},"TestEventType":"ConcurrencyStarted","AtInMillisecondsSinceEpochUtc":1500000000500,"Parameters":[{{"Key":"Concurrency","Value":"5"}}]}}"#,
            header_json()
        );
        let event = decode_line(&line).unwrap();
        let Event::TestEvent(test_event) = &event else {
            panic!("expected TestEvent, got {event:?}");
        };
        assert_eq!(test_event.kind, TestEventKind::ConcurrencyStarted);
        assert_eq!(test_event.at_ms, 1_500_000_000_500);
        assert_eq!(test_event.parameter("concurrency"), Some("5"));
        assert_eq!(event.header().agent_port, 1337);
    }

    #[test]
    fn decodes_event_kinds_by_ordinal() {
        let line = format!(
            r#"{{"PublishItemType":"TestEvent",{},"TestEventType":4}}"#,
            header_json()
        );
        let Event::TestEvent(test_event) = decode_line(&line).unwrap() else {
            panic!("expected TestEvent");
        };
        assert_eq!(test_event.kind, TestEventKind::RunStarted);

        let line = format!(
            r#"{{"PublishItemType":"MonitorEvent",{},"MonitorEventType":5}}"#,
            header_json()
        );
        let Event::MonitorEvent(monitor_event) = decode_line(&line).unwrap() else {
            panic!("expected MonitorEvent");
        };
        assert_eq!(monitor_event.kind, MonitorEventKind::MonitorAfterTestDone);
    }

    #[test]
    fn accepts_legacy_agent_field_names() {
        let line = r#"{"PublishItemType":"Poll","vApusHost":"legacy","vApusPort":5000,"vApusIsMaster":true}"#;
        let event = decode_line(line).unwrap();
        assert_eq!(event.header().agent_host, "legacy");
        assert_eq!(event.header().agent_port, 5000);
        assert!(event.header().agent_is_master);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let line = r#"{"PublishItemType":"Telepathy","ResultSetId":"x"}"#;
        assert!(matches!(decode_line(line), Err(DecodeError::UnknownType(t)) if t == "Telepathy"));
    }

    #[test]
    fn unknown_event_kind_is_an_invalid_payload() {
        let line = format!(
            r#"{{"PublishItemType":"TestEvent",{},"TestEventType":99}}"#,
            header_json()
        );
        assert!(matches!(
            decode_line(&line),
            Err(DecodeError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn malformed_and_empty_lines_are_rejected() {
        assert!(matches!(decode_line("   "), Err(DecodeError::Empty)));
        assert!(matches!(decode_line("{not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode_line(r#"{"Foo":1}"#), Err(DecodeError::MissingTag)));
    }

    #[test]
    fn session_key_concatenates_result_set_host_and_port() {
        let line = format!(
            r#"{{"PublishItemType":"RequestResults",{},"VirtualUser":"vu 1"}}"#,
            header_json()
        );
        let event = decode_line(&line).unwrap();
        assert_eq!(event.session_key().unwrap().as_str(), "rs-1agent-a1337");
        assert!(!event.is_heartbeat());
    }

    #[test]
    fn heartbeats_have_no_session_key() {
        let poll = decode_line(&format!(r#"{{"PublishItemType":"Poll",{}}}"#, header_json())).unwrap();
        assert!(poll.is_heartbeat());
        assert!(poll.session_key().is_none());

        let anonymous =
            decode_line(r#"{"PublishItemType":"MonitorEvent","ResultSetId":"","MonitorEventType":0}"#)
                .unwrap();
        assert!(anonymous.is_heartbeat());
        assert!(anonymous.session_key().is_none());
    }

    #[test]
    fn no_op_variants_decode() {
        for kind in [
            "FastConcurrencyResults",
            "FastRunResults",
            "ClientMonitorMetrics",
            "ApplicationLogEntry",
        ] {
            let line = format!(
                r#"{{"PublishItemType":"{kind}",{},"Whatever":[1,2,3]}}"#,
                header_json()
            );
            let event = decode_line(&line).unwrap();
            assert_eq!(event.type_name(), kind);
        }
    }

    #[test]
    fn stress_test_configuration_decodes_settings() {
        let line = format!(
            r#"{{"PublishItemType":"StressTestConfiguration",{},"StressTest":"Checkout","Description":"nightly","Tags":["a","b"],"Concurrencies":[5,10],"Runs":2,"ConnectionString":"secret","ScenariosAndWeights":[{{"Key":"browse","Value":3}}]}}"#,
            header_json()
        );
        let Event::StressTestConfiguration(config) = decode_line(&line).unwrap() else {
            panic!("expected StressTestConfiguration");
        };
        assert_eq!(config.stress_test, "Checkout");
        assert_eq!(config.tags, vec!["a", "b"]);
        assert_eq!(config.settings.concurrencies, vec![5, 10]);
        assert_eq!(config.settings.connection_string, "secret");
        assert_eq!(config.settings.scenarios_and_weights[0].value, 3);
    }

    #[test]
    fn monitor_metrics_keep_null_values() {
        let line = format!(
            r#"{{"PublishItemType":"MonitorMetrics",{},"Monitor":"cpu","Headers":["user","idle"],"Values":[12.5,null]}}"#,
            header_json()
        );
        let Event::MonitorMetrics(metrics) = decode_line(&line).unwrap() else {
            panic!("expected MonitorMetrics");
        };
        assert_eq!(metrics.values.len(), 2);
        assert!(metrics.values[1].is_null());
    }

    #[test]
    fn log_string_contains_type_tag() {
        let event = decode_line(&format!(r#"{{"PublishItemType":"Poll",{}}}"#, header_json())).unwrap();
        assert!(event.to_log_string().contains(r#""PublishItemType":"Poll""#));
    }
}
