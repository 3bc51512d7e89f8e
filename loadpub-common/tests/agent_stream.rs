//! Decoding a recorded agent stream end to end.

use loadpub_common::protocol::{DecodeError, Event, TestEventKind, decode_line};
use loadpub_common::testing::init_test_logging;
use loadpub_common::test_log;

const STREAM: &str = r#"{"PublishItemType":"Poll","AgentHost":"agent-a","AgentPort":1337}
{"PublishItemType":"StressTestConfiguration","ResultSetId":"rs-42","AgentHost":"agent-a","AgentPort":1337,"StressTest":"Checkout","ConnectionString":"Server=db;Password=hunter2","Concurrencies":[5,10],"ScenariosAndWeights":[{"Key":"login","Value":2}]}
{"PublishItemType":"TestEvent","ResultSetId":"rs-42","AgentHost":"agent-a","AgentPort":1337,"TestEventType":0}
{"PublishItemType":"TestEvent","ResultSetId":"rs-42","AgentHost":"agent-a","AgentPort":1337,"TestEventType":"TestStarted","AtInMillisecondsSinceEpochUtc":1700000000000}
{"PublishItemType":"RequestResults","ResultSetId":"rs-42","AgentHost":"agent-a","AgentPort":1337,"VirtualUser":"vu-1","Request":"GET /"}

{"PublishItemType":"ClientMonitorMetrics","ResultSetId":"rs-42","AgentHost":"agent-a","AgentPort":1337}
{"PublishItemType":"Telepathy","ResultSetId":"rs-42"}
"#;

#[test]
fn test_recorded_stream_decodes_into_one_session() {
    init_test_logging();
    test_log!("TEST START: test_recorded_stream_decodes_into_one_session");

    let mut events = Vec::new();
    let mut rejected = Vec::new();
    for line in STREAM.lines() {
        match decode_line(line) {
            Ok(event) => events.push(event),
            Err(DecodeError::Empty) => {}
            Err(e) => rejected.push(e),
        }
    }

    assert_eq!(
        events.iter().map(Event::type_name).collect::<Vec<_>>(),
        vec![
            "Poll",
            "StressTestConfiguration",
            "TestEvent",
            "TestEvent",
            "RequestResults",
            "ClientMonitorMetrics",
        ]
    );
    assert!(matches!(rejected.as_slice(), [DecodeError::UnknownType(kind)] if kind == "Telepathy"));

    assert!(events[0].is_heartbeat());
    let keys: Vec<_> = events[1..].iter().filter_map(Event::session_key).collect();
    assert_eq!(keys.len(), 5);
    assert!(keys.iter().all(|key| key == &keys[0]));

    let Event::TestEvent(initialized) = &events[2] else {
        panic!("expected a test event");
    };
    assert_eq!(initialized.kind, TestEventKind::TestInitialized);

    let logged = events[1].to_log_string();
    assert!(logged.contains("Checkout"));

    test_log!("TEST PASS: test_recorded_stream_decodes_into_one_session");
}
