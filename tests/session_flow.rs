use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use flate2::read::GzDecoder;
use protobuf::CodedInputStream;

use kindling::collector::{CollectorData, LiveEvent};
use kindling::config::WindowPolicy;
use kindling::sink::SinkCall;
use kindling::thread_state::{ExecState, ThreadHandle, ThreadLister, ThreadSnapshot};
use kindling::{Config, EventCollector, MemorySink, ReplaySource, SessionBuilder};

struct OneThread;

impl ThreadLister for OneThread {
    fn list(&mut self) -> Result<Vec<ThreadSnapshot>> {
        Ok(vec![ThreadSnapshot {
            handle: ThreadHandle(1),
            name: "main".into(),
            state: ExecState::Running,
        }])
    }
}

fn recording(signature: &str) -> String {
    format!(
        r#"{{
            "frames": {{
                "1": {{ "type_name": "app/Server", "name": "serve", "signature": "{signature}" }},
                "2": {{ "name": "write", "kernel": true }}
            }},
            "samples": [
                {{ "kind": "itimer", "thread_label": "main", "frames": [2, 1], "value": 5 }},
                {{ "kind": "itimer", "thread_label": "[tid=42]", "frames": [1], "value": 5 }},
                {{ "kind": "alloc", "thread_label": "main", "frames": [1], "value": 1024 }}
            ]
        }}"#
    )
}

fn fast_config() -> Config {
    Config {
        tick_ms: 10,
        windows: WindowPolicy {
            warmup_windows: 2,
            warmup_window_ms: 50,
            steady_window_ms: 100,
        },
        timeline_interval_ms: 100,
        thread_poll_ms: 20,
        thread_priming_rounds: 2,
        profile_memory: true,
        ..Config::default()
    }
}

/// Decompress and strip the length prefix.
fn unframe(blob: &[u8]) -> Vec<u8> {
    let mut raw = Vec::new();
    GzDecoder::new(blob).read_to_end(&mut raw).unwrap();
    let mut is = CodedInputStream::from_bytes(&raw);
    let len = is.read_raw_varint64().unwrap();
    let body = is.read_raw_bytes(len as u32).unwrap();
    assert!(is.eof().unwrap());
    body
}

#[test]
fn test_session_uploads_windows_and_final_flush() {
    let sink = Arc::new(MemorySink::new());
    let events = Arc::new(EventCollector::new(
        "host",
        vec![CollectorData::new("host:restart", "Restart", "Host restarts")],
    ));
    let source = ReplaySource::from_json(&recording("()V")).unwrap();
    let mut session = SessionBuilder::new(fast_config(), Box::new(source), sink.clone())
        .thread_lister(Box::new(OneThread))
        .collector(events.clone())
        .build();

    assert!(session.start().unwrap().is_empty());
    assert!(session.is_running());
    events
        .report(LiveEvent {
            data_id: "host:restart".into(),
            time_ms: 1,
            duration_ms: 0,
            metadata: BTreeMap::new(),
        })
        .unwrap();

    thread::sleep(Duration::from_millis(400));
    assert!(session.is_running());
    let before_stop = sink.snapshots().len();
    assert!(before_stop >= 1, "no window flushed while running");

    session.stop().unwrap();
    assert!(!session.is_running());
    assert!(session.current_duration() >= Duration::from_millis(400));

    // stop() always flushes once more and sends the remaining timeline.
    let snapshots = sink.snapshots();
    assert_eq!(snapshots.len(), before_stop + 1);
    for snapshot in &snapshots {
        assert!(!unframe(snapshot).is_empty());
    }
    assert!(!sink.timelines().is_empty());

    let calls = sink.calls();
    let SinkCall::CreateSession(metadata) = &calls[0] else {
        panic!("first call should be the handshake");
    };
    assert_eq!(metadata.timeline.len(), 1);
    assert_eq!(metadata.timeline[0].id, "host:restart");
    assert!(calls[1..]
        .iter()
        .all(|call| !matches!(call, SinkCall::CreateSession(_))));

    // Nothing more arrives once stopped.
    let total = sink.calls().len();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sink.calls().len(), total);
}

#[test]
fn test_malformed_signature_halts_session() {
    let sink = Arc::new(MemorySink::new());
    let source = ReplaySource::from_json(&recording("(Q)V")).unwrap();
    let mut session = SessionBuilder::new(fast_config(), Box::new(source), sink.clone())
        .thread_lister(Box::new(OneThread))
        .build();
    session.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!session.is_running(), "session should halt on its own");
    assert!(sink.snapshots().is_empty());

    // Stopping a halted session is still allowed and sends nothing.
    let total = sink.calls().len();
    session.stop().unwrap();
    assert_eq!(sink.calls().len(), total);
}
