// End-to-end flows through the reassembly engine and the TLS session
// tracker's decision path.

use std::collections::HashMap;

use mcpspy_common::http::{self, PayloadVerdict};
use mcpspy_common::table::{DropReason, FragmentOutcome, StreamTable};
use mcpspy_common::{
    StreamKey, TlsSession, EVENT_READ, EVENT_WRITE, HTTP_VERSION_1, HTTP_VERSION_UNKNOWN,
};

fn key(pid: u32, file: u64) -> StreamKey {
    StreamKey { pid, file }
}

#[test]
fn single_fragment_complete_json() {
    let mut table = StreamTable::new();
    let fragment = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}";
    assert_eq!(fragment.len(), 40);

    match table.on_fragment(key(100, 0xdead), EVENT_READ, fragment, 1) {
        FragmentOutcome::Completed(message) => {
            assert_eq!(message.operation, EVENT_READ);
            assert_eq!(message.data.len(), 40);
            assert_eq!(message.data, fragment);
            assert_eq!(message.event_payload(), fragment);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert!(table.is_empty());
}

#[test]
fn two_fragment_reassembly() {
    let mut table = StreamTable::new();
    let k = key(100, 0xbeef);

    assert!(matches!(
        table.on_fragment(k, EVENT_WRITE, b"{\"a\":{\"b\":1", 1),
        FragmentOutcome::Buffered
    ));
    let state = table.state(&k).expect("stream installed");
    assert_eq!(state.open_brackets, 2);
    assert_eq!(state.close_brackets, 0);
    assert!(!state.is_complete());

    match table.on_fragment(k, EVENT_WRITE, b"}}", 2) {
        FragmentOutcome::Completed(message) => {
            assert_eq!(message.operation, EVENT_WRITE);
            assert_eq!(message.data.len(), 13);
            assert_eq!(message.data, b"{\"a\":{\"b\":1}}");
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert!(!table.contains(&k));
}

#[test]
fn oversized_stream_is_dropped() {
    let mut table = StreamTable::new();
    let k = key(200, 1);

    // 65,530 accumulated bytes with counts (5, 0).
    let mut first = vec![b'{'; 5];
    first.extend(std::iter::repeat(b'a').take(65_525));
    assert!(matches!(
        table.on_fragment(k, EVENT_READ, &first, 1),
        FragmentOutcome::Buffered
    ));

    let outcome = table.on_fragment(k, EVENT_READ, &[b'b'; 100], 2);
    assert!(matches!(
        outcome,
        FragmentOutcome::Dropped(DropReason::Overflow)
    ));
    assert!(!table.contains(&k));
}

#[test]
fn non_json_fragment_is_ignored() {
    let mut table = StreamTable::new();
    let outcome = table.on_fragment(
        key(300, 2),
        EVENT_READ,
        b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n",
        1,
    );
    assert!(matches!(outcome, FragmentOutcome::Ignored));
    assert!(table.is_empty());
}

// ── TLS session tracker model ─────────────────────────────────────────────────
// Mirrors the probe-side flow: sessions keyed by ssl_ctx, decided payload by
// payload, version written back on the first fix.

struct Tracker {
    sessions: HashMap<u64, TlsSession>,
}

enum Emitted {
    Send(u8),
    Recv(u8),
    Nothing,
}

impl Tracker {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    fn on_new(&mut self, ssl: u64) {
        self.sessions.insert(ssl, TlsSession::new());
    }

    fn on_payload(&mut self, ssl: u64, is_send: bool, payload: &[u8]) -> Emitted {
        let session = self.sessions.entry(ssl).or_default();
        match http::payload_decision(session.http_version, is_send, payload) {
            PayloadVerdict::Emit { version } => {
                session.http_version = version;
                if is_send {
                    Emitted::Send(version)
                } else {
                    Emitted::Recv(version)
                }
            }
            PayloadVerdict::Unidentified | PayloadVerdict::DirectionMismatch => Emitted::Nothing,
        }
    }

    fn on_free(&mut self, ssl: u64) {
        self.sessions.remove(&ssl);
    }
}

#[test]
fn tls_request_fixes_session_version() {
    let mut tracker = Tracker::new();
    tracker.on_new(0x7f00);

    let payload =
        b"POST /rpc HTTP/1.1\r\nContent-Type: application/json\r\n\r\n{\"jsonrpc\":\"2.0\"}";
    match tracker.on_payload(0x7f00, true, payload) {
        Emitted::Send(version) => assert_eq!(version, HTTP_VERSION_1),
        _ => panic!("expected a send emission"),
    }
    assert_eq!(tracker.sessions[&0x7f00].http_version, HTTP_VERSION_1);
}

#[test]
fn tls_version_locked_after_first_classification() {
    let mut tracker = Tracker::new();
    tracker.on_new(0x7f01);

    // A response on the write path is the wrong polarity: nothing emitted,
    // session stays open for a later fix.
    assert!(matches!(
        tracker.on_payload(0x7f01, true, b"HTTP/1.1 200 OK\r\n\r\n"),
        Emitted::Nothing
    ));
    assert_eq!(
        tracker.sessions[&0x7f01].http_version,
        HTTP_VERSION_UNKNOWN
    );

    tracker.on_payload(0x7f01, true, b"POST /v1/messages HTTP/1.1\r\n\r\n");
    assert_eq!(tracker.sessions[&0x7f01].http_version, HTTP_VERSION_1);

    // Version fixed: the read side reuses it without re-inference, even for
    // bytes that classify as nothing at all.
    match tracker.on_payload(0x7f01, false, b"chunked body continuation") {
        Emitted::Recv(version) => assert_eq!(version, HTTP_VERSION_1),
        _ => panic!("expected a recv emission"),
    }

    tracker.on_free(0x7f01);
    assert!(!tracker.sessions.contains_key(&0x7f01));
}
