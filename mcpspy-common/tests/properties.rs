// Property suites for the reassembly engine and the TLS payload decision.
//
// The engine is checked against a straight-line oracle that applies the
// append/count/complete rules to a single stream, so any divergence in the
// table's bookkeeping (LRU, removal, operation pinning) shows up as a
// counterexample.

use proptest::prelude::*;

use mcpspy_common::http::{self, PayloadVerdict, HTTP_MESSAGE_REQUEST, HTTP_MESSAGE_RESPONSE};
use mcpspy_common::json::{self, BracketCounts};
use mcpspy_common::table::{DropReason, FragmentOutcome, StreamTable};
use mcpspy_common::{
    StreamKey, EVENT_READ, HTTP_VERSION_1, HTTP_VERSION_2, HTTP_VERSION_UNKNOWN, MAX_AGG, MAX_BUF,
};

const KEY: StreamKey = StreamKey { pid: 42, file: 7 };

/// Bytes with braces and whitespace heavily over-represented so streams
/// actually open, close, and go imbalanced.
fn fragment_byte() -> impl Strategy<Value = u8> {
    prop_oneof![
        3 => Just(b'{'),
        3 => Just(b'}'),
        1 => Just(b' '),
        1 => Just(b'\n'),
        4 => proptest::num::u8::ANY,
    ]
}

fn fragment() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(fragment_byte(), 0..200)
}

fn fragment_sequence() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(fragment(), 1..24)
}

/// Single-stream oracle: what the state machine must do, written as plainly
/// as possible.
#[derive(Default)]
struct Oracle {
    stream: Option<(Vec<u8>, BracketCounts)>,
}

enum OracleStep {
    Ignored,
    Buffered,
    Completed(Vec<u8>),
    Dropped(DropReason),
}

impl Oracle {
    fn step(&mut self, bytes: &[u8]) -> OracleStep {
        let (mut data, mut counts) = match self.stream.take() {
            Some(open) => open,
            None => {
                if !json::looks_like_json_object(bytes) {
                    return OracleStep::Ignored;
                }
                (Vec::new(), BracketCounts::default())
            }
        };
        if bytes.is_empty() || bytes.len() > MAX_AGG || data.len() + bytes.len() > MAX_AGG {
            return OracleStep::Dropped(DropReason::Overflow);
        }
        data.extend_from_slice(bytes);
        if !json::scan_brackets(bytes, &mut counts) {
            return OracleStep::Dropped(DropReason::Imbalance);
        }
        if counts.is_complete() {
            return OracleStep::Completed(data);
        }
        self.stream = Some((data, counts));
        OracleStep::Buffered
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 512,
        ..ProptestConfig::default()
    })]

    /// P1 + P2: open >= close and accumulated <= MAX_AGG at every observable
    /// state; violations only ever resolve by dropping the stream.
    #[test]
    fn counts_monotonic_and_size_bounded(fragments in fragment_sequence()) {
        let mut table = StreamTable::new();
        for bytes in &fragments {
            table.on_fragment(KEY, EVENT_READ, bytes, 1);
            if let Some(state) = table.state(&KEY) {
                prop_assert!(state.open_brackets >= state.close_brackets);
                prop_assert!(state.accumulated_size as usize <= MAX_AGG);
            }
        }
    }

    /// P3 + P4: a completion removes the stream, carries exactly the
    /// accumulated bytes, and the engine agrees with the oracle step by step.
    #[test]
    fn engine_matches_oracle(fragments in fragment_sequence()) {
        let mut table = StreamTable::new();
        let mut oracle = Oracle::default();
        for bytes in &fragments {
            let outcome = table.on_fragment(KEY, EVENT_READ, bytes, 1);
            match (oracle.step(bytes), outcome) {
                (OracleStep::Ignored, FragmentOutcome::Ignored) => {}
                (OracleStep::Buffered, FragmentOutcome::Buffered) => {}
                (OracleStep::Dropped(expected), FragmentOutcome::Dropped(got)) => {
                    prop_assert_eq!(expected, got);
                    prop_assert!(!table.contains(&KEY));
                }
                (OracleStep::Completed(expected), FragmentOutcome::Completed(message)) => {
                    prop_assert_eq!(&expected, &message.data);
                    prop_assert_eq!(message.operation, EVENT_READ);
                    prop_assert!(!table.contains(&KEY));
                    let mut counts = BracketCounts::default();
                    prop_assert!(json::scan_brackets(&message.data, &mut counts));
                    prop_assert!(counts.is_complete());
                }
                (_, got) => prop_assert!(false, "engine diverged from oracle: {:?}", got),
            }
        }
    }

    /// P5: the classifier is a pure function.
    #[test]
    fn classifier_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let first = json::looks_like_json_object(&bytes);
        prop_assert_eq!(json::looks_like_json_object(&bytes), first);
        prop_assert_eq!(json::looks_like_json_object(&bytes), first);
    }

    /// P6: http_version moves away from UNKNOWN at most once, and never back.
    #[test]
    fn session_version_is_monotonic(
        payloads in proptest::collection::vec(
            (any::<bool>(), proptest::collection::vec(any::<u8>(), 0..48)),
            1..32,
        )
    ) {
        let mut version = HTTP_VERSION_UNKNOWN;
        let mut transitions = 0u32;
        for (is_send, payload) in &payloads {
            if let PayloadVerdict::Emit { version: v } =
                http::payload_decision(version, *is_send, payload)
            {
                prop_assert!(v == HTTP_VERSION_1 || v == HTTP_VERSION_2);
                if version == HTTP_VERSION_UNKNOWN {
                    transitions += 1;
                    version = v;
                } else {
                    prop_assert_eq!(v, version);
                }
            }
        }
        prop_assert!(transitions <= 1);
    }

    /// P7: while a session is UNKNOWN, the write path only ever fixes it off
    /// request-shaped bytes and the read path off response-shaped bytes.
    #[test]
    fn polarity_filter_holds(
        is_send in any::<bool>(),
        payload in proptest::collection::vec(any::<u8>(), 0..48),
    ) {
        if let PayloadVerdict::Emit { version } =
            http::payload_decision(HTTP_VERSION_UNKNOWN, is_send, &payload)
        {
            let class = http::classify(&payload);
            prop_assert_eq!(version, class.version);
            match class.message {
                HTTP_MESSAGE_REQUEST => prop_assert!(is_send),
                HTTP_MESSAGE_RESPONSE => prop_assert!(!is_send),
                _ => prop_assert_eq!(class.version, HTTP_VERSION_2),
            }
        }
    }

    /// P8: event payloads are the min(size, MAX_BUF) prefix of the source.
    #[test]
    fn truncation_is_transparent(filler in 6usize..40_000) {
        let mut message = vec![b'{'];
        message.extend(std::iter::repeat(b'a').take(filler));
        message.push(b'}');
        let mut table = StreamTable::new();
        match table.on_fragment(KEY, EVENT_READ, &message, 1) {
            FragmentOutcome::Completed(done) => {
                let payload = done.event_payload();
                prop_assert_eq!(payload.len(), message.len().min(MAX_BUF));
                prop_assert_eq!(payload, &message[..payload.len()]);
            }
            other => prop_assert!(false, "expected completion, got {:?}", other),
        }
    }
}
