// mcpspy-common/src/http.rs
//
// HTTP shape detection over the leading bytes of a TLS application payload.
// Drives the per-session version inference: a session starts UNKNOWN, is
// fixed to 1 or 2 by the first classifiable payload of the right polarity,
// and keeps that version until SSL_free.

use crate::{HTTP_VERSION_1, HTTP_VERSION_2, HTTP_VERSION_UNKNOWN};

/// Client connection preface that opens every HTTP/2 connection.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// How many leading payload bytes the classifier inspects.
pub const HTTP_INSPECT_LEN: usize = 128;

/// SETTINGS_MAX_FRAME_SIZE floor: initial frames never exceed this.
const HTTP2_MAX_FRAME_LEN: u32 = 16_384;

/// Highest frame type in the base HTTP/2 registry (CONTINUATION).
const HTTP2_MAX_FRAME_TYPE: u8 = 0x09;

const HTTP1_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
    b"TRACE ",
];

pub const HTTP_MESSAGE_REQUEST: u8 = 1;
pub const HTTP_MESSAGE_RESPONSE: u8 = 2;
pub const HTTP_MESSAGE_UNKNOWN: u8 = 3;

/// Version + polarity read off a payload prefix.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HttpClass {
    pub version: u8,
    pub message: u8,
}

/// Classify the leading bytes of an application payload.
///
/// HTTP/2 is recognized by the connection preface (a client artifact, so
/// REQUEST polarity) or by a plausible frame header (flows both ways, so
/// polarity-neutral). HTTP/1 is recognized by a request-line or status-line
/// and carries strict polarity. Anything else stays UNKNOWN.
pub fn classify(payload: &[u8]) -> HttpClass {
    let prefix = &payload[..payload.len().min(HTTP_INSPECT_LEN)];

    if prefix.starts_with(HTTP2_PREFACE) || is_http2_preface_prefix(prefix) {
        return HttpClass {
            version: HTTP_VERSION_2,
            message: HTTP_MESSAGE_REQUEST,
        };
    }
    if is_http2_frame_header(prefix) {
        return HttpClass {
            version: HTTP_VERSION_2,
            message: HTTP_MESSAGE_UNKNOWN,
        };
    }
    if is_http1_request(prefix) {
        return HttpClass {
            version: HTTP_VERSION_1,
            message: HTTP_MESSAGE_REQUEST,
        };
    }
    if is_http1_response(prefix) {
        return HttpClass {
            version: HTTP_VERSION_1,
            message: HTTP_MESSAGE_RESPONSE,
        };
    }
    HttpClass {
        version: HTTP_VERSION_UNKNOWN,
        message: HTTP_MESSAGE_UNKNOWN,
    }
}

/// A short first write may carry only the start of the preface. Anything
/// shorter than `PRI ` is too weak a signal to fix a session on.
fn is_http2_preface_prefix(prefix: &[u8]) -> bool {
    prefix.len() >= 4 && prefix.len() < HTTP2_PREFACE.len() && HTTP2_PREFACE.starts_with(prefix)
}

/// 9-byte frame header: u24 length, u8 type, u8 flags, u31 stream id with the
/// reserved bit clear. Length is sanity-checked against the initial
/// SETTINGS_MAX_FRAME_SIZE so text protocols don't alias into frames.
fn is_http2_frame_header(prefix: &[u8]) -> bool {
    if prefix.len() < 9 {
        return false;
    }
    let length = u32::from_be_bytes([0, prefix[0], prefix[1], prefix[2]]);
    let frame_type = prefix[3];
    let reserved = prefix[5] & 0x80;
    frame_type <= HTTP2_MAX_FRAME_TYPE && reserved == 0 && length <= HTTP2_MAX_FRAME_LEN
}

/// Method token followed somewhere in the prefix by ` HTTP/1.`.
fn is_http1_request(prefix: &[u8]) -> bool {
    if !HTTP1_METHODS.iter().any(|m| prefix.starts_with(m)) {
        return false;
    }
    contains(prefix, b" HTTP/1.")
}

/// `HTTP/1.x SP digit digit digit`.
fn is_http1_response(prefix: &[u8]) -> bool {
    if prefix.len() < 12 || !prefix.starts_with(b"HTTP/1.") {
        return false;
    }
    let minor = prefix[7];
    if minor != b'0' && minor != b'1' {
        return false;
    }
    prefix[8] == b' ' && prefix[9..12].iter().all(|b| b.is_ascii_digit())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack
            .windows(needle.len())
            .any(|window| window == needle)
}

// ── Payload decision ──────────────────────────────────────────────────────────

/// What the session tracker should do with one payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PayloadVerdict {
    /// Emit with this version; if it differs from the session's current
    /// version the caller fixes the session to it.
    Emit { version: u8 },
    /// Prefix matched nothing; leave the session UNKNOWN, wait for more.
    Unidentified,
    /// Polarity disagrees with the probe direction; leave the session alone.
    DirectionMismatch,
}

/// Decide one payload for a client-side session.
///
/// A session with a fixed version emits unconditionally — polarity filtering
/// only exists to avoid fixing the version off a mislabeled first payload.
/// Until then, the write path accepts only REQUEST-shaped payloads and the
/// read path only RESPONSE-shaped ones; HTTP/2 frame headers are accepted on
/// either side.
pub fn payload_decision(current_version: u8, is_send: bool, prefix: &[u8]) -> PayloadVerdict {
    if current_version != HTTP_VERSION_UNKNOWN {
        return PayloadVerdict::Emit {
            version: current_version,
        };
    }
    let class = classify(prefix);
    if class.version == HTTP_VERSION_UNKNOWN {
        return PayloadVerdict::Unidentified;
    }
    let polarity_ok = match class.message {
        HTTP_MESSAGE_REQUEST => is_send,
        HTTP_MESSAGE_RESPONSE => !is_send,
        _ => class.version == HTTP_VERSION_2,
    };
    if !polarity_ok {
        return PayloadVerdict::DirectionMismatch;
    }
    PayloadVerdict::Emit {
        version: class.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preface_classifies_as_h2_request() {
        let class = classify(HTTP2_PREFACE);
        assert_eq!(class.version, HTTP_VERSION_2);
        assert_eq!(class.message, HTTP_MESSAGE_REQUEST);
        // Partial first write of the preface still counts.
        let class = classify(&HTTP2_PREFACE[..10]);
        assert_eq!(class.version, HTTP_VERSION_2);
    }

    #[test]
    fn settings_frame_classifies_as_h2() {
        // length=12, type=SETTINGS(0x4), flags=0, stream=0
        let frame = [0x00, 0x00, 0x0c, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff];
        let class = classify(&frame);
        assert_eq!(class.version, HTTP_VERSION_2);
        assert_eq!(class.message, HTTP_MESSAGE_UNKNOWN);
    }

    #[test]
    fn request_line_classifies_as_h1_request() {
        let class = classify(b"POST /rpc HTTP/1.1\r\nContent-Type: application/json\r\n\r\n{}");
        assert_eq!(class.version, HTTP_VERSION_1);
        assert_eq!(class.message, HTTP_MESSAGE_REQUEST);
    }

    #[test]
    fn status_line_classifies_as_h1_response() {
        let class = classify(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}");
        assert_eq!(class.version, HTTP_VERSION_1);
        assert_eq!(class.message, HTTP_MESSAGE_RESPONSE);
    }

    #[test]
    fn garbage_stays_unknown() {
        assert_eq!(classify(b"").version, HTTP_VERSION_UNKNOWN);
        assert_eq!(classify(b"hello world").version, HTTP_VERSION_UNKNOWN);
        // Method without a version token is not a request line.
        assert_eq!(classify(b"GET lucky").version, HTTP_VERSION_UNKNOWN);
        // Binary with an implausible frame type.
        let junk = [0xff, 0xff, 0xff, 0x7f, 0x00, 0x80, 0x00, 0x00, 0x00];
        assert_eq!(classify(&junk).version, HTTP_VERSION_UNKNOWN);
    }

    #[test]
    fn first_request_fixes_version_on_send() {
        let verdict = payload_decision(
            HTTP_VERSION_UNKNOWN,
            true,
            b"POST /rpc HTTP/1.1\r\nContent-Type: application/json\r\n\r\n{\"id\":1}",
        );
        assert_eq!(
            verdict,
            PayloadVerdict::Emit {
                version: HTTP_VERSION_1
            }
        );
    }

    #[test]
    fn response_on_send_is_a_mismatch() {
        let verdict = payload_decision(HTTP_VERSION_UNKNOWN, true, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(verdict, PayloadVerdict::DirectionMismatch);
        let verdict = payload_decision(HTTP_VERSION_UNKNOWN, false, b"GET /x HTTP/1.1\r\n\r\n");
        assert_eq!(verdict, PayloadVerdict::DirectionMismatch);
    }

    #[test]
    fn fixed_session_skips_reinference() {
        // Once the session is v1, even request-shaped bytes on the read path
        // are emitted with the fixed version.
        let verdict = payload_decision(HTTP_VERSION_1, false, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(
            verdict,
            PayloadVerdict::Emit {
                version: HTTP_VERSION_1
            }
        );
        let verdict = payload_decision(HTTP_VERSION_2, true, b"anything at all");
        assert_eq!(
            verdict,
            PayloadVerdict::Emit {
                version: HTTP_VERSION_2
            }
        );
    }

    #[test]
    fn unidentified_payload_is_skipped() {
        let verdict = payload_decision(HTTP_VERSION_UNKNOWN, true, b"{\"jsonrpc\":\"2.0\"}");
        assert_eq!(verdict, PayloadVerdict::Unidentified);
    }
}
