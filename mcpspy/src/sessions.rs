// mcpspy/src/sessions.rs
//
// Per-session accounting on the consumer side. The kernel already tags each
// payload with its session and version; this registry just keeps counters so
// a session can be summarized when its TLS_FREE arrives.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::events::TlsDirection;

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub http_version: u8,
    pub sent_msgs: u64,
    pub recv_msgs: u64,
    pub bytes: u64,
    pub first_seen: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionStats>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_payload(&self, ssl_ctx: u64, direction: TlsDirection, version: u8, size: u32) {
        let mut stats = self.sessions.entry(ssl_ctx).or_insert_with(|| SessionStats {
            http_version: version,
            sent_msgs: 0,
            recv_msgs: 0,
            bytes: 0,
            first_seen: Utc::now(),
        });
        stats.http_version = version;
        stats.bytes += size as u64;
        match direction {
            TlsDirection::Send => stats.sent_msgs += 1,
            TlsDirection::Recv => stats.recv_msgs += 1,
        }
    }

    /// Close out a session, returning its totals for the summary log line.
    pub fn finish(&self, ssl_ctx: u64) -> Option<SessionStats> {
        self.sessions.remove(&ssl_ctx).map(|(_, stats)| stats)
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_closes_sessions() {
        let registry = SessionRegistry::new();
        registry.record_payload(1, TlsDirection::Send, 1, 100);
        registry.record_payload(1, TlsDirection::Recv, 1, 250);
        registry.record_payload(2, TlsDirection::Send, 2, 9);
        assert_eq!(registry.active(), 2);

        let stats = registry.finish(1).expect("session tracked");
        assert_eq!(stats.sent_msgs, 1);
        assert_eq!(stats.recv_msgs, 1);
        assert_eq!(stats.bytes, 350);
        assert_eq!(stats.http_version, 1);
        assert_eq!(registry.active(), 1);
        assert!(registry.finish(1).is_none());
    }
}
