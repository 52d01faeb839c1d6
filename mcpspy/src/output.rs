// mcpspy/src/output.rs
//
// JSONL sink. One line per event, stdout by default or an append-only file.
// Payloads go out as lossy UTF-8; `size` vs `buf_size` tells the reader how
// much was truncated on the way through the ring.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, Stdout};

use crate::events::{Direction, McpEvent, TlsDirection};

#[derive(Debug, Serialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub event: &'static str,
    pub transport: &'static str,
    pub pid: u32,
    pub comm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buf_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_ctx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_version: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mnt_ns_id: Option<u32>,
}

impl Record {
    pub fn from_event(event: &McpEvent) -> Self {
        let meta = event.meta();
        let mut record = Record {
            timestamp: Utc::now(),
            event: "",
            transport: "",
            pid: meta.pid,
            comm: meta.comm.clone(),
            size: None,
            buf_size: None,
            data: None,
            ssl_ctx: None,
            http_version: None,
            path: None,
            inode: None,
            mnt_ns_id: None,
        };

        match event {
            McpEvent::Data {
                direction,
                size,
                payload,
                ..
            } => {
                record.event = match direction {
                    Direction::Read => "read",
                    Direction::Write => "write",
                };
                record.transport = "fs";
                record.size = Some(*size);
                record.buf_size = Some(payload.len() as u32);
                record.data = Some(String::from_utf8_lossy(payload).into_owned());
            }
            McpEvent::TlsPayload {
                direction,
                ssl_ctx,
                http_version,
                size,
                payload,
                ..
            } => {
                record.event = match direction {
                    TlsDirection::Send => "tls_send",
                    TlsDirection::Recv => "tls_recv",
                };
                record.transport = "tls";
                record.size = Some(*size);
                record.buf_size = Some(payload.len() as u32);
                record.data = Some(String::from_utf8_lossy(payload).into_owned());
                record.ssl_ctx = Some(*ssl_ctx);
                record.http_version = Some(*http_version);
            }
            McpEvent::TlsFree { ssl_ctx, .. } => {
                record.event = "tls_free";
                record.transport = "tls";
                record.ssl_ctx = Some(*ssl_ctx);
            }
            McpEvent::Library {
                inode,
                mnt_ns_id,
                path,
                ..
            } => {
                record.event = "library";
                record.transport = "fs";
                record.path = Some(path.clone());
                record.inode = Some(*inode);
                record.mnt_ns_id = Some(*mnt_ns_id);
            }
        }
        record
    }

    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

enum Sink {
    Stdout(Stdout),
    File(tokio::fs::File),
}

pub struct Output {
    sink: Sink,
}

impl Output {
    pub async fn create(path: Option<PathBuf>) -> Result<Self> {
        let sink = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .with_context(|| format!("open output file {}", path.display()))?;
                Sink::File(file)
            }
            None => Sink::Stdout(tokio::io::stdout()),
        };
        Ok(Self { sink })
    }

    pub async fn write(&mut self, event: &McpEvent) -> Result<()> {
        let line = Record::from_event(event).to_jsonl() + "\n";
        match &mut self.sink {
            Sink::Stdout(out) => out.write_all(line.as_bytes()).await?,
            Sink::File(file) => file.write_all(line.as_bytes()).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Meta;

    fn meta() -> Meta {
        Meta {
            pid: 4242,
            comm: "mcp-server".to_string(),
        }
    }

    #[test]
    fn data_record_carries_payload_and_sizes() {
        let event = McpEvent::Data {
            meta: meta(),
            direction: Direction::Read,
            size: 1000,
            payload: b"{\"id\":1}".to_vec(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&Record::from_event(&event).to_jsonl()).expect("valid json");
        assert_eq!(value["event"], "read");
        assert_eq!(value["transport"], "fs");
        assert_eq!(value["pid"], 4242);
        assert_eq!(value["size"], 1000);
        assert_eq!(value["buf_size"], 8);
        assert_eq!(value["data"], "{\"id\":1}");
        assert!(value.get("ssl_ctx").is_none());
    }

    #[test]
    fn tls_free_record_is_minimal() {
        let event = McpEvent::TlsFree {
            meta: meta(),
            ssl_ctx: 0xabc,
        };
        let value: serde_json::Value =
            serde_json::from_str(&Record::from_event(&event).to_jsonl()).expect("valid json");
        assert_eq!(value["event"], "tls_free");
        assert_eq!(value["ssl_ctx"], 0xabc);
        assert!(value.get("data").is_none());
        assert!(value.get("size").is_none());
    }

    #[test]
    fn binary_payload_survives_lossily() {
        let event = McpEvent::TlsPayload {
            meta: meta(),
            direction: TlsDirection::Recv,
            ssl_ctx: 1,
            http_version: 2,
            size: 4,
            payload: vec![0x00, 0xff, b'o', b'k'],
        };
        let line = Record::from_event(&event).to_jsonl();
        let value: serde_json::Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(value["event"], "tls_recv");
        assert_eq!(value["http_version"], 2);
    }
}
