// mcpspy/src/events.rs
//
// Userspace view of the records coming off the ring buffer. The raw layouts
// live in mcpspy-common and mirror what the BPF programs fill in; this module
// turns them into owned values the consumer can hold past the ring item's
// lifetime.

use std::mem;

use thiserror::Error;

use mcpspy_common::{
    DataEvent, LibraryEvent, TlsFreeEvent, TlsPayloadEvent, EVENT_LIBRARY, EVENT_READ,
    EVENT_TLS_FREE, EVENT_TLS_PAYLOAD_RECV, EVENT_TLS_PAYLOAD_SEND, EVENT_WRITE, MAX_BUF,
};

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("empty record")]
    Empty,
    #[error("unknown event type {0}")]
    UnknownType(u8),
    #[error("record truncated: {got} bytes for event type {event_type}, need {need}")]
    Truncated {
        event_type: u8,
        got: usize,
        need: usize,
    },
}

/// Direction of a reassembled vfs stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Direction of a TLS payload, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsDirection {
    Send,
    Recv,
}

/// pid + comm, present on every record.
#[derive(Debug, Clone)]
pub struct Meta {
    pub pid: u32,
    pub comm: String,
}

#[derive(Debug)]
pub enum McpEvent {
    /// One reassembled JSON-RPC message from the vfs layer.
    Data {
        meta: Meta,
        direction: Direction,
        /// Full reassembled length; `payload` holds at most MAX_BUF of it.
        size: u32,
        payload: Vec<u8>,
    },
    /// A shared object mapped by some process (library enumeration path).
    Library {
        meta: Meta,
        inode: u64,
        mnt_ns_id: u32,
        path: String,
    },
    /// One TLS application payload.
    TlsPayload {
        meta: Meta,
        direction: TlsDirection,
        ssl_ctx: u64,
        http_version: u8,
        size: u32,
        payload: Vec<u8>,
    },
    /// End of a TLS session.
    TlsFree { meta: Meta, ssl_ctx: u64 },
}

impl McpEvent {
    pub fn meta(&self) -> &Meta {
        match self {
            McpEvent::Data { meta, .. }
            | McpEvent::Library { meta, .. }
            | McpEvent::TlsPayload { meta, .. }
            | McpEvent::TlsFree { meta, .. } => meta,
        }
    }
}

/// Parse one ring buffer record. The leading byte picks the variant; each
/// variant is a fixed-size repr(C) struct the kernel filled in full.
pub fn parse_event(bytes: &[u8]) -> Result<McpEvent, EventParseError> {
    let event_type = *bytes.first().ok_or(EventParseError::Empty)?;
    match event_type {
        EVENT_READ | EVENT_WRITE => {
            let raw: DataEvent = read_record(bytes, event_type)?;
            let direction = if event_type == EVENT_READ {
                Direction::Read
            } else {
                Direction::Write
            };
            Ok(McpEvent::Data {
                meta: meta_of(raw.header.pid, &raw.header.comm),
                direction,
                size: raw.size,
                payload: payload_of(&raw.buf, raw.buf_size),
            })
        }
        EVENT_LIBRARY => {
            let raw: LibraryEvent = read_record(bytes, event_type)?;
            Ok(McpEvent::Library {
                meta: meta_of(raw.header.pid, &raw.header.comm),
                inode: raw.inode,
                mnt_ns_id: raw.mnt_ns_id,
                path: nul_terminated(&raw.path),
            })
        }
        EVENT_TLS_PAYLOAD_SEND | EVENT_TLS_PAYLOAD_RECV => {
            let raw: TlsPayloadEvent = read_record(bytes, event_type)?;
            let direction = if event_type == EVENT_TLS_PAYLOAD_SEND {
                TlsDirection::Send
            } else {
                TlsDirection::Recv
            };
            Ok(McpEvent::TlsPayload {
                meta: meta_of(raw.header.pid, &raw.header.comm),
                direction,
                ssl_ctx: raw.ssl_ctx,
                http_version: raw.http_version,
                size: raw.size,
                payload: payload_of(&raw.buf, raw.buf_size),
            })
        }
        EVENT_TLS_FREE => {
            let raw: TlsFreeEvent = read_record(bytes, event_type)?;
            Ok(McpEvent::TlsFree {
                meta: meta_of(raw.header.pid, &raw.header.comm),
                ssl_ctx: raw.ssl_ctx,
            })
        }
        other => Err(EventParseError::UnknownType(other)),
    }
}

fn read_record<T: Copy>(bytes: &[u8], event_type: u8) -> Result<T, EventParseError> {
    let need = mem::size_of::<T>();
    if bytes.len() < need {
        return Err(EventParseError::Truncated {
            event_type,
            got: bytes.len(),
            need,
        });
    }
    // Size-checked above; ring records carry no alignment guarantee.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

fn meta_of(pid: u32, comm: &[u8]) -> Meta {
    Meta {
        pid,
        comm: nul_terminated(comm),
    }
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn payload_of(buf: &[u8; MAX_BUF], buf_size: u32) -> Vec<u8> {
    buf[..(buf_size as usize).min(MAX_BUF)].to_vec()
}
