// mcpspy-common/src/lib.rs
//
// Shared core between the mcpspy userspace daemon, the preload shim and the
// BPF programs. Everything with a `#[repr(C)]` here crosses the kernel/user
// boundary through BPF maps or the ring buffer and must keep the exact same
// layout on both sides.
//
// The crate is no_std unless the `user` feature (default) is enabled; the BPF
// crate depends on it with default-features = false.

#![cfg_attr(not(any(feature = "user", test)), no_std)]

pub mod http;
pub mod json;

#[cfg(feature = "user")]
pub mod table;

// ── Resource ceilings ─────────────────────────────────────────────────────────

/// Maximum payload bytes carried in a single event record.
pub const MAX_BUF: usize = 16 * 1024;

/// Maximum bytes accumulated per stream before it is dropped as overflowed.
pub const MAX_AGG: usize = 64 * 1024;

/// Matches TASK_COMM_LEN in the kernel.
pub const TASK_COMM_LEN: usize = 16;

/// Library paths are truncated to this to save ring buffer space.
pub const PATH_MAX: usize = 512;

/// Concurrent stream ceiling: 256 * 64KB = 16MB of map memory.
pub const MAX_STREAMS: u32 = 256;

/// Bracket scans walk the buffer in fixed chunks of this size.
pub const BRACKET_CHUNK: usize = 64;

/// 1024 chunks * 64B covers the full 64KB aggregation window.
pub const MAX_BRACKET_CHUNKS: usize = MAX_AGG / BRACKET_CHUNK;

/// Ring buffer capacity shared by every event producer.
pub const RING_BUF_BYTES: u32 = 4 * 1024 * 1024;

// ── Event types ───────────────────────────────────────────────────────────────

pub const EVENT_READ: u8 = 1;
pub const EVENT_WRITE: u8 = 2;
pub const EVENT_LIBRARY: u8 = 3;
pub const EVENT_TLS_PAYLOAD_SEND: u8 = 4;
pub const EVENT_TLS_PAYLOAD_RECV: u8 = 5;
pub const EVENT_TLS_FREE: u8 = 6;

// ── Event records ─────────────────────────────────────────────────────────────
// Little-endian host order. The consumer reads the header first to pick the
// variant, so the header must stay the leading field of every record.

/// Common header for all events.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventHeader {
    pub event_type: u8,
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

/// READ / WRITE: one fully reassembled JSON-RPC message.
/// `size` is the reassembled length; `buf` holds the first `buf_size` bytes,
/// so `size > buf_size` signals truncation to the consumer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DataEvent {
    pub header: EventHeader,
    pub size: u32,
    pub buf_size: u32,
    pub buf: [u8; MAX_BUF],
}

/// LIBRARY: a shared object mapped by some process. Produced by the library
/// enumeration probes, carried here because it shares the ring buffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LibraryEvent {
    pub header: EventHeader,
    pub inode: u64,
    pub mnt_ns_id: u32,
    pub path: [u8; PATH_MAX],
}

/// TLS_PAYLOAD_SEND / TLS_PAYLOAD_RECV: one application payload observed at
/// the libssl boundary, tagged with the session's inferred HTTP version.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TlsPayloadEvent {
    pub header: EventHeader,
    pub ssl_ctx: u64,
    pub size: u32,
    pub buf_size: u32,
    pub http_version: u8,
    pub buf: [u8; MAX_BUF],
}

/// TLS_FREE: the session identified by `ssl_ctx` is gone.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TlsFreeEvent {
    pub header: EventHeader,
    pub ssl_ctx: u64,
}

// ── Stream reassembly state ───────────────────────────────────────────────────

/// Identifies a JSON stream across vfs operations.
/// The file pointer disambiguates concurrent streams within one process and
/// is never reused while the file stays open.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StreamKey {
    pub pid: u32,
    pub file: u64,
}

/// Aggregation state for one stream: metadata plus the 64KB data window.
/// Too large for any stack — the BPF side builds these in per-CPU scratch,
/// the userland engine boxes them.
#[repr(C)]
pub struct StreamState {
    pub accumulated_size: u32,
    pub open_brackets: u32,
    pub close_brackets: u32,
    /// EVENT_READ or EVENT_WRITE, fixed when the stream is created.
    pub operation: u8,
    pub last_update_ns: u64,
    pub data: [u8; MAX_AGG],
}

impl StreamState {
    pub const fn zeroed() -> Self {
        Self {
            accumulated_size: 0,
            open_brackets: 0,
            close_brackets: 0,
            operation: 0,
            last_update_ns: 0,
            data: [0u8; MAX_AGG],
        }
    }

    /// Reinitialize a scratch slot for a fresh stream. The data window is
    /// left as-is: `accumulated_size` governs what is live.
    pub fn reset(&mut self, operation: u8, now_ns: u64) {
        self.accumulated_size = 0;
        self.open_brackets = 0;
        self.close_brackets = 0;
        self.operation = operation;
        self.last_update_ns = now_ns;
    }

    pub fn counts(&self) -> json::BracketCounts {
        json::BracketCounts {
            open: self.open_brackets,
            close: self.close_brackets,
        }
    }

    /// `open > 0 && open == close`: the accumulated bytes form a structurally
    /// closed JSON object.
    pub fn is_complete(&self) -> bool {
        self.counts().is_complete()
    }

    /// All-or-nothing copy of `bytes` at the current write offset.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let (offset, end) =
            json::append_bounds(self.accumulated_size, bytes.len()).ok_or(Overflow)?;
        self.data[offset..end].copy_from_slice(bytes);
        self.accumulated_size = end as u32;
        Ok(())
    }

    /// Advance the running bracket counts over `bytes`. Returns false when
    /// the cumulative counts go imbalanced — the stream can never complete.
    pub fn update_brackets(&mut self, bytes: &[u8]) -> bool {
        let mut counts = self.counts();
        let ok = json::scan_brackets(bytes, &mut counts);
        if ok {
            self.open_brackets = counts.open;
            self.close_brackets = counts.close;
        }
        ok
    }
}

/// Append would exceed MAX_AGG (or the fragment itself is unusable).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Overflow;

// ── TLS session state ─────────────────────────────────────────────────────────

pub const HTTP_VERSION_UNKNOWN: u8 = 0;
pub const HTTP_VERSION_1: u8 = 1;
pub const HTTP_VERSION_2: u8 = 2;

/// Per-SSL-object state, keyed by the SSL context pointer.
/// `http_version` moves away from UNKNOWN at most once and then sticks for
/// the life of the session.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TlsSession {
    pub http_version: u8,
    pub is_active: u8,
}

impl TlsSession {
    pub const fn new() -> Self {
        Self {
            http_version: HTTP_VERSION_UNKNOWN,
            is_active: 0,
        }
    }
}

impl Default for TlsSession {
    fn default() -> Self {
        Self::new()
    }
}
