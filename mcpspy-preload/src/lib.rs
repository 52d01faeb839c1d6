// mcpspy-preload/src/lib.rs
//
// LD_PRELOAD shim: the fallback ingestion path for hosts where BPF is not
// available. Interposes read/write, watches the stdio fds that MCP servers
// speak JSON-RPC over, and runs the same reassembly engine the kernel path
// uses — one JSONL line per completed message, same field names as the
// daemon's sink.
//
// Usage:
//   MCPSPY_ENABLE=1 LD_PRELOAD=libmcpspy_preload.so  mcp-server ...
//   MCPSPY_OUTPUT=/tmp/mcp.jsonl ...                 # default is stderr
//
// Nothing activates unless MCPSPY_ENABLE is set, so the library is inert
// when preloaded system-wide.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use libc::{c_char, c_int, c_void, size_t, ssize_t, RTLD_NEXT};
use serde::Serialize;

use mcpspy_common::table::{FragmentOutcome, StreamTable};
use mcpspy_common::{StreamKey, EVENT_READ, EVENT_WRITE, MAX_BUF};

// ── libc passthrough ──────────────────────────────────────────────────────────

type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;

static REAL_READ: OnceLock<Option<ReadFn>> = OnceLock::new();
static REAL_WRITE: OnceLock<Option<WriteFn>> = OnceLock::new();

fn real_read() -> Option<ReadFn> {
    *REAL_READ.get_or_init(|| unsafe {
        let sym = libc::dlsym(RTLD_NEXT, c"read".as_ptr() as *const c_char);
        if sym.is_null() {
            None
        } else {
            Some(std::mem::transmute::<*mut c_void, ReadFn>(sym))
        }
    })
}

fn real_write() -> Option<WriteFn> {
    *REAL_WRITE.get_or_init(|| unsafe {
        let sym = libc::dlsym(RTLD_NEXT, c"write".as_ptr() as *const c_char);
        if sym.is_null() {
            None
        } else {
            Some(std::mem::transmute::<*mut c_void, WriteFn>(sym))
        }
    })
}

// ── Hooked entry points ───────────────────────────────────────────────────────

/// # Safety
/// Called by the dynamic linker in place of libc's read; `buf` must be valid
/// for `count` bytes, exactly as for the function being interposed.
#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let n = match real_read() {
        Some(real) => real(fd, buf, count),
        None => libc::syscall(libc::SYS_read, fd, buf, count) as ssize_t,
    };
    if n > 0 {
        observe(fd, EVENT_READ, buf as *const u8, n as usize);
    }
    n
}

/// # Safety
/// Called by the dynamic linker in place of libc's write; `buf` must be
/// valid for `count` bytes, exactly as for the function being interposed.
#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let n = match real_write() {
        Some(real) => real(fd, buf, count),
        None => libc::syscall(libc::SYS_write, fd, buf, count) as ssize_t,
    };
    if n > 0 {
        observe(fd, EVENT_WRITE, buf as *const u8, n as usize);
    }
    n
}

// ── Observation path ──────────────────────────────────────────────────────────

thread_local! {
    // Our own sink writes go through the hooked write(); the guard keeps
    // them from being observed in turn.
    static IN_SHIM: Cell<bool> = const { Cell::new(false) };
}

fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("MCPSPY_ENABLE").is_some())
}

fn is_stdio_fd(fd: c_int) -> bool {
    fd == libc::STDIN_FILENO || fd == libc::STDOUT_FILENO || fd == libc::STDERR_FILENO
}

unsafe fn observe(fd: c_int, operation: u8, buf: *const u8, len: usize) {
    if !enabled() || !is_stdio_fd(fd) {
        return;
    }
    let entered = IN_SHIM.with(|flag| {
        if flag.get() {
            true
        } else {
            flag.set(true);
            false
        }
    });
    if entered {
        return;
    }

    let bytes = std::slice::from_raw_parts(buf, len);
    feed(fd, operation, bytes);

    IN_SHIM.with(|flag| flag.set(false));
}

struct Shim {
    table: StreamTable,
    pid: u32,
    comm: String,
}

static SHIM: OnceLock<Mutex<Shim>> = OnceLock::new();

fn shim() -> &'static Mutex<Shim> {
    SHIM.get_or_init(|| {
        let pid = std::process::id();
        let comm = std::fs::read_to_string("/proc/self/comm")
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default();
        Mutex::new(Shim {
            table: StreamTable::new(),
            pid,
            comm,
        })
    })
}

fn feed(fd: c_int, operation: u8, bytes: &[u8]) {
    let mut shim = match shim().lock() {
        Ok(shim) => shim,
        Err(poisoned) => poisoned.into_inner(),
    };
    let key = StreamKey {
        pid: shim.pid,
        file: fd as u64,
    };
    let now_ns = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .unsigned_abs();

    match shim.table.on_fragment(key, operation, bytes, now_ns) {
        FragmentOutcome::Completed(message) => {
            if is_jsonrpc_payload(&message.data) {
                let record = ShimRecord::new(&shim, fd, message.operation, &message.data);
                emit(&record);
            }
        }
        FragmentOutcome::Ignored
        | FragmentOutcome::Buffered
        | FragmentOutcome::Dropped(_) => {}
    }
}

/// The classifier admits any JSON object; only messages that look like
/// JSON-RPC are worth a log line.
fn is_jsonrpc_payload(data: &[u8]) -> bool {
    if data.len() <= 20 {
        return false;
    }
    contains(data, b"\"jsonrpc\"")
        || contains(data, b"\"method\"")
        || contains(data, b"\"result\"")
        || contains(data, b"\"error\"")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

// ── JSONL sink ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ShimRecord<'a> {
    timestamp: DateTime<Utc>,
    event: &'static str,
    transport: &'static str,
    pid: u32,
    comm: &'a str,
    fd: c_int,
    size: usize,
    buf_size: usize,
    data: std::borrow::Cow<'a, str>,
}

impl<'a> ShimRecord<'a> {
    fn new(shim: &'a Shim, fd: c_int, operation: u8, data: &'a [u8]) -> Self {
        let buf_size = data.len().min(MAX_BUF);
        ShimRecord {
            timestamp: Utc::now(),
            event: if operation == EVENT_READ {
                "read"
            } else {
                "write"
            },
            transport: "stdio",
            pid: shim.pid,
            comm: &shim.comm,
            fd,
            size: data.len(),
            buf_size,
            data: String::from_utf8_lossy(&data[..buf_size]),
        }
    }
}

fn emit(record: &ShimRecord<'_>) {
    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(_) => return,
    };

    static OUTPUT: OnceLock<Option<Mutex<std::fs::File>>> = OnceLock::new();
    let output = OUTPUT.get_or_init(|| {
        std::env::var_os("MCPSPY_OUTPUT").and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
                .map(Mutex::new)
        })
    });

    match output {
        Some(file) => {
            let mut file = match file.lock() {
                Ok(file) => file,
                Err(poisoned) => poisoned.into_inner(),
            };
            let _ = writeln!(file, "{line}");
        }
        None => {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonrpc_marker_detection() {
        assert!(is_jsonrpc_payload(
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}"
        ));
        assert!(is_jsonrpc_payload(
            b"{\"result\":{\"tools\":[]},\"id\":1,\"x\":0}"
        ));
        assert!(!is_jsonrpc_payload(b"{\"id\":1}"));
        assert!(!is_jsonrpc_payload(b"{\"a\":\"plain json, not rpc\"}"));
    }
}
