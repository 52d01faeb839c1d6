// mcpspy-ebpf/src/main.rs
//
// mcpspy eBPF kernel programs.
//
// These programs run INSIDE the Linux kernel via the eBPF VM. They are
// compiled to BPF bytecode (bpfel-unknown-none target) and loaded by the
// userspace loader (mcpspy/src/loader.rs).
//
// Programs:
//   1. exit_vfs_read / exit_vfs_write — fexit on the vfs layer: classify
//      JSON-RPC fragments and reassemble them per (pid, file) stream
//   2. ssl_* uprobes — track libssl sessions (SSL_new → SSL_free), infer the
//      HTTP version from plaintext payloads, emit them without reassembly
//
// Why fexit on vfs_read/vfs_write instead of syscall tracepoints:
//   - one attach point covers regular files, pipes and sockets alike
//   - the file pointer is in hand, which is what keys a stream
//   - the return value gives the actual byte count, not the requested one
//
// Why uprobes on libssl instead of pcap:
//   - SSL_write is hooked BEFORE encryption, SSL_read after decryption
//   - no ciphertext ever needs decoding
//
// Kernel requirements: Linux 5.8+ (BTF + CO-RE), CONFIG_BPF_SYSCALL=y,
// CONFIG_UPROBE_EVENTS=y for the ssl probes.

#![no_std]
#![no_main]

use aya_bpf::{
    macros::map,
    maps::{HashMap, LruHashMap, PerCpuArray, RingBuf},
};

use mcpspy_common::{StreamKey, StreamState, TlsSession, MAX_STREAMS, RING_BUF_BYTES};

mod emit;
mod tls;
mod vfs;

// ── BPF maps ──────────────────────────────────────────────────────────────────

/// Single shared sink: every event variant goes out through this ring.
/// Producers never block; a full ring drops the event.
#[map]
pub static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_BYTES, 0);

/// JSON streams in flight, keyed by (pid, file). 256 * 64KB = 16MB max;
/// the LRU policy reclaims streams that never complete.
#[map]
pub static JSON_STREAMS: LruHashMap<StreamKey, StreamState> =
    LruHashMap::with_max_entries(MAX_STREAMS, 0);

/// Scratch slot for building fresh stream states. A 64KB state can never
/// live on the BPF stack; probe bodies are non-preemptible per CPU, so one
/// per-CPU slot needs no locking.
#[map]
pub static JSON_SCRATCH: PerCpuArray<StreamState> = PerCpuArray::with_max_entries(1, 0);

/// TLS sessions keyed by the SSL context pointer, SSL_new → SSL_free.
#[map]
pub static TLS_SESSIONS: LruHashMap<u64, TlsSession> = LruHashMap::with_max_entries(1024, 0);

/// SSL_do_handshake argument stash: pid_tgid → ssl, entry to exit.
#[map]
pub static HANDSHAKE_ARGS: HashMap<u64, u64> = HashMap::with_max_entries(1024, 0);

/// SSL_read/SSL_write(_ex) argument stash: the buffer pointer is only
/// visible at entry, the byte count only at exit.
#[map]
pub static SSL_RW_ARGS: HashMap<u64, tls::SslCallArgs> = HashMap::with_max_entries(1024, 0);

// ── Panic handler (required for no_std) ──────────────────────────────────────

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // BPF programs cannot panic — the verifier rejects programs that can.
    // This handler is required by no_std but should never be reached.
    loop {}
}

// fexit and the probe-read helpers are GPL-gated.
#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
