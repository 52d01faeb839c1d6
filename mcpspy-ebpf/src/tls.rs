// mcpspy-ebpf/src/tls.rs
//
// TLS session tracking over libssl uprobes.
//
// Sessions are keyed by the SSL context pointer and live from SSL_new to
// SSL_free. Payloads are emitted directly — TLS records already frame them —
// tagged with the session's HTTP version. The version is inferred once, from
// the first payload whose shape and polarity agree with the probe direction
// (client-side view: requests go out on write, responses come in on read),
// and reused for everything after.
//
// SSL_read/SSL_write buffer pointers are only visible at function entry and
// byte counts only at return, so each pair stashes its arguments keyed by
// pid_tgid in between — same pattern for the _ex variants, which additionally
// report the actual count through a caller-provided out pointer.

use aya_bpf::{
    cty::c_void,
    helpers::{bpf_get_current_pid_tgid, bpf_probe_read_user, bpf_probe_read_user_buf},
    macros::{uprobe, uretprobe},
    programs::{ProbeContext, RetProbeContext},
    BpfContext,
};

use mcpspy_common::http::{self, PayloadVerdict, HTTP_INSPECT_LEN};
use mcpspy_common::{TlsSession, EVENT_TLS_PAYLOAD_RECV, EVENT_TLS_PAYLOAD_SEND};

use crate::{emit, HANDSHAKE_ARGS, SSL_RW_ARGS, TLS_SESSIONS};

/// Arguments stashed between an SSL call's entry and exit probes.
/// `out_count` is 0 for the plain variants and the caller's out pointer for
/// SSL_read_ex/SSL_write_ex.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SslCallArgs {
    pub ssl: u64,
    pub buf: u64,
    pub out_count: u64,
}

// ── Session lifecycle ─────────────────────────────────────────────────────────

#[uretprobe(name = "ssl_new_exit")]
pub fn ssl_new_exit(ctx: RetProbeContext) -> u32 {
    match try_ssl_new_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_ssl_new_exit(ctx: &RetProbeContext) -> Result<(), i64> {
    let ssl: u64 = ctx.ret().ok_or(1i64)?;
    if ssl == 0 {
        return Ok(());
    }
    TLS_SESSIONS
        .insert(&ssl, &TlsSession::new(), 0)
        .map_err(|e| e as i64)?;
    Ok(())
}

#[uprobe(name = "ssl_free_enter")]
pub fn ssl_free_enter(ctx: ProbeContext) -> u32 {
    match try_ssl_free_enter(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_ssl_free_enter(ctx: &ProbeContext) -> Result<(), i64> {
    let ssl: *const c_void = ctx.arg(0).ok_or(1i64)?;
    let ssl = ssl as u64;
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;

    unsafe {
        emit::submit_tls_free(ctx, pid, ssl).ok();
        let _ = TLS_SESSIONS.remove(&ssl);
    }
    Ok(())
}

// ── Handshake ─────────────────────────────────────────────────────────────────

#[uprobe(name = "ssl_handshake_enter")]
pub fn ssl_handshake_enter(ctx: ProbeContext) -> u32 {
    match try_ssl_handshake_enter(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_ssl_handshake_enter(ctx: &ProbeContext) -> Result<(), i64> {
    let ssl: *const c_void = ctx.arg(0).ok_or(1i64)?;
    let pid_tgid = bpf_get_current_pid_tgid();
    HANDSHAKE_ARGS
        .insert(&pid_tgid, &(ssl as u64), 0)
        .map_err(|e| e as i64)?;
    Ok(())
}

#[uretprobe(name = "ssl_handshake_exit")]
pub fn ssl_handshake_exit(ctx: RetProbeContext) -> u32 {
    match try_ssl_handshake_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_ssl_handshake_exit(ctx: &RetProbeContext) -> Result<(), i64> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let ssl = unsafe { *HANDSHAKE_ARGS.get(&pid_tgid).ok_or(1i64)? };
    let _ = HANDSHAKE_ARGS.remove(&pid_tgid);

    // SSL_do_handshake returns 1 on a completed handshake.
    let ret: i32 = ctx.ret().ok_or(1i64)?;
    if ret != 1 {
        return Ok(());
    }
    if let Some(session) = TLS_SESSIONS.get_ptr_mut(&ssl) {
        unsafe { (*session).is_active = 1 };
    }
    Ok(())
}

// ── SSL_read / SSL_read_ex ────────────────────────────────────────────────────

#[uprobe(name = "ssl_read_enter")]
pub fn ssl_read_enter(ctx: ProbeContext) -> u32 {
    match try_ssl_rw_enter(&ctx, false) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[uprobe(name = "ssl_read_ex_enter")]
pub fn ssl_read_ex_enter(ctx: ProbeContext) -> u32 {
    match try_ssl_rw_enter(&ctx, true) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// SSL_read(ssl, buf, num) / SSL_read_ex(ssl, buf, num, *readbytes)
// SSL_write_ex(ssl, buf, num, *written) stashes identically.
fn try_ssl_rw_enter(ctx: &ProbeContext, has_out_count: bool) -> Result<(), i64> {
    let ssl: *const c_void = ctx.arg(0).ok_or(1i64)?;
    let buf: *const u8 = ctx.arg(1).ok_or(1i64)?;
    let out_count: u64 = if has_out_count {
        let ptr: *const c_void = ctx.arg(3).ok_or(1i64)?;
        ptr as u64
    } else {
        0
    };

    let pid_tgid = bpf_get_current_pid_tgid();
    let args = SslCallArgs {
        ssl: ssl as u64,
        buf: buf as u64,
        out_count,
    };
    SSL_RW_ARGS
        .insert(&pid_tgid, &args, 0)
        .map_err(|e| e as i64)?;
    Ok(())
}

#[uretprobe(name = "ssl_read_exit")]
pub fn ssl_read_exit(ctx: RetProbeContext) -> u32 {
    match try_ssl_read_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_ssl_read_exit(ctx: &RetProbeContext) -> Result<(), i64> {
    let args = take_rw_args()?;

    // SSL_read returns the byte count, <= 0 on error/shutdown.
    let ret: i32 = ctx.ret().ok_or(1i64)?;
    if ret <= 0 {
        return Ok(());
    }
    unsafe { process_payload(ctx, &args, ret as u32, false) }
}

#[uretprobe(name = "ssl_read_ex_exit")]
pub fn ssl_read_ex_exit(ctx: RetProbeContext) -> u32 {
    match try_ssl_rw_ex_exit(&ctx, false) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// ── SSL_write / SSL_write_ex ──────────────────────────────────────────────────

#[uprobe(name = "ssl_write_enter")]
pub fn ssl_write_enter(ctx: ProbeContext) -> u32 {
    match try_ssl_write_enter(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// SSL_write(ssl, buf, num): the payload is fully in hand at entry, so no
// stash round-trip is needed on the plain write path.
fn try_ssl_write_enter(ctx: &ProbeContext) -> Result<(), i64> {
    let ssl: *const c_void = ctx.arg(0).ok_or(1i64)?;
    let buf: *const u8 = ctx.arg(1).ok_or(1i64)?;
    let num: i32 = ctx.arg(2).ok_or(1i64)?;
    if num <= 0 {
        return Ok(());
    }
    let args = SslCallArgs {
        ssl: ssl as u64,
        buf: buf as u64,
        out_count: 0,
    };
    unsafe { process_payload(ctx, &args, num as u32, true) }
}

#[uprobe(name = "ssl_write_ex_enter")]
pub fn ssl_write_ex_enter(ctx: ProbeContext) -> u32 {
    match try_ssl_rw_enter(&ctx, true) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[uretprobe(name = "ssl_write_ex_exit")]
pub fn ssl_write_ex_exit(ctx: RetProbeContext) -> u32 {
    match try_ssl_rw_ex_exit(&ctx, true) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// The _ex variants return 1 on success and report the actual byte count
// through the out pointer saved at entry.
fn try_ssl_rw_ex_exit(ctx: &RetProbeContext, is_send: bool) -> Result<(), i64> {
    let args = take_rw_args()?;

    let ret: i32 = ctx.ret().ok_or(1i64)?;
    if ret != 1 || args.out_count == 0 {
        return Ok(());
    }
    let count: u64 =
        unsafe { bpf_probe_read_user(args.out_count as *const u64).map_err(|e| e as i64)? };
    if count == 0 {
        return Ok(());
    }
    unsafe { process_payload(ctx, &args, count as u32, is_send) }
}

fn take_rw_args() -> Result<SslCallArgs, i64> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let args = unsafe { *SSL_RW_ARGS.get(&pid_tgid).ok_or(1i64)? };
    let _ = SSL_RW_ARGS.remove(&pid_tgid);
    Ok(args)
}

// ── Payload classification + emission ─────────────────────────────────────────

/// Decide one payload for its session and emit it if the session's version
/// is (or just became) known. Sessions missing from the map — eviction, or
/// attachment after the process started — are recreated as UNKNOWN.
unsafe fn process_payload<C: BpfContext>(
    ctx: &C,
    args: &SslCallArgs,
    size: u32,
    is_send: bool,
) -> Result<(), i64> {
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;

    if TLS_SESSIONS.get(&args.ssl).is_none() {
        TLS_SESSIONS
            .insert(&args.ssl, &TlsSession::new(), 0)
            .map_err(|e| e as i64)?;
    }
    let session = TLS_SESSIONS.get_ptr_mut(&args.ssl).ok_or(1i64)?;

    let mut prefix = [0u8; HTTP_INSPECT_LEN];
    let take = (size as usize).min(HTTP_INSPECT_LEN);
    if bpf_probe_read_user_buf(args.buf as *const u8, &mut prefix[..take]).is_err() {
        return Ok(());
    }

    match http::payload_decision((*session).http_version, is_send, &prefix[..take]) {
        PayloadVerdict::Emit { version } => {
            (*session).http_version = version;
            let event_type = if is_send {
                EVENT_TLS_PAYLOAD_SEND
            } else {
                EVENT_TLS_PAYLOAD_RECV
            };
            emit::submit_tls_payload(
                ctx,
                event_type,
                pid,
                args.ssl,
                args.buf as *const u8,
                size,
                version,
            )
            .ok();
            Ok(())
        }
        // Wrong shape or wrong polarity: skip, leave the session open for a
        // later payload to fix.
        PayloadVerdict::Unidentified | PayloadVerdict::DirectionMismatch => Ok(()),
    }
}
