// mcpspy-ebpf/src/vfs.rs
//
// Stream reassembly over the vfs layer.
//
// Every vfs_read/vfs_write completion hands us one fragment. Fragments are
// keyed by (pid, file pointer); the first fragment of a stream must pass the
// JSON classifier, after which the stream accumulates until its brackets
// balance (emit), it outgrows the 64KB window (drop), or the LRU map evicts
// it. Each fragment is handled to completion inside one probe invocation —
// no retries, no blocking.

use aya_bpf::{
    cty::c_void,
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_user_buf},
    macros::fexit,
    programs::FExitContext,
    BpfContext,
};
use aya_log_ebpf::warn;

use mcpspy_common::json::{self, BracketCounts, CLASSIFIER_WINDOW};
use mcpspy_common::{
    StreamKey, StreamState, BRACKET_CHUNK, EVENT_READ, EVENT_WRITE, MAX_AGG, MAX_BRACKET_CHUNKS,
};

use crate::{emit, JSON_SCRATCH, JSON_STREAMS};

#[fexit(function = "vfs_read")]
pub fn exit_vfs_read(ctx: FExitContext) -> u32 {
    match unsafe { try_vfs_op(&ctx, EVENT_READ) } {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[fexit(function = "vfs_write")]
pub fn exit_vfs_write(ctx: FExitContext) -> u32 {
    match unsafe { try_vfs_op(&ctx, EVENT_WRITE) } {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// vfs_read(struct file *file, char __user *buf, size_t count, loff_t *pos)
// fexit makes the return value visible as the trailing argument.
unsafe fn try_vfs_op(ctx: &FExitContext, operation: u8) -> Result<(), i64> {
    let file: *const c_void = ctx.arg(0);
    let buf: *const u8 = ctx.arg(1);
    let ret: i64 = ctx.arg(4);
    if ret <= 0 {
        // Only operations that moved data matter.
        return Ok(());
    }

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let key = StreamKey {
        pid,
        file: file as u64,
    };
    handle_fragment(ctx, &key, operation, buf, ret as u32)
}

unsafe fn handle_fragment(
    ctx: &FExitContext,
    key: &StreamKey,
    operation: u8,
    buf: *const u8,
    len: u32,
) -> Result<(), i64> {
    let now = bpf_ktime_get_ns();

    if let Some(state) = JSON_STREAMS.get_ptr_mut(key) {
        return advance_stream(ctx, key, &mut *state, buf, len, now);
    }

    // No stream yet: the classifier gates creation on the leading bytes.
    if (len as usize) < CLASSIFIER_WINDOW {
        return Ok(());
    }
    let mut head = [0u8; CLASSIFIER_WINDOW];
    if bpf_probe_read_user_buf(buf, &mut head).is_err() {
        return Ok(());
    }
    if !json::looks_like_json_object(&head) {
        return Ok(());
    }

    // Fresh states are built in per-CPU scratch — far too large for the
    // stack — and only copied into the map if the stream stays open.
    let scratch = JSON_SCRATCH.get_ptr_mut(0).ok_or(-1i64)?;
    let state = &mut *scratch;
    state.reset(operation, now);

    let mut counts = BracketCounts::default();
    match scan_user_brackets(&mut counts, buf, len) {
        Scan::Unreadable => return Ok(()),
        // An imbalanced opening fragment can never become an object.
        Scan::Imbalanced => return Ok(()),
        Scan::Counted => {}
    }
    if append_user(state, buf, len).is_err() {
        // A first fragment can only overflow by exceeding the whole window.
        return Ok(());
    }
    state.open_brackets = counts.open;
    state.close_brackets = counts.close;

    if state.is_complete() {
        emit::submit_data_event(ctx, key, state).ok();
        return Ok(());
    }
    JSON_STREAMS.insert(key, state, 0).map_err(|e| e as i64)?;
    Ok(())
}

/// Append one fragment to an existing stream: emit on completion, drop on
/// overflow or imbalance, otherwise keep accumulating.
unsafe fn advance_stream(
    ctx: &FExitContext,
    key: &StreamKey,
    state: &mut StreamState,
    buf: *const u8,
    len: u32,
    now: u64,
) -> Result<(), i64> {
    if json::append_bounds(state.accumulated_size, len as usize).is_none() {
        warn!(
            ctx,
            "json stream overflow, dropping pid={} size={}", key.pid, state.accumulated_size
        );
        let _ = JSON_STREAMS.remove(key);
        return Ok(());
    }

    // Counts are staged locally so an unreadable fragment mutates nothing.
    let mut counts = BracketCounts {
        open: state.open_brackets,
        close: state.close_brackets,
    };
    match scan_user_brackets(&mut counts, buf, len) {
        Scan::Unreadable => return Ok(()),
        Scan::Imbalanced => {
            let _ = JSON_STREAMS.remove(key);
            return Ok(());
        }
        Scan::Counted => {}
    }
    if append_user(state, buf, len).is_err() {
        return Ok(());
    }
    state.open_brackets = counts.open;
    state.close_brackets = counts.close;
    state.last_update_ns = now;

    if state.is_complete() {
        emit::submit_data_event(ctx, key, state).ok();
        let _ = JSON_STREAMS.remove(key);
    }
    Ok(())
}

/// All-or-nothing copy of the fragment into the stream's data window.
unsafe fn append_user(state: &mut StreamState, buf: *const u8, len: u32) -> Result<(), i64> {
    let (offset, end) =
        json::append_bounds(state.accumulated_size, len as usize).ok_or(-1i64)?;
    bpf_probe_read_user_buf(buf, &mut state.data[offset..end])?;
    state.accumulated_size = end as u32;
    Ok(())
}

enum Scan {
    Counted,
    Imbalanced,
    Unreadable,
}

/// Walk the fragment in 64-byte chunks, staging each through the stack.
/// Work is bounded by min(len, 64KB) regardless of what userspace claims.
unsafe fn scan_user_brackets(counts: &mut BracketCounts, buf: *const u8, len: u32) -> Scan {
    let total = (len as usize).min(MAX_AGG);
    let mut chunk = [0u8; BRACKET_CHUNK];

    for i in 0..MAX_BRACKET_CHUNKS {
        let offset = i * BRACKET_CHUNK;
        if offset >= total {
            break;
        }
        let take = (total - offset).min(BRACKET_CHUNK);
        if bpf_probe_read_user_buf(buf.add(offset), &mut chunk[..take]).is_err() {
            return Scan::Unreadable;
        }
        if !json::scan_chunk(&chunk[..take], counts) {
            return Scan::Imbalanced;
        }
    }
    Scan::Counted
}
