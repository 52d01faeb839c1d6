// mcpspy-ebpf/src/emit.rs
//
// Ring buffer emission. Every event follows the same shape: reserve a slot
// sized for the variant, fill the header, fill the variant fields, then
// submit — or discard if any copy into the slot fails. Reservation failure
// is logged and the event is dropped; nothing here ever blocks or retries.

use aya_bpf::{
    helpers::{bpf_get_current_comm, bpf_probe_read_kernel_buf, bpf_probe_read_user_buf},
    BpfContext,
};
use aya_log_ebpf::error;

use mcpspy_common::{
    DataEvent, StreamKey, StreamState, TlsFreeEvent, TlsPayloadEvent, EVENT_TLS_FREE, MAX_BUF,
    TASK_COMM_LEN,
};

use crate::EVENTS;

/// Emit a fully reassembled JSON message. `buf_size = min(size, MAX_BUF)`;
/// the consumer detects truncation from the difference.
pub unsafe fn submit_data_event<C: BpfContext>(
    ctx: &C,
    key: &StreamKey,
    state: &StreamState,
) -> Result<(), i64> {
    let Some(mut entry) = EVENTS.reserve::<DataEvent>(0) else {
        error!(ctx, "ring buffer full, dropping data event pid={}", key.pid);
        return Err(-1);
    };

    let ev = entry.as_mut_ptr();
    let copy = (state.accumulated_size as usize).min(MAX_BUF);
    (*ev).header.event_type = state.operation;
    (*ev).header.pid = key.pid;
    (*ev).header.comm = bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN]);
    (*ev).size = state.accumulated_size;
    (*ev).buf_size = copy as u32;

    // state.data lives in map memory, which is kernel memory.
    if bpf_probe_read_kernel_buf(state.data.as_ptr(), &mut (*ev).buf[..copy]).is_err() {
        error!(ctx, "failed to copy aggregated data, discarding event");
        entry.discard(0);
        return Err(-1);
    }

    entry.submit(0);
    Ok(())
}

/// Emit one TLS application payload, tagged with the session's HTTP version.
pub unsafe fn submit_tls_payload<C: BpfContext>(
    ctx: &C,
    event_type: u8,
    pid: u32,
    ssl: u64,
    buf: *const u8,
    size: u32,
    http_version: u8,
) -> Result<(), i64> {
    let Some(mut entry) = EVENTS.reserve::<TlsPayloadEvent>(0) else {
        error!(ctx, "ring buffer full, dropping tls payload pid={}", pid);
        return Err(-1);
    };

    let ev = entry.as_mut_ptr();
    let copy = (size as usize).min(MAX_BUF);
    (*ev).header.event_type = event_type;
    (*ev).header.pid = pid;
    (*ev).header.comm = bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN]);
    (*ev).ssl_ctx = ssl;
    (*ev).size = size;
    (*ev).buf_size = copy as u32;
    (*ev).http_version = http_version;

    if bpf_probe_read_user_buf(buf, &mut (*ev).buf[..copy]).is_err() {
        entry.discard(0);
        return Err(-1);
    }

    entry.submit(0);
    Ok(())
}

/// Emit the end-of-session marker.
pub unsafe fn submit_tls_free<C: BpfContext>(ctx: &C, pid: u32, ssl: u64) -> Result<(), i64> {
    let Some(mut entry) = EVENTS.reserve::<TlsFreeEvent>(0) else {
        error!(ctx, "ring buffer full, dropping tls free pid={}", pid);
        return Err(-1);
    };

    let ev = entry.as_mut_ptr();
    (*ev).header.event_type = EVENT_TLS_FREE;
    (*ev).header.pid = pid;
    (*ev).header.comm = bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN]);
    (*ev).ssl_ctx = ssl;

    entry.submit(0);
    Ok(())
}
