// mcpspy/src/main.rs
//
// mcpspy — MCP traffic observation via eBPF.
//
// Kernel probes reassemble JSON-RPC messages crossing vfs_read/vfs_write and
// capture TLS plaintext at the libssl boundary; this daemon loads them,
// drains the shared ring buffer and writes one JSONL line per event.
//
// Usage:
//   sudo mcpspy                               # events to stdout
//   sudo mcpspy --output /var/log/mcpspy.jsonl
//   sudo mcpspy --libssl /opt/openssl/lib/libssl.so.3
//   sudo mcpspy --disable-tls                 # vfs streams only
//
// Requires: Linux 5.8+, BTF, CAP_BPF (or root), --features live-ebpf.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod events;
mod loader;
mod output;
mod sessions;

use events::McpEvent;
use loader::{AttachOptions, McpSpyLoader};
use output::Output;
use sessions::SessionRegistry;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "mcpspy",
    about   = "MCP traffic observation via eBPF",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "Write JSONL events to this file instead of stdout")]
    output: Option<PathBuf>,

    #[arg(long, help = "Explicit libssl path (skips discovery)")]
    libssl: Option<PathBuf>,

    #[arg(long, help = "Skip the vfs_read/vfs_write stream probes")]
    disable_fs: bool,

    #[arg(long, help = "Skip the libssl session probes")]
    disable_tls: bool,
}

// ── Stats ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Stats {
    data_events: AtomicU64,
    tls_payloads: AtomicU64,
    library_events: AtomicU64,
}

async fn stats_loop(stats: Arc<Stats>, registry: Arc<SessionRegistry>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        info!(
            "stats uptime={:.0}s streams={} tls={} libraries={} active_sessions={}",
            start.elapsed().as_secs_f64(),
            stats.data_events.load(Ordering::Relaxed),
            stats.tls_payloads.load(Ordering::Relaxed),
            stats.library_events.load(Ordering::Relaxed),
            registry.active(),
        );
    }
}

fn print_banner() {
    println!("\x1b[1mmcpspy\x1b[0m v{} — MCP traffic observation via eBPF", env!("CARGO_PKG_VERSION"));
    println!("\x1b[90mvfs JSON-RPC reassembly + libssl session tracking\x1b[0m\n");
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mcpspy=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    print_banner();

    let mut bpf_loader = McpSpyLoader::load()?;
    let report = bpf_loader.attach(&AttachOptions {
        libssl: cli.libssl,
        disable_fs: cli.disable_fs,
        disable_tls: cli.disable_tls,
    })?;
    info!(
        "Attached: vfs={} libssl={}",
        report.vfs_attached,
        report
            .libssl
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string()),
    );

    let mut rx = bpf_loader.events()?;
    let mut out = Output::create(cli.output).await?;
    let registry = Arc::new(SessionRegistry::new());
    let stats = Arc::new(Stats::default());

    tokio::spawn(stats_loop(
        Arc::clone(&stats),
        Arc::clone(&registry),
        Instant::now(),
    ));

    println!("Press Ctrl+C to stop.\n");

    while let Some(event) = rx.recv().await {
        match &event {
            McpEvent::Data { .. } => {
                stats.data_events.fetch_add(1, Ordering::Relaxed);
            }
            McpEvent::TlsPayload {
                ssl_ctx,
                direction,
                http_version,
                size,
                ..
            } => {
                stats.tls_payloads.fetch_add(1, Ordering::Relaxed);
                registry.record_payload(*ssl_ctx, *direction, *http_version, *size);
            }
            McpEvent::TlsFree { ssl_ctx, meta } => {
                if let Some(summary) = registry.finish(*ssl_ctx) {
                    info!(
                        "session closed ssl_ctx={:#x} comm={} http={} sent={} recv={} bytes={}",
                        ssl_ctx,
                        meta.comm,
                        summary.http_version,
                        summary.sent_msgs,
                        summary.recv_msgs,
                        summary.bytes,
                    );
                }
            }
            McpEvent::Library { .. } => {
                stats.library_events.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Err(e) = out.write(&event).await {
            error!("Output write failed: {}", e);
        }
    }

    Ok(())
}
