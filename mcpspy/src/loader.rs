// mcpspy/src/loader.rs
//
// aya BPF loader — loads compiled BPF bytecode and attaches probes.
//
// Two probe families:
//   vfs    — fexit on vfs_read/vfs_write (BTF-based, kernel 5.8+ with
//            CONFIG_DEBUG_INFO_BTF=y): in-kernel JSON stream reassembly
//   libssl — uprobes on SSL_new/SSL_free/SSL_do_handshake/SSL_read/SSL_write
//            (+ the _ex variants where the build exports them): TLS session
//            tracking with plaintext payload capture
//
// Events from both families arrive on one ring buffer and are handed to the
// consumer as parsed McpEvents over an mpsc channel.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use aya::{
    include_bytes_aligned,
    maps::RingBuf,
    programs::{FExit, UProbe},
    Bpf, BpfLoader, Btf,
};
use aya_log::BpfLogger;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::events::{parse_event, McpEvent};

// ── TLS library paths ─────────────────────────────────────────────────────────

const OPENSSL_PATHS: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/libssl.so.3",
    "/usr/lib/x86_64-linux-gnu/libssl.so.1.1",
    "/usr/lib/aarch64-linux-gnu/libssl.so.3",
    "/usr/lib/aarch64-linux-gnu/libssl.so.1.1",
    "/usr/lib64/libssl.so.3",
    "/usr/local/lib/libssl.so.3",
    "/usr/local/ssl/lib/libssl.so",
];

// ── Probe attachment plan ─────────────────────────────────────────────────────

/// (program, symbol). Every libssl build exports these.
const SSL_CORE_PROBES: &[(&str, &str)] = &[
    ("ssl_new_exit", "SSL_new"),
    ("ssl_free_enter", "SSL_free"),
    ("ssl_handshake_enter", "SSL_do_handshake"),
    ("ssl_handshake_exit", "SSL_do_handshake"),
    ("ssl_read_enter", "SSL_read"),
    ("ssl_read_exit", "SSL_read"),
    ("ssl_write_enter", "SSL_write"),
];

/// The _ex variants are OpenSSL 1.1.1+; attach failures are non-fatal.
const SSL_EX_PROBES: &[(&str, &str)] = &[
    ("ssl_read_ex_enter", "SSL_read_ex"),
    ("ssl_read_ex_exit", "SSL_read_ex"),
    ("ssl_write_ex_enter", "SSL_write_ex"),
    ("ssl_write_ex_exit", "SSL_write_ex"),
];

// ── McpSpyLoader ──────────────────────────────────────────────────────────────

pub struct McpSpyLoader {
    bpf: Bpf,
}

#[derive(Debug, Default)]
pub struct AttachOptions {
    /// Explicit libssl path; discovery is skipped when set.
    pub libssl: Option<PathBuf>,
    pub disable_fs: bool,
    pub disable_tls: bool,
}

#[derive(Debug, Default)]
pub struct AttachReport {
    pub vfs_attached: bool,
    pub libssl: Option<PathBuf>,
}

impl McpSpyLoader {
    pub fn load() -> Result<Self> {
        #[cfg(feature = "live-ebpf")]
        let bpf_bytes = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/mcpspy-ebpf"));
        #[cfg(not(feature = "live-ebpf"))]
        let bpf_bytes: &[u8] = &[];

        if bpf_bytes.is_empty() {
            return Err(anyhow!(
                "BPF bytecode not embedded. Run: cargo xtask build-ebpf\n\
                 Then rebuild with: cargo build --features live-ebpf"
            ));
        }

        let mut bpf = BpfLoader::new()
            .load(bpf_bytes)
            .context("Failed to load BPF object")?;
        if let Err(e) = BpfLogger::init(&mut bpf) {
            warn!("BPF logger init failed (non-fatal): {}", e);
        }
        Ok(Self { bpf })
    }

    pub fn attach(&mut self, opts: &AttachOptions) -> Result<AttachReport> {
        let mut report = AttachReport::default();

        if !opts.disable_fs {
            let btf = Btf::from_sys_fs()
                .context("BTF unavailable — kernel needs CONFIG_DEBUG_INFO_BTF=y")?;
            self.attach_fexit("exit_vfs_read", "vfs_read", &btf)?;
            self.attach_fexit("exit_vfs_write", "vfs_write", &btf)?;
            report.vfs_attached = true;
        }

        if !opts.disable_tls {
            let libssl = opts
                .libssl
                .clone()
                .or_else(|| find_library(OPENSSL_PATHS, "libssl"));
            match libssl {
                Some(path) => {
                    info!("Attaching libssl probes: {}", path.display());
                    for (prog, sym) in SSL_CORE_PROBES {
                        self.attach_uprobe(prog, sym, &path)?;
                    }
                    for (prog, sym) in SSL_EX_PROBES {
                        if let Err(e) = self.attach_uprobe(prog, sym, &path) {
                            warn!("Optional probe {prog} on {sym} not attached: {e}");
                        }
                    }
                    report.libssl = Some(path);
                }
                None => warn!("No libssl found — TLS session tracking disabled"),
            }
        }

        if !report.vfs_attached && report.libssl.is_none() {
            return Err(anyhow!("Nothing attached: no probe family enabled"));
        }
        Ok(report)
    }

    /// Consume the ring buffer, parse records, stream them to the caller.
    pub fn events(mut self) -> Result<mpsc::Receiver<McpEvent>> {
        let ring_map = self
            .bpf
            .take_map("EVENTS")
            .context("EVENTS map not found in BPF object")?;
        let ring = RingBuf::try_from(ring_map)?;
        let mut ring_fd = AsyncFd::with_interest(ring, Interest::READABLE)?;

        let (tx, rx) = mpsc::channel(65536);
        tokio::spawn(async move {
            // The loader owns the Bpf handle for the life of the stream;
            // dropping it would detach every probe.
            let _bpf = self.bpf;
            loop {
                let mut guard = match ring_fd.readable_mut().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!("Ring buffer poll failed: {}", e);
                        break;
                    }
                };
                let ring = guard.get_inner_mut();
                while let Some(item) = ring.next() {
                    match parse_event(&item) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return; // consumer gone
                            }
                        }
                        Err(e) => warn!("Skipping malformed record: {}", e),
                    }
                }
                guard.clear_ready();
            }
        });

        info!("mcpspy eBPF probes active.");
        Ok(rx)
    }

    fn attach_fexit(&mut self, prog: &str, function: &str, btf: &Btf) -> Result<()> {
        let p = self
            .bpf
            .program_mut(prog)
            .with_context(|| format!("{prog} not found in BPF object"))?;
        let fexit: &mut FExit = p.try_into()?;
        fexit.load(function, btf)?;
        fexit.attach()?;
        info!("Attached fexit: {}", function);
        Ok(())
    }

    fn attach_uprobe(&mut self, prog: &str, symbol: &str, lib: &PathBuf) -> Result<()> {
        let p = self
            .bpf
            .program_mut(prog)
            .with_context(|| format!("{prog} not found in BPF object"))?;
        let up: &mut UProbe = p.try_into()?;
        up.load()?;
        up.attach(Some(symbol), 0, lib, None)
            .with_context(|| format!("attach {prog} to {}:{symbol}", lib.display()))?;
        info!("Attached {prog}: {}:{symbol}", lib.display());
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn find_library(paths: &[&str], label: &str) -> Option<PathBuf> {
    for p in paths {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
    }
    // Scan /proc for loaded instances
    for proc_dir in std::fs::read_dir("/proc").ok()?.flatten() {
        if let Ok(maps) = std::fs::read_to_string(proc_dir.path().join("maps")) {
            for line in maps.lines() {
                if line.to_lowercase().contains(label) {
                    if let Some(p) = line.split_whitespace().last() {
                        let pb = PathBuf::from(p);
                        if pb.exists() {
                            return Some(pb);
                        }
                    }
                }
            }
        }
    }
    None
}
