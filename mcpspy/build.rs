// build.rs — embed compiled BPF bytecode at compile time.
//
// Only relevant when building with --features live-ebpf.
// The bytecode is produced by: cargo xtask build-ebpf

fn main() {
    // Re-run if BPF source or compiled object changes.
    println!("cargo:rerun-if-changed=../mcpspy-ebpf/src");
    println!("cargo:rerun-if-changed=../mcpspy-ebpf/target/bpfel-unknown-none/release/mcpspy-ebpf");
}
