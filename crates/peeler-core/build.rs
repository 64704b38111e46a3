//! Build script for peeler-core
//!
//! Checks requirements before compilation:
//! - Minimum Rust version
//! - Target platform (live tracing needs a 64-bit Windows target)
//!
//! ## Requirements
//!
//! - **Rust**: 1.73.0 or newer
//! - **Windows**: x86-64 target for the debugger backend; every other target
//!   builds the replay-only engine

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    // `u64::div_ceil` is the newest API the crate relies on.
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 73, 0);

        if rustc_version < min_rust_version {
            panic!(
                "peeler-core requires Rust {} or newer, found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        println!("cargo:warning=could not verify Rust version");
    }

    // Build scripts run on the host; the target comes from Cargo's environment.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_os != "windows" || target_arch != "x86_64" {
        println!(
            "cargo:warning=peeler-core: no live debugger backend for {target_os}/{target_arch}; only replay is available"
        );
    }
}
