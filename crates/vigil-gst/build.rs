//! Build script: locate the DeepStream libraries for the real backend.
//!
//!   DEEPSTREAM_DIR  DeepStream install root (default /opt/nvidia/deepstream/deepstream)

use std::env;
use std::path::PathBuf;

const DEFAULT_DEEPSTREAM_ROOT: &str = "/opt/nvidia/deepstream/deepstream";

fn main() {
    println!("cargo:rerun-if-env-changed=DEEPSTREAM_DIR");
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("CARGO_FEATURE_GSTREAMER_RUNTIME").is_none() {
        return;
    }

    let root = env::var_os("DEEPSTREAM_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DEEPSTREAM_ROOT));
    let lib_dir = root.join("lib");
    if !lib_dir.exists() {
        println!(
            "cargo:warning=DeepStream libraries not found at {}; set DEEPSTREAM_DIR",
            lib_dir.display()
        );
    }
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
}
