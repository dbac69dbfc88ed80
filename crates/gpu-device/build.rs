//! Build script for the CUDA device layer
//!
//! Compiles the CUDA helper library and links the CUDA runtime when the
//! `cuda` feature is enabled. Without it the crate emulates device memory on
//! the host and nothing native is built.

fn main() {
    println!("cargo:rerun-if-changed=csrc/");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");

    if std::env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    let cuda_root = std::env::var("CUDA_PATH").unwrap_or_else(|_| "/usr/local/cuda".to_string());

    let mut build = cc::Build::new();

    build
        .cuda(true)
        .include("csrc")
        .include(format!("{}/include", cuda_root))
        .file("csrc/vi_cuda.cu")
        .flag("-std=c++17")
        .warnings(true);

    build.compile("vi_cuda");

    println!("cargo:rustc-link-search=native={}/lib64", cuda_root);
    println!("cargo:rustc-link-lib=cudart");
}
