//! Build script for the inference engine
//!
//! Compiles the C++ TensorRT shim and links TensorRT when the `tensorrt`
//! feature is enabled. The default build uses the tract reference backend and
//! needs no native toolchain.

fn main() {
    println!("cargo:rerun-if-changed=csrc/");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");
    println!("cargo:rerun-if-env-changed=TENSORRT_ROOT");

    if std::env::var_os("CARGO_FEATURE_TENSORRT").is_none() {
        return;
    }

    let cuda_root = std::env::var("CUDA_PATH").unwrap_or_else(|_| "/usr/local/cuda".to_string());
    let trt_root = std::env::var("TENSORRT_ROOT").ok();

    let mut build = cc::Build::new();

    build
        .cpp(true)
        .std("c++17")
        .include("csrc")
        .include(format!("{}/include", cuda_root))
        .file("csrc/trt_shim.cpp")
        .warnings(true)
        .extra_warnings(true);

    if let Some(root) = &trt_root {
        build.include(format!("{}/include", root));
    }

    build.compile("vi_trt_shim");

    if let Some(root) = &trt_root {
        println!("cargo:rustc-link-search=native={}/lib", root);
    }
    println!("cargo:rustc-link-search=native={}/lib64", cuda_root);
    println!("cargo:rustc-link-lib=nvinfer");
    println!("cargo:rustc-link-lib=nvonnxparser");
    println!("cargo:rustc-link-lib=cudart");
}
