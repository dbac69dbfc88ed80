//! CUDA Device Layer
//!
//! Safe wrappers over the CUDA runtime used by the inference engine:
//! - Device enumeration and selection
//! - RAII device buffers and streams
//! - Device-resident 8-bit RGB/BGR images
//! - Image-to-tensor preprocessing kernel
//!
//! Build with the `cuda` feature to link the real runtime. Without it, device
//! memory is emulated on the host so the rest of the stack runs anywhere.

pub mod buffer;
pub mod device;
pub mod error;
pub mod ffi;
pub mod image;
pub mod preprocess;
pub mod stream;

pub use buffer::{copy_from_host_async, copy_to_host_async, DeviceBuffer, DevicePtr};
pub use device::{device_count, device_name, device_names, memory_info, set_device, MemoryInfo};
pub use error::DeviceError;
pub use image::{DeviceImage, CHANNELS};
pub use preprocess::{blob_from_images, preprocess_interleaved, Normalization};
pub use stream::CudaStream;

#[cfg(not(feature = "cuda"))]
pub use ffi::{live_allocations, EMULATED_DEVICE_NAME};
