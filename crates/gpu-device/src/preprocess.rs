//! Image-to-tensor preprocessing
//!
//! Turns interleaved 8-bit images into the planar `f32` layout networks
//! consume: bilinear resize to the network input size, scale to `[0, 1]`,
//! then per-channel `(x - subtract) / divide`. On CUDA builds the work runs as
//! a kernel on the caller's stream; [`preprocess_interleaved`] is the host
//! implementation of the same arithmetic.

use libc::c_int;

use crate::buffer::DeviceBuffer;
use crate::error::{check, DeviceError};
use crate::ffi;
use crate::image::{DeviceImage, CHANNELS};
use crate::stream::CudaStream;

/// Per-channel normalization applied after scaling pixels to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub subtract: [f32; CHANNELS],
    pub divide: [f32; CHANNELS],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            subtract: [0.0; CHANNELS],
            divide: [1.0; CHANNELS],
        }
    }
}

impl Normalization {
    pub fn new(subtract: [f32; CHANNELS], divide: [f32; CHANNELS]) -> Self {
        Self { subtract, divide }
    }

    /// ImageNet mean/std, a common choice for classification backbones
    pub fn imagenet() -> Self {
        Self {
            subtract: [0.485, 0.456, 0.406],
            divide: [0.229, 0.224, 0.225],
        }
    }

    /// Reject divisors that would produce infinities or NaNs
    pub fn validate(&self) -> Result<(), DeviceError> {
        if let Some(d) = self.divide.iter().find(|d| **d == 0.0 || !d.is_finite()) {
            return Err(DeviceError::InvalidArgument(format!(
                "normalization divisor must be finite and non-zero, got {}",
                d
            )));
        }
        if self.subtract.iter().any(|s| !s.is_finite()) {
            return Err(DeviceError::InvalidArgument(
                "normalization offsets must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Host implementation of the preprocessing kernel.
///
/// `src` is interleaved `src_w x src_h x 3` with `src_pitch` bytes per row;
/// `dst` receives `3 x dst_h x dst_w` values, channel-major.
#[allow(clippy::too_many_arguments)]
pub fn preprocess_interleaved(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    src_pitch: usize,
    dst: &mut [f32],
    dst_w: usize,
    dst_h: usize,
    norm: &Normalization,
) {
    let plane = dst_w * dst_h;
    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;
    let max_x = (src_w - 1) as f32;
    let max_y = (src_h - 1) as f32;

    for y in 0..dst_h {
        let sy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = sy - y0 as f32;

        for x in 0..dst_w {
            let sx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = sx - x0 as f32;

            for c in 0..CHANNELS {
                let px = |row: usize, col: usize| src[row * src_pitch + col * CHANNELS + c] as f32;
                let top = px(y0, x0) * (1.0 - fx) + px(y0, x1) * fx;
                let bottom = px(y1, x0) * (1.0 - fx) + px(y1, x1) * fx;
                let value = (top * (1.0 - fy) + bottom * fy) / 255.0;
                dst[c * plane + y * dst_w + x] = (value - norm.subtract[c]) / norm.divide[c];
            }
        }
    }
}

/// Write every image of the batch into `dst` as one contiguous NCHW tensor of
/// `images.len() x 3 x height x width` floats, queued on `stream`.
pub fn blob_from_images(
    images: &[DeviceImage],
    dst: &mut DeviceBuffer,
    width: u32,
    height: u32,
    norm: &Normalization,
    stream: &CudaStream,
) -> Result<(), DeviceError> {
    norm.validate()?;
    if width == 0 || height == 0 {
        return Err(DeviceError::InvalidArgument(format!(
            "target size must be positive, got {}x{}",
            width, height
        )));
    }

    let item_bytes = CHANNELS * width as usize * height as usize * std::mem::size_of::<f32>();
    let needed = item_bytes * images.len();
    if dst.len() < needed {
        return Err(DeviceError::InvalidArgument(format!(
            "input tensor needs {} bytes, buffer holds {}",
            needed,
            dst.len()
        )));
    }

    for (i, image) in images.iter().enumerate() {
        let out = dst.as_ptr().offset(i * item_bytes);
        let code = unsafe {
            ffi::vi_cuda_preprocess_u8c3(
                image.as_ptr().as_raw() as *const u8,
                image.width() as c_int,
                image.height() as c_int,
                image.pitch(),
                out.as_raw() as *mut f32,
                width as c_int,
                height as c_int,
                norm.subtract.as_ptr(),
                norm.divide.as_ptr(),
                stream.as_raw(),
            )
        };
        check("vi_cuda_preprocess_u8c3", code)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn interleaved(w: usize, h: usize, f: impl Fn(usize, usize, usize) -> u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    data.push(f(x, y, c));
                }
            }
        }
        data
    }

    #[test]
    fn test_same_size_is_planar_copy() {
        let src = interleaved(3, 2, |x, y, c| (x * 10 + y * 100 + c) as u8);
        let mut dst = vec![0.0f32; 3 * 3 * 2];
        preprocess_interleaved(&src, 3, 2, 9, &mut dst, 3, 2, &Normalization::default());

        // channel 1, row 1, column 2
        let expected = (2 * 10 + 100 + 1) as f32 / 255.0;
        assert!((dst[6 + 3 + 2] - expected).abs() < 1e-6);
        // channel 0, row 0, column 0
        assert_eq!(dst[0], 0.0);
    }

    #[test]
    fn test_normalization_applied_per_channel() {
        let src = interleaved(2, 2, |_, _, _| 255);
        let mut dst = vec![0.0f32; 12];
        let norm = Normalization::new([0.5, 0.0, 1.0], [0.5, 2.0, 1.0]);
        preprocess_interleaved(&src, 2, 2, 6, &mut dst, 2, 2, &norm);
        assert!(dst[0..4].iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(dst[4..8].iter().all(|v| (v - 0.5).abs() < 1e-6));
        assert!(dst[8..12].iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_downscale_averages_neighbours() {
        // 2x1 image: black then white; 1x1 output samples the midpoint.
        let src = vec![0, 0, 0, 255, 255, 255];
        let mut dst = vec![0.0f32; 3];
        preprocess_interleaved(&src, 2, 1, 6, &mut dst, 1, 1, &Normalization::default());
        assert!(dst.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_zero_divisor_rejected() {
        let norm = Normalization::new([0.0; 3], [1.0, 0.0, 1.0]);
        assert!(norm.validate().is_err());
        assert!(Normalization::imagenet().validate().is_ok());
    }

    #[test]
    fn test_blob_from_images_offsets_each_element() {
        let stream = CudaStream::new().unwrap();
        let images = vec![
            DeviceImage::filled(4, 4, [0, 0, 0]).unwrap(),
            DeviceImage::filled(8, 8, [255, 255, 255]).unwrap(),
        ];
        let mut blob = DeviceBuffer::alloc(2 * 3 * 2 * 2 * 4).unwrap();
        blob_from_images(&images, &mut blob, 2, 2, &Normalization::default(), &stream).unwrap();
        stream.synchronize().unwrap();

        let values = blob.download::<f32>().unwrap();
        assert!(values[..12].iter().all(|v| *v == 0.0));
        assert!(values[12..].iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_blob_from_images_checks_capacity() {
        let stream = CudaStream::new().unwrap();
        let images = vec![DeviceImage::filled(2, 2, [1, 1, 1]).unwrap()];
        let mut blob = DeviceBuffer::alloc(16).unwrap();
        let norm = Normalization::default();
        let err = blob_from_images(&images, &mut blob, 2, 2, &norm, &stream).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    proptest! {
        #[test]
        fn prop_constant_image_stays_constant(
            value in 0u8..=255,
            sw in 1usize..12,
            sh in 1usize..12,
            dw in 1usize..12,
            dh in 1usize..12,
        ) {
            let src = interleaved(sw, sh, |_, _, _| value);
            let mut dst = vec![0.0f32; 3 * dw * dh];
            let norm = Normalization::default();
            preprocess_interleaved(&src, sw, sh, sw * 3, &mut dst, dw, dh, &norm);
            let expected = value as f32 / 255.0;
            prop_assert!(dst.iter().all(|v| (v - expected).abs() < 1e-5));
        }
    }
}
