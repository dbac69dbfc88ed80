//! Images resident in device memory

use crate::buffer::{DeviceBuffer, DevicePtr};
use crate::error::DeviceError;

/// Channels per pixel of a [`DeviceImage`]
pub const CHANNELS: usize = 3;

/// 8-bit, 3-channel interleaved image in device memory.
///
/// Rows are tightly packed (`pitch == width * 3`). Channel order is whatever
/// the producer uploaded; no colour conversion happens here.
#[derive(Debug)]
pub struct DeviceImage {
    buffer: DeviceBuffer,
    width: u32,
    height: u32,
}

impl DeviceImage {
    /// Upload interleaved pixel data (`width * height * 3` bytes)
    pub fn upload(data: &[u8], width: u32, height: u32) -> Result<Self, DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "image dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(DeviceError::InvalidArgument(format!(
                "{}x{} image needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            buffer: DeviceBuffer::from_host(data)?,
            width,
            height,
        })
    }

    /// Image where every pixel has the same value
    pub fn filled(width: u32, height: u32, pixel: [u8; CHANNELS]) -> Result<Self, DeviceError> {
        let data: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * CHANNELS)
            .collect();
        Self::upload(&data, width, height)
    }

    /// Copy the pixels back to host memory
    pub fn download(&self) -> Result<Vec<u8>, DeviceError> {
        self.buffer.download::<u8>()
    }

    /// Device-side copy of this image
    pub fn try_clone(&self) -> Result<Self, DeviceError> {
        Ok(Self {
            buffer: self.buffer.try_clone()?,
            width: self.width,
            height: self.height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes per row
    pub fn pitch(&self) -> usize {
        self.width as usize * CHANNELS
    }

    pub fn as_ptr(&self) -> DevicePtr {
        self.buffer.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_checks_length() {
        let err = DeviceImage::upload(&[0u8; 10], 2, 2).unwrap_err();
        assert!(err.to_string().contains("needs 12 bytes"));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(DeviceImage::upload(&[], 0, 4).is_err());
    }

    #[test]
    fn test_filled_image() {
        let image = DeviceImage::filled(4, 2, [10, 20, 30]).unwrap();
        assert_eq!(image.dimensions(), (4, 2));
        assert_eq!(image.pitch(), 12);
        let pixels = image.download().unwrap();
        assert_eq!(pixels.len(), 24);
        assert_eq!(&pixels[3..6], &[10, 20, 30]);
    }

    #[test]
    fn test_try_clone_is_independent_allocation() {
        let image = DeviceImage::filled(2, 2, [1, 2, 3]).unwrap();
        let copy = image.try_clone().unwrap();
        assert_ne!(copy.as_ptr(), image.as_ptr());
        assert_eq!(copy.download().unwrap(), image.download().unwrap());
    }
}
