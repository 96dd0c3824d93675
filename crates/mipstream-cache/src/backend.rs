//! Collaborator Interfaces
//!
//! The cache never talks to the network, a codec or a graphics API directly.
//! It consumes these traits and moves the value types below between them.

use serde::{Deserialize, Serialize};

use crate::{CacheError, CacheResult, TextureKey};

/// Where decoded pixels came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImageSource {
    /// Delivered by the transport; dimensions must be powers of two
    #[default]
    Network,
    /// Produced locally or offline; may be padded to a power of two
    Local,
}

/// Decoded pixels at one discard level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawImage {
    /// Width at `discard_level`
    pub width: u32,
    /// Height at `discard_level`
    pub height: u32,
    /// Bytes per pixel, 1 through 4
    pub components: u8,
    /// Level these pixels represent
    pub discard_level: u8,
    /// Width at level 0
    pub full_width: u32,
    /// Height at level 0
    pub full_height: u32,
    /// Origin of the pixels
    pub source: ImageSource,
    /// Tightly packed rows
    pub data: Vec<u8>,
}

impl RawImage {
    /// Expected payload length for the declared dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.components as usize
    }

    /// Size of the pixel buffer
    pub fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// GPU pixel layout derived from the component count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    R8,
    Rg8,
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    /// Layout for a component count
    pub fn from_components(components: u8) -> CacheResult<Self> {
        match components {
            1 => Ok(Self::R8),
            2 => Ok(Self::Rg8),
            3 => Ok(Self::Rgb8),
            4 => Ok(Self::Rgba8),
            other => Err(CacheError::Unsupported(format!(
                "{} components per pixel",
                other
            ))),
        }
    }

    /// Bytes per pixel
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::R8 => 1,
            Self::Rg8 => 2,
            Self::Rgb8 => 3,
            Self::Rgba8 => 4,
        }
    }
}

/// Ready-to-upload payload produced by creation assembly
#[derive(Debug, Clone, PartialEq)]
pub struct UploadImage {
    pub key: TextureKey,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub discard_level: u8,
    /// True when the source was expanded to a power of two
    pub padded: bool,
    pub data: Vec<u8>,
}

impl UploadImage {
    /// Size of the pixel buffer
    pub fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Opaque handle to a GPU texture object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuHandle(pub u64);

/// Delivers compressed bytes for a texture level
///
/// Called from fetch workers; implementations may block.
pub trait Transport: Send + Sync {
    /// Fetch the encoded bytes for `key` at `level`
    fn fetch(&self, key: TextureKey, level: u8) -> CacheResult<Vec<u8>>;

    /// Advisory cancellation; in-flight requests may still complete
    fn cancel(&self, _key: TextureKey) {}
}

/// Turns transport bytes into pixels
pub trait Codec: Send + Sync {
    /// Decode `bytes` that were fetched for `level`
    fn decode(&self, bytes: &[u8], level: u8) -> CacheResult<RawImage>;
}

/// Render-thread graphics layer
///
/// Not `Send`: a scheduler that owns a device stays on the thread that built it.
pub trait GpuDevice {
    /// Allocate and fill a texture object
    fn upload(&mut self, image: &UploadImage) -> CacheResult<GpuHandle>;

    /// Release a texture object
    fn free(&mut self, handle: GpuHandle);

    /// Bytes charged against the budget for an upload
    fn allocation_size(&self, image: &UploadImage) -> u64 {
        image.byte_len()
    }

    /// Detected memory ceiling, if the device can report one
    fn memory_ceiling(&self) -> Option<u64> {
        None
    }
}

/// Allocation or free reported to the accounting callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountingEvent {
    Allocated { key: TextureKey, handle: GpuHandle, bytes: u64 },
    Freed { key: TextureKey, handle: GpuHandle, bytes: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format() {
        assert_eq!(PixelFormat::from_components(1).unwrap(), PixelFormat::R8);
        assert_eq!(PixelFormat::from_components(4).unwrap().bytes_per_pixel(), 4);
        assert!(matches!(
            PixelFormat::from_components(5),
            Err(CacheError::Unsupported(_))
        ));
        assert!(PixelFormat::from_components(0).is_err());
    }

    #[test]
    fn test_raw_image_len() {
        let image = RawImage {
            width: 4,
            height: 2,
            components: 3,
            discard_level: 0,
            full_width: 4,
            full_height: 2,
            source: ImageSource::Network,
            data: vec![0; 24],
        };
        assert_eq!(image.expected_len(), 24);
        assert_eq!(image.byte_len(), 24);
    }
}
