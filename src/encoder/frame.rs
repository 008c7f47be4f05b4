//! Captured frame types
//!
//! A [`VideoFrame`] is the owned result of the (external) capture/copy step.
//! The pipeline never looks inside the pixel data; it only moves the frame
//! into a slot and lends it to the backend at submission time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Packed pixel layouts accepted by the built-in backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Blue, Green, Red, Alpha (8 bits each)
    Bgra8888,
    /// Red, Green, Blue, Alpha (8 bits each)
    Rgba8888,
    /// Blue, Green, Red, padding
    Bgrx8888,
    /// Red, Green, Blue, padding
    Rgbx8888,
}

impl PixelFormat {
    /// Bytes per pixel for this format
    pub const fn bytes_per_pixel(&self) -> usize {
        4
    }

    /// Whether the fourth byte carries alpha
    pub const fn has_alpha(&self) -> bool {
        matches!(self, Self::Bgra8888 | Self::Rgba8888)
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count
    pub const fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Both dimensions non-zero and even (4:2:0 chroma requirement)
    pub const fn is_encodable(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An owned, fully captured frame
///
/// Cloning is cheap: pixel data is reference counted.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Bytes,
    resolution: Resolution,
    stride: usize,
    format: PixelFormat,
}

impl VideoFrame {
    /// Wrap tightly packed pixel data (stride = width * bpp)
    pub fn new(data: impl Into<Bytes>, resolution: Resolution, format: PixelFormat) -> Self {
        let stride = resolution.width as usize * format.bytes_per_pixel();
        Self::with_stride(data, resolution, stride, format)
    }

    /// Wrap pixel data with an explicit row stride
    pub fn with_stride(
        data: impl Into<Bytes>,
        resolution: Resolution,
        stride: usize,
        format: PixelFormat,
    ) -> Self {
        Self {
            data: data.into(),
            resolution,
            stride,
            format,
        }
    }

    /// Raw pixel bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Frame dimensions
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Pixel layout
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Minimum buffer length for the declared geometry
    pub fn expected_len(&self) -> usize {
        if self.resolution.height == 0 {
            return 0;
        }
        self.stride * (self.resolution.height as usize - 1)
            + self.resolution.width as usize * self.format.bytes_per_pixel()
    }

    /// Whether the buffer is large enough for the declared geometry
    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.expected_len()
    }

    /// Synthetic BGRA frame with a moving gradient
    ///
    /// Consecutive `frame_num`s differ everywhere, which gives delta coders
    /// realistic work.
    pub fn test_pattern(resolution: Resolution, frame_num: u32) -> Self {
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        let offset = frame_num as usize * 10;
        let mut data = vec![0u8; width * height * 4];

        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) * 4;
                data[idx] = (((x + offset) * 255) / width) as u8;
                data[idx + 1] = (((y + offset) * 255) / height) as u8;
                data[idx + 2] = ((128 + frame_num as usize * 5) % 256) as u8;
                data[idx + 3] = 255;
            }
        }
        Self::new(data, resolution, PixelFormat::Bgra8888)
    }

    /// Iterate over visible rows, skipping stride padding
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        let row_len = self.resolution.width as usize * self.format.bytes_per_pixel();
        let stride = self.stride.max(1);
        self.data
            .chunks(stride)
            .take(self.resolution.height as usize)
            .map(move |row| &row[..row_len.min(row.len())])
    }
}
