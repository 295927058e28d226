//! Raw video frame views handed in by the calling media engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel layouts a caller may hand over
///
/// Only [`PixelFormat::I420`] is accepted by the sink, the others exist so
/// that a mismatch can be reported precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar 4:2:0, Y plane followed by U and V at half resolution
    I420,
    /// Semi-planar 4:2:0 with interleaved chroma
    Nv12,
    /// Packed 32 bit BGRA
    Bgra,
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of rows in each chroma plane (floor of half the height)
    pub fn chroma_rows(&self) -> usize {
        self.height as usize / 2
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for FrameSize {
    type Err = String;

    /// Parses `WIDTHxHEIGHT`, e.g. `640x480`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("bad width '{}': {}", w, e))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("bad height '{}': {}", h, e))?;
        Ok(Self { width, height })
    }
}

/// One image plane: row data plus the distance in bytes between rows
#[derive(Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

impl<'a> Plane<'a> {
    pub fn new(data: &'a [u8], stride: usize) -> Self {
        Self { data, stride }
    }
}

/// Borrowed view of a decoded frame
///
/// The caller keeps ownership of the plane memory; it only has to stay
/// valid for the duration of a single display call.
#[derive(Clone, Copy)]
pub struct VideoFrame<'a> {
    pub format: PixelFormat,
    pub size: FrameSize,
    /// Y, U, V
    pub planes: [Plane<'a>; 3],
}

impl<'a> VideoFrame<'a> {
    /// Build an I420 frame view from its three planes
    pub fn i420(size: FrameSize, y: Plane<'a>, u: Plane<'a>, v: Plane<'a>) -> Self {
        Self {
            format: PixelFormat::I420,
            size,
            planes: [y, u, v],
        }
    }

    /// Visible bytes per row of plane `index`
    pub fn plane_width(&self, index: usize) -> usize {
        let width = self.size.width as usize;
        if index == 0 { width } else { width.div_ceil(2) }
    }

    /// Rows stored in plane `index`
    pub fn plane_rows(&self, index: usize) -> usize {
        if index == 0 {
            self.size.height as usize
        } else {
            self.size.chroma_rows()
        }
    }
}

impl fmt::Debug for VideoFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("format", &self.format)
            .field("size", &self.size)
            .field(
                "strides",
                &[
                    self.planes[0].stride,
                    self.planes[1].stride,
                    self.planes[2].stride,
                ],
            )
            .finish()
    }
}

/// Owned I420 image with tightly packed rows
///
/// Handy for producers that generate frames themselves (test patterns,
/// synthetic sources) rather than receiving them from a decoder.
#[derive(Clone)]
pub struct I420Image {
    pub size: FrameSize,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl I420Image {
    /// Black image of the given size
    pub fn black(size: FrameSize) -> Self {
        let (y_stride, c_stride) = Self::strides(size);
        Self {
            size,
            y: vec![16; y_stride * size.height as usize],
            u: vec![128; c_stride * size.chroma_rows()],
            v: vec![128; c_stride * size.chroma_rows()],
        }
    }

    /// Luma and chroma line strides
    pub fn strides(size: FrameSize) -> (usize, usize) {
        let w = size.width as usize;
        (w, w.div_ceil(2))
    }

    pub fn as_frame(&self) -> VideoFrame<'_> {
        let (y_stride, c_stride) = Self::strides(self.size);
        VideoFrame::i420(
            self.size,
            Plane::new(&self.y, y_stride),
            Plane::new(&self.u, c_stride),
            Plane::new(&self.v, c_stride),
        )
    }
}
