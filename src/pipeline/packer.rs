//! Planar frame packing
//!
//! Copies the three I420 planes of a caller-owned frame into one freshly
//! allocated contiguous buffer, Y then U then V, each plane contributing
//! `stride * rows` bytes with no gaps between planes.

use bytes::Bytes;
use std::fmt;

use crate::error::{Result, SinkError};
use crate::frame::{PixelFormat, VideoFrame};

/// Exclusively owned, contiguous copy of a frame ready for the engine
///
/// Ownership moves into the engine on ingest.
#[derive(Clone, PartialEq, Eq)]
pub struct PackedBuffer {
    data: Bytes,
}

impl PackedBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Hand the underlying bytes to whoever consumes the buffer
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl AsRef<[u8]> for PackedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PackedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Byte count of the packed representation of `frame`
///
/// Always derived from the frame being packed, never cached.
pub fn packed_len(frame: &VideoFrame<'_>) -> Result<usize> {
    let mut total = 0usize;
    for (index, plane) in frame.planes.iter().enumerate() {
        let bytes = plane
            .stride
            .checked_mul(frame.plane_rows(index))
            .ok_or_else(|| SinkError::InvalidFrame(format!("plane {} size overflows", index)))?;
        total = total
            .checked_add(bytes)
            .ok_or_else(|| SinkError::InvalidFrame("frame size overflows".into()))?;
    }
    Ok(total)
}

/// Check that `frame` can be packed, returning the packed length
///
/// Runs before anything touches the pipeline, so a malformed frame is
/// rejected without disturbing the session.
pub fn validate(frame: &VideoFrame<'_>) -> Result<usize> {
    if frame.format != PixelFormat::I420 {
        return Err(SinkError::UnsupportedFormat(frame.format));
    }
    if frame.size.is_empty() {
        return Err(SinkError::InvalidFrame(format!(
            "empty frame {}",
            frame.size
        )));
    }

    for (index, plane) in frame.planes.iter().enumerate() {
        let width = frame.plane_width(index);
        if plane.stride < width {
            return Err(SinkError::InvalidFrame(format!(
                "plane {} stride {} is below its row width {}",
                index, plane.stride, width
            )));
        }
    }

    let size = packed_len(frame)?;
    for (index, plane) in frame.planes.iter().enumerate() {
        let needed = plane.stride * frame.plane_rows(index);
        if plane.data.len() < needed {
            return Err(SinkError::InvalidFrame(format!(
                "plane {} holds {} bytes, {} expected for stride {}",
                index,
                plane.data.len(),
                needed,
                plane.stride
            )));
        }
    }
    Ok(size)
}

/// Pack an I420 frame into a single contiguous buffer
pub fn pack(frame: &VideoFrame<'_>) -> Result<PackedBuffer> {
    let size = validate(frame)?;

    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|_| SinkError::OutOfMemory { size })?;

    for (index, plane) in frame.planes.iter().enumerate() {
        let bytes = plane.stride * frame.plane_rows(index);
        data.extend_from_slice(&plane.data[..bytes]);
    }
    debug_assert_eq!(data.len(), size);

    Ok(PackedBuffer {
        data: Bytes::from(data),
    })
}
