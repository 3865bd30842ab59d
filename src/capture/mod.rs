//! Screen capture delivery module
//!
//! Turns raw samples delivered by a platform capture source into packed RGB
//! frames handed to a consumer sink, with pooled buffers and backpressure-aware
//! frame dropping. One `CaptureStream` exists per logical stream.

pub mod convert;
pub mod display;
pub mod dropper;
pub mod frame_pool;
pub mod generic;
pub mod stream;
mod traits;

use crate::assets::SOURCE_BYTES_PER_PIXEL;

/// Byte order of a 4-byte source pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelLayout {
    /// A, R, G, B (native format of the capture source).
    #[default]
    Argb,
    /// B, G, R, A (Windows Graphics Capture, PipeWire BGRx).
    Bgra,
}

impl PixelLayout {
    /// Byte offsets of the red, green and blue channels inside one pixel.
    #[inline]
    pub(crate) fn rgb_offsets(self) -> (usize, usize, usize) {
        match self {
            PixelLayout::Argb => (1, 2, 3),
            PixelLayout::Bgra => (2, 1, 0),
        }
    }
}

/// One platform-delivered image, valid only for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct RawSample<'a> {
    pub width: u32,
    pub height: u32,
    /// Source stride; may exceed `width * 4` when rows are padded.
    pub bytes_per_row: usize,
    pub data: &'a [u8],
    pub layout: PixelLayout,
}

impl<'a> RawSample<'a> {
    pub fn new(width: u32, height: u32, bytes_per_row: usize, data: &'a [u8]) -> Self {
        Self {
            width,
            height,
            bytes_per_row,
            data,
            layout: PixelLayout::Argb,
        }
    }

    pub fn with_layout(mut self, layout: PixelLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Minimum number of source bytes the dimensions and stride require.
    pub fn required_len(&self) -> Option<usize> {
        if self.width == 0 || self.height == 0 {
            return Some(0);
        }
        let row = (self.width as usize).checked_mul(SOURCE_BYTES_PER_PIXEL)?;
        let full_rows = self.bytes_per_row.checked_mul(self.height as usize - 1)?;
        full_rows.checked_add(row)
    }

    /// Checks the sample against its own dimensions before conversion.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!("empty sample {}x{}", self.width, self.height));
        }
        let row = self.width as usize * SOURCE_BYTES_PER_PIXEL;
        if self.bytes_per_row < row {
            return Err(format!(
                "stride {} shorter than row of {} bytes",
                self.bytes_per_row, row
            ));
        }
        match self.required_len() {
            Some(required) if required <= self.data.len() => Ok(()),
            Some(required) => Err(format!(
                "sample holds {} bytes, {}x{} with stride {} needs {}",
                self.data.len(),
                self.width,
                self.height,
                self.bytes_per_row,
                required
            )),
            None => Err("sample dimensions overflow".to_string()),
        }
    }

    /// Byte length of the converted RGB frame.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * crate::assets::FRAME_BYTES_PER_PIXEL
    }
}

/// A converted RGB888 frame, borrowed for the duration of one sink call.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub width: u32,
    pub height: u32,
    pub data: &'a [u8],
    /// Sequence number of the frame within its stream.
    pub sequence: u64,
}

impl Frame<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy the pixels out when the consumer needs them past the callback.
    pub fn to_bytes(&self) -> bytes::Bytes {
        bytes::Bytes::copy_from_slice(self.data)
    }
}

pub use convert::convert;
pub use display::{DisplayCatalog, DisplayDescriptor, StaticCatalog};
pub use dropper::{DropPolicy, DropStats, FrameDropper};
pub use frame_pool::{BufferLease, BufferPool, PoolLimits, PoolStats, PooledBuffer};
pub use generic::SyntheticSource;
pub use stream::{CaptureStream, StartCompletion, StreamInput, StreamOptions};
pub use traits::{CaptureHandle, CaptureSource, FrameSink, StopObserver, StreamStopped};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_len_with_padding() {
        let data = [0u8; 32];
        let sample = RawSample::new(2, 2, 16, &data);
        assert_eq!(sample.required_len(), Some(16 + 8));
        assert!(sample.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_buffers() {
        let data = [0u8; 20];
        assert!(RawSample::new(2, 2, 16, &data).validate().is_err());
        assert!(RawSample::new(4, 1, 8, &data).validate().is_err());
        assert!(RawSample::new(0, 1, 8, &data).validate().is_err());
    }

    #[test]
    fn test_frame_to_bytes() {
        let pixels = [1u8, 2, 3];
        let frame = Frame {
            width: 1,
            height: 1,
            data: &pixels,
            sequence: 0,
        };
        assert_eq!(frame.len(), 3);
        assert_eq!(&frame.to_bytes()[..], &pixels);
    }
}
