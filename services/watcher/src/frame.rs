//! Captured video frames.
//!
//! Frames are immutable once built. Pixel data is reference counted so a
//! buffer snapshot or a clip job can hold a frame without copying pixels.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Bytes per RGB24 pixel.
pub const BYTES_PER_PIXEL: usize = 3;

/// Errors raised when building a frame from raw data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame data size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Frame dimensions must be non-zero")]
    EmptyDimensions,
}

/// A decoded RGB24 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number assigned by the source
    pub sequence: u64,

    /// Monotonic capture time since the source epoch
    pub timestamp: Duration,

    /// Wall-clock capture time, used for file names and overlays
    pub captured_at: DateTime<Utc>,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Packed RGB24 pixel data, row major
    pub data: Bytes,
}

impl Frame {
    /// Build a frame, checking that the pixel data matches the dimensions.
    pub fn new(
        sequence: u64,
        timestamp: Duration,
        captured_at: DateTime<Utc>,
        width: u32,
        height: u32,
        data: impl Into<Bytes>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions);
        }

        let data = data.into();
        let expected = frame_size(width, height);
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            sequence,
            timestamp,
            captured_at,
            width,
            height,
            data,
        })
    }

    /// RGB value at `(x, y)`.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * self.width + x) as usize) * BYTES_PER_PIXEL;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Same frame metadata with replacement pixel data of the same size.
    pub fn with_data(&self, data: impl Into<Bytes>) -> Result<Self, FrameError> {
        Self::new(
            self.sequence,
            self.timestamp,
            self.captured_at,
            self.width,
            self.height,
            data,
        )
    }

    /// Timestamp in fractional seconds.
    pub fn seconds(&self) -> f64 {
        self.timestamp.as_secs_f64()
    }
}

/// Size in bytes of an RGB24 frame.
pub fn frame_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_checked() {
        let err = Frame::new(0, Duration::ZERO, Utc::now(), 4, 4, vec![0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            FrameError::SizeMismatch {
                expected: 48,
                actual: 10
            }
        );
    }

    #[test]
    fn test_empty_dimensions_rejected() {
        let err = Frame::new(0, Duration::ZERO, Utc::now(), 0, 4, Vec::<u8>::new()).unwrap_err();
        assert_eq!(err, FrameError::EmptyDimensions);
    }

    #[test]
    fn test_pixel_lookup() {
        let mut data = vec![0u8; frame_size(2, 2)];
        // (1, 1) is the last pixel
        data[9] = 10;
        data[10] = 20;
        data[11] = 30;
        let frame = Frame::new(7, Duration::from_secs(3), Utc::now(), 2, 2, data).unwrap();
        assert_eq!(frame.pixel(1, 1), [10, 20, 30]);
        assert_eq!(frame.pixel(0, 0), [0, 0, 0]);
        assert_eq!(frame.seconds(), 3.0);
    }

    #[test]
    fn test_with_data_keeps_metadata() {
        let frame = Frame::new(1, Duration::from_secs(1), Utc::now(), 1, 1, vec![1, 2, 3]).unwrap();
        let copy = frame.with_data(vec![9, 9, 9]).unwrap();
        assert_eq!(copy.sequence, 1);
        assert_eq!(copy.captured_at, frame.captured_at);
        assert_eq!(copy.pixel(0, 0), [9, 9, 9]);
        assert!(frame.with_data(vec![0u8; 6]).is_err());
    }
}
