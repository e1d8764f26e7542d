//! Rolling pre-roll buffer.
//!
//! The buffer keeps the most recent `pre_roll` seconds of frames so a clip can
//! include footage from before the instant an alert fires. Eviction is lazy:
//! every push drops frames that fell out of the window. Readers either take an
//! owned snapshot (cheap, frames share pixel memory) or borrow a history view
//! for the duration of one analysis tick.

use crate::frame::Frame;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the rolling buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Out-of-order frame: {got:?} is not after {last:?}")]
    OutOfOrder { last: Duration, got: Duration },
}

/// Time-windowed frame store.
pub struct RollingBuffer {
    pre_roll: Duration,
    frames: RwLock<VecDeque<Frame>>,
    evicted: AtomicU64,
}

impl RollingBuffer {
    /// Create a buffer retaining `pre_roll` of history.
    pub fn new(pre_roll: Duration) -> Self {
        Self {
            pre_roll,
            frames: RwLock::new(VecDeque::new()),
            evicted: AtomicU64::new(0),
        }
    }

    /// Create a buffer pre-sized for a nominal frame rate.
    pub fn with_frame_rate(pre_roll: Duration, fps: f32) -> Self {
        let capacity = (pre_roll.as_secs_f32() * fps).ceil() as usize + 2;
        Self {
            pre_roll,
            frames: RwLock::new(VecDeque::with_capacity(capacity)),
            evicted: AtomicU64::new(0),
        }
    }

    /// Retention window.
    pub fn pre_roll(&self) -> Duration {
        self.pre_roll
    }

    /// Append a frame and evict anything older than the window.
    ///
    /// Frames must arrive in strictly increasing timestamp order.
    pub fn push(&self, frame: Frame) -> Result<(), BufferError> {
        let mut frames = self.frames.write();

        if let Some(last) = frames.back() {
            if frame.timestamp <= last.timestamp {
                return Err(BufferError::OutOfOrder {
                    last: last.timestamp,
                    got: frame.timestamp,
                });
            }
        }

        let cutoff = frame.timestamp.saturating_sub(self.pre_roll);
        frames.push_back(frame);

        let mut evicted = 0;
        while frames.front().is_some_and(|f| f.timestamp < cutoff) {
            frames.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.evicted.fetch_add(evicted, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Ordered copy of every retained frame.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.read().iter().cloned().collect()
    }

    /// Borrowed view of the retained frames.
    ///
    /// Holds a read lock; drop it before the next push.
    pub fn history(&self) -> HistoryView<'_> {
        HistoryView {
            frames: self.frames.read(),
        }
    }

    /// Most recent frame.
    pub fn latest(&self) -> Option<Frame> {
        self.frames.read().back().cloned()
    }

    /// Time covered between the oldest and newest retained frame.
    pub fn span(&self) -> Duration {
        span_of(&self.frames.read())
    }

    /// Number of retained frames.
    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }

    /// Frames evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Drop every retained frame.
    pub fn clear(&self) {
        self.frames.write().clear();
    }
}

/// Read-only view over the buffer for one analysis tick.
pub struct HistoryView<'a> {
    frames: RwLockReadGuard<'a, VecDeque<Frame>>,
}

impl<'a> HistoryView<'a> {
    /// Newest frame, normally the one being analyzed.
    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    /// Frame immediately before the newest one.
    pub fn previous(&self) -> Option<&Frame> {
        let len = self.frames.len();
        if len >= 2 {
            self.frames.get(len - 2)
        } else {
            None
        }
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn span(&self) -> Duration {
        span_of(&self.frames)
    }
}

fn span_of(frames: &VecDeque<Frame>) -> Duration {
    match (frames.front(), frames.back()) {
        (Some(first), Some(last)) => last.timestamp - first.timestamp,
        _ => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::solid_frame;
    use std::sync::Arc;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_push_and_len() {
        let buffer = RollingBuffer::new(secs(10));
        assert!(buffer.is_empty());
        buffer.push(solid_frame(0, 0.0, 0)).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.span(), Duration::ZERO);
    }

    #[test]
    fn test_window_bounded_by_pre_roll() {
        let buffer = RollingBuffer::with_frame_rate(secs(10), 1.0);
        for t in 0..100u64 {
            buffer.push(solid_frame(t, t as f64, 0)).unwrap();

            let snapshot = buffer.snapshot();
            let oldest = snapshot.first().unwrap().timestamp;
            let newest = snapshot.last().unwrap().timestamp;
            // never older than pre_roll, and covers pre_roll once available
            assert!(newest - oldest <= secs(10));
            if t >= 10 {
                assert_eq!(newest - oldest, secs(10));
            }
        }
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.evicted(), 89);
    }

    #[test]
    fn test_snapshot_contiguous_at_fractional_rate() {
        let buffer = RollingBuffer::new(secs(2));
        for i in 0..50u64 {
            buffer.push(solid_frame(i, i as f64 * 0.1, 0)).unwrap();
        }
        let snapshot = buffer.snapshot();
        for pair in snapshot.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
        let span = buffer.span();
        assert!(span <= Duration::from_millis(2100));
        assert!(span >= Duration::from_millis(1900));
    }

    #[test]
    fn test_snapshot_idempotent() {
        let buffer = RollingBuffer::new(secs(5));
        for t in 0..8u64 {
            buffer.push(solid_frame(t, t as f64, t as u8)).unwrap();
        }
        assert_eq!(buffer.snapshot(), buffer.snapshot());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let buffer = RollingBuffer::new(secs(5));
        buffer.push(solid_frame(0, 3.0, 0)).unwrap();
        let err = buffer.push(solid_frame(1, 3.0, 0)).unwrap_err();
        assert_eq!(
            err,
            BufferError::OutOfOrder {
                last: secs(3),
                got: secs(3)
            }
        );
        assert!(buffer.push(solid_frame(2, 2.0, 0)).is_err());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_stall_does_not_fabricate() {
        let buffer = RollingBuffer::new(secs(10));
        for t in 0..5u64 {
            buffer.push(solid_frame(t, t as f64, 0)).unwrap();
        }
        // a 60s gap evicts history but adds nothing
        buffer.push(solid_frame(5, 65.0, 0)).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.latest().unwrap().sequence, 5);
    }

    #[test]
    fn test_history_view() {
        let buffer = RollingBuffer::new(secs(10));
        {
            let history = buffer.history();
            assert!(history.previous().is_none());
            assert!(history.latest().is_none());
        }
        buffer.push(solid_frame(0, 0.0, 0)).unwrap();
        buffer.push(solid_frame(1, 1.0, 0)).unwrap();

        let history = buffer.history();
        assert_eq!(history.latest().unwrap().sequence, 1);
        assert_eq!(history.previous().unwrap().sequence, 0);
        assert_eq!(history.iter().count(), 2);
        assert_eq!(history.span(), secs(1));
    }

    #[test]
    fn test_snapshot_concurrent_with_push() {
        let buffer = Arc::new(RollingBuffer::new(secs(3)));
        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for i in 0..2000u64 {
                    buffer.push(solid_frame(i, i as f64 * 0.01, 0)).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let snapshot = buffer.snapshot();
            for pair in snapshot.windows(2) {
                assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            }
        }
        writer.join().unwrap();
    }
}
