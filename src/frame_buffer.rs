//! # Frame Buffer Module
//!
//! A single-slot, latest-frame-wins cell shared between a capture worker and its reader.
//!
//! The slot is guarded by a mutex which is only held for one copy in or one copy out, never
//! across a device grab. A condition variable lets readers sleep until a frame is deposited
//! instead of spinning.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::frame::RawFrame;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Holds the most recent frame from one device plus a freshness flag.
#[derive(Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
    deposited: Condvar,
}

#[derive(Default)]
struct Slot {
    frame: RawFrame,
    fresh: bool,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame and mark it fresh.
    ///
    /// Never waits for a reader, an unread frame is simply overwritten.
    pub fn deposit(&self, frame: RawFrame) {
        {
            let mut slot = self.lock();
            slot.frame = frame;
            slot.fresh = true;
        }
        self.deposited.notify_all();
    }

    /// Copy the stored frame into `out` if it is fresh, clearing the fresh flag.
    ///
    /// # Returns
    /// - `true` if a frame was copied, `false` if nothing new was deposited since the last take
    pub fn take(&self, out: &mut RawFrame) -> bool {
        let mut slot = self.lock();
        Self::take_from(&mut slot, out)
    }

    /// As [`FrameBuffer::take`], but waits up to `timeout` for a fresh frame to be deposited.
    pub fn take_timeout(&self, out: &mut RawFrame, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();

        while !slot.fresh {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            slot = match self.deposited.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        Self::take_from(&mut slot, out)
    }

    /// Mark the stored frame as already read.
    pub fn clear(&self) {
        self.lock().fresh = false;
    }

    /// Whether an unread frame is waiting in the slot.
    pub fn is_fresh(&self) -> bool {
        self.lock().fresh
    }

    /// Wake any reader blocked in [`FrameBuffer::take_timeout`] so it can recheck liveness.
    pub fn wake(&self) {
        self.deposited.notify_all();
    }

    fn take_from(slot: &mut Slot, out: &mut RawFrame) -> bool {
        if !slot.fresh {
            return false;
        }

        out.clone_from(&slot.frame);
        slot.fresh = false;

        true
    }

    /// A panicking writer can only leave a complete frame behind, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn solid(value: u8, sequence: u64) -> RawFrame {
        let mut frame = RawFrame::new(RgbImage::from_pixel(4, 3, Rgb([value, value, value])), 0);
        frame.sequence = sequence;
        frame
    }

    /// A take before any deposit reports nothing available
    #[test]
    fn test_take_before_deposit() {
        let buffer = FrameBuffer::new();
        let mut out = RawFrame::default();

        assert!(!buffer.take(&mut out));
        assert!(out.is_empty());
    }

    /// A deposited frame is returned exactly once
    #[test]
    fn test_take_once() {
        let buffer = FrameBuffer::new();
        let mut out = RawFrame::default();

        buffer.deposit(solid(42, 1));
        assert!(buffer.is_fresh());

        assert!(buffer.take(&mut out));
        assert_eq!(out, solid(42, 1));

        assert!(!buffer.take(&mut out));
        assert!(!buffer.is_fresh());
        // A failed take leaves the output untouched
        assert_eq!(out.sequence, 1);
    }

    #[test]
    fn test_clear_discards_pending() {
        let buffer = FrameBuffer::new();
        let mut out = RawFrame::default();

        buffer.deposit(solid(7, 1));
        buffer.clear();
        assert!(!buffer.take(&mut out));

        buffer.deposit(solid(8, 2));
        assert!(buffer.take(&mut out));
        assert_eq!(out.sequence, 2);
    }

    /// Unread frames are overwritten, only the newest is observed
    #[test]
    fn test_latest_frame_wins() {
        let buffer = FrameBuffer::new();
        let mut out = RawFrame::default();

        for seq in 1..=5 {
            buffer.deposit(solid(seq as u8, seq));
        }

        assert!(buffer.take(&mut out));
        assert_eq!(out.sequence, 5);
        assert!(!buffer.take(&mut out));
    }

    #[test]
    fn test_take_timeout_expires() {
        let buffer = FrameBuffer::new();
        let mut out = RawFrame::default();

        let start = Instant::now();
        assert!(!buffer.take_timeout(&mut out, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_take_timeout_wakes_on_deposit() {
        let buffer = Arc::new(FrameBuffer::new());
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                buffer.deposit(solid(9, 3));
            })
        };

        let mut out = RawFrame::default();
        assert!(buffer.take_timeout(&mut out, Duration::from_secs(5)));
        assert_eq!(out.sequence, 3);

        producer.join().unwrap();
    }

    /// Concurrent readers never observe a frame whose pixels disagree with its sequence number
    #[test]
    fn test_no_torn_frames() {
        let buffer = Arc::new(FrameBuffer::new());
        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let buffer = buffer.clone();
            let done = done.clone();
            thread::spawn(move || {
                for seq in 1..=2000u64 {
                    buffer.deposit(solid((seq % 251) as u8, seq));
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut out = RawFrame::default();
        let mut last = 0;
        while !done.load(Ordering::SeqCst) || buffer.is_fresh() {
            if buffer.take(&mut out) {
                let expected = (out.sequence % 251) as u8;
                assert!(out.image.pixels().all(|p| *p == Rgb([expected; 3])));
                assert!(out.sequence > last);
                last = out.sequence;
            }
        }
        producer.join().unwrap();

        assert_eq!(last, 2000);
    }
}
