//! # Camera Stream Module
//!
//! This module provides the stereo camera stream, which presents two capture workers (or one
//! worker on a side-by-side stereo module) as a single source of left/right frame pairs.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use crate::capture::CaptureWorker;
use crate::error::{Error, Result};
use crate::frame::{RawFrame, StereoFrame};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Default upper bound on a single wait for a frame before liveness is rechecked.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

pub trait CamStream {
    type Frame;

    /// Capture a frame from the camera stream.
    fn capture(&mut self) -> Result<Self::Frame>;
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTS
// -----------------------------------------------------------------------------------------------

pub struct StereoCamStream {
    rig: Rig,
    poll_interval: Duration,

    /// Set from another thread to make a waiting read give up
    interrupt: Arc<AtomicBool>,
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// How the two views reach the host.
enum Rig {
    /// One device per camera
    Dual {
        left: CaptureWorker,
        right: CaptureWorker,
    },

    /// Both sensors delivered as one frame, left half then right half
    SideBySide(CaptureWorker),
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl StereoCamStream {
    /// Create a stream from two independently clocked cameras.
    pub fn new(left: CaptureWorker, right: CaptureWorker) -> Self {
        Self {
            rig: Rig::Dual { left, right },
            poll_interval: DEFAULT_POLL_INTERVAL,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a stream from a single device delivering both views side by side.
    pub fn side_by_side(worker: CaptureWorker) -> Self {
        Self {
            rig: Rig::SideBySide(worker),
            poll_interval: DEFAULT_POLL_INTERVAL,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set how long one wait for a frame may last before liveness is rechecked.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Share `flag` as the interrupt flag, a waiting read returns `false` once it is set.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = flag;
    }

    /// Make any current or future read return `false` within one poll interval.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Drop any frame deposited before this call, so the next read only sees newer frames.
    pub fn discard_pending(&self) {
        match &self.rig {
            Rig::Dual { left, right } => {
                left.buffer().clear();
                right.buffer().clear();
            }
            Rig::SideBySide(worker) => worker.buffer().clear(),
        }
    }

    /// Read the latest frame of each camera into `left` and `right`.
    ///
    /// Waits while one side has not produced a new frame yet, in steps bounded by the poll
    /// interval so a closed camera is noticed promptly. The two frames are each the most recent
    /// of their device, no common hardware timestamp is implied.
    ///
    /// A device which stays open but stops delivering frames keeps the read waiting until the
    /// stream is interrupted.
    ///
    /// # Returns
    /// - `true` once both frames were read, `false` as soon as either camera is closed or the
    ///   stream is interrupted
    pub fn read_pair(&self, left: &mut RawFrame, right: &mut RawFrame) -> bool {
        match &self.rig {
            Rig::Dual {
                left: left_worker,
                right: right_worker,
            } => {
                let mut have_left = false;
                let mut have_right = false;

                while !(have_left && have_right) {
                    if self.is_interrupted() || !left_worker.is_open() || !right_worker.is_open() {
                        return false;
                    }

                    if !have_left {
                        have_left = left_worker.buffer().take_timeout(left, self.poll_interval);
                    }
                    if !have_right {
                        have_right = right_worker.buffer().take_timeout(right, self.poll_interval);
                    }
                }

                // One side may have been waited on long enough for the other to move on
                left_worker.buffer().take(left);
                right_worker.buffer().take(right);

                true
            }
            Rig::SideBySide(worker) => {
                let mut combined = RawFrame::default();

                loop {
                    if self.is_interrupted() || !worker.is_open() {
                        return false;
                    }
                    if worker.buffer().take_timeout(&mut combined, self.poll_interval) {
                        break;
                    }
                }

                match combined.split_side_by_side() {
                    Some((l, r)) => {
                        *left = l;
                        *right = r;
                        true
                    }
                    None => {
                        error!(
                            "Camera {} delivered a {}x{} frame which cannot be split into two views",
                            worker.name(),
                            combined.width(),
                            combined.height()
                        );
                        false
                    }
                }
            }
        }
    }

    /// Whether every camera of the rig is still acquiring.
    pub fn is_open(&self) -> bool {
        match &self.rig {
            Rig::Dual { left, right } => left.is_open() && right.is_open(),
            Rig::SideBySide(worker) => worker.is_open(),
        }
    }

    /// The reason the first closed camera gave, if any closed by itself.
    pub fn failure(&self) -> Option<String> {
        match &self.rig {
            Rig::Dual { left, right } => left
                .failure()
                .map(|f| format!("{}: {}", left.name(), f))
                .or_else(|| right.failure().map(|f| format!("{}: {}", right.name(), f))),
            Rig::SideBySide(worker) => worker.failure().map(|f| format!("{}: {}", worker.name(), f)),
        }
    }

    /// Stop both cameras, releasing their devices before returning.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        match &self.rig {
            Rig::Dual { left, right } => {
                left.stop();
                right.stop();
            }
            Rig::SideBySide(worker) => worker.stop(),
        }
        info!("Stereo stream stopped");
    }
}

impl CamStream for StereoCamStream {
    type Frame = StereoFrame;

    /// Capture a frame from the pair of stereo cameras.
    fn capture(&mut self) -> Result<Self::Frame> {
        let mut frame = StereoFrame::default();

        if self.read_pair(&mut frame.left, &mut frame.right) {
            Ok(frame)
        } else {
            Err(Error::StreamClosed)
        }
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
