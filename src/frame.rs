//! # Frame types
//!
//! Raw frames as deposited by the capture workers and the left/right pairs handed to consumers.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::time::{SystemTime, UNIX_EPOCH};

use derive_more::Display;
use image::{imageops, RgbImage};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A dense 8-bit, 3 channel image tagged with its capture sequence number and timestamp.
///
/// The default frame is empty (0x0), which is what a buffer holds before the first capture.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    /// Pixel data
    pub image: RgbImage,

    /// Monotonically increasing per-device sequence number, assigned by the capture worker
    pub sequence: u64,

    /// Capture timestamp in microseconds
    pub timestamp: u64,
}

/// A frame from a stereo camera stream containing both images.
///
/// The two sides are each the latest frame of their device, they are not guaranteed to share
/// a hardware timestamp.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StereoFrame {
    /// The left image
    pub left: RawFrame,

    /// The right image
    pub right: RawFrame,
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Which camera of the rig something belongs to.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum CameraSide {
    #[display(fmt = "left")]
    Left,

    #[display(fmt = "right")]
    Right,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for RawFrame {
    fn default() -> Self {
        Self::new(RgbImage::new(0, 0), 0)
    }
}

impl RawFrame {
    /// Wrap an image captured at `timestamp` (microseconds), sequence numbers are assigned later.
    pub fn new(image: RgbImage, timestamp: u64) -> Self {
        Self {
            image,
            sequence: 0,
            timestamp,
        }
    }

    /// Wrap an image captured now.
    pub fn now(image: RgbImage) -> Self {
        Self::new(image, timestamp_now())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// `(width, height)` of the frame
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// True for the placeholder frame held before any capture.
    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Split a combined side-by-side frame into its left and right halves.
    ///
    /// Both halves keep the sequence number and timestamp of the combined frame. Returns `None`
    /// if the frame width is odd or the frame is empty.
    pub fn split_side_by_side(&self) -> Option<(RawFrame, RawFrame)> {
        let (width, height) = self.dimensions();
        if self.is_empty() || width % 2 != 0 {
            return None;
        }

        let half = width / 2;
        let left = imageops::crop_imm(&self.image, 0, 0, half, height).to_image();
        let right = imageops::crop_imm(&self.image, half, 0, half, height).to_image();

        Some((
            RawFrame {
                image: left,
                sequence: self.sequence,
                timestamp: self.timestamp,
            },
            RawFrame {
                image: right,
                sequence: self.sequence,
                timestamp: self.timestamp,
            },
        ))
    }
}

impl StereoFrame {
    /// Get the width of an individual image in the frame
    pub fn width(&self) -> u32 {
        self.left.width()
    }

    /// Get the height of an individual image in the frame
    pub fn height(&self) -> u32 {
        self.left.height()
    }

    /// Timestamp difference between the two sides in microseconds.
    pub fn skew_us(&self) -> i64 {
        self.right.timestamp as i64 - self.left.timestamp as i64
    }

    /// Convert the frame into a pair of images
    pub fn into_image_pair(self) -> (RgbImage, RgbImage) {
        (self.left.image, self.right.image)
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Current wall clock time in microseconds since the unix epoch.
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
