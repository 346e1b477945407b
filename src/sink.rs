//! # Sink Module
//!
//! Sinks are the passive consumers the pipeline forwards frame pairs to. The crate does not care
//! whether a sink publishes, stores or displays what it receives.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::fs;
use std::path::{Path, PathBuf};

use derive_more::Display;
use log::debug;

use crate::calibration::CameraInfo;
use crate::error::{Error, Result};
use crate::frame::StereoFrame;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// A consumer of stereo frame pairs.
pub trait FrameSink {
    /// Accept one pair. An error is fatal to the pipeline run.
    fn accept(&mut self, frame: &StereoFrame, kind: FrameKind) -> Result<()>;

    /// Accept the camera info of both cameras, sent once per raw pair `frame` when info output
    /// is enabled. Ignored unless overridden.
    fn accept_info(
        &mut self,
        _frame: &StereoFrame,
        _left: &CameraInfo,
        _right: &CameraInfo,
    ) -> Result<()> {
        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Writes pairs as JPEG files into `left/` and `right/` subdirectories.
pub struct ImageFileSink {
    root: PathBuf,
    kind: FrameKind,
    every: u64,
    seen: u64,
    saved: u64,
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Whether a pair is straight from the cameras or rectified.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum FrameKind {
    #[display(fmt = "raw")]
    Raw,

    #[display(fmt = "rect")]
    Rectified,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl<F> FrameSink for F
where
    F: FnMut(&StereoFrame, FrameKind) -> Result<()>,
{
    fn accept(&mut self, frame: &StereoFrame, kind: FrameKind) -> Result<()> {
        self(frame, kind)
    }
}

impl ImageFileSink {
    /// Save pairs of `kind` under `root`, creating `root/left` and `root/right`.
    pub fn new<P: AsRef<Path>>(root: P, kind: FrameKind) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("left"))?;
        fs::create_dir_all(root.join("right"))?;

        Ok(Self {
            root,
            kind,
            every: 1,
            seen: 0,
            saved: 0,
        })
    }

    /// Only save every `every`-th pair.
    pub fn every(mut self, every: u64) -> Self {
        self.every = every.max(1);
        self
    }

    /// Number of pairs written so far
    pub fn saved(&self) -> u64 {
        self.saved
    }

    fn save(&self, frame: &StereoFrame) -> Result<()> {
        let name = format!("{}.jpg", self.saved);
        let left_path = self.root.join("left").join(&name);
        let right_path = self.root.join("right").join(&name);

        frame
            .left
            .image
            .save(&left_path)
            .map_err(|e| Error::ImageSaveError {
                path: left_path.clone(),
                source: e,
            })?;
        frame
            .right
            .image
            .save(&right_path)
            .map_err(|e| Error::ImageSaveError {
                path: right_path.clone(),
                source: e,
            })?;

        debug!("Saved {:?} and {:?}", left_path, right_path);

        Ok(())
    }
}

impl FrameSink for ImageFileSink {
    fn accept(&mut self, frame: &StereoFrame, kind: FrameKind) -> Result<()> {
        if kind != self.kind {
            return Ok(());
        }

        self.seen += 1;
        if (self.seen - 1) % self.every != 0 {
            return Ok(());
        }

        self.save(frame)?;
        self.saved += 1;

        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::frame::RawFrame;
    use image::{Rgb, RgbImage};
    use std::env;
    use std::process;

    fn pair() -> StereoFrame {
        StereoFrame {
            left: RawFrame::now(RgbImage::from_pixel(8, 6, Rgb([200, 10, 10]))),
            right: RawFrame::now(RgbImage::from_pixel(8, 6, Rgb([10, 10, 200]))),
        }
    }

    #[test]
    fn test_closure_sink() {
        let mut count = 0;
        {
            let mut sink = |frame: &StereoFrame, kind: FrameKind| -> Result<()> {
                assert_eq!(kind, FrameKind::Raw);
                assert_eq!(frame.width(), 8);
                count += 1;
                Ok(())
            };
            sink.accept(&pair(), FrameKind::Raw).unwrap();
            sink.accept(&pair(), FrameKind::Raw).unwrap();
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_image_file_sink() {
        let root = env::temp_dir().join(format!("stereo_camstream_sink_{}", process::id()));
        let mut sink = ImageFileSink::new(&root, FrameKind::Rectified).unwrap().every(2);

        // Raw pairs are ignored by a rectified sink
        sink.accept(&pair(), FrameKind::Raw).unwrap();
        for _ in 0..3 {
            sink.accept(&pair(), FrameKind::Rectified).unwrap();
        }
        assert_eq!(sink.saved(), 2);

        for name in &["0.jpg", "1.jpg"] {
            let left = image::open(root.join("left").join(name)).unwrap().to_rgb8();
            assert_eq!(left.dimensions(), (8, 6));
            assert!(root.join("right").join(name).exists());
        }
        assert!(!root.join("left").join("2.jpg").exists());

        fs::remove_dir_all(&root).unwrap();
    }
}
