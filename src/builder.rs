//! # `CamStreamBuilder` implementation
//!
//! This module implements the builders for stereo camera streams, and the [`Rectifiable`] trait
//! for anything that can be given a calibration model.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::calibration::CalibrationModel;
use crate::camstream::{StereoCamStream, DEFAULT_POLL_INTERVAL};
use crate::capture::{CaptureWorker, DEFAULT_YIELD};
use crate::error::{Error, Result};
use crate::pipeline::PipelineDriver;
use crate::source::{DeviceConfig, PixelFormat, V4l2Source};

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// Provides common methods for enabling rectification of images.
pub trait Rectifiable: Sized {
    /// Rectify with the given model.
    fn calibration(self, model: Arc<CalibrationModel>) -> Self;

    /// Load the calibration model from a file.
    ///
    /// The format is chosen from the file extension, see [`CalibrationModel::load_file`].
    fn calibration_from_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let model = CalibrationModel::load_file(path)?;

        Ok(self.calibration(Arc::new(model)))
    }
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct CamStreamBuilder {}

/// Settings shared by every device of a rig.
#[derive(Clone, Debug)]
struct CommonConfig {
    resolution: (u32, u32),
    fps: u32,
    format: PixelFormat,
    num_buffers: u32,
    poll_interval: Duration,
    yield_interval: Duration,
}

/// Builds a stream from two cameras.
pub struct StereoStreamBuilder {
    left_path: Option<PathBuf>,
    right_path: Option<PathBuf>,

    common: CommonConfig,
}

/// Builds a stream from one camera delivering both views side by side.
pub struct SideBySideStreamBuilder {
    path: Option<PathBuf>,

    common: CommonConfig,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl CamStreamBuilder {
    pub fn new() -> Self {
        Self {}
    }

    pub fn stereo(self) -> StereoStreamBuilder {
        StereoStreamBuilder {
            left_path: None,
            right_path: None,
            common: CommonConfig::default(),
        }
    }

    pub fn side_by_side(self) -> SideBySideStreamBuilder {
        SideBySideStreamBuilder {
            path: None,
            common: CommonConfig::default(),
        }
    }
}

impl Default for CamStreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            resolution: (640, 480),
            fps: 30,
            format: PixelFormat::Mjpg,
            num_buffers: 2,
            poll_interval: DEFAULT_POLL_INTERVAL,
            yield_interval: DEFAULT_YIELD,
        }
    }
}

impl CommonConfig {
    fn device(&self, path: &Path) -> Result<DeviceConfig> {
        let device_id = path.to_str().ok_or_else(|| {
            Error::InvalidConfig(format!("device path {:?} is not valid unicode", path))
        })?;

        Ok(DeviceConfig {
            device_id: device_id.to_string(),
            width: self.resolution.0,
            height: self.resolution.1,
            fps: self.fps,
            pixel_format: self.format,
            num_buffers: self.num_buffers,
        })
    }

    fn spawn(&self, name: &str, path: &Path) -> Result<CaptureWorker> {
        let device = self.device(path)?;
        device.validate()?;

        CaptureWorker::spawn_with_yield(name, self.yield_interval, move || {
            V4l2Source::open(&device)
        })
    }
}

/// Setters shared by both builders, mirroring the V4L2 negotiation parameters.
macro_rules! common_setters {
    ($builder:ty) => {
        impl $builder {
            /// Set the frame rate of the cameras.
            ///
            /// V4L2 is asked for an interval of `(1, fps)`, default value is 30.
            pub fn fps(mut self, fps: u32) -> Self {
                self.common.fps = fps;

                self
            }

            /// Set the resolution of the cameras.
            ///
            /// Default value is `(640, 480)`.
            pub fn resolution(mut self, resolution: (u32, u32)) -> Self {
                self.common.resolution = resolution;

                self
            }

            /// Set the format of the images.
            ///
            /// Uses the FourCC notation, default value is `b"MJPG"`.
            pub fn format(mut self, format: &[u8]) -> Result<Self> {
                self.common.format = PixelFormat::from_fourcc(format).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "unsupported pixel format {}",
                        String::from_utf8_lossy(format)
                    ))
                })?;

                Ok(self)
            }

            /// Set the number of buffers in the queue for each camera.
            ///
            /// Default value is 2.
            pub fn num_buffers(mut self, num_buffers: u32) -> Self {
                self.common.num_buffers = num_buffers;

                self
            }

            /// Set how long a pair read waits for a frame before rechecking the cameras.
            pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
                self.common.poll_interval = poll_interval;

                self
            }

            /// Set the pause taken by the capture threads after each frame.
            pub fn yield_interval(mut self, yield_interval: Duration) -> Self {
                self.common.yield_interval = yield_interval;

                self
            }
        }
    };
}

common_setters!(StereoStreamBuilder);
common_setters!(SideBySideStreamBuilder);

impl StereoStreamBuilder {
    /// Specify the path of the left camera, i.e. the device path, such as `/dev/video1`
    ///
    /// # Returns
    /// - `self` if the path exists, `Err` otherwise
    pub fn left_path<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.left_path = Some(existing(path)?);

        Ok(self)
    }

    /// Specify the path of the right camera, i.e. the device path, such as `/dev/video2`
    ///
    /// # Returns
    /// - `self` if the path exists, `Err` otherwise
    pub fn right_path<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.right_path = Some(existing(path)?);

        Ok(self)
    }

    /// Build the stereo camera stream object.
    ///
    /// This function can fail if either camera cannot be opened, in which case any camera
    /// already opened is released again.
    pub fn build(self) -> Result<StereoCamStream> {
        let (left_path, right_path) = match (self.left_path, self.right_path) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(Error::InvalidConfig(String::from("Missing camera path"))),
        };

        let left = self.common.spawn("left", &left_path)?;
        let right = self.common.spawn("right", &right_path)?;

        Ok(StereoCamStream::new(left, right).poll_interval(self.common.poll_interval))
    }
}

impl SideBySideStreamBuilder {
    /// Specify the path of the combined camera, such as `/dev/video0`
    ///
    /// The resolution is that of the combined frame, e.g. `(1280, 480)` for two 640x480 views.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.path = Some(existing(path)?);

        Ok(self)
    }

    pub fn build(self) -> Result<StereoCamStream> {
        let path = self
            .path
            .ok_or_else(|| Error::InvalidConfig(String::from("Missing camera path")))?;

        if self.common.resolution.0 % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "side by side width {} cannot be split into two views",
                self.common.resolution.0
            )));
        }

        let worker = self.common.spawn("stereo", &path)?;

        Ok(StereoCamStream::side_by_side(worker).poll_interval(self.common.poll_interval))
    }
}

impl Rectifiable for PipelineDriver {
    fn calibration(self, model: Arc<CalibrationModel>) -> Self {
        self.with_model(model)
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn existing<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    if path.as_ref().exists() {
        Ok(path.as_ref().to_path_buf())
    } else {
        Err(Error::FileNotFound(path.as_ref().to_path_buf()))
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
