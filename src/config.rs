//! # Configuration
//!
//! A [`StereoConfig`] describes a complete capture rig: the devices, the calibration file, what
//! to publish and where to save it. It is loaded with `serde_any`, so TOML, JSON and YAML files
//! all work, the format being picked from the file extension.
//!
//! ```toml
//! layout = "dual"
//! calibration = "m2_calibration.yml"
//! publishRaw = false
//! publishRect = true
//! saveDir = "capture"
//!
//! [left]
//! deviceId = "/dev/video0"
//!
//! [right]
//! deviceId = "/dev/video2"
//! ```

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::Rgb;
use log::{debug, info};
use serde::Deserialize;

use crate::builder::Rectifiable;
use crate::calibration::CalibrationModel;
use crate::camstream::StereoCamStream;
use crate::capture::CaptureWorker;
use crate::error::{Error, Result};
use crate::pipeline::{PipelineConfig, PipelineDriver};
use crate::sink::{FrameKind, ImageFileSink};
use crate::source::{DeviceConfig, TestPatternSource, V4l2Source};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

const SYNTHETIC_LEFT: Rgb<u8> = Rgb([200, 40, 40]);
const SYNTHETIC_RIGHT: Rgb<u8> = Rgb([40, 40, 200]);

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StereoConfig {
    #[serde(default)]
    pub layout: Layout,

    /// The left camera, or the combined camera of a side by side rig
    pub left: DeviceConfig,

    #[serde(default)]
    pub right: Option<DeviceConfig>,

    /// Calibration file, relative paths are resolved against the config file's directory
    #[serde(default)]
    pub calibration: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub publish_raw: bool,

    #[serde(default)]
    pub publish_rect: bool,

    /// Publish the camera info of both cameras with every pair
    #[serde(default)]
    pub publish_info: bool,

    /// Save the published pairs as JPEGs under this directory
    #[serde(default)]
    pub save_dir: Option<PathBuf>,

    #[serde(default = "default_one")]
    pub save_every: u64,

    #[serde(default)]
    pub max_frames: Option<u64>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_throughput_window")]
    pub throughput_window: u64,

    /// Use test patterns instead of V4L2 devices
    #[serde(default)]
    pub synthetic: bool,
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// How the two views reach the host.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Layout {
    /// One device per camera
    Dual,

    /// A single device delivering both views in one frame, left half first
    SideBySide,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for Layout {
    fn default() -> Self {
        Layout::Dual
    }
}

impl StereoConfig {
    /// Load and validate a configuration file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let mut config: Self =
            serde_any::from_file(path).map_err(|e| Error::DeserialisationError(e))?;

        if let (Some(calibration), Some(dir)) = (config.calibration.as_mut(), path.parent()) {
            if calibration.is_relative() {
                *calibration = dir.join(&*calibration);
            }
        }

        config.validate()?;
        debug!("Loaded configuration from {:?}: {:?}", path, config);

        Ok(config)
    }

    /// Check the configuration is consistent without opening anything.
    pub fn validate(&self) -> Result<()> {
        self.left.validate()?;

        match self.layout {
            Layout::Dual => {
                let right = self.right.as_ref().ok_or_else(|| {
                    Error::InvalidConfig(String::from("dual layout requires a right camera"))
                })?;
                right.validate()?;

                if right.device_id == self.left.device_id && !self.synthetic {
                    return Err(Error::InvalidConfig(format!(
                        "left and right both use {}",
                        right.device_id
                    )));
                }
            }
            Layout::SideBySide => {
                if self.right.is_some() {
                    return Err(Error::InvalidConfig(String::from(
                        "side by side layout takes a single camera",
                    )));
                }
                if self.left.width % 2 != 0 {
                    return Err(Error::InvalidConfig(format!(
                        "side by side width {} cannot be split into two views",
                        self.left.width
                    )));
                }
            }
        }

        if !self.publish_raw && !self.publish_rect && !self.publish_info {
            return Err(Error::InvalidConfig(String::from(
                "no raw, rectified or info output is enabled",
            )));
        }
        if (self.publish_rect || self.publish_info) && self.calibration.is_none() {
            return Err(Error::InvalidConfig(String::from(
                "rectified and info output require a calibration file",
            )));
        }
        if self.poll_interval_ms == 0 || self.throughput_window == 0 || self.save_every == 0 {
            return Err(Error::InvalidConfig(String::from(
                "pollIntervalMs, throughputWindow and saveEvery must be positive",
            )));
        }

        Ok(())
    }

    /// Resolution of a single view.
    pub fn view_size(&self) -> (u32, u32) {
        match self.layout {
            Layout::Dual => (self.left.width, self.left.height),
            Layout::SideBySide => (self.left.width / 2, self.left.height),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            publish_raw: self.publish_raw,
            publish_rect: self.publish_rect,
            publish_info: self.publish_info,
            max_frames: self.max_frames,
            throughput_window: self.throughput_window,
        }
    }

    /// Open the cameras and start capturing.
    pub fn build_stream(&self) -> Result<StereoCamStream> {
        self.validate()?;

        let stream = match self.layout {
            Layout::Dual => {
                let right = self.right.as_ref().ok_or_else(|| {
                    Error::InvalidConfig(String::from("dual layout requires a right camera"))
                })?;

                let left = self.spawn("left", &self.left, SYNTHETIC_LEFT)?;
                let right = self.spawn("right", right, SYNTHETIC_RIGHT)?;
                StereoCamStream::new(left, right)
            }
            Layout::SideBySide => {
                StereoCamStream::side_by_side(self.spawn("stereo", &self.left, SYNTHETIC_LEFT)?)
            }
        };

        Ok(stream.poll_interval(Duration::from_millis(self.poll_interval_ms)))
    }

    /// Build an idle pipeline: calibration, cameras and the file sink if one is configured.
    ///
    /// The calibration is loaded before any camera is opened. A model whose image size does not
    /// match the cameras is rejected here rather than on the first frame.
    pub fn build_pipeline(&self) -> Result<PipelineDriver> {
        self.validate()?;

        let model = match &self.calibration {
            Some(path) => Some(Arc::new(CalibrationModel::load_file(path)?)),
            None => None,
        };

        if let Some(model) = &model {
            if self.publish_rect && model.image_size() != self.view_size() {
                return Err(Error::SizeMismatch {
                    expected: model.image_size(),
                    found: self.view_size(),
                });
            }
        }

        let mut driver = PipelineDriver::new(self.build_stream()?, self.pipeline_config());
        if let Some(model) = model {
            driver = driver.calibration(model);
        }

        if let Some(dir) = &self.save_dir {
            let kind = if self.publish_rect {
                FrameKind::Rectified
            } else {
                FrameKind::Raw
            };

            driver.add_sink(ImageFileSink::new(dir, kind)?.every(self.save_every));
            info!("Saving {} pairs to {:?}", kind, dir);
        }

        Ok(driver)
    }

    fn spawn(&self, name: &str, device: &DeviceConfig, colour: Rgb<u8>) -> Result<CaptureWorker> {
        let device = device.clone();

        if self.synthetic {
            CaptureWorker::spawn(name, move || TestPatternSource::open(&device, colour))
        } else {
            CaptureWorker::spawn(name, move || V4l2Source::open(&device))
        }
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_one() -> u64 {
    1
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_throughput_window() -> u64 {
    10
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
