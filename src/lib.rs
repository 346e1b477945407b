//! # Stereo camera stream for use in the CV system
//!
//! This crate acquires images from a pair of cameras, rectifies them against a stereo calibration
//! and hands synchronised pairs on for further processing.
//! Under the hood this uses [`rscam`](https://github.com/loyd/rscam) to access cameras over V4L2,
//! therefore currently only Linux is supported.
//!
//! Each camera is read by its own capture thread which only ever keeps the latest frame, so a
//! slow consumer never builds up a backlog and never sees a half written frame.
//!
//! ## Dependencies
//!
//! Before installing make sure that the following dependencies are installed:
//!
//! - V4L2 - video for linux 2, including the dev headers
//!
//! ### Ubuntu
//!
//! ```shell
//! sudo apt install v4l-utils libv4l-dev
//! ```
//!
//! ## Installation
//!
//! Once the dependencies are met add the following to your project's `Cargo.toml`
//!
//! ```toml
//! [dependencies]
//! stereo_camstream = "0.1"
//! ```
//!
//! ## Usage
//!
//! Cameras are opened through the builder API `CamStreamBuilder`, either as two devices or as a
//! single device delivering both views side by side.
//!
//! ```no_run
//! use stereo_camstream::prelude::*;
//!
//! # fn main() -> stereo_camstream::Result<()> {
//! let stream = CamStreamBuilder::new()
//!     // Create a stereo camera object
//!     .stereo()
//!     // The paths that the devices can be found at, which return results
//!     .left_path("/dev/video0")?
//!     .right_path("/dev/video2")?
//!     // Set rscam parameters, like frame rate, resolution, and format
//!     .fps(30)
//!     .resolution((640, 480))
//!     .format(b"MJPG")?
//!     // Open the cameras and start capturing
//!     .build()?;
//!
//! let config = PipelineConfig {
//!     publish_rect: true,
//!     ..PipelineConfig::default()
//! };
//!
//! let mut pipeline = PipelineDriver::new(stream, config)
//!     // Path to the stereo calibration, as written by the calibration tool
//!     .calibration_from_file("res/m2_calibration.yml")?
//!     .with_sink(|pair: &StereoFrame, kind: FrameKind| -> stereo_camstream::Result<()> {
//!         println!("{} pair {}", kind, pair.left.sequence);
//!         Ok(())
//!     });
//!
//! let summary = pipeline.run()?;
//! println!("{} pairs", summary.frames);
//! # Ok(())
//! # }
//! ```
//!
//! The coordinator can also be read directly, `capture()` blocks until a pair is available:
//!
//! ```no_run
//! # use stereo_camstream::prelude::*;
//! # fn main() -> stereo_camstream::Result<()> {
//! # let mut stream = CamStreamBuilder::new().side_by_side().path("/dev/video0")?.build()?;
//! let pair = stream.capture()?;
//! # Ok(())
//! # }
//! ```
//!
//! A whole rig can also be described in a file and run with the `stereo_capture` binary, see
//! [`config::StereoConfig`].

// -----------------------------------------------------------------------------------------------
// EXPORTS
// -----------------------------------------------------------------------------------------------

pub use builder::{CamStreamBuilder, Rectifiable, SideBySideStreamBuilder, StereoStreamBuilder};
pub use calibration::{CalibrationModel, CameraInfo, RemapTable};
pub use camstream::{CamStream, StereoCamStream};
pub use error::{CalibrationLoadError, Error, Result};
pub use frame::{CameraSide, RawFrame, StereoFrame};
pub use pipeline::{PipelineConfig, PipelineDriver, PipelineState, RunSummary, StopHandle, StopReason};
pub use sink::{FrameKind, FrameSink, ImageFileSink};

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

mod builder;
pub mod calibration;
mod camstream;
pub mod capture;
pub mod config;
mod error;
mod frame;
pub mod frame_buffer;
pub mod pipeline;
pub mod rectification;
mod sink;
pub mod source;

pub mod prelude {
    pub use crate::{CamStreamBuilder, Rectifiable};
    pub use crate::{CamStream, StereoCamStream, StereoFrame};
    pub use crate::{FrameKind, PipelineConfig, PipelineDriver};
}
