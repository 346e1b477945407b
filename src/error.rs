//! # `stereo_camstream` Error module
//!
//! Provides abstractions over errors which can occur during this crate's use.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::PathBuf;

use serde_any;
use thiserror;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Result type used by faillible functions inside the `stereo_camstream` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors which can occur during use of the `stereo_camstream` crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Cannot find file at {0:?}")]
    FileNotFound(PathBuf),

    #[error("Error deserialising data: {0}")]
    DeserialisationError(serde_any::Error),

    /// The device could not be opened or refused the negotiated parameters.
    #[error("Cannot open camera {device}: {reason}")]
    DeviceOpen { device: String, reason: String },

    /// A single frame read failed, the worker owning the device is closed afterwards.
    #[error("Error capturing image from camera {device}: {reason}")]
    Grab { device: String, reason: String },

    #[error("Cannot load calibration: {0}")]
    CalibrationLoad(#[from] CalibrationLoadError),

    /// A raw frame does not have the size the calibration model was built for.
    #[error(
        "Frame size mismatch: calibration expects {}x{}, got {}x{}",
        .expected.0, .expected.1, .found.0, .found.1
    )]
    SizeMismatch { expected: (u32, u32), found: (u32, u32) },

    #[error("Error occured while converting an image: {0}")]
    ImageConversionError(image::ImageError),

    #[error("Cannot save image to {path:?}: {source}")]
    ImageSaveError { path: PathBuf, source: image::ImageError },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot spawn capture thread for {device}: {source}")]
    ThreadSpawn { device: String, source: std::io::Error },

    #[error("The camera stream is closed")]
    StreamClosed,

    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while validating a calibration document.
///
/// A failed load never yields a partially initialised model.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationLoadError {
    #[error("missing field {0:?}")]
    MissingField(&'static str),

    #[error(
        "malformed matrix {field:?}: expected {}x{}, found {}x{} with {len} values",
        .expected.0, .expected.1, .found.0, .found.1
    )]
    MalformedMatrix {
        field: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
        len: usize,
    },

    #[error("invalid image size {0}x{1}")]
    InvalidImageSize(u32, u32),

    #[error("matrix {0:?} cannot be inverted")]
    SingularMatrix(&'static str),

    #[error("unsupported calibration file format {0:?}")]
    UnsupportedFormat(PathBuf),

    #[error("cannot parse calibration document: {0}")]
    Deserialisation(serde_any::Error),
}
