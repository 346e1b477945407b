//! # Frame Source Module
//!
//! Devices that capture workers pull frames from. [`V4l2Source`] drives a real camera through
//! [`rscam`](https://github.com/loyd/rscam), [`TestPatternSource`] produces a solid colour at a
//! fixed rate for tests and bench setups without hardware.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use derive_more::Display;
use image::{ImageFormat, Rgb, RgbImage};
use log::{debug, info};
use rscam::{Camera, Config};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::frame::RawFrame;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// A device which can be grabbed from repeatedly by a capture worker.
pub trait FrameSource {
    /// Block until the device produces its next frame.
    ///
    /// Any error is treated as terminal for the worker owning the source.
    fn grab(&mut self) -> Result<RawFrame>;

    /// Human readable identifier used in logs and errors, e.g. the device path.
    fn describe(&self) -> String;
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Acquisition parameters for one device.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Device path, such as `/dev/video0`
    pub device_id: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Target frame rate, V4L2 is asked for an interval of `1/fps`
    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default)]
    pub pixel_format: PixelFormat,

    /// Number of buffers in the V4L2 queue
    #[serde(default = "default_num_buffers")]
    pub num_buffers: u32,
}

/// A camera opened over V4L2.
pub struct V4l2Source {
    camera: Camera,
    device: String,
    format: PixelFormat,
}

/// Produces a solid colour frame at a fixed rate.
pub struct TestPatternSource {
    name: String,
    pattern: RgbImage,
    interval: Duration,
    next_deadline: Option<Instant>,
    remaining: Option<u64>,
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Pixel formats that can be negotiated with a device, in FourCC notation.
#[derive(Clone, Copy, Debug, Display, Deserialize, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG, decoded with `image`
    #[serde(rename = "MJPG")]
    #[display(fmt = "MJPG")]
    Mjpg,

    /// Packed YUV 4:2:2
    #[serde(rename = "YUYV")]
    #[display(fmt = "YUYV")]
    Yuyv,

    /// Packed 8-bit RGB
    #[serde(rename = "RGB3")]
    #[display(fmt = "RGB3")]
    Rgb3,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Mjpg
    }
}

impl PixelFormat {
    /// The FourCC code handed to V4L2
    pub fn fourcc(self) -> &'static [u8] {
        match self {
            PixelFormat::Mjpg => b"MJPG",
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Rgb3 => b"RGB3",
        }
    }

    pub fn from_fourcc(format: &[u8]) -> Option<Self> {
        match format {
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGB3" => Some(PixelFormat::Rgb3),
            _ => None,
        }
    }
}

impl DeviceConfig {
    /// Config for `device_id` with the default 640x480 MJPG at 30 fps.
    pub fn new<S: Into<String>>(device_id: S) -> Self {
        Self {
            device_id: device_id.into(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            pixel_format: PixelFormat::default(),
            num_buffers: default_num_buffers(),
        }
    }

    /// Check the configuration is usable before touching any device.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: resolution {}x{} is empty",
                self.device_id, self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: frame rate must be positive",
                self.device_id
            )));
        }

        Ok(())
    }
}

impl V4l2Source {
    /// Open the device and negotiate the configured format, resolution and interval.
    ///
    /// Fails with [`Error::DeviceOpen`] if the device is missing or refuses any of them.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        config.validate()?;

        let device = config.device_id.clone();
        if !Path::new(&device).exists() {
            return Err(Error::DeviceOpen {
                device,
                reason: String::from("no such device"),
            });
        }

        let mut camera = Camera::new(&device).map_err(|e| Error::DeviceOpen {
            device: device.clone(),
            reason: format!("{}", e),
        })?;

        camera
            .start(&Config {
                interval: (1, config.fps),
                resolution: (config.width, config.height),
                format: config.pixel_format.fourcc(),
                nbuffers: config.num_buffers,
                ..Config::default()
            })
            .map_err(|e| Error::DeviceOpen {
                device: device.clone(),
                reason: format!("{}", e),
            })?;

        info!(
            "Opened camera {}: {}x{} {} at {} fps",
            device, config.width, config.height, config.pixel_format, config.fps
        );

        Ok(Self {
            camera,
            device,
            format: config.pixel_format,
        })
    }
}

impl FrameSource for V4l2Source {
    fn grab(&mut self) -> Result<RawFrame> {
        let frame = self.camera.capture().map_err(|e| Error::Grab {
            device: self.device.clone(),
            reason: format!("{}", e),
        })?;

        let timestamp = frame.get_timestamp();
        let (width, height) = frame.resolution;

        let image = match self.format {
            PixelFormat::Mjpg => Some(
                image::load_from_memory_with_format(&frame, ImageFormat::Jpeg)
                    .map_err(Error::ImageConversionError)?
                    .to_rgb8(),
            ),
            PixelFormat::Yuyv => yuyv_to_rgb(&frame, width, height),
            PixelFormat::Rgb3 => RgbImage::from_raw(width, height, frame.to_vec()),
        };

        match image {
            Some(image) => Ok(RawFrame::new(image, timestamp)),
            None => Err(Error::Grab {
                device: self.device.clone(),
                reason: format!(
                    "{} buffer of {} bytes does not fill {}x{}",
                    self.format,
                    frame.len(),
                    width,
                    height
                ),
            }),
        }
    }

    fn describe(&self) -> String {
        self.device.clone()
    }
}

impl TestPatternSource {
    /// A `width`x`height` source of `colour` producing `fps` frames per second.
    pub fn new<S: Into<String>>(name: S, width: u32, height: u32, fps: u32, colour: Rgb<u8>) -> Self {
        Self {
            name: name.into(),
            pattern: RgbImage::from_pixel(width, height, colour),
            interval: Duration::from_secs(1) / fps.max(1),
            next_deadline: None,
            remaining: None,
        }
    }

    /// Build a source matching a device configuration.
    pub fn open(config: &DeviceConfig, colour: Rgb<u8>) -> Result<Self> {
        config.validate()?;

        debug!(
            "Opened test pattern {}: {}x{} at {} fps",
            config.device_id, config.width, config.height, config.fps
        );

        Ok(Self::new(
            config.device_id.clone(),
            config.width,
            config.height,
            config.fps,
            colour,
        ))
    }

    /// Fail every grab after `frames` frames have been produced, like an unplugged camera.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.remaining = Some(frames);
        self
    }
}

impl FrameSource for TestPatternSource {
    fn grab(&mut self) -> Result<RawFrame> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(Error::Grab {
                    device: self.name.clone(),
                    reason: String::from("device disconnected"),
                });
            }
            *remaining -= 1;
        }

        // Pace on absolute deadlines so time spent outside grab does not lower the rate
        let now = Instant::now();
        let deadline = match self.next_deadline {
            Some(d) if d + self.interval > now => d,
            _ => now,
        };
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline + self.interval);

        Ok(RawFrame::now(self.pattern.clone()))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_fps() -> u32 {
    30
}

fn default_num_buffers() -> u32 {
    2
}

/// Convert a packed YUYV buffer into RGB using the BT.601 coefficients.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Option<RgbImage> {
    let expected = width as usize * height as usize * 2;
    if data.len() < expected || width % 2 != 0 {
        return None;
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in data[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;

        for &y in &[chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }

    RgbImage::from_raw(width, height, rgb)
}

fn clamp_u8(value: f32) -> u8 {
    value.round().max(0.0).min(255.0) as u8
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_fourcc_round_trip() {
        for format in &[PixelFormat::Mjpg, PixelFormat::Yuyv, PixelFormat::Rgb3] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(*format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }

    #[test]
    fn test_yuyv_grey() {
        // Neutral chroma gives grey pixels equal to luma
        let data = [16u8, 128, 235, 128, 100, 128, 50, 128];
        let img = yuyv_to_rgb(&data, 2, 2).unwrap();

        assert_eq!(*img.get_pixel(0, 0), Rgb([16, 16, 16]));
        assert_eq!(*img.get_pixel(1, 0), Rgb([235, 235, 235]));
        assert_eq!(*img.get_pixel(1, 1), Rgb([50, 50, 50]));
    }

    #[test]
    fn test_yuyv_short_buffer() {
        assert!(yuyv_to_rgb(&[0u8; 6], 2, 2).is_none());
    }

    #[test]
    fn test_missing_device_is_open_error() {
        let config = DeviceConfig::new("/dev/this-camera-does-not-exist");

        match V4l2Source::open(&config) {
            Err(Error::DeviceOpen { device, .. }) => {
                assert_eq!(device, "/dev/this-camera-does-not-exist")
            }
            _ => panic!("expected a device open error"),
        }
    }

    #[test]
    fn test_invalid_config() {
        let mut config = DeviceConfig::new("pattern");
        config.fps = 0;
        assert!(matches!(
            TestPatternSource::open(&config, Rgb([0, 0, 0])),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pattern_rate_and_failure() {
        let mut source = TestPatternSource::new("pattern", 8, 6, 100, Rgb([1, 2, 3])).fail_after(5);

        let start = Instant::now();
        for _ in 0..5 {
            let frame = source.grab().unwrap();
            assert_eq!(frame.dimensions(), (8, 6));
            assert_eq!(*frame.image.get_pixel(7, 5), Rgb([1, 2, 3]));
        }
        // First frame is immediate, the other four are paced at 10 ms
        assert!(start.elapsed() >= Duration::from_millis(40));

        assert!(matches!(source.grab(), Err(Error::Grab { .. })));
    }

    #[test]
    fn test_device_config_deserialise() {
        let config: DeviceConfig = serde_any::from_str(
            r#"{ "deviceId": "/dev/video2", "width": 1280, "height": 480, "pixelFormat": "YUYV" }"#,
            serde_any::Format::Json,
        )
        .unwrap();

        assert_eq!(config.device_id, "/dev/video2");
        assert_eq!((config.width, config.height), (1280, 480));
        assert_eq!(config.fps, 30);
        assert_eq!(config.pixel_format, PixelFormat::Yuyv);
        assert_eq!(config.num_buffers, 2);
    }
}
