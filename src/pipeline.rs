//! # Pipeline Module
//!
//! The pipeline driver pulls synchronised raw pairs from a [`StereoCamStream`], optionally
//! rectifies them, forwards the results to its sinks and keeps throughput statistics.
//!
//! The driver moves through `Idle -> Running -> Stopped`. It stops by itself once either camera
//! closes, when the configured frame limit is reached, or when a [`StopHandle`] is triggered.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use derive_more::Display;
use log::{error, info, warn};

use crate::calibration::{CalibrationModel, CameraInfo};
use crate::camstream::StereoCamStream;
use crate::error::{Error, Result};
use crate::frame::{CameraSide, StereoFrame};
use crate::rectification;
use crate::sink::{FrameKind, FrameSink};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// What the driver does with each pair.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Forward raw pairs to the sinks
    pub publish_raw: bool,

    /// Rectify pairs and forward the result to the sinks, requires a calibration model
    pub publish_rect: bool,

    /// Forward the camera info of both cameras with every pair, requires a calibration model
    pub publish_info: bool,

    /// Stop after this many pairs
    pub max_frames: Option<u64>,

    /// Number of pairs per throughput measurement
    pub throughput_window: u64,
}

/// Frame rate measured over fixed-size windows of frames.
///
/// The first recorded frame only anchors the first window, so every rate is taken over the
/// intervals between frames actually processed.
#[derive(Clone, Debug)]
pub struct ThroughputMeter {
    window: u64,
    in_window: u64,
    intervals: u64,
    total: u64,
    anchor: Option<Instant>,
    history: Vec<f64>,
}

/// Statistics of one completed throughput window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowStats {
    pub frames: u64,
    pub fps: f64,
    pub frame_time_ms: f64,
}

/// Outcome of a pipeline run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Pairs fully processed
    pub frames: u64,

    /// Frame rate of every completed throughput window, in order
    pub window_fps: Vec<f64>,

    pub stop_reason: StopReason,

    /// The reason a camera gave for closing, if one did
    pub failure: Option<String>,
}

/// Requests a running pipeline to stop from any thread.
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<AtomicBool>);

pub struct PipelineDriver {
    stream: StereoCamStream,
    model: Option<Arc<CalibrationModel>>,
    info: Option<(CameraInfo, CameraInfo)>,
    sinks: Vec<Box<dyn FrameSink + Send>>,
    config: PipelineConfig,

    state: PipelineState,
    stop_reason: StopReason,
    stop_requested: Arc<AtomicBool>,
    meter: ThroughputMeter,

    raw: StereoFrame,
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum PipelineState {
    #[display(fmt = "idle")]
    Idle,

    #[display(fmt = "running")]
    Running,

    #[display(fmt = "stopped")]
    Stopped,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum StopReason {
    /// Not stopped yet
    #[display(fmt = "not stopped")]
    None,

    #[display(fmt = "camera closed")]
    CameraClosed,

    #[display(fmt = "frame limit reached")]
    FrameLimit,

    #[display(fmt = "stop requested")]
    Requested,

    #[display(fmt = "fatal error")]
    Error,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            publish_raw: true,
            publish_rect: false,
            publish_info: false,
            max_frames: None,
            throughput_window: 10,
        }
    }
}

impl ThroughputMeter {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            in_window: 0,
            intervals: 0,
            total: 0,
            anchor: None,
            history: Vec::new(),
        }
    }

    /// Forget the current window, the next recorded frame anchors a new one.
    pub fn start(&mut self) {
        self.anchor = None;
        self.in_window = 0;
        self.intervals = 0;
    }

    /// Count one frame finished at `now`, returning the stats if this completes a window.
    pub fn record(&mut self, now: Instant) -> Option<WindowStats> {
        self.total += 1;
        self.in_window += 1;

        let anchor = match self.anchor {
            Some(anchor) => {
                self.intervals += 1;
                anchor
            }
            None => {
                self.anchor = Some(now);
                now
            }
        };

        if self.in_window < self.window {
            return None;
        }

        let intervals = self.intervals;
        let elapsed = now.duration_since(anchor).as_secs_f64();
        self.anchor = Some(now);
        self.in_window = 0;
        self.intervals = 0;

        if intervals == 0 || elapsed <= 0.0 {
            return None;
        }

        let fps = intervals as f64 / elapsed;
        self.history.push(fps);

        Some(WindowStats {
            frames: self.total,
            fps,
            frame_time_ms: elapsed * 1000.0 / intervals as f64,
        })
    }

    /// Frames recorded so far
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Frame rate of the last completed window
    pub fn last_fps(&self) -> Option<f64> {
        self.history.last().copied()
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }
}

impl RunSummary {
    /// A run succeeded if at least one complete pair was processed.
    pub fn succeeded(&self) -> bool {
        self.frames > 0
    }

    /// Process exit status for this run
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl PipelineDriver {
    /// Create an idle driver around an already opened stream.
    pub fn new(mut stream: StereoCamStream, config: PipelineConfig) -> Self {
        let meter = ThroughputMeter::new(config.throughput_window);
        let stop_requested = Arc::new(AtomicBool::new(false));
        stream.set_interrupt(stop_requested.clone());

        Self {
            stream,
            model: None,
            info: None,
            sinks: Vec::new(),
            config,
            state: PipelineState::Idle,
            stop_reason: StopReason::None,
            stop_requested,
            meter,
            raw: StereoFrame::default(),
        }
    }

    /// Use `model` for rectification.
    pub fn with_model(mut self, model: Arc<CalibrationModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Forward pairs to `sink` as well.
    ///
    /// Sinks are `Send` so the whole driver can be moved onto its own thread.
    pub fn with_sink<S: FrameSink + Send + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn add_sink<S: FrameSink + Send + 'static>(&mut self, sink: S) {
        self.sinks.push(Box::new(sink));
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stream(&self) -> &StereoCamStream {
        &self.stream
    }

    pub fn throughput(&self) -> &ThroughputMeter {
        &self.meter
    }

    /// Pairs fully processed so far
    pub fn frames_processed(&self) -> u64 {
        self.meter.total()
    }

    /// A handle which makes [`PipelineDriver::run`] return after the current iteration, or
    /// straight away while it waits for a camera.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_requested.clone())
    }

    /// Move from `Idle` to `Running`.
    ///
    /// Fails if the configuration leaves nothing to do, or asks for rectification without a
    /// calibration model.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(Error::InvalidState(format!(
                "cannot start a pipeline which is {}",
                self.state
            )));
        }

        if !self.config.publish_raw && !self.config.publish_rect && !self.config.publish_info {
            return Err(Error::InvalidConfig(String::from(
                "no raw, rectified or info output is enabled",
            )));
        }
        if self.config.publish_rect && self.model.is_none() {
            return Err(Error::InvalidConfig(String::from(
                "rectified output requires a calibration model",
            )));
        }
        if self.config.publish_info {
            let model = self.model.as_ref().ok_or_else(|| {
                Error::InvalidConfig(String::from("info output requires a calibration model"))
            })?;
            self.info = Some((
                model.camera_info(CameraSide::Left),
                model.camera_info(CameraSide::Right),
            ));
        }
        if self.sinks.is_empty() {
            warn!("Pipeline started without sinks, pairs will be dropped");
        }

        // Frames deposited while idle would make the first window look faster than the cameras
        self.stream.discard_pending();
        self.meter.start();
        self.state = PipelineState::Running;
        info!("Pipeline running");

        Ok(())
    }

    /// Run one iteration: read a pair, rectify it if enabled and hand it to the sinks.
    ///
    /// # Returns
    /// - `Ok(true)` if a pair was processed, `Ok(false)` if a camera closed or a stop was
    ///   requested while waiting, and the pipeline stopped
    pub fn step(&mut self) -> Result<bool> {
        if self.state != PipelineState::Running {
            return Err(Error::InvalidState(format!(
                "cannot step a pipeline which is {}",
                self.state
            )));
        }

        if !self.stream.read_pair(&mut self.raw.left, &mut self.raw.right) {
            if self.stream.is_open() && self.stream.is_interrupted() {
                info!("Stop requested while waiting for a pair");
                self.stop_reason = StopReason::Requested;
            } else {
                match self.stream.failure() {
                    Some(reason) => warn!("Camera closed: {}", reason),
                    None => info!("Camera closed"),
                }
                self.stop_reason = StopReason::CameraClosed;
            }
            self.stop();
            return Ok(false);
        }

        if self.config.publish_raw {
            for sink in self.sinks.iter_mut() {
                sink.accept(&self.raw, FrameKind::Raw)?;
            }
        }

        if self.config.publish_rect {
            let model = self.model.as_ref().ok_or_else(|| {
                Error::InvalidConfig(String::from("rectified output requires a calibration model"))
            })?;
            let rect = rectification::rectify(&self.raw.left, &self.raw.right, model)?;

            for sink in self.sinks.iter_mut() {
                sink.accept(&rect, FrameKind::Rectified)?;
            }
        }

        if let Some((left, right)) = self.info.as_ref() {
            for sink in self.sinks.iter_mut() {
                sink.accept_info(&self.raw, left, right)?;
            }
        }

        if let Some(stats) = self.meter.record(Instant::now()) {
            info!(
                "Frames captured: {:5}    Average FPS: {:9.1}    Average time per frame: {:9.2} ms",
                stats.frames, stats.fps, stats.frame_time_ms
            );
        }

        Ok(true)
    }

    /// Start if idle, then process pairs until a camera closes, the frame limit is reached or
    /// a stop is requested. The cameras are released before this returns.
    ///
    /// A fatal error stops the pipeline and is returned as is.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state == PipelineState::Idle {
            self.start()?;
        }

        while self.state == PipelineState::Running {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.stop_reason = StopReason::Requested;
                break;
            }
            if let Some(max) = self.config.max_frames {
                if self.meter.total() >= max {
                    self.stop_reason = StopReason::FrameLimit;
                    break;
                }
            }

            if let Err(e) = self.step() {
                error!("Pipeline failed: {}", e);
                self.stop_reason = StopReason::Error;
                self.stop();
                return Err(e);
            }
        }

        self.stop();

        let summary = self.summary();
        info!(
            "Number of captured frames: {} ({})",
            summary.frames, summary.stop_reason
        );

        Ok(summary)
    }

    /// Stop the pipeline and release both cameras.
    ///
    /// Idempotent, and also valid on a pipeline that was never started.
    pub fn stop(&mut self) {
        if self.state == PipelineState::Stopped {
            return;
        }

        if self.stop_reason == StopReason::None {
            self.stop_reason = StopReason::Requested;
        }
        self.stream.stop();
        self.state = PipelineState::Stopped;
        info!("Pipeline stopped");
    }

    /// Summary of the run so far.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            frames: self.meter.total(),
            window_fps: self.meter.history().to_vec(),
            stop_reason: self.stop_reason,
            failure: self.stream.failure(),
        }
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
