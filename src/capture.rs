//! # Capture Worker Module
//!
//! A capture worker owns one device and grabs frames from it on a dedicated thread, depositing
//! each into its [`FrameBuffer`]. Workers do not reconnect: the first failed grab closes the
//! worker for good.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame_buffer::FrameBuffer;
use crate::source::FrameSource;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Default pause after each deposit, keeps the loop from spinning faster than the device.
pub const DEFAULT_YIELD: Duration = Duration::from_millis(5);

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Owns a capture device and the thread acquiring from it.
pub struct CaptureWorker {
    name: String,
    buffer: Arc<FrameBuffer>,
    open: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl CaptureWorker {
    /// Start a worker with the default yield interval.
    ///
    /// See [`CaptureWorker::spawn_with_yield`].
    pub fn spawn<N, F, S>(name: N, open: F) -> Result<Self>
    where
        N: Into<String>,
        F: FnOnce() -> Result<S> + Send + 'static,
        S: FrameSource,
    {
        Self::spawn_with_yield(name, DEFAULT_YIELD, open)
    }

    /// Start a worker whose device is opened by `open`.
    ///
    /// The device is opened on the worker thread itself and this function waits for the result,
    /// so an open failure is returned here and no worker is created.
    pub fn spawn_with_yield<N, F, S>(name: N, yield_interval: Duration, open: F) -> Result<Self>
    where
        N: Into<String>,
        F: FnOnce() -> Result<S> + Send + 'static,
        S: FrameSource,
    {
        let name = name.into();
        let buffer = Arc::new(FrameBuffer::new());
        let open_flag = Arc::new(AtomicBool::new(true));
        let failure = Arc::new(Mutex::new(None));

        let (ready_tx, ready_rx) = channel();

        let handle = {
            let buffer = buffer.clone();
            let open_flag = open_flag.clone();
            let failure = failure.clone();
            let worker_name = name.clone();

            thread::Builder::new()
                .name(format!("capture-{}", name))
                .spawn(move || {
                    let mut source = match open() {
                        Ok(s) => {
                            let _ = ready_tx.send(Ok(s.describe()));
                            s
                        }
                        Err(e) => {
                            open_flag.store(false, Ordering::SeqCst);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    let failed = capture_loop(&mut source, &buffer, &open_flag, yield_interval);
                    if let Some(reason) = failed {
                        error!("Camera {} closed: {}", worker_name, reason);
                        if let Ok(mut f) = failure.lock() {
                            *f = Some(reason);
                        }
                    }

                    // Release the device before the thread can be joined
                    drop(source);
                    open_flag.store(false, Ordering::SeqCst);
                    buffer.wake();
                })
                .map_err(|e| Error::ThreadSpawn {
                    device: name.clone(),
                    source: e,
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(device)) => {
                info!("Capture worker {} started on {}", name, device);

                Ok(Self {
                    name,
                    buffer,
                    open: open_flag,
                    failure,
                    handle: Mutex::new(Some(handle)),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::DeviceOpen {
                    device: name,
                    reason: String::from("capture thread exited before opening the device"),
                })
            }
        }
    }

    /// Name given to the worker, e.g. `left`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The buffer the worker deposits into.
    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Whether the acquisition loop is still running.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Why the worker closed on its own, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    /// Stop acquisition, join the thread and release the device.
    ///
    /// Safe to call repeatedly, and after the loop has already exited by itself. The loop only
    /// checks for the stop request between grabs, so this waits for an in-flight grab.
    pub fn stop(&self) {
        self.open.store(false, Ordering::SeqCst);

        let handle = match self.handle.lock() {
            Ok(mut h) => h.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Capture thread for {} panicked", self.name);
            }
            debug!("Capture worker {} stopped", self.name);
        }

        self.buffer.wake();
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Grab until stopped or the device fails, returning the failure reason if it did.
fn capture_loop<S: FrameSource>(
    source: &mut S,
    buffer: &FrameBuffer,
    open: &AtomicBool,
    yield_interval: Duration,
) -> Option<String> {
    let mut sequence = 1;

    while open.load(Ordering::SeqCst) {
        match source.grab() {
            Ok(mut frame) => {
                frame.sequence = sequence;
                sequence += 1;
                buffer.deposit(frame);
            }
            Err(e) => return Some(format!("{}", e)),
        }

        thread::sleep(yield_interval);
    }

    None
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
