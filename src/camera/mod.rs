//! Camera capture: frame sources, the capture thread and still captures

pub mod jpeg;
pub mod test_pattern;

#[cfg(feature = "libcamera")]
pub mod libcamera;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{CameraConfig, CaptureSource};
use crate::streaming::{Frame, FrameBuffer};
use jpeg::JpegSplitter;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open camera: {0}")]
    Open(String),

    #[error("device error: {0}")]
    Device(#[from] std::io::Error),

    #[error("JPEG encoding failed: {0}")]
    Encode(String),

    #[error("capture returned no image data")]
    Empty,

    #[error("capture worker failed: {0}")]
    Worker(String),

    #[error("capture source {0:?} is not compiled in (enable the `{1}` feature)")]
    Unsupported(CaptureSource, &'static str),
}

/// Camera delivering an MJPEG byte stream
pub trait ChunkSource: Send {
    /// Block until the device hands over the next piece of the stream
    fn next_chunk(&mut self) -> Result<Bytes, CaptureError>;

    /// True when every non-empty chunk is exactly one JPEG
    ///
    /// Such chunks are published as they arrive instead of waiting for the
    /// next SOI to close them.
    fn whole_frames(&self) -> bool {
        false
    }
}

/// Camera that produces one complete JPEG per request
pub trait StillSource: Send {
    fn capture_still(&mut self) -> Result<Frame, CaptureError>;
}

/// Open the configured source for continuous streaming
pub fn open_chunk_source(config: &CameraConfig) -> Result<Box<dyn ChunkSource>, CaptureError> {
    match config.source {
        CaptureSource::TestPattern => Ok(Box::new(test_pattern::TestPattern::new(config))),
        #[cfg(feature = "v4l2")]
        CaptureSource::V4l2 => Ok(Box::new(v4l2::V4l2Source::open(config)?)),
        #[cfg(not(feature = "v4l2"))]
        CaptureSource::V4l2 => Err(CaptureError::Unsupported(config.source, "v4l2")),
        #[cfg(feature = "libcamera")]
        CaptureSource::Libcamera => Ok(Box::new(libcamera::LibcameraSource::open(config)?)),
        #[cfg(not(feature = "libcamera"))]
        CaptureSource::Libcamera => Err(CaptureError::Unsupported(config.source, "libcamera")),
    }
}

/// Open the configured source for on-demand still captures
pub fn open_still_source(config: &CameraConfig) -> Result<Box<dyn StillSource>, CaptureError> {
    match config.source {
        CaptureSource::TestPattern => Ok(Box::new(test_pattern::TestPattern::new(config))),
        #[cfg(feature = "v4l2")]
        CaptureSource::V4l2 => Ok(Box::new(v4l2::V4l2Source::open(config)?)),
        #[cfg(not(feature = "v4l2"))]
        CaptureSource::V4l2 => Err(CaptureError::Unsupported(config.source, "v4l2")),
        #[cfg(feature = "libcamera")]
        CaptureSource::Libcamera => Ok(Box::new(libcamera::LibcameraSource::open(config)?)),
        #[cfg(not(feature = "libcamera"))]
        CaptureSource::Libcamera => Err(CaptureError::Unsupported(config.source, "libcamera")),
    }
}

/// Settings for the capture thread
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Pause after a failed read before trying again
    pub retry_delay: Duration,
    /// Log statistics every this many frames (0 disables)
    pub stats_every: u64,
}

impl CaptureSettings {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            retry_delay: config.retry_delay(),
            stats_every: 100,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            stats_every: 100,
        }
    }
}

/// Statistics for capture
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub is_running: bool,
}

#[derive(Default)]
struct CaptureCounters {
    frames: AtomicU64,
    failures: AtomicU64,
}

/// Dedicated thread pulling chunks from a source into a `FrameBuffer`
///
/// The only writer of the buffer in streaming mode. A failed read is logged
/// and retried; it never ends the thread.
pub struct CaptureTask {
    is_running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    buffer: Arc<FrameBuffer>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureTask {
    pub fn spawn(
        mut source: Box<dyn ChunkSource>,
        buffer: Arc<FrameBuffer>,
        settings: CaptureSettings,
    ) -> Result<Self, CaptureError> {
        let is_running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(CaptureCounters::default());

        let handle = {
            let is_running = Arc::clone(&is_running);
            let counters = Arc::clone(&counters);
            let buffer = Arc::clone(&buffer);

            thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || {
                    let whole_frames = source.whole_frames();
                    info!(whole_frames, "Capture thread started");
                    let mut splitter = JpegSplitter::new();

                    while is_running.load(Ordering::Relaxed) {
                        let chunk = match source.next_chunk() {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                let failures = counters.failures.fetch_add(1, Ordering::Relaxed) + 1;
                                warn!(error = %e, failures, "Capture failed, retrying");
                                thread::sleep(settings.retry_delay);
                                continue;
                            }
                        };

                        let frames = if !whole_frames {
                            splitter.push(&chunk)
                        } else if chunk.is_empty() {
                            Vec::new()
                        } else {
                            let frame = Frame::new(chunk);
                            if !frame.is_jpeg() {
                                let failures = counters.failures.fetch_add(1, Ordering::Relaxed) + 1;
                                warn!(bytes = frame.len(), failures, "Device buffer is not a JPEG, dropped");
                                continue;
                            }
                            vec![frame]
                        };

                        for frame in frames {
                            let frames = counters.frames.fetch_add(1, Ordering::Relaxed) + 1;
                            buffer.publish(frame);

                            if settings.stats_every > 0 && frames % settings.stats_every == 0 {
                                debug!(
                                    frames,
                                    failures = counters.failures.load(Ordering::Relaxed),
                                    discarded = splitter.bytes_discarded(),
                                    "Capture progress"
                                );
                                buffer.log_stats();
                            }
                        }
                    }

                    info!("Capture thread stopped");
                })
                .map_err(|e| CaptureError::Worker(e.to_string()))?
        };

        Ok(Self {
            is_running,
            counters,
            buffer,
            handle: Some(handle),
        })
    }

    /// Stop the thread, wait for it, and close the buffer so sessions finish
    pub fn stop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
        }

        self.buffer.close();
    }

    /// `stop` for async callers: the join runs on the blocking pool
    pub async fn shutdown(mut self) -> Result<CaptureStats, CaptureError> {
        tokio::task::spawn_blocking(move || {
            self.stop();
            self.stats()
        })
        .await
        .map_err(|e| CaptureError::Worker(e.to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.frames.load(Ordering::Relaxed),
            capture_failures: self.counters.failures.load(Ordering::Relaxed),
            is_running: self.is_running(),
        }
    }
}

impl Drop for CaptureTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Still captures shared by every session and snapshot in still mode
///
/// Captures are serialised on the camera; each result is also published to
/// the buffer so generations stay monotonic across callers.
#[derive(Clone)]
pub struct StillCamera {
    source: Arc<Mutex<Box<dyn StillSource>>>,
    buffer: Arc<FrameBuffer>,
}

impl StillCamera {
    pub fn new(source: Box<dyn StillSource>, buffer: Arc<FrameBuffer>) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            buffer,
        }
    }

    /// Capture one frame off the async runtime
    pub async fn capture(&self) -> Result<(Frame, u64), CaptureError> {
        let source = Arc::clone(&self.source);
        let buffer = Arc::clone(&self.buffer);

        tokio::task::spawn_blocking(move || {
            let mut source = source.lock();
            let frame = source.capture_still()?;
            if frame.is_empty() {
                return Err(CaptureError::Empty);
            }
            let generation = buffer.publish(frame.clone());
            Ok((frame, generation))
        })
        .await
        .map_err(|e| CaptureError::Worker(e.to_string()))?
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }
}
