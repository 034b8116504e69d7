//! Live MJPEG streaming from a Raspberry Pi camera
//!
//! One capture source feeds a single-slot `FrameBuffer`; every HTTP client on
//! `/stream.mjpg` gets its own `StreamSession` reading from that buffer, and
//! `/frame.jpg` serves one still. An indicator (an LED on a GPIO pin) is lit
//! while anything is using the camera.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpi_mjpeg_streamer::config::Config;
//! use rpi_mjpeg_streamer::indicator::{IndicatorController, LogIndicator};
//! use rpi_mjpeg_streamer::streaming::{FrameBuffer, FrameFeed};
//! use rpi_mjpeg_streamer::web_server::{AppState, WebServer};
//!
//! # async fn run() -> std::io::Result<()> {
//! let config = Config::default();
//! let buffer = Arc::new(FrameBuffer::new());
//! let indicator = Arc::new(IndicatorController::new(Box::new(LogIndicator)));
//! let state = AppState::new(FrameFeed::Live(buffer), indicator, &config.server, &config.page);
//! WebServer::bind(config.server.listen_address(), state).await?.run().await
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod indicator;
pub mod streaming;
pub mod web_server;

// Re-exports for convenience
pub use camera::{CaptureError, CaptureTask, StillCamera};
pub use config::Config;
pub use indicator::{IndicatorController, IndicatorGuard, IndicatorPin, LogIndicator};
pub use streaming::{Frame, FrameBuffer, FrameFeed, StreamSession};
pub use web_server::{AppState, ShutdownHandle, WebServer};
