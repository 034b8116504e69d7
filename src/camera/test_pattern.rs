//! Synthetic camera for running without hardware
//!
//! Renders a moving gradient as raw RGB, encodes it like a sensor pipeline
//! would, and paces itself to the configured frame rate.

use bytes::Bytes;
use std::thread;
use std::time::{Duration, Instant};

use super::jpeg::{JpegEncoder, RawFrame};
use super::{CaptureError, ChunkSource, StillSource};
use crate::config::CameraConfig;
use crate::streaming::Frame;

/// Bytes handed out per `next_chunk`, so frames arrive split like a real driver's writes
const CHUNK_SIZE: usize = 16 * 1024;

pub struct TestPattern {
    width: u32,
    height: u32,
    interval: Duration,
    encoder: JpegEncoder,
    next_deadline: Instant,
    tick: u32,
    pending: Bytes,
}

impl TestPattern {
    pub fn new(config: &CameraConfig) -> Self {
        tracing::info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            rotation = config.rotation,
            "Using synthetic test pattern (no camera hardware required)"
        );

        Self {
            width: config.width,
            height: config.height,
            interval: config.frame_interval(),
            encoder: JpegEncoder::new(config.quality, config.rotation()),
            next_deadline: Instant::now(),
            tick: 0,
            pending: Bytes::new(),
        }
    }

    /// Sleep until the next frame slot, like a sensor running at a fixed rate
    fn wait_for_slot(&mut self) {
        let now = Instant::now();
        if self.next_deadline > now {
            thread::sleep(self.next_deadline - now);
        }
        self.next_deadline = Instant::now().max(self.next_deadline) + self.interval;
    }

    fn render(&mut self) -> RawFrame {
        let t = self.tick;
        self.tick = self.tick.wrapping_add(1);

        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                rgb.push((x.wrapping_add(t.wrapping_mul(4)) % 256) as u8);
                rgb.push((y.wrapping_add(t.wrapping_mul(2)) % 256) as u8);
                rgb.push((t % 256) as u8);
            }
        }

        RawFrame {
            width: self.width,
            height: self.height,
            rgb,
        }
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        self.wait_for_slot();
        let raw = self.render();
        self.encoder.encode(raw)
    }
}

impl ChunkSource for TestPattern {
    fn next_chunk(&mut self) -> Result<Bytes, CaptureError> {
        if self.pending.is_empty() {
            self.pending = self.next_frame()?.as_bytes().clone();
        }
        let take = self.pending.len().min(CHUNK_SIZE);
        Ok(self.pending.split_to(take))
    }
}

impl StillSource for TestPattern {
    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        self.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::jpeg::JpegSplitter;

    fn small_config() -> CameraConfig {
        CameraConfig {
            width: 64,
            height: 48,
            fps: 120,
            rotation: 90,
            ..CameraConfig::default()
        }
    }

    #[test]
    fn test_still_capture_is_rotated_jpeg() {
        let mut pattern = TestPattern::new(&small_config());
        let frame = pattern.capture_still().unwrap();
        assert!(frame.is_jpeg());

        let decoded = image::load_from_memory(frame.as_bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (48, 64));
    }

    #[test]
    fn test_chunks_reassemble_into_frames() {
        let mut pattern = TestPattern::new(&small_config());
        let mut splitter = JpegSplitter::new();
        let mut frames = Vec::new();

        while frames.len() < 2 {
            let chunk = pattern.next_chunk().unwrap();
            frames.extend(splitter.push(&chunk));
        }

        for frame in frames {
            assert!(frame.is_jpeg());
            assert_eq!(&frame.as_bytes()[frame.len() - 2..], &[0xFF, 0xD9]);
        }
    }
}
