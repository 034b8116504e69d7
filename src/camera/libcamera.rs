//! libcamera capture through GStreamer
//!
//! `libcamerasrc` feeds `jpegenc`, and an `appsink` hands encoded frames to
//! the capture thread synchronously.

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info};

use super::jpeg::Rotation;
use super::{CaptureError, ChunkSource, StillSource};
use crate::config::CameraConfig;
use crate::streaming::Frame;

/// How long a pull may block before it counts as a failed capture
const PULL_TIMEOUT_MS: u64 = 2_000;

pub struct LibcameraSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl LibcameraSource {
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::Open(e.to_string()))?;

        let description = build_pipeline_string(config);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| CaptureError::Open(format!("{}: {}", description, e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::Open("parsed element is not a pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::Open("element 'sink' not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::Open("element 'sink' is not an appsink".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CaptureError::Open(format!("failed to start pipeline: {:?}", e)))?;

        info!(
            device = %config.device,
            resolution = %format!("{}x{}", config.width, config.height),
            fps = config.fps,
            "libcamera capture started"
        );

        Ok(Self { pipeline, appsink })
    }

    fn pull(&mut self) -> Result<Bytes, CaptureError> {
        let sample = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
            .ok_or_else(|| CaptureError::Device(std::io::Error::other("no sample from appsink")))?;

        let buffer = sample.buffer().ok_or(CaptureError::Empty)?;
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::Device(std::io::Error::other("unable to map buffer")))?;

        // GStreamer owns the buffer, so copy straight into Bytes
        Ok(Bytes::copy_from_slice(map.as_slice()))
    }
}

impl ChunkSource for LibcameraSource {
    fn next_chunk(&mut self) -> Result<Bytes, CaptureError> {
        self.pull()
    }

    fn whole_frames(&self) -> bool {
        // one image per appsink sample
        true
    }
}

impl StillSource for LibcameraSource {
    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        Ok(Frame::new(self.pull()?))
    }
}

impl Drop for LibcameraSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn build_pipeline_string(config: &CameraConfig) -> String {
    let camera = if config.device.starts_with("/base/") {
        format!("camera-name=\"{}\" ", config.device)
    } else {
        String::new()
    };

    let flip = match config.rotation() {
        Rotation::Upright => String::new(),
        Rotation::Clockwise90 => " ! videoflip video-direction=1".to_string(),
        Rotation::Rotate180 => " ! videoflip video-direction=2".to_string(),
        Rotation::Clockwise270 => " ! videoflip video-direction=3".to_string(),
    };

    format!(
        "libcamerasrc {camera}! video/x-raw,width={w},height={h},framerate={fps}/1{flip} ! queue max-size-buffers=2 leaky=downstream ! videoconvert ! jpegenc quality={q} ! appsink name=sink max-buffers=2 drop=true sync=false",
        camera = camera,
        w = config.width,
        h = config.height,
        fps = config.fps,
        flip = flip,
        q = config.quality,
    )
}
