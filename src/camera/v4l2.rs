use bytes::Bytes;
use tracing::{info, warn};
use v4l::{
    buffer::Type,
    io::{mmap::Stream as MmapStream, traits::CaptureStream},
    video::Capture,
    Device, FourCC, Fraction,
};

use super::{CaptureError, ChunkSource, StillSource};
use crate::config::CameraConfig;
use crate::streaming::Frame;

/// V4L2 camera negotiated to emit MJPEG; each dequeued buffer is one JPEG
pub struct V4l2Source {
    stream: MmapStream<'static>,
    // keeps the device handle open for the lifetime of the stream
    _device: Device,
}

impl V4l2Source {
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        let device = Device::with_path(&config.device)
            .map_err(|e| CaptureError::Open(format!("{}: {}", config.device, e)))?;

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(b"MJPG");
        let fmt = device.set_format(&fmt)?;

        if fmt.fourcc != FourCC::new(b"MJPG") {
            return Err(CaptureError::Open(format!(
                "{} does not support MJPEG output (negotiated {})",
                config.device, fmt.fourcc
            )));
        }
        info!("Camera format set for {}: {}", config.device, fmt);

        let mut params = device.params()?;
        params.interval = Fraction::new(1, config.fps);
        if let Err(e) = device.set_params(&params) {
            warn!(error = %e, "Camera rejected frame interval, using driver default");
        }

        if config.rotation != 0 {
            warn!(
                rotation = config.rotation,
                "V4L2 MJPEG frames are passed through unrotated"
            );
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, 4)?;

        Ok(Self {
            stream,
            _device: device,
        })
    }

    fn dequeue(&mut self) -> Result<Bytes, CaptureError> {
        let (buf, meta) = self.stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(CaptureError::Empty);
        }
        Ok(Bytes::copy_from_slice(&buf[..used]))
    }
}

impl ChunkSource for V4l2Source {
    fn next_chunk(&mut self) -> Result<Bytes, CaptureError> {
        self.dequeue()
    }

    fn whole_frames(&self) -> bool {
        // one image per dequeued buffer
        true
    }
}

impl StillSource for V4l2Source {
    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        let frame = Frame::new(self.dequeue()?);
        if !frame.is_jpeg() {
            return Err(CaptureError::Encode("device buffer is not a JPEG".to_string()));
        }
        Ok(frame)
    }
}
