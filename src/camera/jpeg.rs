//! JPEG frame boundary detection and encoding
//!
//! Some cameras in MJPEG mode hand us an unframed byte stream. Every JPEG
//! starts with the SOI marker (`FF D8`) and entropy-coded data stuffs any `FF`
//! with a zero byte, so an SOI in the stream is taken as an image boundary.
//! That does not hold for images that embed a thumbnail (an EXIF APP1 segment
//! carries its own SOI), so sources that hand over one complete image per
//! buffer bypass the splitter.

use bytes::BytesMut;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::{imageops, ExtendedColorType, RgbImage};
use tracing::warn;

use super::CaptureError;
use crate::streaming::Frame;

/// JPEG marker codes
mod markers {
    pub const PREFIX: u8 = 0xFF;
    pub const SOI: u8 = 0xD8; // Start of Image
}

/// Default upper bound for a single frame in progress
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Splits a raw MJPEG byte stream into complete frames at SOI markers
///
/// Each SOI ends the frame in progress and starts the next one. Bytes before
/// the first SOI are discarded.
pub struct JpegSplitter {
    buf: BytesMut,
    in_frame: bool,
    max_frame_bytes: usize,
    bytes_discarded: u64,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(256 * 1024),
            in_frame: false,
            max_frame_bytes,
            bytes_discarded: 0,
        }
    }

    /// Feed the next chunk, returning every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        // A marker may straddle chunks, so rescan the last byte we kept.
        let mut pos = self.buf.len().saturating_sub(1);
        if self.in_frame {
            // buf starts with the SOI of the frame in progress
            pos = pos.max(2);
        }
        self.buf.extend_from_slice(chunk);

        while let Some(offset) = find_soi(&self.buf[pos..]) {
            let head = self.buf.split_to(pos + offset);
            if self.in_frame {
                frames.push(Frame::new(head.freeze()));
            } else {
                self.bytes_discarded += head.len() as u64;
            }
            self.in_frame = true;
            pos = 2;
        }

        if !self.in_frame {
            self.discard_keeping_prefix();
        } else if self.buf.len() > self.max_frame_bytes {
            warn!(
                bytes = self.buf.len(),
                limit = self.max_frame_bytes,
                "JPEG frame exceeded size limit, resynchronising"
            );
            self.in_frame = false;
            self.discard_keeping_prefix();
        }

        frames
    }

    /// Bytes thrown away while searching for a frame start
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }

    /// Drop everything except a trailing `FF` that could begin the next SOI
    fn discard_keeping_prefix(&mut self) {
        let keep = usize::from(self.buf.last() == Some(&markers::PREFIX));
        let drop = self.buf.len() - keep;
        self.bytes_discarded += drop as u64;
        let _ = self.buf.split_to(drop);
    }
}

impl Default for JpegSplitter {
    fn default() -> Self {
        Self::new()
    }
}

fn find_soi(data: &[u8]) -> Option<usize> {
    data.windows(2)
        .position(|w| w[0] == markers::PREFIX && w[1] == markers::SOI)
}

/// Clockwise sensor rotation applied before encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Upright,
    Clockwise90,
    Rotate180,
    Clockwise270,
}

impl Rotation {
    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::Upright),
            90 => Some(Rotation::Clockwise90),
            180 => Some(Rotation::Rotate180),
            270 => Some(Rotation::Clockwise270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Upright => 0,
            Rotation::Clockwise90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Clockwise270 => 270,
        }
    }

    /// Output size for a sensor of `width` x `height`
    pub fn output_size(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Rotation::Clockwise90 | Rotation::Clockwise270 => (height, width),
            Rotation::Upright | Rotation::Rotate180 => (width, height),
        }
    }
}

/// Uncompressed RGB8 image straight from a sensor
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Encodes raw RGB frames into JPEG
#[derive(Debug, Clone)]
pub struct JpegEncoder {
    quality: u8,
    rotation: Rotation,
}

impl JpegEncoder {
    pub fn new(quality: u8, rotation: Rotation) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            rotation,
        }
    }

    pub fn encode(&self, raw: RawFrame) -> Result<Frame, CaptureError> {
        let (width, height) = (raw.width, raw.height);
        let image = RgbImage::from_raw(width, height, raw.rgb).ok_or_else(|| {
            CaptureError::Encode(format!("buffer too small for {}x{} RGB frame", width, height))
        })?;

        let image = match self.rotation {
            Rotation::Upright => image,
            Rotation::Clockwise90 => imageops::rotate90(&image),
            Rotation::Rotate180 => imageops::rotate180(&image),
            Rotation::Clockwise270 => imageops::rotate270(&image),
        };

        let mut out = Vec::with_capacity((image.width() * image.height()) as usize / 4);
        ImageJpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| CaptureError::Encode(e.to_string()))?;

        Ok(Frame::new(out))
    }
}
