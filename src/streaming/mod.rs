pub mod frame_buffer;
pub mod session;

pub use frame_buffer::{BufferClosed, Frame, FrameBuffer, FrameStats};
pub use session::{PartStream, SessionEnd, SessionError, SessionReport, StreamSession};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::camera::{CaptureError, StillCamera};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("frame source closed")]
    Closed,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("no frame available within {0:?}")]
    Timeout(Duration),
}

impl From<BufferClosed> for FeedError {
    fn from(_: BufferClosed) -> Self {
        FeedError::Closed
    }
}

/// Where sessions and snapshots get their frames from
///
/// `Live` reads what the capture thread publishes. `OnDemand` asks the camera
/// for a fresh still on every request, paced to the configured frame rate
/// when streaming.
#[derive(Clone)]
pub enum FrameFeed {
    Live(Arc<FrameBuffer>),
    OnDemand {
        camera: StillCamera,
        interval: Duration,
    },
}

impl FrameFeed {
    /// Next frame newer than generation `last`
    pub async fn next_frame(&self, last: u64) -> Result<(Frame, u64), FeedError> {
        match self {
            FrameFeed::Live(buffer) => Ok(buffer.wait_for_next(last).await?),
            FrameFeed::OnDemand { camera, .. } => {
                if camera.buffer().is_closed() {
                    return Err(FeedError::Closed);
                }
                let (frame, generation) = camera.capture().await?;
                // a capture racing with close publishes nothing new
                if generation <= last {
                    return Err(FeedError::Closed);
                }
                Ok((frame, generation))
            }
        }
    }

    /// One frame for a snapshot response
    ///
    /// Live feeds answer with the most recent frame, waiting up to `limit`
    /// for the first one after startup. On-demand feeds capture exactly once.
    pub async fn snapshot(&self, limit: Duration) -> Result<Frame, FeedError> {
        match self {
            FrameFeed::Live(buffer) => {
                if let Some((frame, _)) = buffer.latest() {
                    return Ok(frame);
                }
                let (frame, _) = timeout(limit, buffer.wait_for_next(0))
                    .await
                    .map_err(|_| FeedError::Timeout(limit))??;
                Ok(frame)
            }
            FrameFeed::OnDemand { camera, .. } => {
                let (frame, _) = timeout(limit, camera.capture())
                    .await
                    .map_err(|_| FeedError::Timeout(limit))??;
                Ok(frame)
            }
        }
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        match self {
            FrameFeed::Live(buffer) => buffer,
            FrameFeed::OnDemand { camera, .. } => camera.buffer(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.buffer().generation()
    }

    /// Minimum spacing between frames a session pulls, if the feed needs pacing
    pub fn pacing(&self) -> Option<Duration> {
        match self {
            FrameFeed::Live(_) => None,
            FrameFeed::OnDemand { interval, .. } => Some(*interval),
        }
    }
}
