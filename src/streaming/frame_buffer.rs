/// Single-slot frame buffer shared by the capture thread and every stream session
///
/// The buffer keeps only the most recent complete JPEG. Publishing swaps the
/// slot and bumps the generation in one step under the channel lock, then
/// wakes every waiter. Readers ask for "anything newer than the generation I
/// last sent"; a slow reader skips frames instead of queueing them, so memory
/// stays bounded by one frame per in-flight write.
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// One complete encoded JPEG image
///
/// Backed by `Bytes`, so cloning a frame hands out another reference to the
/// same allocation rather than copying image data.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// True when the data starts with the JPEG start-of-image marker
    pub fn is_jpeg(&self) -> bool {
        self.data.starts_with(&[0xFF, 0xD8])
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame").field("len", &self.data.len()).finish()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Returned to waiters once the buffer has been shut down
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("frame buffer closed")]
pub struct BufferClosed;

/// Statistics for monitoring frame publication
#[derive(Debug, Clone)]
pub struct FrameStats {
    pub frames_published: u64,
    pub current_generation: u64,
    pub waiters: usize,
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    generation: u64,
    closed: bool,
}

/// Latest-frame slot with a generation counter
///
/// Generation 0 means nothing has been published yet; every publish
/// increments it by exactly one.
pub struct FrameBuffer {
    tx: watch::Sender<Slot>,
    frames_published: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Slot::default());

        Self {
            tx,
            frames_published: AtomicU64::new(0),
        }
    }

    /// Replace the current frame and wake all waiters
    ///
    /// Returns the generation assigned to the frame. After `close` the frame
    /// is discarded and the last generation is returned unchanged.
    pub fn publish(&self, frame: Frame) -> u64 {
        let mut generation = 0;

        let published = self.tx.send_if_modified(|slot| {
            generation = slot.generation;
            if slot.closed {
                return false;
            }
            slot.generation += 1;
            slot.frame = Some(frame);
            generation = slot.generation;
            true
        });

        if published {
            self.frames_published.fetch_add(1, Ordering::Relaxed);
            debug!(generation, "Frame published");
        } else {
            debug!("Frame dropped - buffer closed");
        }

        generation
    }

    /// Wait until a generation newer than `last` is published
    ///
    /// The predicate is evaluated under the channel lock before suspending,
    /// so a publish racing with the call is never lost. Never returns a
    /// generation less than or equal to `last`.
    pub async fn wait_for_next(&self, last: u64) -> Result<(Frame, u64), BufferClosed> {
        let mut rx = self.tx.subscribe();
        let slot = rx
            .wait_for(|slot| slot.closed || slot.generation > last)
            .await
            .map_err(|_| BufferClosed)?;

        if slot.closed {
            return Err(BufferClosed);
        }

        match &slot.frame {
            Some(frame) => Ok((frame.clone(), slot.generation)),
            None => Err(BufferClosed),
        }
    }

    /// Most recently published frame, if any
    pub fn latest(&self) -> Option<(Frame, u64)> {
        let slot = self.tx.borrow();
        if slot.closed {
            return None;
        }
        slot.frame.clone().map(|frame| (frame, slot.generation))
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    /// Shut the buffer down; current and future waiters get `BufferClosed`
    pub fn close(&self) {
        let closed = self.tx.send_if_modified(|slot| {
            if slot.closed {
                return false;
            }
            slot.closed = true;
            slot.frame = None;
            true
        });

        if closed {
            info!("Frame buffer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            current_generation: self.generation(),
            waiters: self.tx.receiver_count(),
        }
    }

    /// Log statistics (call periodically for monitoring)
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            published = stats.frames_published,
            generation = stats.current_generation,
            waiters = stats.waiters,
            "Frame buffer stats"
        );
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
