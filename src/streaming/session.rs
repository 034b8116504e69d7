//! One client's multipart MJPEG stream
//!
//! A session walks `Starting -> Streaming -> Closing -> Closed`. It feeds the
//! body of its HTTP response through a short queue and owns nothing else; a
//! client that goes away or stops reading ends this session only, and the
//! capture pipeline never waits on it.

use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use super::{FeedError, Frame, FrameFeed};
use crate::indicator::{IndicatorController, IndicatorGuard};

/// Multipart boundary token
pub const BOUNDARY: &str = "FRAME";

pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=FRAME";

/// Parts a session may queue ahead of a slow client
pub const PART_QUEUE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Streaming,
    Closing,
    Closed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("client took no part for {0:?}")]
    Timeout(Duration),
}

/// Why a session finished
#[derive(Debug)]
pub enum SessionEnd {
    /// The server is shutting down
    Shutdown,
    /// The frame source was closed
    SourceClosed,
    /// The client dropped the response or stopped reading it
    Disconnected(SessionError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Shutdown => write!(f, "server shutdown"),
            SessionEnd::SourceClosed => write!(f, "frame source closed"),
            SessionEnd::Disconnected(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub last_generation: u64,
    pub end: SessionEnd,
}

/// Boundary line and part headers preceding a JPEG of `len` bytes
pub fn encode_part_header(len: usize) -> String {
    format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY, len
    )
}

/// One complete multipart part: headers, JPEG, trailing CRLF
pub fn encode_part(frame: &Frame) -> Bytes {
    let header = encode_part_header(frame.len());
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(frame.as_bytes());
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Resolves once shutdown is requested or the sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // the borrow returned by wait_for must not outlive this call
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Response body of one session
///
/// Yields encoded parts until the session ends. Dropping it (the client went
/// away) ends the session and releases its indicator guard.
pub struct PartStream {
    inner: ReceiverStream<Bytes>,
}

impl Stream for PartStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|part| part.map(Ok))
    }
}

pub struct StreamSession {
    id: u64,
    feed: FrameFeed,
    parts: mpsc::Sender<Bytes>,
    shutdown: watch::Receiver<bool>,
    write_timeout: Duration,
    state: SessionState,
    guard: Option<IndicatorGuard>,
    pacing: Option<Interval>,
    last_generation: u64,
    frames_sent: u64,
    bytes_sent: u64,
}

impl StreamSession {
    /// Open a session and the response body it feeds
    ///
    /// The indicator is lit and the starting generation recorded here, before
    /// the response head is sent. Only frames published after this point
    /// reach the client.
    pub fn new(
        id: u64,
        feed: FrameFeed,
        indicator: &Arc<IndicatorController>,
        shutdown: watch::Receiver<bool>,
        write_timeout: Duration,
    ) -> (Self, PartStream) {
        let (parts, rx) = mpsc::channel(PART_QUEUE);

        let session = Self {
            id,
            last_generation: feed.generation(),
            feed,
            parts,
            shutdown,
            write_timeout,
            state: SessionState::Starting,
            guard: Some(indicator.enter()),
            pacing: None,
            frames_sent: 0,
            bytes_sent: 0,
        };

        let body = PartStream {
            inner: ReceiverStream::new(rx),
        };
        (session, body)
    }

    /// Drive the session to completion; the body ends when this returns
    pub async fn run(mut self) -> SessionReport {
        self.start();
        let end = self.stream().await;
        self.close(&end);

        SessionReport {
            id: self.id,
            frames_sent: self.frames_sent,
            bytes_sent: self.bytes_sent,
            last_generation: self.last_generation,
            end,
        }
    }

    fn start(&mut self) {
        debug_assert_eq!(self.state, SessionState::Starting);

        self.pacing = self.feed.pacing().map(|period| {
            let mut pacing = interval(period);
            pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pacing
        });

        self.transition(SessionState::Streaming);
        info!(
            session_id = self.id,
            generation = self.last_generation,
            "Stream session started"
        );
    }

    async fn stream(&mut self) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return SessionEnd::Shutdown,
                _ = self.parts.closed() => {
                    return SessionEnd::Disconnected(SessionError::ClientDisconnected);
                }
                next = next_frame(&self.feed, &mut self.pacing, self.last_generation) => next,
            };

            let (frame, generation) = match next {
                Ok(next) => next,
                Err(FeedError::Closed) => return SessionEnd::SourceClosed,
                Err(e) => {
                    warn!(session_id = self.id, error = %e, "Frame unavailable, retrying");
                    continue;
                }
            };

            if let Err(e) = self.send_part(&frame).await {
                return SessionEnd::Disconnected(e);
            }

            self.last_generation = generation;
            self.frames_sent += 1;
        }
    }

    async fn send_part(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let part = encode_part(frame);
        let len = part.len() as u64;

        match timeout(self.write_timeout, self.parts.send(part)).await {
            Ok(Ok(())) => {
                self.bytes_sent += len;
                Ok(())
            }
            Ok(Err(_)) => Err(SessionError::ClientDisconnected),
            Err(_) => Err(SessionError::Timeout(self.write_timeout)),
        }
    }

    fn close(&mut self, end: &SessionEnd) {
        self.transition(SessionState::Closing);
        self.guard.take();
        self.transition(SessionState::Closed);

        match end {
            SessionEnd::Disconnected(e) => info!(
                session_id = self.id,
                frames = self.frames_sent,
                bytes = self.bytes_sent,
                error = %e,
                "Stream client went away"
            ),
            _ => info!(
                session_id = self.id,
                frames = self.frames_sent,
                bytes = self.bytes_sent,
                reason = %end,
                "Stream session ended"
            ),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            matches!(
                (self.state, next),
                (SessionState::Starting, SessionState::Streaming)
                    | (SessionState::Streaming, SessionState::Closing)
                    | (SessionState::Closing, SessionState::Closed)
            ),
            "invalid session transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(session_id = self.id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}

async fn next_frame(
    feed: &FrameFeed,
    pacing: &mut Option<Interval>,
    last: u64,
) -> Result<(Frame, u64), FeedError> {
    if let Some(pacing) = pacing {
        pacing.tick().await;
    }
    feed.next_frame(last).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CaptureError, StillCamera, StillSource};
    use crate::indicator::IndicatorPin;
    use crate::streaming::FrameBuffer;
    use assert_matches::assert_matches;
    use tokio::time::sleep;
    use tokio_stream::StreamExt;

    struct NullPin;

    impl IndicatorPin for NullPin {
        fn set_on(&mut self) {}
        fn set_off(&mut self) {}
    }

    struct Harness {
        buffer: Arc<FrameBuffer>,
        indicator: Arc<IndicatorController>,
        shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn new() -> Self {
            let (shutdown, _) = watch::channel(false);
            Self {
                buffer: Arc::new(FrameBuffer::new()),
                indicator: Arc::new(IndicatorController::new(Box::new(NullPin))),
                shutdown,
            }
        }

        fn session_with(&self, id: u64, feed: FrameFeed) -> (StreamSession, PartStream) {
            StreamSession::new(
                id,
                feed,
                &self.indicator,
                self.shutdown.subscribe(),
                Duration::from_millis(200),
            )
        }

        fn session(&self, id: u64) -> (StreamSession, PartStream) {
            self.session_with(id, FrameFeed::Live(Arc::clone(&self.buffer)))
        }
    }

    fn jpeg(tag: u8) -> Frame {
        Frame::new(vec![0xFF, 0xD8, tag, tag, tag, 0xFF, 0xD9])
    }

    async fn next_part(parts: &mut PartStream) -> Bytes {
        match timeout(Duration::from_secs(1), parts.next()).await {
            Ok(Some(Ok(part))) => part,
            Ok(None) => panic!("stream ended early"),
            Err(_) => panic!("no part within 1s"),
        }
    }

    #[test]
    fn test_part_header_format() {
        assert_eq!(
            encode_part_header(1234),
            "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: 1234\r\n\r\n"
        );
    }

    #[test]
    fn test_part_wraps_whole_jpeg() {
        let frame = jpeg(7);
        let part = encode_part(&frame);

        let header = encode_part_header(frame.len());
        assert!(part.starts_with(header.as_bytes()));
        assert_eq!(&part[header.len()..part.len() - 2], &frame.as_bytes()[..]);
        assert!(part.ends_with(b"\r\n"));
    }

    #[test]
    fn test_content_type_names_boundary() {
        assert!(STREAM_CONTENT_TYPE.starts_with("multipart/x-mixed-replace"));
        assert!(STREAM_CONTENT_TYPE.ends_with(&format!("boundary={}", BOUNDARY)));
    }

    #[tokio::test]
    async fn test_streams_frames_published_after_start() {
        let harness = Harness::new();
        harness.buffer.publish(jpeg(0));

        let (session, mut parts) = harness.session(1);
        assert!(harness.indicator.is_on());
        let session = tokio::spawn(session.run());

        // the frame published before the session opened is never sent
        for tag in 1..=3 {
            harness.buffer.publish(jpeg(tag));
            assert_eq!(next_part(&mut parts).await, encode_part(&jpeg(tag)));
        }
        harness.buffer.close();
        assert!(parts.next().await.is_none());

        let report = session.await.unwrap();
        assert_matches!(report.end, SessionEnd::SourceClosed);
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.last_generation, 4);
        assert!(!harness.indicator.is_on());
    }

    #[tokio::test]
    async fn test_dropped_body_only_ends_that_session() {
        let harness = Harness::new();

        let (healthy, mut healthy_parts) = harness.session(1);
        let (dropped, dropped_parts) = harness.session(2);
        assert_eq!(harness.indicator.active(), 2);

        let healthy = tokio::spawn(healthy.run());
        let dropped = tokio::spawn(dropped.run());

        // released while idle, without waiting for another frame
        drop(dropped_parts);
        let report = timeout(Duration::from_secs(1), dropped)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(
            report.end,
            SessionEnd::Disconnected(SessionError::ClientDisconnected)
        );
        assert_eq!(report.frames_sent, 0);
        assert_eq!(harness.indicator.active(), 1);
        assert!(harness.indicator.is_on());

        harness.buffer.publish(jpeg(1));
        assert_eq!(next_part(&mut healthy_parts).await, encode_part(&jpeg(1)));
        harness.buffer.publish(jpeg(2));
        assert_eq!(next_part(&mut healthy_parts).await, encode_part(&jpeg(2)));

        harness.shutdown.send_replace(true);
        let report = healthy.await.unwrap();
        assert_matches!(report.end, SessionEnd::Shutdown);
        assert_eq!(report.frames_sent, 2);
        assert!(!harness.indicator.is_on());
    }

    #[tokio::test]
    async fn test_stalled_client_times_out() {
        let harness = Harness::new();
        // held but never polled, so the queue fills up
        let (session, _parts) = harness.session(1);
        let session = tokio::spawn(session.run());

        for tag in 1..=(PART_QUEUE as u8 + 1) {
            harness.buffer.publish(jpeg(tag));
            sleep(Duration::from_millis(20)).await;
        }

        let report = timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(
            report.end,
            SessionEnd::Disconnected(SessionError::Timeout(_))
        );
        assert_eq!(report.frames_sent, PART_QUEUE as u64);
        assert_eq!(harness.indicator.active(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_session() {
        let harness = Harness::new();
        let (session, mut parts) = harness.session(7);
        let session = tokio::spawn(session.run());

        harness.shutdown.send_replace(true);

        let report = timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.id, 7);
        assert_matches!(report.end, SessionEnd::Shutdown);
        assert!(parts.next().await.is_none());
    }

    struct SequenceStill {
        next: u8,
        fail_every: u8,
    }

    impl StillSource for SequenceStill {
        fn capture_still(&mut self) -> Result<Frame, CaptureError> {
            self.next += 1;
            if self.next % self.fail_every == 0 {
                return Err(CaptureError::Empty);
            }
            Ok(jpeg(self.next))
        }
    }

    #[tokio::test]
    async fn test_on_demand_session_survives_capture_failure() {
        let harness = Harness::new();
        let feed = FrameFeed::OnDemand {
            camera: StillCamera::new(
                Box::new(SequenceStill {
                    next: 0,
                    fail_every: 2,
                }),
                Arc::clone(&harness.buffer),
            ),
            interval: Duration::from_millis(5),
        };

        let (session, mut parts) = harness.session_with(1, feed);
        let session = tokio::spawn(session.run());

        // captures 1 and 3 succeed, 2 fails and is skipped
        assert_eq!(next_part(&mut parts).await, encode_part(&jpeg(1)));
        assert_eq!(next_part(&mut parts).await, encode_part(&jpeg(3)));

        harness.shutdown.send_replace(true);
        drop(parts);
        let report = session.await.unwrap();
        assert!(report.frames_sent >= 2);
    }
}
