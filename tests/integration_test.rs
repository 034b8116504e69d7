use anyhow::Result;
use parking_lot::Mutex;
use rpi_mjpeg_streamer::camera::test_pattern::TestPattern;
use rpi_mjpeg_streamer::camera::StillCamera;
use rpi_mjpeg_streamer::config::{CameraConfig, PageConfig, ServerConfig};
use rpi_mjpeg_streamer::indicator::{IndicatorController, IndicatorPin};
use rpi_mjpeg_streamer::streaming::session::encode_part_header;
use rpi_mjpeg_streamer::streaming::{Frame, FrameBuffer, FrameFeed};
use rpi_mjpeg_streamer::web_server::{AppState, ShutdownHandle, WebServer};
use rstest::rstest;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const FRAME_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    On,
    Off,
}

/// Indicator pin that remembers every drive request
#[derive(Clone, Default)]
struct RecordingPin {
    log: Arc<Mutex<Vec<Drive>>>,
}

impl IndicatorPin for RecordingPin {
    fn set_on(&mut self) {
        self.log.lock().push(Drive::On);
    }

    fn set_off(&mut self) {
        self.log.lock().push(Drive::Off);
    }
}

/// In-process server on an ephemeral port with a frame buffer the test publishes to
struct TestServer {
    addr: SocketAddr,
    buffer: Arc<FrameBuffer>,
    indicator: Arc<IndicatorController>,
    pin_log: Arc<Mutex<Vec<Drive>>>,
    shutdown: ShutdownHandle,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let buffer = Arc::new(FrameBuffer::new());
        Self::start_with(FrameFeed::Live(Arc::clone(&buffer)), buffer).await
    }

    async fn start_with(feed: FrameFeed, buffer: Arc<FrameBuffer>) -> Result<Self> {
        let pin = RecordingPin::default();
        let pin_log = Arc::clone(&pin.log);
        let indicator = Arc::new(IndicatorController::new(Box::new(pin)));

        let server_config = ServerConfig {
            snapshot_timeout_ms: 200,
            write_timeout_ms: 1_000,
            ..ServerConfig::default()
        };
        let state = AppState::new(
            feed,
            Arc::clone(&indicator),
            &server_config,
            &PageConfig::default(),
        );

        let server = WebServer::bind("127.0.0.1:0", state).await?;
        let addr = server.local_addr()?;
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        Ok(TestServer {
            addr,
            buffer,
            indicator,
            pin_log,
            shutdown,
            task: Some(task),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn pin_log(&self) -> Vec<Drive> {
        self.pin_log.lock().clone()
    }

    /// Open `/stream.mjpg`; returns once the response head has arrived
    async fn open_stream(&self) -> Result<StreamClient> {
        let response = reqwest::get(self.url("/stream.mjpg")).await?;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        Ok(StreamClient {
            response,
            pending: Vec::new(),
        })
    }

    async fn wait_until_idle(&self) -> Result<()> {
        timeout(Duration::from_secs(5), async {
            while self.indicator.is_on() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(())
    }

    async fn stop(mut self) -> Result<()> {
        self.shutdown.shutdown();
        if let Some(task) = self.task.take() {
            timeout(Duration::from_secs(5), task).await???;
        }
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

/// Reads the multipart body of one stream response
struct StreamClient {
    response: reqwest::Response,
    pending: Vec<u8>,
}

impl StreamClient {
    fn header(&self, name: &str) -> String {
        self.response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.pending.len() < len {
            match self.response.chunk().await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => anyhow::bail!("stream ended after {} bytes", self.pending.len()),
            }
        }
        Ok(self.pending.drain(..len).collect())
    }

    /// Everything left until the server ends the body
    async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        while let Some(chunk) = self.response.chunk().await? {
            self.pending.extend_from_slice(&chunk);
        }
        Ok(std::mem::take(&mut self.pending))
    }

    /// Read until `needle` shows up or the body ends
    async fn read_until_contains(&mut self, needle: &[u8]) -> Result<bool> {
        loop {
            if self.pending.windows(needle.len()).any(|w| w == needle) {
                return Ok(true);
            }
            match self.response.chunk().await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => return Ok(false),
            }
        }
    }
}

/// Send a hand-written request and return the status line of the answer
async fn raw_status_line(addr: SocketAddr, request: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut line = Vec::new();
    while !line.ends_with(b"\r\n") {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
    }
    Ok(String::from_utf8(line)?.trim_end().to_string())
}

fn jpeg(index: u8, body_len: usize) -> Frame {
    let mut data = vec![0xFF, 0xD8];
    data.extend(std::iter::repeat(index).take(body_len));
    data.extend_from_slice(&[0xFF, 0xD9]);
    Frame::new(data)
}

fn encode_parts(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(encode_part_header(frame.len()).as_bytes());
        out.extend_from_slice(frame.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn no_redirect_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[rstest]
#[case("/unknown-path")]
#[case("/index.htm")]
#[case("/stream.mjpeg")]
#[case("/frame.jpg/extra")]
#[tokio::test]
async fn test_unknown_path_returns_404(#[case] path: &str) -> Result<()> {
    let server = TestServer::start().await?;

    let resp = reqwest::get(server.url(path)).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    assert!(resp.text().await?.contains("404"));

    server.stop().await
}

#[rstest]
#[case::relative_target("GET index.html HTTP/1.1\r\nHost: camera\r\n\r\n")]
#[case::absolute_form("GET http://camera/unknown-path HTTP/1.1\r\nHost: camera\r\n\r\n")]
#[tokio::test]
async fn test_target_without_known_path_returns_404(#[case] request: &str) -> Result<()> {
    let server = TestServer::start().await?;

    let status = timeout(Duration::from_secs(5), raw_status_line(server.addr, request)).await??;
    assert_eq!(status, "HTTP/1.1 404 Not Found");

    server.stop().await
}

#[tokio::test]
async fn test_unknown_path_returns_404_while_streaming() -> Result<()> {
    let server = TestServer::start().await?;
    let _stream = server.open_stream().await?;
    server.buffer.publish(jpeg(1, 64));

    let resp = reqwest::get(server.url("/unknown-path")).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    assert!(server.indicator.is_on());

    server.stop().await
}

#[tokio::test]
async fn test_root_redirects_to_index() -> Result<()> {
    let server = TestServer::start().await?;

    let resp = no_redirect_client().get(server.url("/")).send().await?;
    assert_eq!(resp.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
    assert_eq!(resp.headers()["location"], "/index.html");

    server.stop().await
}

#[tokio::test]
async fn test_index_page_embeds_stream() -> Result<()> {
    let server = TestServer::start().await?;

    let resp = reqwest::get(server.url("/index.html")).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()?
        .starts_with("text/html"));

    let body = resp.text().await?;
    assert!(body.contains(r#"<img src="stream.mjpg""#));
    assert!(body.contains("Raspberry Pi - Chicken Cam!"));

    server.stop().await
}

#[tokio::test]
async fn test_non_get_is_rejected() -> Result<()> {
    let server = TestServer::start().await?;

    let resp = reqwest::Client::new()
        .post(server.url("/stream.mjpg"))
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
    assert!(!server.indicator.is_on());

    server.stop().await
}

#[tokio::test]
async fn test_three_clients_receive_every_frame_in_order() -> Result<()> {
    let server = TestServer::start().await?;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = server.open_stream().await?;
        assert_eq!(
            client.header("content-type"),
            "multipart/x-mixed-replace; boundary=FRAME"
        );
        assert_eq!(client.header("age"), "0");
        assert_eq!(client.header("cache-control"), "no-cache, private");
        assert_eq!(client.header("pragma"), "no-cache");
        assert!(client.header("server").starts_with("rpi-mjpeg-streamer/"));
        clients.push(client);
    }
    assert_eq!(server.pin_log(), vec![Drive::Off, Drive::On]);

    let frames: Vec<Frame> = (1..=5u8)
        .map(|i| jpeg(i, 500 * i as usize + 17))
        .collect();
    let expected = encode_parts(&frames);

    let readers: Vec<_> = clients
        .into_iter()
        .map(|mut client| {
            let len = expected.len();
            tokio::spawn(async move {
                let received = client.read_exact(len).await?;
                Ok::<_, anyhow::Error>((client, received))
            })
        })
        .collect();

    for frame in &frames {
        server.buffer.publish(frame.clone());
        sleep(Duration::from_millis(FRAME_INTERVAL_MS)).await;
    }

    let mut clients = Vec::new();
    for reader in readers {
        let (client, received) = timeout(Duration::from_secs(5), reader).await???;
        assert_eq!(received.len(), expected.len());
        assert!(received == expected, "client stream does not match F1..F5");
        clients.push(client);
    }

    // closing the source ends every stream cleanly
    server.buffer.close();
    for mut client in clients {
        let rest = timeout(Duration::from_secs(5), client.read_to_end()).await??;
        assert!(rest.is_empty());
    }

    server.wait_until_idle().await?;
    assert_eq!(server.pin_log(), vec![Drive::Off, Drive::On, Drive::Off]);

    server.stop().await
}

#[tokio::test]
async fn test_snapshot_lights_indicator_only_during_request() -> Result<()> {
    let server = TestServer::start().await?;
    let frame = jpeg(9, 2048);
    server.buffer.publish(frame.clone());

    let resp = reqwest::get(server.url("/frame.jpg")).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    assert_eq!(
        resp.headers()["content-length"].to_str()?,
        frame.len().to_string()
    );
    assert_eq!(&resp.bytes().await?[..], &frame.as_bytes()[..]);

    server.wait_until_idle().await?;
    assert_eq!(server.pin_log(), vec![Drive::Off, Drive::On, Drive::Off]);

    server.stop().await
}

#[tokio::test]
async fn test_snapshot_during_stream_keeps_indicator_on() -> Result<()> {
    let server = TestServer::start().await?;
    let _stream = server.open_stream().await?;
    server.buffer.publish(jpeg(1, 256));

    let resp = reqwest::get(server.url("/frame.jpg")).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    resp.bytes().await?;

    // give the snapshot handler time to release its guard
    sleep(Duration::from_millis(100)).await;
    assert!(server.indicator.is_on());
    assert_eq!(server.indicator.active(), 1);
    assert_eq!(server.pin_log(), vec![Drive::Off, Drive::On]);

    server.stop().await
}

#[tokio::test]
async fn test_snapshot_without_frames_is_unavailable() -> Result<()> {
    let server = TestServer::start().await?;

    let resp = reqwest::get(server.url("/frame.jpg")).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    server.wait_until_idle().await?;
    server.stop().await
}

#[tokio::test]
async fn test_disconnected_client_is_reaped() -> Result<()> {
    let server = TestServer::start().await?;

    let mut dead = TcpStream::connect(server.addr).await?;
    dead.write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: camera\r\n\r\n")
        .await?;
    let mut alive = server.open_stream().await?;

    timeout(Duration::from_secs(5), async {
        while server.indicator.active() < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    drop(dead);

    // keep publishing until the dead session notices its client is gone
    let mut tag = 0u8;
    timeout(Duration::from_secs(5), async {
        while server.indicator.active() > 1 {
            tag = tag.wrapping_add(1);
            server.buffer.publish(jpeg(tag, 1024));
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    assert!(server.indicator.is_on());

    // the surviving client still receives complete parts
    let marker = jpeg(0xAB, 100);
    let expected = encode_parts(std::slice::from_ref(&marker));
    server.buffer.publish(marker);

    let found = timeout(
        Duration::from_secs(5),
        alive.read_until_contains(&expected),
    )
    .await??;
    assert!(found);

    server.stop().await
}

#[tokio::test]
async fn test_shutdown_closes_stream_clients() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.open_stream().await?;

    let indicator = Arc::clone(&server.indicator);
    server.stop().await?;

    // the body ends, cleanly or with the connection
    let _ = timeout(Duration::from_secs(5), client.read_to_end()).await?;
    assert!(!indicator.is_on());

    Ok(())
}

#[tokio::test]
async fn test_still_mode_serves_fresh_captures() -> Result<()> {
    let camera_config = CameraConfig {
        width: 32,
        height: 24,
        fps: 60,
        ..CameraConfig::default()
    };
    let buffer = Arc::new(FrameBuffer::new());
    let camera = StillCamera::new(
        Box::new(TestPattern::new(&camera_config)),
        Arc::clone(&buffer),
    );
    let feed = FrameFeed::OnDemand {
        camera,
        interval: camera_config.frame_interval(),
    };
    let server = TestServer::start_with(feed, Arc::clone(&buffer)).await?;

    for expected_generation in 1..=2 {
        let resp = reqwest::get(server.url("/frame.jpg")).await?;
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body = resp.bytes().await?;
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
        assert_eq!(buffer.generation(), expected_generation);
    }

    let mut client = server.open_stream().await?;
    let part = timeout(Duration::from_secs(5), client.read_exact(64)).await??;
    assert!(part.starts_with(b"--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: "));

    server.stop().await
}
