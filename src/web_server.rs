use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{self, HeaderValue};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tokio::time::timeout;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{PageConfig, ServerConfig};
use crate::indicator::IndicatorController;
use crate::streaming::session::{shutdown_requested, STREAM_CONTENT_TYPE};
use crate::streaming::{FrameFeed, StreamSession};

pub const SERVER_NAME: &str = concat!("rpi-mjpeg-streamer/", env!("CARGO_PKG_VERSION"));

/// How long shutdown waits for open connections before giving up on them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>404 Not Found</title></head>
<body>
    <h1>404 - Page Not Found</h1>
    <p>The requested page was not found.</p>
    <p><a href="/index.html">Go to the camera</a></p>
</body>
</html>"#;

/// Everything a handler needs, shared by all connections
pub struct AppState {
    feed: FrameFeed,
    indicator: Arc<IndicatorController>,
    index_page: String,
    write_timeout: Duration,
    snapshot_timeout: Duration,
    next_session_id: AtomicU64,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(
        feed: FrameFeed,
        indicator: Arc<IndicatorController>,
        server: &ServerConfig,
        page: &PageConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            feed,
            indicator,
            index_page: render_index(page),
            write_timeout: server.write_timeout(),
            snapshot_timeout: server.snapshot_timeout(),
            next_session_id: AtomicU64::new(1),
            shutdown: Arc::new(shutdown),
        }
    }
}

/// Stops a running `WebServer` and every stream it is serving
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Routes; anything else, including targets that are not an origin path, gets 404
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/index.html", get(index))
        .route("/frame.jpg", get(snapshot))
        .route("/stream.mjpg", get(stream))
        .fallback(not_found)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct WebServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl WebServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A, state: AppState) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.state.shutdown),
        }
    }

    /// Serve until shut down, then give open connections a grace period
    pub async fn run(self) -> io::Result<()> {
        let addr = self.listener.local_addr()?;
        info!("Web server listening on http://{}", addr);

        let mut stop = self.state.shutdown.subscribe();
        let mut signal = self.state.shutdown.subscribe();
        let app = router(Arc::clone(&self.state)).into_make_service_with_connect_info::<SocketAddr>();

        let server = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown_requested(&mut signal).await })
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => return result,
            _ = shutdown_requested(&mut stop) => {}
        }

        info!("Web server stopping");
        match timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(result) => result?,
            Err(_) => warn!(
                grace = ?SHUTDOWN_GRACE,
                "Connections still open after grace period, closing"
            ),
        }

        info!("Web server stopped");
        Ok(())
    }
}

async fn root() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/index.html")],
    )
}

async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(state.index_page.clone())
}

/// Single still frame; the indicator is lit while it is acquired
async fn snapshot(State(state): State<Arc<AppState>>) -> Response {
    let _guard = state.indicator.enter();

    match state.feed.snapshot(state.snapshot_timeout).await {
        Ok(frame) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache, private"),
                (header::PRAGMA, "no-cache"),
            ],
            frame.as_bytes().clone(),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Snapshot capture failed");
            (StatusCode::SERVICE_UNAVAILABLE, "no frame available\n").into_response()
        }
    }
}

async fn stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    info!(session_id = id, %peer, "Stream client connected");

    let (session, body) = StreamSession::new(
        id,
        state.feed.clone(),
        &state.indicator,
        state.shutdown.subscribe(),
        state.write_timeout,
    );
    tokio::spawn(async move {
        let report = session.run().await;
        debug!(?report, "Stream session report");
    });

    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::AGE, "0"),
            (header::CACHE_CONTROL, "no-cache, private"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

async fn not_found() -> (StatusCode, Html<&'static str>) {
    (StatusCode::NOT_FOUND, Html(NOT_FOUND_PAGE))
}

fn render_index(page: &PageConfig) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: Arial, sans-serif; margin: 0; padding: 20px; background: #f0f0f0; text-align: center; }}
        img {{ max-width: 100%; border-radius: 10px; }}
    </style>
</head>
<body>
    <h1>{heading}</h1>
    <img src="stream.mjpg" alt="Live camera stream">
    <p><a href="frame.jpg">Snapshot</a></p>
</body>
</html>
"#,
        title = escape_html(&page.title),
        heading = escape_html(&page.heading),
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
