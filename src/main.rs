//! MJPEG camera streamer CLI

use anyhow::{Context, Result};
use clap::Parser;
use rpi_mjpeg_streamer::camera::{self, CaptureSettings, CaptureTask, StillCamera};
use rpi_mjpeg_streamer::config::{CaptureMode, CaptureSource, Config, IndicatorConfig};
use rpi_mjpeg_streamer::indicator::{IndicatorController, IndicatorPin, LogIndicator};
use rpi_mjpeg_streamer::streaming::{FrameBuffer, FrameFeed};
use rpi_mjpeg_streamer::web_server::{AppState, WebServer};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rpi-mjpeg-streamer")]
#[command(about = "Live MJPEG stream and snapshots from a Raspberry Pi camera")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults apply if it does not exist)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// HTTP port, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to listen on, overrides the configuration file
    #[arg(long)]
    bind_ip: Option<String>,

    /// Camera backend
    #[arg(long, value_enum)]
    source: Option<CaptureSource>,

    /// Continuous stream capture or on-demand stills
    #[arg(long, value_enum)]
    mode: Option<CaptureMode>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind_ip) = &self.bind_ip {
            config.server.bind_ip = bind_ip.clone();
        }
        if let Some(source) = self.source {
            config.camera.source = source;
        }
        if let Some(mode) = self.mode {
            config.camera.mode = mode;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("MJPEG streamer starting");
    info!(config_path = %cli.config, "Loading configuration");

    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = ?config.camera.source,
        mode = ?config.camera.mode,
        resolution = %format!("{}x{}", config.camera.width, config.camera.height),
        fps = config.camera.fps,
        rotation = config.camera.rotation,
        "Configuration loaded"
    );

    let indicator = Arc::new(IndicatorController::new(open_indicator(&config.indicator)?));
    let buffer = Arc::new(FrameBuffer::new());

    let (feed, capture) = match config.camera.mode {
        CaptureMode::Stream => {
            let source = camera::open_chunk_source(&config.camera)
                .context("Failed to open camera for streaming")?;
            let task = CaptureTask::spawn(
                source,
                Arc::clone(&buffer),
                CaptureSettings::from_config(&config.camera),
            )
            .context("Failed to start capture thread")?;
            (FrameFeed::Live(Arc::clone(&buffer)), Some(task))
        }
        CaptureMode::Still => {
            let source = camera::open_still_source(&config.camera)
                .context("Failed to open camera for still capture")?;
            let camera = StillCamera::new(source, Arc::clone(&buffer));
            let feed = FrameFeed::OnDemand {
                camera,
                interval: config.camera.frame_interval(),
            };
            (feed, None)
        }
    };

    let state = AppState::new(feed, Arc::clone(&indicator), &config.server, &config.page);
    let address = config.server.listen_address();
    let server = WebServer::bind(&address, state)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;

    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    info!("Streaming started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.shutdown();
    buffer.close();
    if let Some(task) = capture {
        match task.shutdown().await {
            Ok(stats) => info!(
                frames = stats.frames_captured,
                failures = stats.capture_failures,
                "Capture stopped"
            ),
            Err(e) => error!(error = %e, "Failed to stop capture"),
        }
    }

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Web server failed"),
        Err(e) => error!(error = %e, "Web server task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}

fn open_indicator(config: &IndicatorConfig) -> Result<Box<dyn IndicatorPin>> {
    if !config.enabled {
        info!("Indicator disabled, logging transitions only");
        return Ok(Box::new(LogIndicator));
    }

    #[cfg(feature = "gpio")]
    {
        let pin = rpi_mjpeg_streamer::indicator::gpio::GpioIndicator::new(config.gpio_pin)
            .with_context(|| format!("Failed to open GPIO pin {} for the indicator", config.gpio_pin))?;
        Ok(Box::new(pin))
    }

    #[cfg(not(feature = "gpio"))]
    {
        info!(
            gpio_pin = config.gpio_pin,
            "Built without the `gpio` feature, logging indicator transitions only"
        );
        Ok(Box::new(LogIndicator))
    }
}
