//! Viewer binary entry point
//!
//! Connects to the signaling broker, negotiates a media session with the
//! analysis peer, and runs the receive pipeline end to end: packet ingest,
//! frame/result synchronization, overlay composition, presentation.
//!
//! # Usage
//!
//! ```bash
//! # Connect to a local broker with defaults
//! cargo run -p scopelink-viewer
//!
//! # Point at a deployment and dump overlay PNGs for inspection
//! cargo run -p scopelink-viewer -- \
//!   --signaling-url wss://broker.example.net/signal \
//!   --ice-url https://broker.example.net/ice-config \
//!   --surface png --png-dir ./frames
//!
//! # With logging
//! RUST_LOG=debug cargo run -p scopelink-viewer
//! ```
//!
//! # Environment Variables
//!
//! - `SCOPELINK_SIGNALING_URL`: broker WebSocket endpoint
//! - `SCOPELINK_ICE_CONFIG_URL`: connectivity config endpoint
//! - `RUST_LOG`: logging level (default: `info`)

mod surface;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scopelink_core::{BoundedQueue, ViewerConfig};
use scopelink_pipeline::{LatencyMonitor, RenderLoop, SyncPump};
use scopelink_webrtc::{
    IceConfigFetcher, MediaIngest, PassthroughDecoder, SessionEvent, SessionManager,
    WebRtcPeerFactory, WebSocketSignaling,
};

use surface::{PngSurface, StatsSurface};

/// Composites buffered between the synchronizer and the render loop.
const SYNCED_QUEUE_CAPACITY: usize = 4;

/// Scopelink Viewer
///
/// Receiving client for the remote-analysis video pipeline. Renders the
/// incoming video with detection overlays on a headless surface.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, env = "SCOPELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Session id to offer. A random one is generated when omitted.
    #[arg(short, long, env = "SCOPELINK_SESSION_ID")]
    session: Option<String>,

    /// Signaling broker URL, overriding the config file
    #[arg(long)]
    signaling_url: Option<String>,

    /// Connectivity config URL, overriding the config file
    #[arg(long)]
    ice_url: Option<String>,

    /// Presentation surface
    #[arg(long, value_enum, default_value = "stats")]
    surface: SurfaceMode,

    /// Output directory for the png surface
    #[arg(long, default_value = "./frames")]
    png_dir: PathBuf,

    /// Write every Nth presented composite (png surface)
    #[arg(long, default_value_t = 30)]
    png_every: u64,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum SurfaceMode {
    /// Log a presentation summary once per second
    Stats,
    /// Dump composites as PNG files
    Png,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("scopelink-viewer")
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ViewerConfig::load(args.config.as_deref())?;
    if let Some(url) = args.signaling_url.clone() {
        config.signaling.url = url;
    }
    if let Some(url) = args.ice_url.clone() {
        config.ice.config_url = url;
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        signaling = %config.signaling.url,
        budget_ms = config.latency.budget_ms,
        "scopelink viewer starting"
    );

    let channel = Arc::new(WebSocketSignaling::connect(&config.signaling.url).await?);
    let ice = Arc::new(IceConfigFetcher::new(config.ice.clone()));
    let factory = Arc::new(WebRtcPeerFactory::new(config.session.clone()));
    let (manager, mut events) = SessionManager::new(config.clone(), channel, factory, ice);

    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let media = manager.open(&session_id)?;

    let frames = Arc::new(BoundedQueue::new(config.sync.frame_queue_capacity));
    let synced = Arc::new(BoundedQueue::new(SYNCED_QUEUE_CAPACITY));
    let monitor = Arc::new(LatencyMonitor::new(&config.latency, &config.sync)?);
    let (shutdown_tx, _) = broadcast::channel(1);

    let ingest = MediaIngest::new(
        Arc::clone(&media.packets),
        Arc::clone(&frames),
        Box::new(PassthroughDecoder),
    );
    let ingest_task = tokio::spawn(ingest.run());

    let pump = SyncPump::new(
        Arc::clone(&frames),
        Arc::clone(&media.results),
        Arc::clone(&synced),
        &config.sync,
        monitor.feedback(),
    );
    let pump_task = tokio::spawn(pump.run());

    let render_task = match args.surface {
        SurfaceMode::Stats => tokio::spawn(
            RenderLoop::new(
                Arc::clone(&synced),
                StatsSurface::new(),
                config.render.clone(),
                Arc::clone(&monitor),
                shutdown_tx.subscribe(),
            )
            .run(),
        ),
        SurfaceMode::Png => {
            let png = PngSurface::new(args.png_dir.clone(), args.png_every)?;
            info!(dir = %args.png_dir.display(), every = args.png_every, "png surface enabled");
            tokio::spawn(
                RenderLoop::new(
                    Arc::clone(&synced),
                    png,
                    config.render.clone(),
                    Arc::clone(&monitor),
                    shutdown_tx.subscribe(),
                )
                .run(),
            )
        }
    };

    let stats = Arc::clone(&monitor);
    let mut stats_shutdown = shutdown_tx.subscribe();
    let stats_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        // The first tick is immediate and would log an empty window.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!(
                        avg_ms = stats.average_us() / 1000,
                        p95_ms = stats.percentile_us(0.95) / 1000,
                        degraded = stats.is_degraded(),
                        presented = stats.frames_presented(),
                        "latency summary"
                    );
                }
                _ = stats_shutdown.recv() => break,
            }
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Connected { session_id }) => {
                    info!(%session_id, "session connected");
                }
                Some(SessionEvent::Reconnecting { session_id, attempt }) => {
                    warn!(%session_id, attempt, "session recovering");
                }
                Some(SessionEvent::Closed { session_id }) => {
                    info!(%session_id, "session closed by remote");
                    break;
                }
                Some(SessionEvent::Failed { session_id, reason }) => {
                    error!(%session_id, %reason, "session failed");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, closing session");
                manager.close(&session_id).await;
                break;
            }
        }
    }

    manager.shutdown().await;
    let _ = shutdown_tx.send(());
    let _ = ingest_task.await;
    let _ = pump_task.await;
    let _ = render_task.await;
    let _ = stats_task.await;

    println!("{}", monitor.report());
    info!("viewer shutdown complete");
    Ok(())
}
