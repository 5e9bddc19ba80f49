use clap::Parser;
use occupancy_bridge::api;
use occupancy_bridge::config::{self, Config};
use occupancy_bridge::engine::BridgeEngine;
use occupancy_bridge::error::AppError;
use occupancy_bridge::engine::clock::SystemClock;
use occupancy_bridge::feed::adafruit::{AdafruitIoClient, AioCredentials};
use occupancy_bridge::feed::{DisabledFeed, FeedPublisher, FeedSink};
use occupancy_bridge::forecast::remote::HttpForecastSource;
use occupancy_bridge::occupancy::Capacity;
use occupancy_bridge::sensor::serial::SerialDiscovery;
use occupancy_bridge::state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Bridge serial occupancy sensors to a forecast service and a cloud feed.
#[derive(Debug, Parser)]
#[command(name = "occupancy-bridge", version)]
struct Cli {
    /// Log at debug level, including every packet sent to the sensors
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file [default: config/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Venue capacity (1-65534)
    #[arg(allow_negative_numbers = true)]
    capacity: i64,

    /// Feed key used for the forecast request and the cloud feed
    feed_key: String,
}

fn init_tracing(level: &str) {
    let level = level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_from_path(path)?,
        None => config::load_default()?,
    };
    init_tracing(if cli.verbose {
        "debug"
    } else {
        config.log_level()
    });

    let capacity = Capacity::new(cli.capacity)?;
    tracing::info!(
        app = config.app_name(),
        capacity = capacity.get(),
        feed_key = %cli.feed_key,
        "occupancy-bridge starting"
    );

    let state = Arc::new(RwLock::new(AppState::new()));
    let stop = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit_rx) = oneshot::channel();
    let engine = spawn_engine(
        config.clone(),
        cli.feed_key.clone(),
        capacity,
        Arc::clone(&state),
        Arc::clone(&stop),
        ExitNotice::new(exit_tx),
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(serve(config.server_port(), state, exit_rx));

    stop.store(true, Ordering::Relaxed);
    let joined = engine.join();
    let reason = served?;
    let status = exit_status(reason, joined);
    match &status {
        Ok(()) => tracing::info!("occupancy-bridge stopped"),
        Err(err) => tracing::error!(error = %err, "occupancy-bridge stopped"),
    }
    status
}

/// Why the status server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReason {
    Signal,
    EngineExited,
}

/// Fires when dropped, so the server also learns about an engine panic.
struct ExitNotice(Option<oneshot::Sender<()>>);

impl ExitNotice {
    fn new(sender: oneshot::Sender<()>) -> Self {
        Self(Some(sender))
    }
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(());
        }
    }
}

fn spawn_engine(
    config: Config,
    feed_key: String,
    capacity: Capacity,
    state: Arc<RwLock<AppState>>,
    stop: Arc<AtomicBool>,
    exit: ExitNotice,
) -> std::io::Result<JoinHandle<Result<(), AppError>>> {
    std::thread::Builder::new()
        .name("bridge-engine".to_string())
        .spawn(move || {
            let _exit = exit;
            let result = run_engine(&config, &feed_key, capacity, state, &stop);
            if let Err(err) = &result {
                tracing::error!(error = %err, "Bridge engine failed");
            }
            result
        })
}

fn run_engine(
    config: &Config,
    feed_key: &str,
    capacity: Capacity,
    state: Arc<RwLock<AppState>>,
    stop: &AtomicBool,
) -> Result<(), AppError> {
    let forecast = HttpForecastSource::new(
        config.forecast_url(),
        feed_key,
        config.forecast_interval_minutes(),
        config.forecast_timeout(),
    )?;
    let discovery = SerialDiscovery::new(config.device_dir(), config.baud_rate());

    let engine = BridgeEngine::new(
        config.bridge_settings(feed_key),
        i64::from(capacity.get()),
        Box::new(forecast),
        discovery,
        build_feed(config),
        Arc::new(SystemClock::new()),
    )?;
    engine.with_state(state).run(stop);
    Ok(())
}

/// Process result once the server is down and the engine thread is joined.
fn exit_status(
    reason: ShutdownReason,
    joined: std::thread::Result<Result<(), AppError>>,
) -> Result<(), Box<dyn std::error::Error>> {
    match joined {
        Err(_) => Err("bridge engine thread panicked".into()),
        Ok(Err(err)) => Err(err.into()),
        Ok(Ok(())) if reason == ShutdownReason::EngineExited => {
            Err("bridge engine stopped unexpectedly".into())
        }
        Ok(Ok(())) => Ok(()),
    }
}

/// Cloud feed publisher, or a disabled sink when credentials are missing.
fn build_feed(config: &Config) -> Box<dyn FeedSink> {
    let credentials = match AioCredentials::from_env() {
        Ok(credentials) => credentials,
        Err(err) => {
            tracing::warn!(error = %err, "Feed credentials not set, occupancy will not be published");
            return Box::new(DisabledFeed);
        }
    };
    match AdafruitIoClient::new(config.feed_url(), credentials, config.feed_timeout()) {
        Ok(client) => Box::new(FeedPublisher::spawn(client)),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to build feed client, occupancy will not be published");
            Box::new(DisabledFeed)
        }
    }
}

async fn serve(
    port: Option<u16>,
    state: Arc<RwLock<AppState>>,
    engine_exit: oneshot::Receiver<()>,
) -> Result<ShutdownReason, Box<dyn std::error::Error>> {
    let Some(port) = port else {
        tracing::info!("Status API disabled, press Ctrl-C to stop");
        return Ok(wait_for_shutdown(shutdown_signal(), engine_exit).await);
    };

    let app = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");

    let (reason_tx, reason_rx) = oneshot::channel();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = wait_for_shutdown(shutdown_signal(), engine_exit).await;
            let _ = reason_tx.send(reason);
        })
        .await?;
    Ok(reason_rx.await.unwrap_or(ShutdownReason::Signal))
}

/// Resolve on Ctrl-C or when the engine thread is gone, whichever comes first.
async fn wait_for_shutdown(
    signal: impl Future<Output = ()>,
    engine_exit: oneshot::Receiver<()>,
) -> ShutdownReason {
    tokio::select! {
        () = signal => ShutdownReason::Signal,
        _ = engine_exit => {
            tracing::error!("Bridge engine exited, shutting down");
            ShutdownReason::EngineExited
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
