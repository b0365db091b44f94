use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use fitbit_ingest::types::DEFAULT_SAMPLE_INTERVAL;
use fitbit_ingest::{
    IngestConfig, Ingestor, ReceiptTracker, RecordingStore, SampleEncoding, http, metrics,
    spawn_normalizer, spawn_writer,
};

/// Server configuration parsed from environment variables.
///
/// # Environment Variables
///
/// | Variable                   | Required | Default         | Description                              |
/// |----------------------------|----------|-----------------|------------------------------------------|
/// | `FITBIT_DATA_DIR`          | Yes      | --              | Directory holding one log per recording  |
/// | `FITBIT_LISTEN`            | No       | `0.0.0.0:12345` | Socket address to listen on              |
/// | `FITBIT_SAMPLE_INTERVAL`   | No       | `10`            | Nominal spacing between samples          |
/// | `FITBIT_DEFAULT_ENCODING`  | No       | `int16`         | Axis encoding when the upload names none |
/// | `FITBIT_WRITER_CAPACITY`   | No       | `64`            | Writer queue bound                       |
/// | `FITBIT_FINISHED_CAPACITY` | No       | `4096`          | Completed recordings remembered          |
/// | `FITBIT_IDLE_TIMEOUT_SECS` | No       | `3600`          | Idle time before a partial recording is forgotten |
/// | `FITBIT_MAX_UPLOAD_BYTES`  | No       | `1048576`       | Request body limit                       |
/// | `FITBIT_METRICS_LISTEN`    | No       | --              | Prometheus endpoint address              |
#[derive(Debug, Clone, PartialEq)]
struct Config {
    data_dir: PathBuf,
    listen_addr: SocketAddr,
    sample_interval: u64,
    default_encoding: SampleEncoding,
    writer_capacity: usize,
    finished_capacity: NonZeroUsize,
    idle_timeout: Duration,
    max_upload_bytes: usize,
    /// `None` disables the metrics endpoint.
    metrics_addr: Option<SocketAddr>,
}

/// Default listen address; port 12345 is what the companion app dials.
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:12345";

const DEFAULT_WRITER_CAPACITY: usize = 64;

const DEFAULT_FINISHED_CAPACITY: usize = 4096;

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 1024 * 1024;

/// Parse an optional environment variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| format!("{name} is not valid ({val:?}): {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Parse server configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` naming the variable if `FITBIT_DATA_DIR` is not set or
    /// any set variable fails to parse. Capacities, the sample interval, the idle
    /// timeout, and the upload limit must be nonzero.
    fn from_env() -> Result<Config, String> {
        let data_dir = std::env::var("FITBIT_DATA_DIR")
            .map(PathBuf::from)
            .map_err(|_| "FITBIT_DATA_DIR environment variable is required".to_string())?;

        let listen_addr = match std::env::var("FITBIT_LISTEN") {
            Ok(val) => val
                .parse::<SocketAddr>()
                .map_err(|e| format!("FITBIT_LISTEN is not a valid socket address: {e}"))?,
            Err(_) => DEFAULT_LISTEN_ADDR
                .parse::<SocketAddr>()
                .expect("default listen address is valid"),
        };

        let sample_interval = env_or("FITBIT_SAMPLE_INTERVAL", DEFAULT_SAMPLE_INTERVAL)?;
        if sample_interval == 0 {
            return Err("FITBIT_SAMPLE_INTERVAL must be nonzero".to_string());
        }

        let default_encoding = env_or("FITBIT_DEFAULT_ENCODING", SampleEncoding::default())?;

        let writer_capacity = env_or("FITBIT_WRITER_CAPACITY", DEFAULT_WRITER_CAPACITY)?;
        if writer_capacity == 0 {
            return Err("FITBIT_WRITER_CAPACITY must be nonzero".to_string());
        }

        let finished_capacity = NonZeroUsize::new(env_or(
            "FITBIT_FINISHED_CAPACITY",
            DEFAULT_FINISHED_CAPACITY,
        )?)
        .ok_or_else(|| "FITBIT_FINISHED_CAPACITY must be nonzero".to_string())?;

        let idle_secs = env_or("FITBIT_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS)?;
        if idle_secs == 0 {
            return Err("FITBIT_IDLE_TIMEOUT_SECS must be nonzero".to_string());
        }

        let max_upload_bytes = env_or("FITBIT_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        if max_upload_bytes == 0 {
            return Err("FITBIT_MAX_UPLOAD_BYTES must be nonzero".to_string());
        }

        let metrics_addr = match std::env::var("FITBIT_METRICS_LISTEN") {
            Ok(val) => Some(val.parse::<SocketAddr>().map_err(|e| {
                format!("FITBIT_METRICS_LISTEN is not a valid socket address: {e}")
            })?),
            Err(_) => None,
        };

        Ok(Config {
            data_dir,
            listen_addr,
            sample_interval,
            default_encoding,
            writer_capacity,
            finished_capacity,
            idle_timeout: Duration::from_secs(idle_secs),
            max_upload_bytes,
            metrics_addr,
        })
    }
}

/// Initialize the global `tracing` subscriber with an `EnvFilter`.
///
/// Reads `RUST_LOG`, defaulting to `"info"`. Uses `try_init()` so repeated calls
/// (e.g. across tests in the same process) are a silent no-op.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Waits for a shutdown signal: SIGINT on all platforms, plus SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
    }
}

/// Sweep period for a given idle timeout: a quarter of it, but at least a second.
fn sweep_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).max(Duration::from_secs(1))
}

/// Periodically forget receiving recordings that have gone idle.
fn spawn_idle_sweeper(
    tracker: Arc<ReceiptTracker>,
    idle_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_period(idle_timeout));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = tracker.evict_idle(idle_timeout);
            if evicted > 0 {
                tracing::info!(evicted, "Evicted idle recordings");
            }
            ::metrics::gauge!("fitbit_recordings_tracked").set(tracker.active_len() as f64);
        }
    })
}

#[tokio::main]
async fn main() {
    // 1. Initialize tracing.
    init_tracing();

    // 2. Read configuration from environment variables.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    tracing::info!(data_dir = %config.data_dir.display(), "Data directory");
    tracing::info!(
        sample_interval = config.sample_interval,
        default_encoding = %config.default_encoding,
        "Sample decoding"
    );

    // 3. Open the store, creating the data directory if needed.
    let store = match RecordingStore::open(&config.data_dir) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open store");
            std::process::exit(1);
        }
    };

    // 4. Spawn the writer, normalizer, and idle sweeper.
    let (writer_handle, writer_join) = spawn_writer(store, config.writer_capacity);
    let (normalizer_handle, normalizer_join) = spawn_normalizer(writer_handle.clone());
    let tracker = Arc::new(ReceiptTracker::new(config.finished_capacity));
    let sweeper = spawn_idle_sweeper(Arc::clone(&tracker), config.idle_timeout);

    let ingestor = Arc::new(Ingestor::new(
        writer_handle,
        normalizer_handle,
        tracker,
        IngestConfig {
            sample_interval: config.sample_interval,
            default_encoding: config.default_encoding,
        },
    ));
    let app = http::router(ingestor, config.max_upload_bytes);

    // 5. Install and serve metrics if an address was configured.
    if let Some(addr) = config.metrics_addr {
        match metrics::install_recorder() {
            Ok(handle) => {
                metrics::serve_metrics(handle, addr);
            }
            Err(e) => tracing::error!(error = %e, "Failed to install metrics recorder"),
        }
    }

    // 6. Bind and serve until a shutdown signal arrives.
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(
                addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            std::process::exit(1);
        });
    match listener.local_addr() {
        Ok(addr) => tracing::info!("Server listening on {addr}"),
        Err(e) => tracing::warn!(error = %e, "Listener has no local address"),
    }

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    // Shutdown sequence: the router (and with it the ingestor) is gone, so the
    // normalizer drains its queue, then the writer finishes and exits.
    tracing::info!("Shutting down");
    sweeper.abort();
    normalizer_join
        .await
        .expect("normalizer task should exit without panicking");
    writer_join
        .await
        .expect("writer task should exit without panicking");
}
