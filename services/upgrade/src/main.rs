use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, ValueEnum};
use store::{
    CompletenessPolicy, DEFAULT_AUTO_SAVE_INTERVAL, DEFAULT_EVICTION_AGE,
    DEFAULT_MAX_SNAPSHOT_BYTES, DEFAULT_SNAPSHOT_FILE, DEFAULT_STORAGE_DIR, Durability,
    SessionStore, StoreConfig,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use upgrade::transport::{UpgradeRuntime, serve_http_with_workers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportRuntime {
    Std,
    Axum,
}

impl TransportRuntime {
    fn as_str(self) -> &'static str {
        match self {
            Self::Std => "std",
            Self::Axum => "axum",
        }
    }
}

/// Firmware upgrade session service.
#[derive(Debug, Parser)]
#[command(name = "upgrade", version)]
struct Cli {
    /// Serve the HTTP API instead of loading the store and exiting.
    #[arg(long)]
    serve: bool,

    #[arg(long, env = "FWUP_BIND", default_value = "127.0.0.1:8090")]
    bind: String,

    /// Defaults to the available parallelism, capped at 32.
    #[arg(long, env = "FWUP_HTTP_WORKERS")]
    http_workers: Option<usize>,

    #[arg(long, env = "FWUP_TRANSPORT_RUNTIME", value_enum, default_value = "std")]
    transport_runtime: TransportRuntime,

    #[arg(long, env = "FWUP_STORAGE_DIR", default_value = DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,

    #[arg(long, env = "FWUP_SNAPSHOT_FILE", default_value = DEFAULT_SNAPSHOT_FILE)]
    snapshot_file: String,

    /// 0 disables the background flush.
    #[arg(long, env = "FWUP_AUTO_SAVE_INTERVAL_MS")]
    auto_save_interval_ms: Option<u64>,

    #[arg(long, env = "FWUP_MAX_SNAPSHOT_BYTES")]
    max_snapshot_bytes: Option<usize>,

    #[arg(long, env = "FWUP_EVICTION_AGE_MS")]
    eviction_age_ms: Option<u64>,

    /// Fail mutations whose snapshot write fails.
    #[arg(long, env = "FWUP_STRICT_DURABILITY")]
    strict_durability: bool,

    /// Reject uploads that complete a component with gaps or overlaps.
    #[arg(long, env = "FWUP_STRICT_COMPLETENESS")]
    strict_completeness: bool,
}

impl Cli {
    fn store_config(&self) -> StoreConfig {
        let auto_save_interval = match self.auto_save_interval_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(DEFAULT_AUTO_SAVE_INTERVAL),
        };
        StoreConfig {
            storage_dir: self.storage_dir.clone(),
            snapshot_file: self.snapshot_file.clone(),
            auto_save_interval,
            max_snapshot_bytes: self
                .max_snapshot_bytes
                .filter(|bytes| *bytes > 0)
                .unwrap_or(DEFAULT_MAX_SNAPSHOT_BYTES),
            eviction_age: self
                .eviction_age_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_EVICTION_AGE),
            durability: if self.strict_durability {
                Durability::Strict
            } else {
                Durability::BestEffort
            },
            completeness: if self.strict_completeness {
                CompletenessPolicy::Strict
            } else {
                CompletenessPolicy::Lenient
            },
        }
    }

    fn http_workers(&self) -> usize {
        self.http_workers
            .filter(|workers| *workers > 0)
            .unwrap_or_else(default_http_workers)
    }
}

fn default_http_workers() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get().clamp(1, 32))
        .unwrap_or(4)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.store_config();
    let store = SessionStore::new(config.clone());
    let runtime = UpgradeRuntime::shared(store);

    if !cli.serve {
        info!(
            sessions = runtime.store().session_count(),
            snapshot = %config.snapshot_path().display(),
            durability = ?config.durability,
            completeness = ?config.completeness,
            "upgrade store ready"
        );
        return finish(&runtime, ExitCode::SUCCESS);
    }

    let http_workers = cli.http_workers();
    info!(
        bind = %cli.bind,
        http_workers,
        transport = cli.transport_runtime.as_str(),
        snapshot = %config.snapshot_path().display(),
        sessions = runtime.store().session_count(),
        "upgrade service starting"
    );

    let served = match cli.transport_runtime {
        TransportRuntime::Std => {
            serve_http_with_workers(runtime.clone(), &cli.bind, http_workers)
                .map_err(|err| err.to_string())
        }
        TransportRuntime::Axum => {
            #[cfg(feature = "async-transport")]
            {
                upgrade::transport_axum::serve_http_with_axum(
                    runtime.clone(),
                    &cli.bind,
                    http_workers,
                )
            }
            #[cfg(not(feature = "async-transport"))]
            {
                error!("transport runtime 'axum' requires build feature 'async-transport'");
                return ExitCode::from(2);
            }
        }
    };

    match served {
        Ok(()) => finish(&runtime, ExitCode::SUCCESS),
        Err(err) => {
            error!(error = %err, "upgrade transport failed");
            finish(&runtime, ExitCode::FAILURE)
        }
    }
}

fn finish(runtime: &UpgradeRuntime, code: ExitCode) -> ExitCode {
    match runtime.shutdown() {
        Ok(_) => code,
        Err(_) => ExitCode::FAILURE,
    }
}
