mod config;

use clap::Parser;
use config::DaemonConfig;
use inksight_core::cloud_channel::{CloudChannel, CloudChannelConfig};
use inksight_core::device_channel::{Credentials, DeviceChannel, DeviceChannelConfig};
use inksight_core::model::ChangeEvent;
use inksight_core::monitor::{FileMonitor, MonitorConfig as CoreMonitorConfig};
use inksight_core::prober::{ProberConfig, ReachabilityProber};
use inksight_core::router::HybridRouter;
use inksight_core::sync_engine::SyncEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "inksight-daemon")]
#[command(about = "Syncs handwritten tablet notes between a device, the cloud, and a local cache")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the config file's local cache directory.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Runs a single full sync and exits instead of entering the monitor loop.
    #[arg(long)]
    once: bool,

    /// Overrides RUST_LOG for this run.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let config_path = args.config.clone().unwrap_or_else(DaemonConfig::default_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(cache_dir) = args.cache_dir.clone() {
        config.local_cache_dir = cache_dir;
    }

    info!(config = %config_path.display(), "loaded daemon configuration");

    let credentials = Credentials::new(config.device.password.clone(), config.device.private_key_path.clone())
        .ok_or_else(|| anyhow::anyhow!("device config must supply a password or a private key path"))?;

    let mut device_config = DeviceChannelConfig::new(&config.device.host, &config.device.username, credentials);
    device_config.port = config.device.port;
    let device = Arc::new(DeviceChannel::new(device_config));

    let cloud = Arc::new(CloudChannel::new(CloudChannelConfig::new(
        &config.cloud.base_url,
        &config.cloud.device_token,
    ))?);

    let prober_config = ProberConfig::new(&config.device.host, config.device.port, &config.cloud.host);
    let prober = ReachabilityProber::new(prober_config);
    let router = Arc::new(HybridRouter::new(config.mode, device.clone(), cloud.clone(), prober));

    router.refresh_status().await;
    if router.is_online().await {
        if let Err(e) = device.connect().await {
            info!(error = %e, "ssh connect failed at startup, router will fall back per policy");
        }
        if let Err(e) = cloud.authenticate().await {
            info!(error = %e, "cloud authentication failed at startup, router will fall back per policy");
        }
    }

    let sync_engine = Arc::new(
        SyncEngine::initialize(router.clone(), config.local_cache_dir.clone(), config.conflict_strategy).await?,
    );

    if args.once {
        run_once(&sync_engine).await?;
        return Ok(());
    }

    run_steady_state(sync_engine, device, config.monitor).await
}

async fn run_once(sync_engine: &SyncEngine) -> anyhow::Result<()> {
    let report = sync_engine.full_sync().await?;
    info!(
        synced = report.synced.len(),
        failed = report.failed.len(),
        deleted = report.deleted.len(),
        duration_ms = report.duration.as_millis() as u64,
        "full sync complete"
    );
    for (doc_id, error) in &report.failed {
        error!(%doc_id, %error, "document failed to sync");
    }
    Ok(())
}

/// F loops on events from D via E: an initial full sync, then the File
/// Monitor feeds every subsequent change through `incremental_sync` until
/// the process receives SIGINT.
async fn run_steady_state(
    sync_engine: Arc<SyncEngine>,
    device: Arc<DeviceChannel>,
    monitor_config: config::MonitorConfig,
) -> anyhow::Result<()> {
    let report = sync_engine.full_sync().await?;
    info!(synced = report.synced.len(), failed = report.failed.len(), "initial sync complete");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ChangeEvent>();
    let monitor = FileMonitor::new(
        device,
        CoreMonitorConfig {
            poll_interval: monitor_config.poll_interval(),
            debounce: monitor_config.debounce(),
            auto_reconnect: monitor_config.auto_reconnect,
            ..Default::default()
        },
    );
    monitor.start(Arc::new(move |event| {
        let _ = tx.send(event);
    }));

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                match sync_engine.incremental_sync(vec![event]).await {
                    Ok(report) => {
                        for (doc_id, error) in &report.failed {
                            error!(%doc_id, %error, "incremental sync failed");
                        }
                    }
                    Err(e) => error!(error = %e, "incremental sync failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                monitor.stop();
                return Ok(());
            }
        }
    }
}

fn init_logging(override_level: Option<&str>) {
    let filter = override_level
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
