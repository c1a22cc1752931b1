use std::future::IntoFuture;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use microgpu_plugin::allocator::DeviceAllocator;
use microgpu_plugin::config::{Cli, Config};
use microgpu_plugin::device::cache::DiscoveryCache;
use microgpu_plugin::device::huawei::HuaweiManager;
use microgpu_plugin::device::nvidia::NvidiaManager;
use microgpu_plugin::device::simulator::SimulatorManager;
use microgpu_plugin::device::tool::SmiRunner;
use microgpu_plugin::device::{DeviceManager, Vendor};
use microgpu_plugin::metrics::Metrics;
use microgpu_plugin::plugin::server::DevicePluginServer;
use microgpu_plugin::workload::{InMemoryDirectory, KubeletDirectory, WorkloadDirectory};
use microgpu_plugin::{liveness, plugin};

fn build_manager(vendor: Vendor, config: &Config) -> Arc<dyn DeviceManager> {
    let cache = DiscoveryCache::new(config.intervals.discovery_ttl);
    match vendor {
        Vendor::Nvidia => Arc::new(NvidiaManager::new(
            Arc::new(SmiRunner::new(&config.tool.smi_path)),
            cache,
            config.partition.clone(),
        )),
        Vendor::Huawei => Arc::new(HuaweiManager::new(cache)),
        Vendor::Simulator => Arc::new(SimulatorManager::new()),
    }
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "microgpu_plugin=debug,tower_http=debug"
    } else {
        "microgpu_plugin=info,tower_http=info"
    };
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("microgpu-plugin v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration; flags and environment win over the file.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        vendors = ?config.vendors,
        partitioning = config.partition.enabled,
        profile = %config.partition.profile,
        instances = config.partition.instance_count,
        cdi = config.cdi.enabled,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new()?);
    let directory: Arc<dyn WorkloadDirectory> = match &config.workloads.kubelet_url {
        Some(url) => Arc::new(KubeletDirectory::new(url.clone(), config.workloads.timeout)?),
        None => {
            warn!("No kubelet URL configured, workload liveness is tracked in memory only");
            Arc::new(InMemoryDirectory::new())
        }
    };

    let shutdown = CancellationToken::new();
    let endpoint = config.endpoint();

    // Start one plugin per vendor; a failing vendor does not stop the others.
    let starts = config.vendors.iter().map(|&vendor| {
        let server = Arc::new(
            DevicePluginServer::new(
                build_manager(vendor, &config),
                Arc::new(DeviceAllocator::new()),
                directory.clone(),
                config.server_settings(),
            )
            .with_metrics(metrics.for_vendor(vendor)),
        );
        let endpoint = &endpoint;
        let shutdown = shutdown.clone();
        async move { (vendor, plugin::start(server, endpoint, shutdown).await) }
    });

    let mut running = Vec::new();
    for (vendor, result) in futures::future::join_all(starts).await {
        match result {
            Ok(plugin) => running.push(plugin),
            Err(e) => error!(vendor = %vendor, "Failed to start device plugin: {e}"),
        }
    }
    if running.is_empty() {
        anyhow::bail!("no device plugin could be started");
    }

    // Liveness and metrics.
    let listen_addr = config.liveness.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Liveness endpoint listening on {listen_addr}");
    let liveness_task = tokio::spawn(
        axum::serve(listener, liveness::build_router(metrics))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    shutdown_signal().await;
    info!("Received termination signal, shutting down");

    shutdown.cancel();
    for plugin in running {
        plugin.stop().await;
    }
    if let Ok(Err(e)) = liveness_task.await {
        error!("Liveness server failed: {e}");
    }

    info!("All device plugins stopped");
    Ok(())
}
