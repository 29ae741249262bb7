// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hived`: per-host compute daemon entrypoint.
//!
//! Thin wiring shell: load config, build the concrete collaborators, run
//! the Recovery Engine, then bring up the Bus Router, watchdogs, HTTP
//! cluster-manager surface, and Shutdown Coordinator (§2). Every step here
//! that can fail exits non-zero rather than limping into a half-wired
//! state (§6: "process exit codes").

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use hive_core::{InstanceTypeTable, ResourceLedger};
use hive_daemon::bus::{MessageBus, NatsBus};
use hive_daemon::config::DaemonConfig;
use hive_daemon::http::HttpServer;
use hive_daemon::hypervisor::HostHypervisor;
use hive_daemon::orchestrator::LaunchOrchestrator;
use hive_daemon::registry::InstanceRegistry;
use hive_daemon::resource_registry::ResourceRegistry;
use hive_daemon::router::BusRouter;
use hive_daemon::shutdown::ShutdownCoordinator;
use hive_daemon::state_store::StateStoreAdapter;
use hive_daemon::store::BusBackedStore;
use hive_daemon::volumes::{BusNetworkPlumber, BusVolumeService, NetworkPlumber, VolumeService};
use hive_daemon::{recovery, watchdog};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn config_path() -> PathBuf {
    std::env::var_os("HIVE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/hived/hived.toml"))
}

fn init_logging(config: &DaemonConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(config.console_log_dir())
        .context("creating log directory")?;
    let file_appender = tracing_appender::rolling::daily(config.console_log_dir(), "hived.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hived: fatal: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = DaemonConfig::load(&config_path()).context("loading daemon config")?;
    let _log_guard = init_logging(&config).context("initializing logging")?;

    info!(node = %config.node, region = %config.region, az = %config.az, "hived starting");

    let root_token = CancellationToken::new();

    let bus: Arc<dyn MessageBus> = Arc::new(
        NatsBus::connect(&config.bus_addr)
            .await
            .context("connecting to message bus")?,
    );

    let state_store = Arc::new(
        StateStoreAdapter::connect(Arc::new(BusBackedStore::new(
            Arc::clone(&bus),
            config.bus_timeout(),
        )))
        .await
        .context("connecting to replicated state store")?,
    );

    watchdog::await_cluster_ready(bus.as_ref(), &state_store)
        .await
        .context("waiting for cluster readiness")?;

    let registry = Arc::new(InstanceRegistry::new(config.node.clone(), Arc::clone(&state_store)));

    let host_types = InstanceTypeTable::standard();
    let ledger = host_capacity_ledger();
    let resources = Arc::new(ResourceRegistry::new(ledger, host_types, Arc::clone(&bus)));

    let hypervisor: Arc<dyn hive_daemon::hypervisor::HypervisorDriver> =
        Arc::new(HostHypervisor::new(&config));
    let volumes: Arc<dyn VolumeService> =
        Arc::new(BusVolumeService::new(Arc::clone(&bus), config.bus_timeout()));
    let network: Arc<dyn NetworkPlumber> =
        Arc::new(BusNetworkPlumber::new(Arc::clone(&bus), config.bus_timeout()));

    let orchestrator = Arc::new(LaunchOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&resources),
        Arc::clone(&state_store),
        Arc::clone(&hypervisor),
        Arc::clone(&bus),
        volumes,
        network.clone(),
    ));
    resources.set_orchestrator(&orchestrator);

    // Recovery Engine runs once, before the Bus Router starts accepting new
    // admission work (§2).
    recovery::recover(&registry, &resources, &state_store, &hypervisor, &orchestrator)
        .await
        .context("running recovery engine")?;

    let router = Arc::new(BusRouter::new(
        Arc::clone(&bus),
        Arc::clone(&orchestrator),
        Arc::clone(&registry),
        Arc::clone(&resources),
    ));
    router.start().await.context("starting bus router")?;

    let shutdown = Arc::new(ShutdownCoordinator::new(
        config.node.clone(),
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&orchestrator),
        Arc::clone(&router),
        Arc::clone(&state_store),
        network,
        root_token.clone(),
    ));
    shutdown.start().await.context("starting shutdown coordinator")?;
    tokio::spawn({
        let shutdown = Arc::clone(&shutdown);
        async move { shutdown.run_local_shutdown().await }
    });

    let cluster_epoch = state_store
        .read_cluster_config()
        .await
        .context("loading cluster config")?
        .epoch;

    watchdog::spawn_pending_watchdog(Arc::clone(&registry), Arc::clone(&resources), root_token.clone());
    watchdog::spawn_node_status_publisher(
        config.node.clone(),
        cluster_epoch,
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&resources),
        root_token.clone(),
    );

    let http = HttpServer::new(
        config.node.clone(),
        config.region.clone(),
        config.az.clone(),
        config.data_dir.display().to_string(),
        Arc::clone(&bus),
        Arc::clone(&state_store),
        vec!["bus".to_string(), "store".to_string(), "router".to_string()],
    )
    .await
    .context("building HTTP cluster-manager surface")?;

    tokio::select! {
        result = Arc::clone(&http).serve(&config.http_bind) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP cluster-manager surface exited");
            }
        }
        _ = root_token.cancelled() => {
            info!("shutdown signal received, HTTP surface stopping");
        }
    }

    Ok(())
}

/// Placeholder until host introspection lands: a single t3-class host's
/// worth of capacity. Operators override via the instance-type table
/// today; per-host autodetection is future work.
fn host_capacity_ledger() -> ResourceLedger {
    ResourceLedger::new(32, 131_072)
}
