//! vxnet node daemon (`vxnetd`).
//!
//! Runs as a DaemonSet pod with host networking. Creates the node's tunnel
//! device, advertises it to the cluster, then keeps the per-peer forwarding
//! entries in step with node membership until terminated.

use std::process::ExitCode;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vxnet_networking::IpRoute2;
use vxnet_node_agent::{bootstrap, config::Config};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vxnet daemon");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "vxnet daemon failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    info!(
        cni_config_path = %config.cni_config_path.display(),
        sync_timeout_secs = config.sync_timeout_secs,
        skip_host_setup = config.skip_host_setup,
        "Configuration loaded"
    );

    let mut node = bootstrap(&config, IpRoute2::new()).await?;
    info!(
        node = %node.node_name,
        pod_cidr = %node.pod_cidr,
        "Bootstrap complete"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sync_handle = node.reconciler.spawn(node.events, shutdown_rx);

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        result = &mut sync_handle => {
            if let Err(e) = result {
                error!(error = %e, "Peer synchronization task panicked");
            }
            node.context.stop().await;
            anyhow::bail!("peer synchronization stopped unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    node.context.stop().await;

    if tokio::time::timeout(Duration::from_secs(5), sync_handle)
        .await
        .is_err()
    {
        error!("Peer synchronization did not stop in time");
    }

    info!("vxnet daemon shutdown complete");
    Ok(())
}
