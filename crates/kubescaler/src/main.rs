use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use kubescaler::config::Cli;
use kubescaler::k8s::K8s;
use kubescaler::logging;
use kubescaler::node_pool::DriverRegistry;
use kubescaler::scaler::Scaler;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    tracing::info!(provider = %cli.cloud_provider, "starting kubescaler");

    let registry = DriverRegistry::with_builtin_drivers();
    let provider = registry
        .connect(&cli.cloud_provider, &cli.provider_config())
        .await
        .map_err(|e| anyhow!("failed to connect cloud provider: {e:?}"))?;

    let kube = K8s::from_kubeconfig(
        cli.cluster_kube_config_master_url.as_deref(),
        cli.cluster_kube_config_path.as_deref(),
    )
    .await
    .map_err(|e| anyhow!("failed to create Kubernetes client: {e:?}"))?;

    let scaler = Scaler::new(provider, Arc::new(kube), cli.scaler_config())
        .map_err(|e| anyhow!("invalid scaler configuration: {e:?}"))?;

    let shutdown = CancellationToken::new();
    let loop_task = tokio::spawn({
        let token = shutdown.clone();
        async move {
            if let Err(e) = scaler.run(token).await {
                tracing::error!("scale loop failed: {e:?}");
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown signal received, stopping scale loop");
    shutdown.cancel();
    loop_task.await.context("scale loop task panicked")?;

    tracing::info!("kubescaler exited");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = sigint.recv() => tracing::info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        tracing::info!("received Ctrl+C");
    }
    Ok(())
}
