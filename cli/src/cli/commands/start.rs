use std::path::PathBuf;

use modelgate_core::config::expand_path;
use modelgate_core::proxy::config::key_fingerprint;

use super::open_control_plane;

pub async fn run(config_path: Option<PathBuf>, port_override: Option<u16>) -> anyhow::Result<()> {
    let plane = open_control_plane(config_path)?;
    let config = plane.load_config().await;

    let mut proxy = config.proxy.clone();
    if let Some(port) = port_override {
        proxy.port = port;
    }

    tracing::info!("Starting modelgate...");
    tracing::info!("  Port: {}", proxy.port);
    tracing::info!("  Bind: {}", proxy.get_bind_address());
    tracing::info!("  Accounts directory: {:?}", expand_path(&config.accounts.directory));

    let pool = plane.service().token_manager();
    if pool.is_empty() {
        tracing::warn!("No accounts found. Add account files to the accounts directory.");
        tracing::warn!("The gateway will start but requests will fail without valid accounts.");
    }

    // A port override is for this run only, so it is not saved.
    let status = if port_override.is_some() {
        plane.service().start(&proxy).await?
    } else {
        plane.start_proxy_service(proxy.clone()).await?
    };

    println!("Gateway running at {}", status.base_url);
    println!("  API key fingerprint: {}", key_fingerprint(&proxy.api_key));
    println!("  Active accounts: {}", status.active_accounts);
    tracing::info!("Press Ctrl+C to stop");

    shutdown_signal().await;

    plane.stop_proxy_service().await;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
