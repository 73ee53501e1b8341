//! Relay daemon: polls the configured devices until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use axe_relay::best_diff::BestDifficultyStore;
use axe_relay::config::Settings;
use axe_relay::device::HttpClient;
use axe_relay::monitor::Monitor;
use axe_relay::notify::{LogNotifier, Notifier, WebhookNotifier};
use axe_relay::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init();

    let settings = Settings::load().context("failed to load configuration")?;
    if settings.devices.is_empty() {
        warn!("No devices configured, summaries will be empty");
    }

    let notifier: Arc<dyn Notifier> = match &settings.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => {
            info!("No webhook configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let store = Arc::new(BestDifficultyStore::load(settings.best_diff_path()).await);
    let monitor = Monitor::new(&settings, Arc::new(HttpClient::new()), notifier, store);

    let cancellation = CancellationToken::new();
    let task = tokio::spawn(monitor.run(cancellation.clone()));

    shutdown_signal().await?;
    cancellation.cancel();
    task.await.context("monitor task panicked")?;

    info!("Exiting");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to wait for Ctrl-C")?;
                info!("Received SIGINT, shutting down");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for Ctrl-C")?;
        info!("Received Ctrl-C, shutting down");
    }

    Ok(())
}
