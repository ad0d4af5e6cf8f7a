//! flexgate-notifier - notification daemon binary.

use flexgate_core::{NotificationRuntime, NotifierConfig};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// File config (if `FLEXGATE_CONFIG` is set) with env overrides on top.
fn load_config() -> Result<NotifierConfig, Box<dyn std::error::Error>> {
    let base = match std::env::var("FLEXGATE_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading configuration file");
            NotifierConfig::from_file(path)?
        }
        Err(_) => NotifierConfig::default(),
    };
    Ok(base.with_overrides(|key| std::env::var(key).ok()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("flexgate_core=debug".parse()?),
        )
        .init();

    let config = load_config()?;
    let mut runtime = NotificationRuntime::new(config).await?;
    runtime.start().await?;

    info!(
        webhooks = runtime.manager().get_all_webhooks().len(),
        production = runtime.config().production,
        "flexgate-notifier running"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, stopping notification runtime...");

    runtime.shutdown().await?;
    info!("Notifier stopped cleanly");
    Ok(())
}
