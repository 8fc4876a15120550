use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hyperfeed::application::supervisor::{SessionSupervisor, StateCallback};
use hyperfeed::config::ManagerConfig;
use hyperfeed::domain::subscription::Subscription;
use hyperfeed::infrastructure::session::MessageCallback;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file before anything reads them
    let dotenv_result = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hyperfeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match dotenv_result {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(_) => debug!("No .env file found, using process environment"),
    }

    let config = ManagerConfig::from_env();
    info!(endpoint = %config.endpoint, "starting stream session manager");

    // allMids ticks on every mid-price change, which keeps the data-flow
    // liveness check fed even when nothing else is subscribed.
    let intended = vec![Subscription::AllMids];

    let on_message: MessageCallback = Arc::new(|frame: String| {
        debug!(frame = %frame, "venue frame");
    });
    let on_state: StateCallback = Arc::new(|state| {
        info!(state = state.as_str(), "connection state changed");
    });

    let supervisor = Arc::new(
        SessionSupervisor::new(config, intended, on_message)?.with_state_callback(on_state),
    );

    let shutdown = supervisor.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("shutdown signal received");
        shutdown.stop();
    });

    supervisor.start().await?;

    let stats = supervisor.stats().await;
    info!(
        total_messages = stats.health.total_messages,
        total_reconnects = stats.health.total_reconnects,
        total_errors = stats.health.total_errors,
        "session manager exited"
    );
    Ok(())
}
