//! Launchpad Player - headless realtime session.
//!
//! Connects with the token from the environment and logs realtime events until
//! interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use launchpad_player::infrastructure::http_client::HttpSnapshotSource;
use launchpad_player::infrastructure::websocket::TungsteniteConnector;
use launchpad_player::ports::outbound::SnapshotSource;
use launchpad_player::{EventKind, PlayerEvent, RealtimeConfig, RealtimeCore, SessionIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real deployments set the variables directly
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "launchpad_player=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Launchpad Player");

    let config = RealtimeConfig::from_env().context("invalid configuration")?;
    let token = std::env::var("LAUNCHPAD_TOKEN").context("LAUNCHPAD_TOKEN is not set")?;
    let user_id = std::env::var("LAUNCHPAD_USER_ID").context("LAUNCHPAD_USER_ID is not set")?;
    let username = std::env::var("LAUNCHPAD_USERNAME").unwrap_or_else(|_| user_id.clone());

    let snapshots: Arc<dyn SnapshotSource> = Arc::new(
        HttpSnapshotSource::new(&config.api_base_url, token.clone())
            .context("invalid API base URL")?,
    );

    tracing::info!(ws_url = %config.connection.ws_url, api_url = %config.api_base_url, "Configuration loaded");

    let core = RealtimeCore::new(
        config,
        SessionIdentity::new(user_id, username),
        Arc::new(TungsteniteConnector),
        Some(snapshots),
    );

    let _status = core.events().subscribe_guarded(EventKind::ConnectionStatus, |event| {
        if let PlayerEvent::ConnectionStatus(snapshot) = event {
            tracing::info!(
                state = %snapshot.state,
                offline = snapshot.offline,
                attempt = snapshot.attempt,
                "Connection status"
            );
        }
    });
    let _expired = core.events().subscribe_guarded(EventKind::SessionExpired, |event| {
        if let PlayerEvent::SessionExpired { reason } = event {
            tracing::error!(reason = %reason, "Session expired; log in again");
        }
    });

    core.start(token).await.context("could not connect")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    core.shutdown();
    Ok(())
}
