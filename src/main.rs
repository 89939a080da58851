use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use broadcaster_hub::auth::{AuthorizationGate, ConfigGate};
use broadcaster_hub::config::Settings;
use broadcaster_hub::hub::Hub;
use broadcaster_hub::relay::{subscription_channel, BackoffConfig, FanoutRelay, RedisStore};
use broadcaster_hub::server::{create_app, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Hub, plus the upstream relay when Redis is configured
    let (hub, relay_handle) = match &settings.redis.url {
        Some(url) => {
            let store = Arc::new(RedisStore::new(url)?);
            let (upstream, requests) = subscription_channel();
            let hub = Hub::with_upstream(&settings.hub, upstream);
            let relay = FanoutRelay::new(
                store,
                hub.clone(),
                requests,
                BackoffConfig::from(&settings.redis),
            );
            let handle = tokio::spawn(relay.run(shutdown_tx.subscribe()));
            (hub, Some(handle))
        }
        None => {
            tracing::info!("No Redis URL configured, upstream fan-out disabled");
            (Hub::new(&settings.hub), None)
        }
    };

    let gate: Arc<dyn AuthorizationGate> = Arc::new(ConfigGate::new(&settings.auth));
    let state = AppState::new(settings.clone(), hub, gate);
    tracing::info!("Application state initialized");

    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_tx))
        .await?;

    if let Some(handle) = relay_handle {
        tracing::info!("Waiting for relay to finish...");
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    let _ = shutdown_tx.send(());
}
