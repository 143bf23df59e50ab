#![forbid(unsafe_code)]

use anyhow::Result;
use meshcall::media::{FakeMediaEngine, KurentoClient, MediaConfig, MediaEngine};
use meshcall::metrics::ServerMetrics;
use meshcall::room::RoomRegistry;
use meshcall::session::SessionRegistry;
use meshcall::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcall=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("MeshCall - Starting server");

    let media_config = MediaConfig::from_env();

    let engine: Arc<dyn MediaEngine> = match media_config.engine_url {
        Some(ref url) => {
            info!("Connecting to media engine at {}", url);
            Arc::new(KurentoClient::connect(url).await?)
        }
        None => {
            info!("KMS_URL not set, using in-process fake media engine");
            Arc::new(FakeMediaEngine::new())
        }
    };

    let metrics = ServerMetrics::new();
    let rooms = Arc::new(RoomRegistry::new(
        engine,
        Arc::new(SessionRegistry::new()),
        media_config.filter,
        metrics.clone(),
    ));

    info!("Room registry and media engine initialized");

    let signaling_server = SignalingServer::new(rooms.clone(), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            rooms.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
