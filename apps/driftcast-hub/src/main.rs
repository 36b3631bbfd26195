use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use driftcast_hub::config::{Config, StoreBackend};
use driftcast_hub::coordinator::StreamCoordinator;
use driftcast_hub::http;
use driftcast_hub::media::NullMediaChannel;
use driftcast_hub::store::{MemoryStreamStore, RedisStreamStore, SharedStore};
use driftcast_hub::sweeper::CleanupSweeper;
use driftcast_hub::telemetry::init_tracing;
use driftcast_hub::tracker::ParticipationTracker;

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config.log_filter);
    info!(port = config.port, backend = ?config.store_backend, "starting driftcast hub");

    let store: SharedStore = match config.store_backend {
        StoreBackend::Memory => MemoryStreamStore::new(),
        StoreBackend::Redis => {
            match RedisStreamStore::connect(&config.redis_url, config.store_poll_interval).await {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    error!(error = %err, url = %config.redis_url, "failed to connect to redis");
                    std::process::exit(1);
                }
            }
        }
    };

    let tracker = ParticipationTracker::new(store.clone());
    let media = NullMediaChannel::new();
    let (coordinator, _coordinator_task) = StreamCoordinator::spawn(
        store.clone(),
        tracker,
        media,
        config.coordinator_config(),
    );

    let sweeper = CleanupSweeper::new(store, coordinator.clone(), config.sweeper_config());
    let sweeper_handle = sweeper.start();

    let app = http::router(coordinator)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "driftcast hub listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
    }

    sweeper_handle.shutdown();
    info!("driftcast hub stopped");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
