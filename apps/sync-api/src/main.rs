use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_api::config::Config;
use sync_api::hub::{ConnectionRegistry, RoomCoordinator};
use sync_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present; env vars may also be set externally.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // The hub is explicitly constructed and owned here; its lifecycle ends
    // with the shutdown below, not with process exit.
    let registry = Arc::new(ConnectionRegistry::new());
    let (coordinator, hub) = RoomCoordinator::new(registry.clone());
    let coordinator_task = tokio::spawn(coordinator.run());

    let state = AppState {
        config: Arc::new(config),
        registry,
        hub: hub.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(sync_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "sync-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    hub.shutdown().await;
    let _ = coordinator_task.await;
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutdown signal received");
}
