use crate::auth::TokenAuthority;
use crate::config::ServerConfig;
use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use courier_core::{ConnectionRegistry, MessageRouter, MessageSink, QueueSink, RelayCoordinator};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};

mod routes;

/// Server application state
pub struct AppState {
    /// Connection lifecycle, presence and routing
    pub coordinator: Arc<RelayCoordinator>,
    /// Bearer token issuer and verifier
    pub tokens: TokenAuthority,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(config: ServerConfig, sink: Arc<dyn MessageSink>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = MessageRouter::new(registry, sink);
        let coordinator = Arc::new(RelayCoordinator::new(router, config.outbound_buffer));
        let tokens = TokenAuthority::new(&config.jwt_secret, config.token_ttl);

        Self {
            coordinator,
            tokens,
            config,
        }
    }
}

/// Start the HTTP server and the durable queue consumer.
///
/// Runs until Ctrl-C or SIGTERM. Live connections are asked to close and
/// the queue is drained before returning.
pub async fn start(config: ServerConfig) -> Result<()> {
    let stop_token = CancellationToken::new();

    let (sink, consumer) = QueueSink::channel(config.queue_capacity);
    let consumer = consumer.with_batch_size(config.queue_batch_size);
    let consumer_task = tokio::spawn(consumer.run(stop_token.clone()));

    let addr = config.bind_addr;
    let state = Arc::new(AppState::new(config, Arc::new(sink)));
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting Axum HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    stop_token.cancel();
    match consumer_task.await {
        Ok(acked) => info!(acked, "Durable queue drained"),
        Err(e) => error!(error = %e, "Queue consumer task failed"),
    }

    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM, then signal every live connection to close.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }

    let signalled = state.coordinator.disconnect_all();
    info!(connections = signalled, "Asked live connections to close");
}

/// Create the Axum router with all routes and middleware
fn create_router(state: Arc<AppState>) -> Router {
    let cors = configure_cors(&state.config.cors_origins);

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .merge(routes::websocket::router(state.clone()))
        .merge(routes::session::router(state.clone()))
        .merge(routes::presence::router(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors)
}

/// CORS for the configured origins, with credentials.
///
/// Requested headers and methods are mirrored back, since a wildcard is
/// not allowed alongside credentials.
fn configure_cors(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    info!(origins = ?allowed, "Configured CORS allowed origins");
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}

/// Health check endpoint
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.coordinator.registry();
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "courier-server",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": registry.connection_count(),
            "online": registry.identity_count(),
        })),
    )
}
