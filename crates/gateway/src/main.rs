//! KGRAG API Gateway
//!
//! HTTP entry point for the retrieval engine.
//! Handles:
//! - Search and context assembly
//! - Item mutation hooks that keep the vector index in sync
//! - Consistency repair, regeneration, cache and policy maintenance
//! - Rate limiting and observability (logging, metrics, request ids)

mod handlers;
mod middleware;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use kgrag_common::{config::AppConfig, metrics, EngineContext, VERSION};
use kgrag_search::RagEngine;
use metrics_exporter_prometheus::PrometheusBuilder;
use middleware::rate_limit::{create_rate_limiter, rate_limit_middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<RagEngine>,
}

impl AppState {
    pub fn new(engine: RagEngine) -> Self {
        Self {
            config: engine.context().config.clone(),
            engine: Arc::new(engine),
        }
    }

    pub fn ctx(&self) -> &EngineContext {
        self.engine.context()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(&config);
    info!("Starting KGRAG API Gateway v{}", VERSION);

    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        metrics::register_metrics();
        info!(%addr, "Metrics exporter listening");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let ctx = EngineContext::connect(config).await?;
    let state = AppState::new(RagEngine::new(ctx)?);

    let app = create_router(state);
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))

        // Retrieval
        .route("/search", post(handlers::search::search))
        .route("/context", post(handlers::search::context))

        // Item mutations with sync hooks
        .route("/items", post(handlers::items::create_item))
        .route("/items/regenerate", post(handlers::items::regenerate))
        .route(
            "/items/{kind}/{id}",
            put(handlers::items::update_item).delete(handlers::items::delete_item),
        )

        // Maintenance
        .route("/repair", post(handlers::maintenance::repair))
        .route("/consistency", get(handlers::maintenance::consistency))
        .route(
            "/cache",
            get(handlers::maintenance::cache_stats).delete(handlers::maintenance::clear_cache),
        )
        .route(
            "/settings/sync",
            get(handlers::settings::get_policy).put(handlers::settings::update_policy),
        );

    let mut app = Router::new()
        .nest("/v1", api_routes)
        .layer(axum::middleware::from_fn(middleware::track_metrics));

    let limits = &state.config.rate_limit;
    if limits.enabled {
        let limiter = create_rate_limiter(limits.requests_per_second, limits.burst);
        app = app.layer(from_fn_with_state(limiter, rate_limit_middleware));
    }

    let timeout = TimeoutLayer::new(state.config.request_timeout());

    app.layer(timeout)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
