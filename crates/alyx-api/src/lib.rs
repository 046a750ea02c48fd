//! alyx-api: HTTP API server for alyx
//!
//! Exposes function invocation, the webhook gateway, resumable uploads,
//! and signed file downloads over axum. Business errors are converted to
//! their HTTP encoding here and nowhere deeper.

mod handlers;
pub mod middleware;
mod uploads;
mod webhooks;

use alyx_core::{Alyx, AlyxConfig};
use axum::{
    Router,
    http::{HeaderValue, header},
    middleware::from_fn_with_state,
    routing::{any, get, post},
};
use middleware::auth_middleware;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_governor::GovernorError;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::{KeyExtractor, PeerIpKeyExtractor, SmartIpKeyExtractor};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Rate-limit key extractor that respects proxy configuration.
///
/// When `behind_proxy` is true, extracts the client IP from
/// X-Forwarded-For, X-Real-IP, or the Forwarded header (in that order),
/// which is correct behind a trusted reverse proxy. Otherwise the TCP
/// peer address is used directly.
#[derive(Debug, Clone, Copy)]
struct AlyxKeyExtractor {
    behind_proxy: bool,
}

impl KeyExtractor for AlyxKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &axum::http::Request<T>) -> Result<Self::Key, GovernorError> {
        if self.behind_proxy {
            SmartIpKeyExtractor.extract(req)
        } else {
            PeerIpKeyExtractor.extract(req)
        }
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub alyx: Alyx,
}

impl AppState {
    pub fn config(&self) -> &AlyxConfig {
        self.alyx.config()
    }
}

/// Build the versioned API routes
fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/functions", get(handlers::list_functions))
        .route("/functions/{name}/invoke", post(handlers::invoke_function))
        .route("/executions", get(handlers::list_executions))
        .route(
            "/storage/{bucket}/tus",
            post(uploads::create_upload).options(uploads::options_upload),
        )
        .route(
            "/storage/{bucket}/tus/{upload_id}",
            any(uploads::upload_resource),
        )
        .route(
            "/storage/{bucket}/files/{file_id}",
            get(handlers::download_file),
        )
        .route(
            "/storage/{bucket}/files/{file_id}/sign",
            post(handlers::sign_file),
        )
}

/// Build the Axum router with all routes.
///
/// Rate limiting is applied separately in `serve()` because it requires
/// real TCP connection info (peer IP) which isn't available in `oneshot`
/// tests.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(state.config());

    Router::new()
        // Versioned API routes
        .nest("/api/v1", api_v1_routes())
        // Health check (unversioned)
        .route("/health", get(handlers::health))
        // Manifest-declared function routes
        .route("/fn/{*path}", any(handlers::function_route))
        // Webhook gateway
        .route("/webhooks/{*path}", any(webhooks::gateway_handler))
        // Auth middleware - runs on all routes, sets AuthStatus in extensions
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        // State and other middleware
        .with_state(state)
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'none'"),
        ))
        .layer(
            TraceLayer::new_for_http().make_span_with(
                tower_http::trace::DefaultMakeSpan::new()
                    .level(tracing::Level::INFO)
                    .include_headers(false),
            ),
        )
}

/// Build CORS layer from config.
///
/// Defaults to denying all cross-origin requests if `cors_origins` is not
/// configured. Set `cors_origins = ["*"]` to allow all origins.
fn build_cors_layer(config: &AlyxConfig) -> CorsLayer {
    let origins = config
        .server
        .as_ref()
        .map(|s| &s.cors_origins)
        .filter(|o| !o.is_empty());

    match origins {
        Some(origins) if origins.iter().any(|o| o == "*") => CorsLayer::permissive(),
        Some(origins) => {
            let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new().allow_origin(origins)
        }
        // Default: deny all cross-origin requests
        None => CorsLayer::new(),
    }
}

/// Run the API server with graceful shutdown support.
///
/// Starts the background workers before accepting traffic and stops them
/// after the listener drains on SIGINT (Ctrl+C) or SIGTERM.
pub async fn serve(alyx: Alyx) -> anyhow::Result<()> {
    let server_config = alyx.config().server.clone().unwrap_or_default();

    alyx.start_workers().await?;
    let state = Arc::new(AppState { alyx });

    // Rate limiting: 50 burst capacity, replenish 10/second per IP.
    // Applied here (not in build_router) because it requires the real TCP
    // peer IP.
    let key_extractor = AlyxKeyExtractor {
        behind_proxy: server_config.behind_proxy,
    };
    if server_config.behind_proxy {
        tracing::info!(
            "Rate limiter using proxy headers (X-Forwarded-For/X-Real-IP) for client IP"
        );
    }
    let governor_conf = GovernorConfigBuilder::default()
        .key_extractor(key_extractor)
        .per_second(10)
        .burst_size(50)
        .finish()
        .unwrap();
    let governor_layer = GovernorLayer::new(governor_conf);

    let app = build_router(state.clone()).layer(governor_layer);

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port).parse()?;

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.alyx.shutdown().await;

    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
