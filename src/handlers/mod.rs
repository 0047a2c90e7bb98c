pub mod http;
pub mod middleware;

use axum::{
    http::{header, HeaderValue, StatusCode},
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::security::{build_cors_layer, client_ip_middleware, SecurityConfig};
use crate::state::SharedState;

pub use middleware::online_status_middleware;

/// Routes plus the middleware stack. Layers added later run first, so the
/// client IP is resolved before the online-status middleware reads it.
pub fn router(state: SharedState, security: &SecurityConfig) -> Router {
    Router::new()
        .route("/api/online/count", get(http::get_online_count))
        .route("/api/status", get(http::get_status))
        .route("/health", get(|| async { "ok" }))
        .route("/", get(http::status_page_handler))
        .route("/status", get(http::status_page_handler))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not found. Use / or /status, /health, or /api/*.") })
        .layer(axum::middleware::from_fn_with_state(state.clone(), online_status_middleware))
        .layer(axum::middleware::from_fn(client_ip_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(security.max_body_bytes))
                .layer(build_cors_layer(security))
                .layer(TimeoutLayer::new(security.request_timeout))
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                )),
        )
        .with_state(state)
}
