//! Security configuration and middleware.
//!
//! All settings are env-driven: CORS, body limit, request timeout. Designed to
//! work behind Cloudflare (CF-Connecting-IP / X-Forwarded-For) so the presence
//! address is the real client, not the proxy.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Client IP from CF-Connecting-IP, the first X-Forwarded-For hop, or the
/// socket peer. Empty when none is known.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientIp(pub String);

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    /// Comma-separated allowed CORS origins; unset or "*" = permissive.
    pub cors_origins: Option<String>,
    /// Max request body size in bytes.
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
}

impl SecurityConfig {
    pub fn from_env() -> Self {
        let max_body_bytes = env::var("PRESENCE_MAX_BODY_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000_000); // 1 MB default

        let request_timeout = env::var("PRESENCE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        let cors_origins = env::var("PRESENCE_CORS_ORIGINS").ok();

        Self {
            cors_origins,
            max_body_bytes,
            request_timeout,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cors_origins: None,
            max_body_bytes: 1_000_000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Build CORS layer from config. Unset or "*" => permissive; otherwise comma-separated origins.
pub fn build_cors_layer(config: &SecurityConfig) -> CorsLayer {
    let origins = config
        .cors_origins
        .as_deref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && *s != "*");

    match origins {
        None => CorsLayer::permissive(),
        Some(list) => {
            let list: Vec<HeaderValue> = list
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .filter_map(|s| HeaderValue::try_from(s.to_string()).ok())
                .collect();
            if list.is_empty() {
                CorsLayer::permissive()
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(list))
            }
        }
    }
}

/// Resolve the client address for a request without consuming it.
pub fn client_ip_of(request: &Request) -> ClientIp {
    let forwarded = request
        .headers()
        .get("cf-connecting-ip")
        .or_else(|| request.headers().get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let ip = forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default();
    ClientIp(ip)
}

/// Inserts `ClientIp` into request extensions. Run this before anything that needs it.
pub async fn client_ip_middleware(mut request: Request, next: Next) -> Response {
    let ip = client_ip_of(&request);
    request.extensions_mut().insert(ip);
    next.run(request).await
}
