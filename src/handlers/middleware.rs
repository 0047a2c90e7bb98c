use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::presence::UpdateEnvelope;
use crate::security::{client_ip_of, ClientIp};
use crate::state::SharedState;
use crate::UserId;

/// Header the upstream auth layer sets to the authenticated account id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Build the presence envelope for a request, if it belongs to a signed-in user.
pub fn envelope_for(request: &Request) -> Option<UpdateEnvelope> {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<UserId>().ok())?;

    let ClientIp(address) = request
        .extensions()
        .get::<ClientIp>()
        .cloned()
        .unwrap_or_else(|| client_ip_of(request));

    let client_signature = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    UpdateEnvelope::new(user_id, address, client_signature)
}

/// Records the caller as online before the handler runs. Submission is
/// bounded by the ingest timeout and its outcome never touches the response.
pub async fn online_status_middleware(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    if let Some(envelope) = envelope_for(&request) {
        state.ingest.submit(envelope).await;
    }
    next.run(request).await
}
