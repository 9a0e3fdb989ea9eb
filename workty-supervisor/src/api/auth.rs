use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::{error::SupervisorError, ApiContextRef};

/// Header carrying the supervisor API key
pub(crate) const API_KEY_HEADER: &str = "X-API-Key";

/// Rejects channel requests that do not present the configured API key.
/// Runs before the websocket handshake, so a rejected client never reaches
/// a room.
pub async fn require_api_key(
    State(context): State<ApiContextRef>,
    request: Request,
    next: Next,
) -> Result<Response, SupervisorError> {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match presented {
        Some(key) if key == context.config.api_key => Ok(next.run(request).await),
        Some(_) => {
            warn!("channel rejected: wrong api key");
            Err(SupervisorError::AuthenticationFailed)
        }
        None => {
            warn!("channel rejected: no api key presented");
            Err(SupervisorError::AuthenticationFailed)
        }
    }
}
