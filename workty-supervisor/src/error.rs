use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Unknown context: {0}")]
    UnknownContext(String),

    #[error("Unknown tenant: {0}")]
    UnknownTenant(uuid::Uuid),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for SupervisorError {
    fn into_response(self) -> Response {
        let status = match &self {
            SupervisorError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            SupervisorError::UnknownContext(_) => StatusCode::NOT_FOUND,
            SupervisorError::UnknownTenant(_) => StatusCode::NOT_FOUND,
        };

        let body = serde_json::to_string(&ErrorResponse {
            error: self.to_string(),
        })
        .unwrap_or_else(|_| format!("{{\"error\": \"{}\"}}", self));

        let mut response = Response::new(body.into());
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        response
    }
}
