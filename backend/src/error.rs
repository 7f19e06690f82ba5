//! Transport-level errors.
//!
//! These occur before a JSON-RPC context exists and are answered with a
//! plain `{"error": "..."}` body rather than a JSON-RPC envelope. An unknown
//! session on DELETE is the exception and gets the `{"message": "..."}` body
//! of the teardown response.

use aido_types::{ErrorResponse, MessageResponse};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::mcp::shim::ShimError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid JSON body")]
    InvalidJson(#[source] serde_json::Error),

    #[error("mcp-session-id header required")]
    MissingSessionId,

    #[error("mcp-session-id header is not valid ASCII")]
    InvalidSessionId,

    #[error("Session {0} not found or already cleaned up.")]
    SessionNotFound(String),

    #[error("Session {0} has been terminated")]
    SessionClosed(String),

    #[error("Invalid origin")]
    InvalidOrigin,

    #[error("Method {0} not allowed on the MCP endpoint")]
    MethodNotAllowed(String),

    #[error("Request aborted by client")]
    Aborted,

    #[error("Response stream error: {0}")]
    Shim(#[from] ShimError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::InvalidJson(_)
            | TransportError::MissingSessionId
            | TransportError::InvalidSessionId => StatusCode::BAD_REQUEST,
            TransportError::SessionNotFound(_) | TransportError::SessionClosed(_) => {
                StatusCode::NOT_FOUND
            }
            TransportError::InvalidOrigin => StatusCode::FORBIDDEN,
            TransportError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            // Nobody is listening any more; the status is only seen in logs.
            TransportError::Aborted => StatusCode::REQUEST_TIMEOUT,
            TransportError::Shim(_) | TransportError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Body sent to the client. Internal details stay in the logs.
    pub fn body(&self) -> ErrorResponse {
        match self {
            TransportError::Shim(_) | TransportError::Internal(_) => {
                ErrorResponse::new("Internal server error")
            }
            other => ErrorResponse::new(other.to_string()),
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        match self {
            TransportError::SessionNotFound(_) => (
                self.status(),
                Json(MessageResponse::new(self.to_string())),
            )
                .into_response(),
            other => (other.status(), Json(other.body())).into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
