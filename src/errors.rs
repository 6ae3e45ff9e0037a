//! Gateway error types.
//!
//! Every variant maps to one HTTP status and a short machine-readable code.
//! The enum implements [`axum::response::IntoResponse`] so handlers can
//! simply return `Err(GatewayError::NotFound)`; the response body is always
//! `{"error": "<code>"}`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// JSON body of every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

/// Errors surfaced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed request body or parameters.
    #[error("bad_request")]
    BadRequest,

    /// A query parameter carried an unsupported value.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The hash does not normalize to a full digest.
    #[error("invalid_hash")]
    InvalidHash { hash: String },

    /// A batch request exceeded the allowed number of hashes.
    #[error("too_large_request")]
    TooLarge { count: usize, max: usize },

    /// The client secret header is missing.
    #[error("unauthorized")]
    Unauthorized,

    /// The client secret header does not match.
    #[error("forbidden")]
    Forbidden,

    /// No object exists for the hash.
    #[error("object_not_found")]
    NotFound,

    /// No route matches the request path.
    #[error("endpoint_not_found")]
    EndpointNotFound,

    /// The object exists and the existence policy forbids replacing it.
    #[error("object_already_exists")]
    AlreadyExists { hash: String },

    /// The store-computed digest disagrees with the claimed hash.  The
    /// object has already been written under the claimed key.
    #[error("mismatch_hash")]
    Integrity { expected: String, actual: String },

    /// HTTP method not allowed for this resource.
    #[error("method_not_allowed")]
    MethodNotAllowed { allowed: &'static str },

    /// Backing store or signer failure.
    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest => StatusCode::BAD_REQUEST,
            GatewayError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            GatewayError::InvalidHash { .. } => StatusCode::BAD_REQUEST,
            GatewayError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::EndpointNotFound => StatusCode::NOT_FOUND,
            GatewayError::AlreadyExists { .. } => StatusCode::CONFLICT,
            GatewayError::Integrity { .. } => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            GatewayError::Internal(err) => {
                tracing::error!("Internal error: {:#}", err);
            }
            GatewayError::Integrity { expected, actual } => {
                tracing::warn!(
                    "Digest mismatch: claimed={} stored={} (object left in place)",
                    expected,
                    actual
                );
            }
            _ => {}
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        let mut response = (status, axum::Json(body)).into_response();

        if let GatewayError::MethodNotAllowed { allowed } = self {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(allowed));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::BadRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::TooLarge { count: 1001, max: 1000 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(GatewayError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::AlreadyExists { hash: "ab".into() }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GatewayError::Integrity {
                expected: "a".into(),
                actual: "b".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Internal(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(GatewayError::NotFound.to_string(), "object_not_found");
        assert_eq!(
            GatewayError::TooLarge { count: 5, max: 1 }.to_string(),
            "too_large_request"
        );
        assert_eq!(
            GatewayError::Internal(anyhow::anyhow!("store unreachable")).to_string(),
            "store unreachable"
        );
    }

    #[test]
    fn test_method_not_allowed_sets_allow() {
        let resp = GatewayError::MethodNotAllowed { allowed: "GET" }.into_response();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers().get("allow").unwrap(), "GET");
    }

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
