//! Shared-secret access control for mutating endpoints.
//!
//! Clients authenticate by sending the configured secret in the
//! `x-client-secret` header.  A missing header is `401 unauthorized`, a
//! wrong one is `403 forbidden`.  The comparison runs in constant time.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::AppState;

/// Header carrying the client secret.
pub const CLIENT_SECRET_HEADER: &str = "x-client-secret";

/// Checks the client secret on incoming requests.
#[derive(Clone)]
pub struct AccessGuard {
    secret: String,
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl AccessGuard {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// True when a secret is configured.  Without one every check fails.
    pub fn is_configured(&self) -> bool {
        !self.secret.is_empty()
    }

    /// Validate the `x-client-secret` header in `headers`.
    ///
    /// An empty header value counts as missing.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        let provided = match headers.get(CLIENT_SECRET_HEADER) {
            Some(value) if !value.is_empty() => value.as_bytes(),
            _ => return Err(GatewayError::Unauthorized),
        };

        if self.is_configured() && constant_time_eq_bytes(provided, self.secret.as_bytes()) {
            Ok(())
        } else {
            Err(GatewayError::Forbidden)
        }
    }
}

/// Compare two strings in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    constant_time_eq_bytes(a.as_bytes(), b.as_bytes())
}

fn constant_time_eq_bytes(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Middleware that rejects requests without a valid client secret.
///
/// Only layered onto the mutating routes; reads bypass it.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if let Err(err) = state.guard.check(req.headers()) {
        warn!(
            "Rejected {} {}: {}",
            req.method(),
            req.uri().path(),
            err
        );
        return Err(err);
    }
    debug!("Client secret OK for {} {}", req.method(), req.uri().path());
    Ok(next.run(req).await)
}
