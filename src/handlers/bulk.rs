//! Bulk query and sync handlers.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::errors::GatewayError;
use crate::AppState;

/// `POST /objects/query` and `POST /sync-query` -- Which hashes exist?
#[utoipa::path(
    post,
    path = "/sync-query",
    tag = "Bulk",
    operation_id = "QueryObjects",
    request_body = crate::reconcile::ReconcileRequest,
    responses(
        (status = 200, description = "Detail records of the present hashes", body = Vec<crate::object::ObjectDetail>),
        (status = 400, description = "Malformed request", body = crate::errors::ErrorBody),
        (status = 413, description = "More than 1000 hashes", body = crate::errors::ErrorBody)
    )
)]
pub async fn query_objects(state: Arc<AppState>, body: &[u8]) -> Result<Response, GatewayError> {
    let objects = state.reconciler.query_body(body).await?;
    Ok(Json(objects).into_response())
}

/// `POST /sync` -- Present objects plus upload authorizations for the rest.
///
/// Besides the request shape checks shared with `query_objects`, every hash
/// must be well formed: a single malformed entry fails the whole batch with
/// 400 `invalid_hash` before any store call.
#[utoipa::path(
    post,
    path = "/sync",
    tag = "Bulk",
    operation_id = "SyncObjects",
    request_body = crate::reconcile::ReconcileRequest,
    responses(
        (status = 200, description = "Partitioned result", body = crate::reconcile::SyncResponse),
        (status = 400, description = "Malformed request or hash", body = crate::errors::ErrorBody),
        (status = 401, description = "Missing client secret", body = crate::errors::ErrorBody),
        (status = 403, description = "Wrong client secret", body = crate::errors::ErrorBody),
        (status = 413, description = "More than 1000 hashes", body = crate::errors::ErrorBody)
    )
)]
pub async fn sync_objects(state: Arc<AppState>, body: &[u8]) -> Result<Response, GatewayError> {
    let response = state.reconciler.sync_body(body).await?;
    Ok(Json(response).into_response())
}
