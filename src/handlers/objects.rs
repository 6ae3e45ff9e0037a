//! Single-object HTTP handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;

use crate::errors::GatewayError;
use crate::gateway::ExistencePolicy;
use crate::hash::ContentHash;
use crate::object::{object_headers, Projection};
use crate::presign::UploadPolicy;
use crate::AppState;

/// Parse an optional query parameter, mapping failures to `err`.
fn query_param<T: std::str::FromStr>(
    query: &HashMap<String, String>,
    name: &str,
    err: impl FnOnce() -> GatewayError,
) -> Result<Option<T>, GatewayError> {
    match query.get(name) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| err()),
    }
}

/// `GET /objects` -- List stored objects.
#[utoipa::path(
    get,
    path = "/objects",
    tag = "Object",
    operation_id = "ListObjects",
    params(
        ("return" = Option<String>, Query, description = "`md5` (default), `hash` or `object`"),
        ("limit" = Option<usize>, Query, description = "Maximum number of entries"),
    ),
    responses(
        (status = 200, description = "Array of hashes or detail records"),
        (status = 400, description = "Unsupported return mode or limit", body = crate::errors::ErrorBody)
    )
)]
pub async fn list_objects(
    state: Arc<AppState>,
    query: &HashMap<String, String>,
) -> Result<Response, GatewayError> {
    let projection: Projection =
        query_param(query, "return", || GatewayError::BadRequest)?.unwrap_or_default();
    let limit: Option<usize> = query_param(query, "limit", || GatewayError::InvalidArgument {
        message: "invalid_limit".to_string(),
    })?;

    let entries = state.gateway.list(projection, limit).await?;
    Ok(Json(entries).into_response())
}

/// `GET /objects/{hash}` -- Download an object.
#[utoipa::path(
    get,
    path = "/objects/{hash}",
    tag = "Object",
    operation_id = "GetObject",
    params(("hash" = String, Path, description = "MD5 content hash")),
    responses(
        (status = 200, description = "Object bytes"),
        (status = 404, description = "Object not found", body = crate::errors::ErrorBody)
    )
)]
pub async fn get_object(state: Arc<AppState>, hash: &str) -> Result<Response, GatewayError> {
    let hash = ContentHash::normalize(hash);
    let body = state.gateway.get(&hash).await?;

    let mut headers = object_headers(&body.object);
    headers
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("application/octet-stream"));
    Ok((StatusCode::OK, headers, body.data).into_response())
}

/// `HEAD /objects/{hash}` -- Existence probe.
#[utoipa::path(
    head,
    path = "/objects/{hash}",
    tag = "Object",
    operation_id = "HeadObject",
    params(("hash" = String, Path, description = "MD5 content hash")),
    responses(
        (status = 200, description = "Object exists; headers describe it"),
        (status = 404, description = "Object not found")
    )
)]
pub async fn head_object(state: Arc<AppState>, hash: &str) -> Result<Response, GatewayError> {
    let hash = ContentHash::normalize(hash);
    match state.gateway.head(&hash).await {
        Ok(obj) => Ok((StatusCode::OK, object_headers(&obj)).into_response()),
        // HEAD responses carry no body.
        Err(GatewayError::NotFound) => Ok(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err(e),
    }
}

/// `PUT /objects/{hash}` -- Upload an object through the gateway.
#[utoipa::path(
    put,
    path = "/objects/{hash}",
    tag = "Object",
    operation_id = "PutObject",
    params(
        ("hash" = String, Path, description = "MD5 content hash"),
        ("exists" = Option<String>, Query, description = "`error` (default), `overwrite` or `skip`"),
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 204, description = "Object stored (or kept, with `skip`)"),
        (status = 400, description = "Invalid hash, exists policy or digest mismatch", body = crate::errors::ErrorBody),
        (status = 401, description = "Missing client secret", body = crate::errors::ErrorBody),
        (status = 403, description = "Wrong client secret", body = crate::errors::ErrorBody),
        (status = 409, description = "Object already exists", body = crate::errors::ErrorBody)
    )
)]
pub async fn put_object(
    state: Arc<AppState>,
    hash: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let policy: ExistencePolicy = query_param(query, "exists", || GatewayError::InvalidArgument {
        message: "invalid_exists".to_string(),
    })?
    .unwrap_or_default();
    let hash = ContentHash::normalize(hash);

    let stored = state.gateway.put(&hash, body, policy).await?;

    let mut headers = object_headers(&stored);
    // 204 responses must not advertise a body length.
    headers.remove(header::CONTENT_LENGTH);
    Ok((StatusCode::NO_CONTENT, headers).into_response())
}

/// `POST /objects/{hash}` -- Request a presigned upload authorization.
#[utoipa::path(
    post,
    path = "/objects/{hash}",
    tag = "Object",
    operation_id = "RequestUpload",
    params(
        ("hash" = String, Path, description = "MD5 content hash"),
        ("exists" = Option<String>, Query, description = "`error` (default) or `overwrite`"),
    ),
    responses(
        (status = 200, description = "Upload authorization", body = crate::presign::UploadAuthorization),
        (status = 400, description = "Invalid hash or exists policy", body = crate::errors::ErrorBody),
        (status = 401, description = "Missing client secret", body = crate::errors::ErrorBody),
        (status = 403, description = "Wrong client secret", body = crate::errors::ErrorBody)
    )
)]
pub async fn request_upload(
    state: Arc<AppState>,
    hash: &str,
    query: &HashMap<String, String>,
) -> Result<Response, GatewayError> {
    let policy: UploadPolicy = query_param(query, "exists", || GatewayError::InvalidArgument {
        message: "invalid_exists".to_string(),
    })?
    .unwrap_or_default();
    let hash = ContentHash::normalize(hash);

    let authorization = state.gateway.request_upload(&hash, policy).await?;
    Ok(Json(authorization).into_response())
}

/// `DELETE /objects/{hash}` -- Delete an object.
#[utoipa::path(
    delete,
    path = "/objects/{hash}",
    tag = "Object",
    operation_id = "DeleteObject",
    params(("hash" = String, Path, description = "MD5 content hash")),
    responses(
        (status = 204, description = "Object deleted (or never existed)"),
        (status = 401, description = "Missing client secret", body = crate::errors::ErrorBody),
        (status = 403, description = "Wrong client secret", body = crate::errors::ErrorBody)
    )
)]
pub async fn delete_object(state: Arc<AppState>, hash: &str) -> Result<Response, GatewayError> {
    let hash = ContentHash::normalize(hash);
    state.gateway.delete(&hash).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
