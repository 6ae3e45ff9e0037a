//! Axum router construction and route mapping.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].
//!
//! Reads (listing, download, head, query) are open.  Writes (direct upload,
//! upload authorization, delete, sync) require the client secret; the
//! decision is made per method and path in [`requires_client_secret`].

use axum::{
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{HeaderValue, Method, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::auth::auth_middleware;
use crate::errors::{generate_request_id, GatewayError};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the casgate API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "casgate API",
        version = "0.1.0",
        description = "Content-addressed object gateway"
    ),
    paths(
        health_check,
        crate::handlers::objects::list_objects,
        crate::handlers::objects::get_object,
        crate::handlers::objects::head_object,
        crate::handlers::objects::put_object,
        crate::handlers::objects::request_upload,
        crate::handlers::objects::delete_object,
        crate::handlers::bulk::query_objects,
        crate::handlers::bulk::sync_objects,
    ),
    components(schemas(
        crate::errors::ErrorBody,
        crate::object::ObjectDetail,
        crate::presign::UploadAuthorization,
        crate::reconcile::ReconcileRequest,
        crate::reconcile::SyncResponse,
    )),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Object", description = "Single-object operations"),
        (name = "Bulk", description = "Bulk query and sync"),
    )
)]
pub struct ApiDoc;

/// Build the axum [`Router`] with all routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = usize::try_from(state.config.server.max_object_size).unwrap_or(usize::MAX);

    let mut router = Router::new()
        .route(
            "/objects",
            get(handle_list_objects).fallback(|| method_not_allowed("GET, HEAD")),
        )
        .route(
            "/objects/query",
            post(handle_query_objects).fallback(|| method_not_allowed("POST")),
        )
        .route(
            "/objects/:hash",
            get(handle_get_object)
                .head(handle_head_object)
                .put(handle_put_object)
                .post(handle_post_object)
                .delete(handle_delete_object)
                .fallback(|| method_not_allowed("GET, HEAD, PUT, POST, DELETE")),
        )
        .route(
            "/sync-query",
            post(handle_query_objects).fallback(|| method_not_allowed("POST")),
        )
        .route(
            "/sync",
            post(handle_sync_objects).fallback(|| method_not_allowed("POST")),
        )
        .route("/openapi.json", get(openapi_json));

    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .fallback(endpoint_not_found)
        // Application state shared across all handlers.
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        // auth_middleware is innermost (closest to handlers).
        .layer(middleware::from_fn_with_state(state, client_secret_middleware))
        // common_headers_middleware adds x-request-id, Date and Server.
        .layer(middleware::from_fn(common_headers_middleware))
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

// -- Common headers middleware -----------------------------------------------

/// Adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `casgate`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("casgate"));

    response
}

// -- Auth --------------------------------------------------------------------

/// True for the routes that mutate the store or issue authorizations.
pub fn requires_client_secret(method: &Method, path: &str) -> bool {
    if path == "/sync" {
        return *method == Method::POST;
    }
    let is_object_path = path
        .strip_prefix("/objects/")
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/') && rest != "query");
    is_object_path && matches!(*method, Method::PUT | Method::POST | Method::DELETE)
}

/// Runs the access guard on mutating routes only.
async fn client_secret_middleware(
    state: State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    if requires_client_secret(req.method(), req.uri().path()) {
        auth_middleware(state, req, next).await
    } else {
        Ok(next.run(req).await)
    }
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// `GET /openapi.json`
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Fallbacks ---------------------------------------------------------------

async fn method_not_allowed(allowed: &'static str) -> GatewayError {
    GatewayError::MethodNotAllowed { allowed }
}

async fn endpoint_not_found() -> GatewayError {
    GatewayError::EndpointNotFound
}

// -- Query parameter parsing helper ------------------------------------------

/// Parse raw query string into a HashMap.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let decoded_k = percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned();
                let decoded_v = percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded_k, decoded_v);
            } else if !part.is_empty() {
                let decoded = percent_encoding::percent_decode_str(part)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded, String::new());
            }
        }
    }
    map
}

// -- Dispatch ----------------------------------------------------------------

/// `GET /objects`
async fn handle_list_objects(
    State(state): State<Arc<AppState>>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, GatewayError> {
    let query = parse_query(raw_query);
    crate::handlers::objects::list_objects(state, &query).await
}

/// `POST /objects/query` and `POST /sync-query`
async fn handle_query_objects(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Response, GatewayError> {
    crate::handlers::bulk::query_objects(state, &body).await
}

/// `POST /sync`
async fn handle_sync_objects(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Response, GatewayError> {
    crate::handlers::bulk::sync_objects(state, &body).await
}

/// `GET /objects/:hash`
async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Response, GatewayError> {
    crate::handlers::objects::get_object(state, &hash).await
}

/// `HEAD /objects/:hash`
async fn handle_head_object(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Response, GatewayError> {
    crate::handlers::objects::head_object(state, &hash).await
}

/// `PUT /objects/:hash`
async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    RawQuery(raw_query): RawQuery,
    body: axum::body::Bytes,
) -> Result<Response, GatewayError> {
    let query = parse_query(raw_query);
    crate::handlers::objects::put_object(state, &hash, &query, body).await
}

/// `POST /objects/:hash`
async fn handle_post_object(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, GatewayError> {
    let query = parse_query(raw_query);
    crate::handlers::objects::request_upload(state, &hash, &query).await
}

/// `DELETE /objects/:hash`
async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Response, GatewayError> {
    crate::handlers::objects::delete_object(state, &hash).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let q = parse_query(Some("return=object&limit=5&flag".to_string()));
        assert_eq!(q.get("return").unwrap(), "object");
        assert_eq!(q.get("limit").unwrap(), "5");
        assert_eq!(q.get("flag").unwrap(), "");
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_parse_query_decodes() {
        let q = parse_query(Some("exists=over%77rite".to_string()));
        assert_eq!(q.get("exists").unwrap(), "overwrite");
    }

    #[test]
    fn test_requires_client_secret() {
        let hash = "/objects/d41d8cd98f00b204e9800998ecf8427e";
        assert!(requires_client_secret(&Method::PUT, hash));
        assert!(requires_client_secret(&Method::POST, hash));
        assert!(requires_client_secret(&Method::DELETE, hash));
        assert!(requires_client_secret(&Method::POST, "/sync"));

        assert!(!requires_client_secret(&Method::GET, hash));
        assert!(!requires_client_secret(&Method::HEAD, hash));
        assert!(!requires_client_secret(&Method::GET, "/objects"));
        assert!(!requires_client_secret(&Method::POST, "/objects/query"));
        assert!(!requires_client_secret(&Method::POST, "/sync-query"));
        assert!(!requires_client_secret(&Method::GET, "/sync"));
        assert!(!requires_client_secret(&Method::PATCH, hash));
    }

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<_> = doc.paths.paths.keys().cloned().collect();
        for expected in ["/objects", "/objects/{hash}", "/sync", "/sync-query", "/health"] {
            assert!(paths.iter().any(|p| p == expected), "missing {expected}");
        }
    }
}
