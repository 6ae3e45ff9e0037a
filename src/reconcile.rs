//! Bulk query and sync.
//!
//! A client holding a set of hashes asks which of them the store already
//! has (`query`), or additionally asks for upload authorizations for the
//! ones it lacks (`sync`).  Requests are validated as a whole before any
//! store call: a bad element rejects the entire batch.
//!
//! Probes run concurrently up to a configured bound; results keep input
//! order.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use utoipa::ToSchema;

use crate::errors::GatewayError;
use crate::gateway::ObjectGateway;
use crate::hash::ContentHash;
use crate::object::{to_detail_projection, ObjectDetail};
use crate::presign::{UploadAuthorization, UploadPolicy};

/// Largest number of hashes accepted in one request.
pub const MAX_BATCH: usize = 1000;

/// Default bound on concurrent store probes per request.
pub const DEFAULT_MAX_CONCURRENT_PROBES: usize = 16;

/// Request body of the bulk endpoints.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ReconcileRequest {
    /// Hashes to look up.
    pub md5: Vec<String>,
}

/// Response body of `POST /sync`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SyncResponse {
    /// Hashes already present, as detail records.
    pub objects: Vec<ObjectDetail>,
    /// One authorization per absent hash, in input order.
    pub uploads: Vec<UploadAuthorization>,
}

enum SyncOutcome {
    Present(ObjectDetail),
    Upload(UploadAuthorization),
}

/// Batched existence checks and upload-authorization issuance.
#[derive(Clone)]
pub struct ReconciliationService {
    gateway: Arc<ObjectGateway>,
    max_batch: usize,
    max_concurrent_probes: usize,
}

impl ReconciliationService {
    pub fn new(gateway: Arc<ObjectGateway>, max_batch: usize, max_concurrent_probes: usize) -> Self {
        Self {
            gateway,
            max_batch,
            max_concurrent_probes: max_concurrent_probes.max(1),
        }
    }

    pub fn with_defaults(gateway: Arc<ObjectGateway>) -> Self {
        Self::new(gateway, MAX_BATCH, DEFAULT_MAX_CONCURRENT_PROBES)
    }

    /// Validate a request body and extract its hash list.
    ///
    /// The body must be an object whose `md5` member is an array of at most
    /// `max_batch` strings.
    pub fn parse_request(&self, body: &Value) -> Result<Vec<String>, GatewayError> {
        let items = body
            .get("md5")
            .and_then(Value::as_array)
            .ok_or(GatewayError::BadRequest)?;

        if items.len() > self.max_batch {
            return Err(GatewayError::TooLarge {
                count: items.len(),
                max: self.max_batch,
            });
        }

        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or(GatewayError::BadRequest)
            })
            .collect()
    }

    /// Parse raw request bytes, then run [`query`](Self::query).
    pub async fn query_body(&self, body: &[u8]) -> Result<Vec<ObjectDetail>, GatewayError> {
        let hashes = self.parse_request(&parse_json(body)?)?;
        self.query(&hashes).await
    }

    /// Parse raw request bytes, then run [`sync`](Self::sync).
    pub async fn sync_body(&self, body: &[u8]) -> Result<SyncResponse, GatewayError> {
        let hashes = self.parse_request(&parse_json(body)?)?;
        self.sync(&hashes).await
    }

    /// Detail records for the hashes that exist, in input order.
    pub async fn query(&self, hashes: &[String]) -> Result<Vec<ObjectDetail>, GatewayError> {
        metrics::counter!(crate::metrics::RECONCILE_HASHES_TOTAL, "op" => "query")
            .increment(hashes.len() as u64);

        let found: Vec<Option<ObjectDetail>> = stream::iter(hashes.iter().cloned())
            .map(|raw| {
                let gateway = Arc::clone(&self.gateway);
                async move {
                    let hash = ContentHash::normalize(&raw);
                    let probed = gateway.probe(&hash).await?;
                    Ok::<_, GatewayError>(
                        probed.map(|obj| to_detail_projection(gateway.codec(), &obj)),
                    )
                }
            })
            .buffered(self.max_concurrent_probes)
            .try_collect()
            .await?;

        let objects: Vec<ObjectDetail> = found.into_iter().flatten().collect();
        debug!("Query: {} of {} hashes present", objects.len(), hashes.len());
        Ok(objects)
    }

    /// Present objects plus one `error`-policy authorization per absent hash.
    ///
    /// Unlike [`query`](Self::query), which treats a malformed hash as absent,
    /// every hash here must be 32 hex characters or the whole batch is
    /// rejected with `invalid_hash`.  This is stricter than the request
    /// shape check in [`parse_request`](Self::parse_request).
    pub async fn sync(&self, hashes: &[String]) -> Result<SyncResponse, GatewayError> {
        let normalized: Vec<ContentHash> = hashes.iter().map(|h| ContentHash::normalize(h)).collect();
        if let Some(bad) = normalized.iter().find(|h| !h.is_well_formed()) {
            return Err(GatewayError::InvalidHash {
                hash: bad.to_string(),
            });
        }

        metrics::counter!(crate::metrics::RECONCILE_HASHES_TOTAL, "op" => "sync")
            .increment(hashes.len() as u64);

        let outcomes: Vec<SyncOutcome> = stream::iter(normalized)
            .map(|hash| {
                let gateway = Arc::clone(&self.gateway);
                async move {
                    match gateway.probe(&hash).await? {
                        Some(obj) => Ok(SyncOutcome::Present(to_detail_projection(
                            gateway.codec(),
                            &obj,
                        ))),
                        None => gateway
                            .request_upload(&hash, UploadPolicy::Error)
                            .await
                            .map(SyncOutcome::Upload),
                    }
                }
            })
            .buffered(self.max_concurrent_probes)
            .try_collect()
            .await?;

        let mut response = SyncResponse {
            objects: Vec::new(),
            uploads: Vec::new(),
        };
        for outcome in outcomes {
            match outcome {
                SyncOutcome::Present(detail) => response.objects.push(detail),
                SyncOutcome::Upload(auth) => response.uploads.push(auth),
            }
        }
        debug!(
            "Sync: {} present, {} upload authorizations",
            response.objects.len(),
            response.uploads.len()
        );
        Ok(response)
    }
}

fn parse_json(body: &[u8]) -> Result<Value, GatewayError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!("Rejecting bulk request body: {}", e);
        GatewayError::BadRequest
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{test_gateway, CountingStore};
    use crate::gateway::ExistencePolicy;
    use crate::hash::md5_digest;
    use crate::storage::memory::MemoryStore;
    use bytes::Bytes;
    use chrono::Utc;
    use serde_json::json;

    fn hash_of(data: &[u8]) -> String {
        ContentHash::from_digest(&md5_digest(data)).to_string()
    }

    fn service_over(store: Arc<dyn crate::storage::backend::ObjectStore>) -> ReconciliationService {
        ReconciliationService::with_defaults(Arc::new(test_gateway(store)))
    }

    async fn seed(service: &ReconciliationService, data: &[u8]) -> String {
        let hash = hash_of(data);
        service
            .gateway
            .put(
                &ContentHash::normalize(&hash),
                Bytes::copy_from_slice(data),
                ExistencePolicy::Error,
            )
            .await
            .unwrap();
        hash
    }

    #[test]
    fn test_parse_rejects_non_array() {
        let service = service_over(Arc::new(MemoryStore::default()));
        for body in [
            json!({"md5": "not-an-array"}),
            json!({}),
            json!(null),
            json!(false),
            json!([]),
            json!({"md5": {"0": "ab"}}),
        ] {
            assert!(
                matches!(service.parse_request(&body), Err(GatewayError::BadRequest)),
                "body {body} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_non_string_element() {
        let service = service_over(Arc::new(MemoryStore::default()));
        let body = json!({"md5": ["d41d8cd98f00b204e9800998ecf8427e", 42]});
        assert!(matches!(
            service.parse_request(&body),
            Err(GatewayError::BadRequest)
        ));
    }

    #[test]
    fn test_parse_batch_limit() {
        let service = service_over(Arc::new(MemoryStore::default()));
        let at_limit: Vec<String> = (0..MAX_BATCH).map(|i| format!("{i:032x}")).collect();
        assert_eq!(
            service.parse_request(&json!({ "md5": at_limit })).unwrap().len(),
            MAX_BATCH
        );

        let over: Vec<String> = (0..=MAX_BATCH).map(|i| format!("{i:032x}")).collect();
        match service.parse_request(&json!({ "md5": over })) {
            Err(GatewayError::TooLarge { count, max }) => {
                assert_eq!(count, MAX_BATCH + 1);
                assert_eq!(max, MAX_BATCH);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_batch_makes_no_store_calls() {
        let store = Arc::new(CountingStore::default());
        let service = service_over(store.clone());
        let over: Vec<String> = (0..1001).map(|i| format!("{i:032x}")).collect();
        let body = serde_json::to_vec(&json!({ "md5": over })).unwrap();

        assert!(matches!(
            service.sync_body(&body).await,
            Err(GatewayError::TooLarge { .. })
        ));
        assert!(matches!(
            service.query_body(&body).await,
            Err(GatewayError::TooLarge { .. })
        ));
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let service = service_over(Arc::new(MemoryStore::default()));
        assert!(matches!(
            service.query_body(b"{not json").await,
            Err(GatewayError::BadRequest)
        ));
        assert!(matches!(
            service.sync_body(b"").await,
            Err(GatewayError::BadRequest)
        ));
    }

    #[tokio::test]
    async fn test_query_returns_present_in_order() {
        let service = service_over(Arc::new(MemoryStore::default()));
        let a = seed(&service, b"a").await;
        let b = seed(&service, b"b").await;
        let missing = hash_of(b"missing");

        let details = service
            .query(&[b.clone(), missing, a.to_uppercase(), "garbage".to_string()])
            .await
            .unwrap();
        let hashes: Vec<_> = details.iter().map(|d| d.md5.clone()).collect();
        assert_eq!(hashes, vec![b, a]);
        assert_eq!(details[0].size, 1);
    }

    #[tokio::test]
    async fn test_sync_partitions_present_and_absent() {
        let service = service_over(Arc::new(MemoryStore::default()));
        let h1 = seed(&service, b"h1").await;
        let h2 = hash_of(b"h2");

        let before = Utc::now();
        let resp = service.sync(&[h1.clone(), h2.clone()]).await.unwrap();

        assert_eq!(resp.objects.len(), 1);
        assert_eq!(resp.objects[0].md5, h1);
        assert_eq!(resp.uploads.len(), 1);

        let upload = &resp.uploads[0];
        assert_eq!(upload.md5, h2);
        assert_eq!(upload.method, "PUT");
        assert!(upload.url.contains(&h2));
        assert_eq!(
            upload.headers.get("If-Unmodified-Since").unwrap(),
            "Tue, 28 Sep 2021 16:00:00 GMT"
        );
        let window = (upload.expires - before).num_seconds();
        assert!((599..=601).contains(&window), "window was {window}s");
    }

    #[tokio::test]
    async fn test_sync_preserves_input_order() {
        let service = ReconciliationService::new(
            Arc::new(test_gateway(Arc::new(MemoryStore::default()))),
            MAX_BATCH,
            4,
        );
        let mut input = Vec::new();
        let mut expected_uploads = Vec::new();
        for i in 0..40 {
            let data = format!("item-{i}");
            if i % 3 == 0 {
                input.push(seed(&service, data.as_bytes()).await);
            } else {
                let h = hash_of(data.as_bytes());
                expected_uploads.push(h.clone());
                input.push(h);
            }
        }

        let resp = service.sync(&input).await.unwrap();
        let uploads: Vec<_> = resp.uploads.iter().map(|u| u.md5.clone()).collect();
        assert_eq!(uploads, expected_uploads);
        assert_eq!(resp.objects.len() + resp.uploads.len(), input.len());
    }

    #[tokio::test]
    async fn test_sync_rejects_malformed_hash_before_probing() {
        let store = Arc::new(CountingStore::default());
        let service = service_over(store.clone());
        let err = service
            .sync(&[hash_of(b"ok"), "xyz".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidHash { .. }));
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_repeated_authorizations_admit_one_write() {
        use crate::storage::backend::{ObjectStore, PutOutcome, WriteCondition};

        let store = Arc::new(MemoryStore::default());
        let service = service_over(store.clone());
        let h = hash_of(b"contended");

        let mut conditions = Vec::new();
        for _ in 0..2 {
            let resp = service.sync(&[h.clone()]).await.unwrap();
            assert_eq!(resp.uploads.len(), 1);
            let header = resp.uploads[0].headers.get("If-Unmodified-Since").unwrap();
            let since = httpdate::parse_http_date(header).unwrap();
            conditions.push(WriteCondition::IfUnmodifiedSince(since.into()));
        }

        let key = service.gateway.codec().to_key(&ContentHash::normalize(&h));
        let mut written = Vec::new();
        for condition in conditions {
            let outcome = store
                .put(&key, Bytes::from_static(b"contended"), condition)
                .await
                .unwrap();
            written.push(matches!(outcome, PutOutcome::Written(_)));
        }
        assert_eq!(written, vec![true, false]);
    }

    #[tokio::test]
    async fn test_sync_empty_batch() {
        let service = service_over(Arc::new(MemoryStore::default()));
        let resp = service.sync(&[]).await.unwrap();
        assert!(resp.objects.is_empty());
        assert!(resp.uploads.is_empty());
    }
}
