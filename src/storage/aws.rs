//! AWS S3 (or S3-compatible, e.g. R2/MinIO) object store.
//!
//! Storage keys are used verbatim as S3 keys in a single upstream bucket,
//! so presigned upload URLs issued for a hash land on exactly the key the
//! gateway reads back.
//!
//! Conditional writes map onto native S3 preconditions:
//!   `IfAbsent`             -> `If-None-Match: *`
//!   `IfUnmodifiedSince(t)` -> `If-Unmodified-Since: <http-date>`
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless given explicitly.

use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

use super::backend::{ListPage, ObjectBody, ObjectStore, PutOutcome, StoredObject, WriteCondition};

/// S3 error codes that mean "the write condition did not hold".
const PRECONDITION_CODES: &[&str] = &["PreconditionFailed", "ConditionalRequestConflict"];

/// Object store that forwards operations to an S3 bucket.
pub struct AwsStore {
    /// AWS S3 SDK client.
    client: Client,
    /// The upstream bucket name.
    bucket: String,
}

impl AwsStore {
    /// Create a new S3-backed store.
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
        use_path_style: bool,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        // If explicit credentials are provided, inject them as static credentials.
        if let (Some(ref ak), Some(ref sk)) = (&access_key_id, &secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                None, // session_token
                None, // expiry
                "casgate-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!("AWS object store initialized: bucket={}", bucket);

        Ok(Self { client, bucket })
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("AWS S3 {context}: {err}")
    }

    /// Build a descriptor from the fields S3 reports for an object.
    fn describe(
        key: &str,
        size: Option<i64>,
        last_modified: Option<&aws_sdk_s3::primitives::DateTime>,
        e_tag: Option<&str>,
        content_type: Option<&str>,
    ) -> StoredObject {
        StoredObject {
            key: key.to_string(),
            size: size.unwrap_or(0).max(0) as u64,
            uploaded: last_modified
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                .unwrap_or_else(Utc::now),
            md5: e_tag.and_then(etag_to_md5),
            content_type: content_type.map(str::to_string),
        }
    }
}

/// Extract the MD5 digest from a single-part S3 ETag (`"<32 hex>"`).
///
/// Multipart ETags (`"<hex>-N"`) are not content digests and yield `None`.
fn etag_to_md5(etag: &str) -> Option<[u8; 16]> {
    let inner = etag.trim().trim_matches('"');
    if inner.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    hex::decode_to_slice(inner, &mut out).ok()?;
    Some(out)
}

impl ObjectStore for AwsStore {
    fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ListPage>> + Send + '_>> {
        let prefix = prefix.to_string();
        let start_after = start_after.map(str::to_string);
        Box::pin(async move {
            debug!(
                "AWS list_objects_v2: bucket={} prefix={} start_after={:?}",
                self.bucket, prefix, start_after
            );

            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .max_keys(max_keys.min(1000) as i32)
                .set_start_after(start_after)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("list_objects_v2", e))?;

            let objects: Vec<StoredObject> = resp
                .contents()
                .iter()
                .filter_map(|obj| {
                    obj.key().map(|k| {
                        Self::describe(k, obj.size(), obj.last_modified(), obj.e_tag(), None)
                    })
                })
                .collect();

            let next_start_after = if resp.is_truncated() == Some(true) {
                objects.last().map(|o| o.key.clone())
            } else {
                None
            };

            Ok(ListPage {
                objects,
                next_start_after,
            })
        })
    }

    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredObject>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("AWS head_object: bucket={} key={}", self.bucket, key);

            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(resp) => Ok(Some(Self::describe(
                    &key,
                    resp.content_length(),
                    resp.last_modified(),
                    resp.e_tag(),
                    resp.content_type(),
                ))),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        Ok(None)
                    } else {
                        Err(Self::map_sdk_error("head_object", service_err))
                    }
                }
            }
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectBody>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("AWS get_object: bucket={} key={}", self.bucket, key);

            let resp = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        return Ok(None);
                    }
                    return Err(Self::map_sdk_error("get_object", service_err));
                }
            };

            let object = Self::describe(
                &key,
                resp.content_length(),
                resp.last_modified(),
                resp.e_tag(),
                resp.content_type(),
            );

            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();

            Ok(Some(ObjectBody { object, data }))
        })
    }

    fn put(
        &self,
        key: &str,
        data: Bytes,
        condition: WriteCondition,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutOutcome>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!(
                "AWS put_object: bucket={} key={} condition={:?}",
                self.bucket, key, condition
            );

            let size = data.len() as u64;
            let mut req = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(aws_sdk_s3::primitives::ByteStream::from(data));

            if condition == WriteCondition::IfAbsent {
                req = req.if_none_match("*");
            }

            let result = match condition {
                WriteCondition::IfUnmodifiedSince(t) => {
                    let value = httpdate::fmt_http_date(t.into());
                    req.customize()
                        .mutate_request(move |http_req| {
                            http_req
                                .headers_mut()
                                .insert("if-unmodified-since", value.clone());
                        })
                        .send()
                        .await
                }
                _ => req.send().await,
            };

            match result {
                Ok(resp) => Ok(PutOutcome::Written(StoredObject {
                    key,
                    size,
                    uploaded: Utc::now(),
                    md5: resp.e_tag().and_then(etag_to_md5),
                    content_type: None,
                })),
                Err(e) => {
                    let service_err = e.into_service_error();
                    let code = service_err.meta().code().unwrap_or("");
                    if PRECONDITION_CODES.contains(&code) {
                        debug!("AWS put_object precondition failed: key={} code={}", key, code);
                        Ok(PutOutcome::PreconditionFailed)
                    } else {
                        Err(Self::map_sdk_error("put_object", service_err))
                    }
                }
            }
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("AWS delete_object: bucket={} key={}", self.bucket, key);

            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;

            Ok(())
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_to_md5_single_part() {
        let digest = etag_to_md5("\"d41d8cd98f00b204e9800998ecf8427e\"").unwrap();
        assert_eq!(hex::encode(digest), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_etag_to_md5_unquoted() {
        assert!(etag_to_md5("d41d8cd98f00b204e9800998ecf8427e").is_some());
    }

    #[test]
    fn test_etag_to_md5_multipart_is_none() {
        assert!(etag_to_md5("\"d41d8cd98f00b204e9800998ecf8427e-2\"").is_none());
        assert!(etag_to_md5("").is_none());
    }

    #[test]
    fn test_describe_defaults() {
        let obj = AwsStore::describe("objects/ab", None, None, None, Some("text/plain"));
        assert_eq!(obj.size, 0);
        assert!(obj.md5.is_none());
        assert_eq!(obj.content_type.as_deref(), Some("text/plain"));
    }
}
