//! Single-object operations over the backing store.
//!
//! [`ObjectGateway`] turns content hashes into storage keys, applies the
//! existence policy on direct uploads and checks the store-computed digest
//! against the claimed hash after every write.
//!
//! Probing for an existing object before writing is only a fast path.  The
//! write itself carries a [`WriteCondition`] so the store decides atomically
//! whether a create may proceed; two racing `error` uploads of the same hash
//! produce exactly one object and one `409`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::errors::GatewayError;
use crate::hash::{ContentHash, HashCodec};
use crate::object::{ListEntry, Projection};
use crate::presign::{UploadAuthorization, UploadAuthorizer, UploadPolicy};
use crate::storage::backend::{ObjectBody, ObjectStore, PutOutcome, StoredObject, WriteCondition};

/// Keys requested from the store per listing page.
pub const LIST_PAGE_SIZE: usize = 1000;

/// What a direct upload does when the object already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistencePolicy {
    /// Fail with `409 object_already_exists`.
    #[default]
    Error,
    /// Replace unconditionally.
    Overwrite,
    /// Keep the existing object and report it.
    Skip,
}

impl ExistencePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExistencePolicy::Error => "error",
            ExistencePolicy::Overwrite => "overwrite",
            ExistencePolicy::Skip => "skip",
        }
    }
}

impl fmt::Display for ExistencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExistencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(ExistencePolicy::Error),
            "overwrite" => Ok(ExistencePolicy::Overwrite),
            "skip" => Ok(ExistencePolicy::Skip),
            other => Err(format!("unsupported exists policy: {other}")),
        }
    }
}

/// Hash-addressed access to the backing store.
#[derive(Clone)]
pub struct ObjectGateway {
    store: Arc<dyn ObjectStore>,
    codec: HashCodec,
    authorizer: UploadAuthorizer,
}

impl ObjectGateway {
    pub fn new(store: Arc<dyn ObjectStore>, codec: HashCodec, authorizer: UploadAuthorizer) -> Self {
        Self {
            store,
            codec,
            authorizer,
        }
    }

    pub fn codec(&self) -> &HashCodec {
        &self.codec
    }

    /// Lazily enumerate every object under the key prefix.
    ///
    /// Pages are fetched from the store only as the stream is polled, so a
    /// `limit` stops paging as soon as enough objects have been yielded.
    pub fn list_stream(
        &self,
        limit: Option<usize>,
    ) -> BoxStream<'static, anyhow::Result<StoredObject>> {
        let store = Arc::clone(&self.store);
        let prefix = self.codec.list_prefix();

        // State: `Some(cursor)` while pages remain, `None` once exhausted.
        let pages = stream::try_unfold(Some(None::<String>), move |cursor| {
            let store = Arc::clone(&store);
            let prefix = prefix.clone();
            async move {
                let Some(start_after) = cursor else {
                    return anyhow::Ok(None);
                };
                let page = store
                    .list(&prefix, start_after.as_deref(), LIST_PAGE_SIZE)
                    .await?;
                let next = page.next_start_after.map(Some);
                anyhow::Ok(Some((page.objects, next)))
            }
        });

        pages
            .map_ok(|objects| stream::iter(objects.into_iter().map(anyhow::Ok)))
            .try_flatten()
            .take(limit.unwrap_or(usize::MAX))
            .boxed()
    }

    /// List objects in the chosen projection.
    pub async fn list(
        &self,
        projection: Projection,
        limit: Option<usize>,
    ) -> Result<Vec<ListEntry>, GatewayError> {
        let codec = self.codec.clone();
        let entries: Vec<ListEntry> = self
            .list_stream(limit)
            .map_ok(|obj| projection.project(&codec, &obj))
            .try_collect()
            .await?;
        debug!("Listed {} objects ({:?})", entries.len(), projection);
        Ok(entries)
    }

    /// Fetch an object with its body.
    pub async fn get(&self, hash: &ContentHash) -> Result<ObjectBody, GatewayError> {
        if !hash.is_well_formed() {
            return Err(GatewayError::NotFound);
        }
        self.store
            .get(&self.codec.to_key(hash))
            .await?
            .ok_or(GatewayError::NotFound)
    }

    /// Fetch an object's descriptor.
    pub async fn head(&self, hash: &ContentHash) -> Result<StoredObject, GatewayError> {
        self.probe(hash).await?.ok_or(GatewayError::NotFound)
    }

    /// Existence probe.  Malformed hashes are never present.
    pub async fn probe(&self, hash: &ContentHash) -> Result<Option<StoredObject>, GatewayError> {
        if !hash.is_well_formed() {
            return Ok(None);
        }
        Ok(self.store.head(&self.codec.to_key(hash)).await?)
    }

    /// Upload `data` under `hash`, honouring `policy`.
    ///
    /// Returns the descriptor of the object now stored under the hash.  On a
    /// digest mismatch the bytes stay written and [`GatewayError::Integrity`]
    /// is returned.
    pub async fn put(
        &self,
        hash: &ContentHash,
        data: Bytes,
        policy: ExistencePolicy,
    ) -> Result<StoredObject, GatewayError> {
        if !hash.is_well_formed() {
            return Err(GatewayError::InvalidHash {
                hash: hash.to_string(),
            });
        }
        let key = self.codec.to_key(hash);

        let stored = match policy {
            ExistencePolicy::Overwrite => {
                match self.store.put(&key, data, WriteCondition::Unconditional).await? {
                    PutOutcome::Written(obj) => obj,
                    PutOutcome::PreconditionFailed => {
                        return Err(GatewayError::Internal(anyhow::anyhow!(
                            "store rejected an unconditional write to {key}"
                        )))
                    }
                }
            }
            ExistencePolicy::Skip => {
                if let Some(existing) = self.store.head(&key).await? {
                    debug!("Skip upload of {}: already present", hash);
                    return Ok(existing);
                }
                match self.store.put(&key, data, WriteCondition::IfAbsent).await? {
                    PutOutcome::Written(obj) => obj,
                    PutOutcome::PreconditionFailed => {
                        // Lost the create race; report whoever won.
                        debug!("Skip upload of {}: lost create race", hash);
                        return self.store.head(&key).await?.ok_or_else(|| {
                            GatewayError::Internal(anyhow::anyhow!(
                                "object {key} vanished after a failed create"
                            ))
                        });
                    }
                }
            }
            ExistencePolicy::Error => {
                if self.store.head(&key).await?.is_some() {
                    return Err(GatewayError::AlreadyExists {
                        hash: hash.to_string(),
                    });
                }
                match self.store.put(&key, data, WriteCondition::IfAbsent).await? {
                    PutOutcome::Written(obj) => obj,
                    PutOutcome::PreconditionFailed => {
                        return Err(GatewayError::AlreadyExists {
                            hash: hash.to_string(),
                        })
                    }
                }
            }
        };

        metrics::counter!(crate::metrics::UPLOADS_TOTAL, "exists" => policy.as_str()).increment(1);
        verify_digest(hash, &stored)?;
        info!("Stored {} ({} bytes, exists={})", hash, stored.size, policy);
        Ok(stored)
    }

    /// Remove the object under `hash`.  Absent objects are not an error.
    pub async fn delete(&self, hash: &ContentHash) -> Result<(), GatewayError> {
        if !hash.is_well_formed() {
            return Ok(());
        }
        self.store.delete(&self.codec.to_key(hash)).await?;
        debug!("Deleted {}", hash);
        Ok(())
    }

    /// Issue a presigned upload authorization for `hash`.
    pub async fn request_upload(
        &self,
        hash: &ContentHash,
        policy: UploadPolicy,
    ) -> Result<UploadAuthorization, GatewayError> {
        self.authorizer.authorize(hash, policy).await
    }
}

/// Compare the digest the store computed with the claimed hash.
fn verify_digest(hash: &ContentHash, stored: &StoredObject) -> Result<(), GatewayError> {
    let actual = stored.md5.as_ref().map(ContentHash::from_digest);
    if actual.as_ref() == Some(hash) {
        return Ok(());
    }
    metrics::counter!(crate::metrics::INTEGRITY_FAILURES_TOTAL).increment(1);
    Err(GatewayError::Integrity {
        expected: hash.to_string(),
        actual: actual.map(|h| h.to_string()).unwrap_or_default(),
    })
}
