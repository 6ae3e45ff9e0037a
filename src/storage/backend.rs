//! Abstract backing-store trait.
//!
//! The gateway treats the durable blob store as a flat key/value object
//! store.  Every implementation computes the MD5 digest of the bytes it
//! accepts and supports conditional writes natively; those conditional
//! writes, not the gateway's own existence probes, are what make
//! "create at most once" hold under concurrency.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Descriptor of an object held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Full storage key (`objects/<hash>`).
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Time the store accepted the write.
    pub uploaded: DateTime<Utc>,
    /// MD5 digest computed by the store at write time, if it reports one.
    pub md5: Option<[u8; 16]>,
    /// Content type recorded with the object, if any.
    pub content_type: Option<String>,
}

/// An object's descriptor plus its bytes.
#[derive(Debug, Clone)]
pub struct ObjectBody {
    pub object: StoredObject,
    pub data: Bytes,
}

/// Precondition evaluated by the store atomically with the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Always write, replacing any existing object.
    Unconditional,
    /// Write only if no object exists at the key.
    IfAbsent,
    /// Write only if the key is absent or was last written at or before `t`.
    IfUnmodifiedSince(DateTime<Utc>),
}

impl WriteCondition {
    /// Evaluate the condition against the current occupant of a key.
    pub fn permits(&self, existing: Option<&StoredObject>) -> bool {
        match (self, existing) {
            (_, None) => true,
            (WriteCondition::Unconditional, Some(_)) => true,
            (WriteCondition::IfAbsent, Some(_)) => false,
            (WriteCondition::IfUnmodifiedSince(t), Some(obj)) => obj.uploaded <= *t,
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum PutOutcome {
    /// The write was committed; the descriptor is what the store now holds.
    Written(StoredObject),
    /// The write condition did not hold; nothing was written.
    PreconditionFailed,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in ascending key order.
    pub objects: Vec<StoredObject>,
    /// Key to resume after, when more objects remain.
    pub next_start_after: Option<String>,
}

/// Async object-store contract.
pub trait ObjectStore: Send + Sync + 'static {
    /// List up to `max_keys` objects whose key starts with `prefix`,
    /// beginning strictly after `start_after`.
    fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ListPage>> + Send + '_>>;

    /// Fetch the descriptor at `key` without its body.
    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredObject>>> + Send + '_>>;

    /// Fetch the object at `key` with its body.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectBody>>> + Send + '_>>;

    /// Write `data` at `key` if `condition` holds at commit time.
    fn put(
        &self,
        key: &str,
        data: Bytes,
        condition: WriteCondition,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutOutcome>> + Send + '_>>;

    /// Delete the object at `key`.  Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
