//! In-memory object store.
//!
//! Objects are held in a `tokio::sync::RwLock<BTreeMap<...>>` keyed by
//! storage key, so prefix listings come out in key order.  Conditional
//! writes are evaluated and committed under a single write-lock
//! acquisition, which makes `IfAbsent` a true create-if-absent.
//!
//! A configurable memory limit (`max_size_bytes`) caps total stored bytes.

use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;

use super::backend::{ListPage, ObjectBody, ObjectStore, PutOutcome, StoredObject, WriteCondition};
use crate::hash::md5_digest;

struct Entry {
    object: StoredObject,
    data: Bytes,
}

/// Object store backed by process memory.
pub struct MemoryStore {
    objects: tokio::sync::RwLock<BTreeMap<String, Entry>>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryStore {
    /// Create an empty store holding at most `max_size_bytes` (0 = unlimited).
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            objects: tokio::sync::RwLock::new(BTreeMap::new()),
            max_size_bytes,
        }
    }

    /// True when the store holds no objects.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn check_capacity(
        &self,
        objects: &BTreeMap<String, Entry>,
        key: &str,
        additional: u64,
    ) -> anyhow::Result<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let current: u64 = objects
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, e)| e.object.size)
            .sum();
        if current + additional > self.max_size_bytes {
            anyhow::bail!(
                "Memory limit exceeded: current={current}, additional={additional}, max={}",
                self.max_size_bytes
            );
        }
        Ok(())
    }
}

impl ObjectStore for MemoryStore {
    fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ListPage>> + Send + '_>> {
        let prefix = prefix.to_string();
        let start_after = start_after.map(str::to_string);
        Box::pin(async move {
            if max_keys == 0 {
                return Ok(ListPage::default());
            }
            let objects = self.objects.read().await;
            let lower = match start_after {
                Some(s) if s >= prefix => Bound::Excluded(s),
                _ => Bound::Included(prefix.clone()),
            };
            let mut page: Vec<StoredObject> = objects
                .range((lower, Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(&prefix))
                .take(max_keys + 1)
                .map(|(_, e)| e.object.clone())
                .collect();

            let next_start_after = if page.len() > max_keys {
                page.truncate(max_keys);
                page.last().map(|o| o.key.clone())
            } else {
                None
            };

            Ok(ListPage {
                objects: page,
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
            let objects = self.objects.read().await;
            Ok(objects.get(&key).map(|e| e.object.clone()))
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectBody>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            Ok(objects.get(&key).map(|e| ObjectBody {
                object: e.object.clone(),
                data: e.data.clone(),
            }))
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
            let mut objects = self.objects.write().await;

            if !condition.permits(objects.get(&key).map(|e| &e.object)) {
                return Ok(PutOutcome::PreconditionFailed);
            }

            let size = data.len() as u64;
            self.check_capacity(&objects, &key, size)?;

            let object = StoredObject {
                key: key.clone(),
                size,
                uploaded: Utc::now(),
                md5: Some(md5_digest(&data)),
                content_type: None,
            };
            objects.insert(
                key,
                Entry {
                    object: object.clone(),
                    data,
                },
            );
            Ok(PutOutcome::Written(object))
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.objects.write().await.remove(&key);
            Ok(())
        })
    }
}
