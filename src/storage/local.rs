//! Local filesystem object store.
//!
//! Objects are stored as flat files under a configurable root directory.
//! The storage key is used directly as a relative path (e.g., `objects/<hash>`).
//! Size, digest and upload time are recorded at write time in a JSON sidecar
//! under `.meta/<key>.json`, so `head` and `list` never read object bodies.
//! Files without a sidecar are described from filesystem metadata alone.
//!
//! All writes follow crash-only design: write to temp file, fsync, then
//! rename (unconditional) or hard-link (create-if-absent).  A hard link
//! fails atomically when the target exists, which gives `IfAbsent` the
//! same guarantee as a real object store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::{debug, warn};

use super::backend::{ListPage, ObjectBody, ObjectStore, PutOutcome, StoredObject, WriteCondition};
use crate::hash::md5_digest;

const TMP_DIR: &str = ".tmp";
const META_DIR: &str = ".meta";

/// Per-object metadata persisted next to the data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    size: u64,
    md5: String,
    uploaded: DateTime<Utc>,
}

impl Sidecar {
    fn into_object(self, key: &str) -> StoredObject {
        let mut digest = [0u8; 16];
        let md5 = hex::decode_to_slice(&self.md5, &mut digest)
            .ok()
            .map(|()| digest);
        StoredObject {
            key: key.to_string(),
            size: self.size,
            uploaded: self.uploaded,
            md5,
            content_type: None,
        }
    }
}

/// Stores objects on the local filesystem.
pub struct LocalStore {
    /// Root directory for all stored objects.
    root: PathBuf,
    /// Serializes `IfUnmodifiedSince` check-and-replace within this process.
    replace_lock: tokio::sync::Mutex<()>,
}

impl LocalStore {
    /// Create a new `LocalStore` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        std::fs::create_dir_all(root.join(META_DIR))?;
        Ok(Self {
            root,
            replace_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Resolve a storage key to an absolute file path, rejecting traversal.
    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => anyhow::bail!("Invalid path component in storage key: {key}"),
            }
        }
        Ok(self.root.join(key))
    }

    /// Sidecar path for an already-validated key.
    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(TMP_DIR).join(format!("tmp-{id}"))
    }

    /// Describe the object at `path` without reading its body.
    ///
    /// Prefers the sidecar; falls back to size and mtime with no digest.
    fn describe(&self, key: &str, path: &Path) -> anyhow::Result<Option<StoredObject>> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Some(sidecar) = self.read_sidecar(key)? {
            if sidecar.size == metadata.len() {
                return Ok(Some(sidecar.into_object(key)));
            }
            debug!("Stale sidecar for {}, using file metadata", key);
        }

        Ok(Some(StoredObject {
            key: key.to_string(),
            size: metadata.len(),
            uploaded: DateTime::<Utc>::from(metadata.modified()?),
            md5: None,
            content_type: None,
        }))
    }

    fn read_sidecar(&self, key: &str) -> anyhow::Result<Option<Sidecar>> {
        let raw = match std::fs::read(self.meta_path(key)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(sidecar) => Ok(Some(sidecar)),
            Err(e) => {
                warn!("Ignoring corrupt sidecar for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Atomically replace the sidecar for `key`.
    fn write_sidecar(&self, key: &str, sidecar: &Sidecar) -> anyhow::Result<()> {
        let path = self.meta_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.write_temp(&serde_json::to_vec(sidecar)?)?;
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Write `data` to a fresh temp file and fsync it.
    fn write_temp(&self, data: &[u8]) -> anyhow::Result<PathBuf> {
        let tmp_path = self.temp_path();
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(tmp_path)
    }

    /// Move a temp file into place, removing it if the rename fails.
    fn commit(tmp_path: &Path, final_path: &Path) -> anyhow::Result<()> {
        if let Err(e) = std::fs::rename(tmp_path, final_path) {
            let _ = std::fs::remove_file(tmp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

impl ObjectStore for LocalStore {
    fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ListPage>> + Send + '_>> {
        let prefix = prefix.to_string();
        let start_after = start_after.map(str::to_string);
        Box::pin(async move {
            // Keys are flat within a directory: split "dir/name-prefix".
            let (dir_part, name_prefix) = match prefix.rfind('/') {
                Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
                None => ("", prefix.as_str()),
            };
            let dir = if dir_part.is_empty() {
                self.root.clone()
            } else {
                self.resolve(dir_part)?
            };

            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(ListPage::default())
                }
                Err(e) => return Err(e.into()),
            };

            let mut keys = Vec::new();
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with(name_prefix) {
                    continue;
                }
                let key = if dir_part.is_empty() {
                    name
                } else {
                    format!("{dir_part}/{name}")
                };
                if start_after.as_deref().is_some_and(|s| key.as_str() <= s) {
                    continue;
                }
                keys.push(key);
            }
            keys.sort();

            let more = keys.len() > max_keys;
            keys.truncate(max_keys);

            let mut objects = Vec::with_capacity(keys.len());
            for key in &keys {
                // A concurrent delete between read_dir and here just drops the entry.
                if let Some(object) = self.describe(key, &self.resolve(key)?)? {
                    objects.push(object);
                }
            }

            Ok(ListPage {
                next_start_after: if more { keys.last().cloned() } else { None },
                objects,
            })
        })
    }

    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredObject>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            self.describe(&key, &path)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectBody>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            let Some(mut object) = self.describe(&key, &path)? else {
                return Ok(None);
            };
            let data = match std::fs::read(&path) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if object.md5.is_none() || object.size != data.len() as u64 {
                object.size = data.len() as u64;
                object.md5 = Some(md5_digest(&data));
            }
            Ok(Some(ObjectBody {
                object,
                data: Bytes::from(data),
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
            let final_path = self.resolve(&key)?;
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let sidecar = Sidecar {
                size: data.len() as u64,
                md5: hex::encode(md5_digest(&data)),
                uploaded: Utc::now(),
            };
            let tmp_path = self.write_temp(&data)?;

            match condition {
                WriteCondition::Unconditional => {
                    Self::commit(&tmp_path, &final_path)?;
                }
                WriteCondition::IfAbsent => {
                    let linked = std::fs::hard_link(&tmp_path, &final_path);
                    let _ = std::fs::remove_file(&tmp_path);
                    match linked {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                            debug!("Local put precondition failed (exists): {}", key);
                            return Ok(PutOutcome::PreconditionFailed);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                WriteCondition::IfUnmodifiedSince(_) => {
                    let _guard = self.replace_lock.lock().await;
                    let existing = self.describe(&key, &final_path)?;
                    if !condition.permits(existing.as_ref()) {
                        let _ = std::fs::remove_file(&tmp_path);
                        debug!("Local put precondition failed (modified): {}", key);
                        return Ok(PutOutcome::PreconditionFailed);
                    }
                    Self::commit(&tmp_path, &final_path)?;
                    self.write_sidecar(&key, &sidecar)?;
                    return Ok(PutOutcome::Written(sidecar.into_object(&key)));
                }
            }

            self.write_sidecar(&key, &sidecar)?;
            Ok(PutOutcome::Written(sidecar.into_object(&key)))
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            // Idempotent: a missing file is fine.
            for target in [path, self.meta_path(&key)] {
                match std::fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = LocalStore::new(dir.path()).expect("failed to create store");
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let (_dir, store) = test_store();
        let data = Bytes::from("hello world");
        let outcome = store
            .put("objects/abc", data.clone(), WriteCondition::Unconditional)
            .await
            .unwrap();
        let PutOutcome::Written(obj) = outcome else {
            panic!("expected write");
        };
        assert_eq!(obj.size, 11);
        assert_eq!(obj.md5, Some(md5_digest(b"hello world")));

        let body = store.get("objects/abc").await.unwrap().unwrap();
        assert_eq!(body.data, data);
    }

    #[tokio::test]
    async fn test_if_absent_uses_hard_link() {
        let (_dir, store) = test_store();
        let first = store
            .put("objects/abc", Bytes::from("one"), WriteCondition::IfAbsent)
            .await
            .unwrap();
        assert!(matches!(first, PutOutcome::Written(_)));
        let second = store
            .put("objects/abc", Bytes::from("two"), WriteCondition::IfAbsent)
            .await
            .unwrap();
        assert!(matches!(second, PutOutcome::PreconditionFailed));
        let body = store.get("objects/abc").await.unwrap().unwrap();
        assert_eq!(body.data, Bytes::from("one"));
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let (_dir, store) = test_store();
        store.delete("objects/missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_skips_tmp_and_pages() {
        let (_dir, store) = test_store();
        for key in ["objects/b", "objects/a", "objects/c"] {
            store
                .put(key, Bytes::from("x"), WriteCondition::Unconditional)
                .await
                .unwrap();
        }
        let page = store.list("objects/", None, 2).await.unwrap();
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.clone()).collect();
        assert_eq!(keys, vec!["objects/a", "objects/b"]);
        let page = store
            .list("objects/", page.next_start_after.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(page.objects.len(), 1);
        assert!(page.next_start_after.is_none());
    }

    #[tokio::test]
    async fn test_head_reads_sidecar_not_body() {
        let (dir, store) = test_store();
        store
            .put("objects/abc", Bytes::from("hello"), WriteCondition::Unconditional)
            .await
            .unwrap();
        assert!(dir.path().join(".meta/objects/abc.json").is_file());

        // Same length, different bytes: a body read would change the digest.
        std::fs::write(dir.path().join("objects/abc"), b"HELLO").unwrap();
        let obj = store.head("objects/abc").await.unwrap().unwrap();
        assert_eq!(obj.size, 5);
        assert_eq!(obj.md5, Some(md5_digest(b"hello")));

        let page = store.list("objects/", None, 10).await.unwrap();
        assert_eq!(page.objects[0].md5, Some(md5_digest(b"hello")));
    }

    #[tokio::test]
    async fn test_file_without_sidecar_is_described_from_metadata() {
        let (dir, store) = test_store();
        std::fs::create_dir_all(dir.path().join("objects")).unwrap();
        std::fs::write(dir.path().join("objects/raw"), b"abc").unwrap();

        let obj = store.head("objects/raw").await.unwrap().unwrap();
        assert_eq!(obj.size, 3);
        assert!(obj.md5.is_none());

        let body = store.get("objects/raw").await.unwrap().unwrap();
        assert_eq!(body.object.md5, Some(md5_digest(b"abc")));
    }

    #[tokio::test]
    async fn test_delete_removes_sidecar() {
        let (dir, store) = test_store();
        store
            .put("objects/abc", Bytes::from("x"), WriteCondition::IfAbsent)
            .await
            .unwrap();
        store.delete("objects/abc").await.unwrap();
        assert!(!dir.path().join(".meta/objects/abc.json").exists());
        assert!(store.head("objects/abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_rename_cleans_up_temp_file() {
        let (dir, store) = test_store();
        // A non-empty directory at the target makes the rename fail.
        std::fs::create_dir_all(dir.path().join("objects/abc/inner")).unwrap();

        let result = store
            .put("objects/abc", Bytes::from("x"), WriteCondition::Unconditional)
            .await;
        assert!(result.is_err());
        let leftovers = std::fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_if_unmodified_since_uses_recorded_upload_time() {
        let (_dir, store) = test_store();
        store
            .put("objects/abc", Bytes::from("one"), WriteCondition::Unconditional)
            .await
            .unwrap();
        let past = Utc::now() - chrono::Duration::days(1);
        let outcome = store
            .put(
                "objects/abc",
                Bytes::from("two"),
                WriteCondition::IfUnmodifiedSince(past),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PutOutcome::PreconditionFailed));
        let body = store.get("objects/abc").await.unwrap().unwrap();
        assert_eq!(body.data, Bytes::from("one"));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, store) = test_store();
        assert!(store.head("../etc/passwd").await.is_err());
    }
}
