//! Content-addressed snapshot persistence with remote fallback.

use std::sync::Arc;

use super::{SpaceSnapshot, content_hash};
use crate::error::{EchoError, Result};
use crate::storage::{BoxFuture, Directory};

/// Fetches snapshot blobs that are missing locally.
pub trait RemoteObjectSync: Send + Sync {
    /// Download the blob stored under `key`, or `None` if the remote lacks it.
    fn download<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;
}

/// Stores snapshots in a [`Directory`], one file per content hash.
///
/// # Example
///
/// ```ignore
/// use echo_core::snapshot::SnapshotStore;
/// use echo_core::storage::MemoryDirectory;
///
/// let store = SnapshotStore::new(Arc::new(MemoryDirectory::new()));
/// let key = store.store(&pipeline.snapshot()).await?;
/// let snapshot = store.load(&key).await?.expect("just stored");
/// ```
pub struct SnapshotStore {
    directory: Arc<dyn Directory>,
    remote: Option<Arc<dyn RemoteObjectSync>>,
}

impl SnapshotStore {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            remote: None,
        }
    }

    /// Fall back to `remote` when a snapshot is missing locally.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteObjectSync>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Persist `snapshot` and return its content hash.
    ///
    /// A key already holding a verified copy is left untouched. A copy that
    /// fails verification (torn write, bit rot) is overwritten.
    pub async fn store(&self, snapshot: &SpaceSnapshot) -> Result<String> {
        let bytes = snapshot.encode()?;
        let key = content_hash(&bytes);

        let file = self.directory.get_or_create_file(&key).await?;
        let existing = file.read_all().await?;
        if !existing.is_empty() {
            if content_hash(&existing) == key {
                log::debug!("Snapshot {} already stored", key);
                file.close().await?;
                return Ok(key);
            }
            log::warn!(
                "Stored copy of snapshot {} is corrupt ({} bytes); rewriting",
                key,
                existing.len()
            );
        }

        file.truncate(0).await?;
        file.write(0, &bytes).await?;
        file.close().await?;
        log::info!(
            "Stored snapshot {} for space {} at {} ({} bytes)",
            key,
            snapshot.space_key,
            snapshot.timeframe,
            bytes.len()
        );
        Ok(key)
    }

    /// Load the snapshot stored under `key`.
    ///
    /// Local copies are verified against `key`. A missing or corrupt local
    /// copy is fetched through the remote (if configured), verified, and
    /// persisted before being returned. Looking up a missing key without a
    /// remote creates nothing.
    pub async fn load(&self, key: &str) -> Result<Option<SpaceSnapshot>> {
        let mut corrupt = None;
        if let Some(file) = self.directory.get_file(key).await? {
            let bytes = file.read_all().await?;
            file.close().await?;
            if !bytes.is_empty() {
                let actual = content_hash(&bytes);
                if actual == key {
                    return Ok(Some(SpaceSnapshot::decode(&bytes)?));
                }
                log::warn!("Local copy of snapshot {} is corrupt (hash {})", key, actual);
                corrupt = Some(actual);
            }
        }

        let Some(remote) = &self.remote else {
            return match corrupt {
                Some(actual) => Err(EchoError::CorruptSnapshot {
                    key: key.to_string(),
                    actual,
                }),
                None => Ok(None),
            };
        };

        log::debug!("Snapshot {} not available locally, fetching from remote", key);
        let Some(bytes) = remote.download(key).await? else {
            return match corrupt {
                Some(actual) => Err(EchoError::CorruptSnapshot {
                    key: key.to_string(),
                    actual,
                }),
                None => Ok(None),
            };
        };

        let actual = content_hash(&bytes);
        if actual != key {
            return Err(EchoError::Remote(format!(
                "snapshot {} failed verification (hash {})",
                key, actual
            )));
        }

        let snapshot = SpaceSnapshot::decode(&bytes)?;
        let file = self.directory.get_or_create_file(key).await?;
        file.truncate(0).await?;
        file.write(0, &bytes).await?;
        file.close().await?;
        Ok(Some(snapshot))
    }

    /// Keys of every stored snapshot. Empty files are skipped.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for name in self.directory.list().await? {
            let Some(file) = self.directory.get_file(&name).await? else {
                continue;
            };
            let size = file.stat().await?.size;
            file.close().await?;
            if size > 0 {
                keys.push(name);
            }
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("has_remote", &self.remote.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{PeerId, SpaceKey};
    use crate::storage::MemoryDirectory;
    use crate::timeframe::Timeframe;
    use futures_lite::future::block_on;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockRemote {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        downloads: AtomicUsize,
    }

    impl RemoteObjectSync for MockRemote {
        fn download<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
            Box::pin(async move {
                self.downloads.fetch_add(1, Ordering::SeqCst);
                Ok(self.blobs.lock().unwrap().get(key).cloned())
            })
        }
    }

    fn snapshot() -> SpaceSnapshot {
        let mut timeframe = Timeframe::new();
        timeframe.set(PeerId::from("a"), 0);
        SpaceSnapshot::new(SpaceKey::from("space"), timeframe, Vec::new())
    }

    #[test]
    fn test_store_then_load() {
        block_on(async {
            let store = SnapshotStore::new(Arc::new(MemoryDirectory::new()));
            let key = store.store(&snapshot()).await.unwrap();
            assert_eq!(key, snapshot().content_hash().unwrap());
            assert_eq!(store.load(&key).await.unwrap(), Some(snapshot()));

            // Idempotent
            assert_eq!(store.store(&snapshot()).await.unwrap(), key);
            assert_eq!(store.list().await.unwrap(), vec![key]);
        });
    }

    #[test]
    fn test_missing_without_remote() {
        block_on(async {
            let store = SnapshotStore::new(Arc::new(MemoryDirectory::new()));
            assert_eq!(store.load("deadbeef").await.unwrap(), None);
            // A failed lookup leaves nothing behind
            assert!(store.list().await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_list_skips_empty_files() {
        block_on(async {
            let dir = MemoryDirectory::new();
            dir.get_or_create_file("empty").await.unwrap();
            let store = SnapshotStore::new(Arc::new(dir));
            let key = store.store(&snapshot()).await.unwrap();
            assert_eq!(store.list().await.unwrap(), vec![key]);
        });
    }

    #[test]
    fn test_torn_copy_is_rewritten() {
        block_on(async {
            let dir = MemoryDirectory::new();
            let store = SnapshotStore::new(Arc::new(dir.clone()));
            let bytes = snapshot().encode().unwrap();
            let key = content_hash(&bytes);

            // Half-written file from an interrupted store
            let file = dir.get_or_create_file(&key).await.unwrap();
            file.write(0, &bytes[..bytes.len() / 2]).await.unwrap();
            let err = store.load(&key).await.unwrap_err();
            assert!(matches!(err, EchoError::CorruptSnapshot { .. }));
            assert!(err.is_data_error());

            assert_eq!(store.store(&snapshot()).await.unwrap(), key);
            assert_eq!(store.load(&key).await.unwrap(), Some(snapshot()));
        });
    }

    #[test]
    fn test_corrupt_local_copy_is_repaired_from_remote() {
        block_on(async {
            let bytes = snapshot().encode().unwrap();
            let key = content_hash(&bytes);
            let remote = Arc::new(MockRemote::default());
            remote.blobs.lock().unwrap().insert(key.clone(), bytes.clone());

            let dir = MemoryDirectory::new();
            let mut garbage = bytes.clone();
            garbage.extend_from_slice(b"trailing");
            dir.get_or_create_file(&key)
                .await
                .unwrap()
                .write(0, &garbage)
                .await
                .unwrap();

            let store = SnapshotStore::new(Arc::new(dir.clone()))
                .with_remote(Arc::clone(&remote) as Arc<dyn RemoteObjectSync>);
            assert_eq!(store.load(&key).await.unwrap(), Some(snapshot()));
            let repaired = dir.get_file(&key).await.unwrap().unwrap();
            assert_eq!(repaired.read_all().await.unwrap(), bytes);
        });
    }

    #[test]
    fn test_remote_fallback_persists_locally() {
        block_on(async {
            let bytes = snapshot().encode().unwrap();
            let key = content_hash(&bytes);
            let remote = Arc::new(MockRemote::default());
            remote.blobs.lock().unwrap().insert(key.clone(), bytes);

            let store = SnapshotStore::new(Arc::new(MemoryDirectory::new()))
                .with_remote(Arc::clone(&remote) as Arc<dyn RemoteObjectSync>);

            assert_eq!(store.load(&key).await.unwrap(), Some(snapshot()));
            assert_eq!(store.load(&key).await.unwrap(), Some(snapshot()));
            assert_eq!(remote.downloads.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_remote_blob_with_wrong_hash_is_rejected() {
        block_on(async {
            let remote = Arc::new(MockRemote::default());
            remote
                .blobs
                .lock()
                .unwrap()
                .insert("0000".to_string(), snapshot().encode().unwrap());

            let store = SnapshotStore::new(Arc::new(MemoryDirectory::new()))
                .with_remote(remote as Arc<dyn RemoteObjectSync>);
            let err = store.load("0000").await.unwrap_err();
            assert!(err.is_transient());
        });
    }
}
