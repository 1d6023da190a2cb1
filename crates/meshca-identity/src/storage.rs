//! Secret storage for CA material and agent credentials.
//!
//! The CA and the agent only need three operations from their storage
//! backend: read a key, durably write a key, and watch a key for changes.
//! [`MemorySecretStore`] backs tests and single-process setups;
//! [`FileSecretStore`] persists one file per key with atomic replacement and
//! polls so that watches also see writes from other processes.

use crate::{Error, Result};
use async_trait::async_trait;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::{Stream, StreamExt};

const EVENT_CAPACITY: usize = 64;

/// A change to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Vec<u8>,
}

/// Stream of changes to a watched key.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// Key/value storage for secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Reads a key. `Ok(None)` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes a key. Returns only once the value is durable.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Streams subsequent writes to `key`. Events may be dropped if the
    /// consumer lags; callers re-read with [`SecretStore::get`] when exact
    /// state matters.
    fn watch(&self, key: &str) -> ChangeStream;
}

fn watch_channel(events: &broadcast::Sender<ChangeEvent>, key: &str) -> ChangeStream {
    let key = key.to_string();
    let stream = BroadcastStream::new(events.subscribe()).filter_map(move |event| match event {
        Ok(event) if event.key == key => Some(event),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "secret store watcher lagged");
            None
        }
    });
    Box::pin(stream)
}

/// In-memory secret store.
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        // No receivers is not an error.
        let _ = self.events.send(ChangeEvent {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    fn watch(&self, key: &str) -> ChangeStream {
        watch_channel(&self.events, key)
    }
}

/// Default interval at which file store watches re-read their key.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Secret store backed by one file per key in a directory.
///
/// Files are named by the SHA-256 of the key, so any key length fits the
/// file system's name limit. Writes go to a uniquely named temporary file
/// that is synced, renamed over the target, and followed by a sync of the
/// directory, so a crash leaves either the old or the new value.
///
/// Watches see writes made through this instance immediately and writes
/// made by other processes sharing the directory within one poll interval.
/// A value may be delivered twice.
pub struct FileSecretStore {
    dir: PathBuf,
    events: broadcast::Sender<ChangeEvent>,
    poll_interval: Duration,
}

impl FileSecretStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("create", &dir, e))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            dir,
            events,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Sets how often watches re-read their key to pick up writes from
    /// other processes.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns the directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }

    fn temp_path_for(&self, key: &str) -> Result<PathBuf> {
        let mut nonce = [0u8; 8];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| Error::Storage("failed to generate temporary file name".to_string()))?;
        Ok(self
            .dir
            .join(format!(".{}.{}.tmp", file_name(key), hex::encode(nonce))))
    }
}

fn file_name(key: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, key.as_bytes()))
}

fn storage_err(op: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Storage(format!("{op} {}: {e}", path.display()))
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(storage_err("read", path, e)),
    }
}

async fn write_synced(path: &Path, value: &[u8]) -> Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(0o600);

    let mut file = opts
        .open(path)
        .await
        .map_err(|e| storage_err("open", path, e))?;
    file.write_all(value)
        .await
        .map_err(|e| storage_err("write", path, e))?;
    file.sync_all()
        .await
        .map_err(|e| storage_err("sync", path, e))
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.path_for(key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.temp_path_for(key)?;

        let written = match write_synced(&tmp, &value).await {
            Ok(()) => tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| storage_err("rename", &path, e)),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        #[cfg(unix)]
        {
            let dir = tokio::fs::File::open(&self.dir)
                .await
                .map_err(|e| storage_err("open", &self.dir, e))?;
            dir.sync_all()
                .await
                .map_err(|e| storage_err("sync", &self.dir, e))?;
        }

        tracing::debug!(key, path = %path.display(), "secret persisted");
        let _ = self.events.send(ChangeEvent {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Must be called from within a tokio runtime; the poller runs as a
    /// task that ends when the returned stream is dropped.
    fn watch(&self, key: &str) -> ChangeStream {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let mut local = self.events.subscribe();
        let path = self.path_for(key);
        let key = key.to_string();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut last = read_optional(&path).await.ok().flatten();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let changed = tokio::select! {
                    _ = tx.closed() => return,
                    event = local.recv() => match event {
                        Ok(event) if event.key == key => Some(event.value),
                        Ok(_) => None,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(key = %key, skipped, "secret store watcher lagged");
                            None
                        }
                        Err(RecvError::Closed) => return,
                    },
                    _ = ticker.tick() => match read_optional(&path).await {
                        Ok(Some(value)) if last.as_ref() != Some(&value) => Some(value),
                        Ok(_) => None,
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "secret store poll failed");
                            None
                        }
                    },
                };
                if let Some(value) = changed {
                    last = Some(value.clone());
                    let event = ChangeEvent {
                        key: key.clone(),
                        value,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_get_put() {
        let store = MemorySecretStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.put("a", b"one".to_vec()).await.unwrap();
        store.put("a", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_watch_filters_by_key() {
        let store = MemorySecretStore::new();
        let mut changes = store.watch("wanted");

        store.put("other", b"x".to_vec()).await.unwrap();
        store.put("wanted", b"y".to_vec()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "wanted");
        assert_eq!(event.value, b"y");
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = "credentials/spiffe://cluster.local/ns/default/sa/web";
        {
            let store = FileSecretStore::open(dir.path()).await.unwrap();
            assert_eq!(store.get(key).await.unwrap(), None);
            store.put(key, b"secret".to_vec()).await.unwrap();
        }

        let reopened = FileSecretStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(key).await.unwrap(), Some(b"secret".to_vec()));

        // Key characters never become path separators.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        store.put("k", b"v".to_vec()).await.unwrap();
        let path = store.path_for("k");
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_file_store_watch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        let mut changes = store.watch("k");
        store.put("k", b"v".to_vec()).await.unwrap();
        let event = changes.next().await.unwrap();
        assert_eq!(event.value, b"v");
    }

    #[tokio::test]
    async fn test_file_store_long_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        let key = format!(
            "credentials/spiffe://cluster.local/ns/{}/sa/{}",
            "a".repeat(253),
            "b".repeat(253)
        );
        store.put(&key, b"v".to_vec()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(b"v".to_vec()));

        let name = store.path_for(&key);
        assert_eq!(name.file_name().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_file_store_concurrent_puts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSecretStore::open(dir.path()).await.unwrap());

        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.put("k", vec![i; 1024]).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let value = store.get("k").await.unwrap().unwrap();
        assert_eq!(value.len(), 1024);
        assert!(value.iter().all(|b| *b == value[0]));
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_watch_sees_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileSecretStore::open(dir.path())
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        let writer = FileSecretStore::open(dir.path()).await.unwrap();
        writer.put("k", b"old".to_vec()).await.unwrap();

        let mut changes = watcher.watch("k");
        // Let the watcher record the current value before it changes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.put("k", b"new".to_vec()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "k");
        assert_eq!(event.value, b"new");
    }
}
