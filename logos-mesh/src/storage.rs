//! Swappable key-value storage and offline queue persistence.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  snapshot   ┌──────────────────┐  spawn_blocking  ┌────────────────┐
//! │ MeshClient  │ ──────────► │ QueuePersistence │ ───────────────► │ StorageAdapter │
//! │ (driver)    │  (latest    │ worker task      │                  │ Memory / Rocks │
//! └─────────────┘   wins)     └──────────────────┘                  └────────────────┘
//! ```
//!
//! The queue is stored under `logos-mesh/<workspace>/queue` as LZ4
//! (size-prepended) compressed bincode. Persistence is best-effort: load and
//! save failures are logged and never fail the client.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::MeshError;
use crate::protocol::HlcTimestamp;
use crate::queue::QueueEntry;

/// Layout version of the persisted queue.
const QUEUE_FORMAT_VERSION: u32 = 1;

/// Minimal key-value contract the client persists through.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), MeshError>;
    fn delete(&self, key: &str) -> Result<(), MeshError>;
    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MeshError>;
    fn clear(&self) -> Result<(), MeshError>;
}

impl<T: StorageAdapter + ?Sized> StorageAdapter for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), MeshError> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), MeshError> {
        (**self).delete(key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MeshError> {
        (**self).scan_prefix(prefix)
    }

    fn clear(&self) -> Result<(), MeshError> {
        (**self).clear()
    }
}

// ─── In-memory ────────────────────────────────────────────────────────

/// Process-local storage. Contents vanish with the value.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    map: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> R) -> Result<R, MeshError> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| MeshError::Storage("memory storage lock poisoned".into()))?;
        Ok(f(&mut map))
    }

    pub fn len(&self) -> usize {
        self.with(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageAdapter for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        self.with(|m| m.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), MeshError> {
        self.with(|m| {
            m.insert(key.to_string(), value.to_vec());
        })
    }

    fn delete(&self, key: &str) -> Result<(), MeshError> {
        self.with(|m| {
            m.remove(key);
        })
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MeshError> {
        self.with(|m| {
            m.range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    fn clear(&self) -> Result<(), MeshError> {
        self.with(|m| m.clear())
    }
}

// ─── RocksDB ──────────────────────────────────────────────────────────

/// Durable storage in a RocksDB directory (default column family).
pub struct RocksStorage {
    db: DB,
}

impl From<rocksdb::Error> for MeshError {
    fn from(e: rocksdb::Error) -> Self {
        MeshError::Storage(e.to_string())
    }
}

impl RocksStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_keep_log_file_num(5);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl StorageAdapter for RocksStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), MeshError> {
        Ok(self.db.put(key.as_bytes(), value)?)
    }

    fn delete(&self, key: &str) -> Result<(), MeshError> {
        Ok(self.db.delete(key.as_bytes())?)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MeshError> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| MeshError::Storage(format!("non UTF-8 key: {e}")))?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    fn clear(&self) -> Result<(), MeshError> {
        let mut batch = WriteBatch::default();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete(key);
        }
        Ok(self.db.write(batch)?)
    }
}

// ─── Queue snapshot codec ─────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    value: Vec<u8>,
    timestamp: u128,
    packet: Vec<u8>,
}

pub fn encode_queue(entries: &[QueueEntry]) -> Result<Vec<u8>, MeshError> {
    let persisted = PersistedQueue {
        version: QUEUE_FORMAT_VERSION,
        entries: entries
            .iter()
            .map(|e| PersistedEntry {
                key: e.key.clone(),
                value: e.value.clone(),
                timestamp: e.timestamp.to_u128(),
                packet: e.packet.clone(),
            })
            .collect(),
    };
    let raw = bincode::serde::encode_to_vec(&persisted, bincode::config::standard())
        .map_err(|e| MeshError::Storage(format!("queue serialization failed: {e}")))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub fn decode_queue(bytes: &[u8]) -> Result<Vec<QueueEntry>, MeshError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| MeshError::Storage(format!("queue decompression failed: {e}")))?;
    let (persisted, _): (PersistedQueue, usize) =
        bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| MeshError::Storage(format!("queue deserialization failed: {e}")))?;
    if persisted.version != QUEUE_FORMAT_VERSION {
        return Err(MeshError::Storage(format!(
            "unsupported queue format version {}",
            persisted.version
        )));
    }
    Ok(persisted
        .entries
        .into_iter()
        .map(|e| QueueEntry {
            key: e.key,
            value: e.value,
            timestamp: HlcTimestamp::from_u128(e.timestamp),
            packet: e.packet,
        })
        .collect())
}

/// Read the persisted queue; a missing key is an empty queue.
pub fn load_queue(storage: &dyn StorageAdapter, key: &str) -> Result<Vec<QueueEntry>, MeshError> {
    match storage.get(key)? {
        Some(bytes) => decode_queue(&bytes),
        None => Ok(Vec::new()),
    }
}

/// Write the queue snapshot; an empty queue removes the key.
pub fn save_queue(
    storage: &dyn StorageAdapter,
    key: &str,
    entries: &[QueueEntry],
) -> Result<(), MeshError> {
    if entries.is_empty() {
        storage.delete(key)
    } else {
        storage.set(key, &encode_queue(entries)?)
    }
}

// ─── Background writer ────────────────────────────────────────────────

enum PersistCommand {
    Save(Vec<QueueEntry>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the worker that writes queue snapshots off the driver task.
///
/// Snapshots are coalesced: when several are pending only the newest is
/// written. Dropping the handle stops the worker after pending writes.
pub struct QueuePersistence {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl QueuePersistence {
    pub fn spawn(storage: Arc<dyn StorageAdapter>, key: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(storage, key, rx));
        Self { tx }
    }

    /// Schedule a snapshot write.
    pub fn save(&self, entries: Vec<QueueEntry>) {
        if self.tx.send(PersistCommand::Save(entries)).is_err() {
            log::warn!("Queue persistence worker stopped; snapshot not saved");
        }
    }

    /// Resolve once every snapshot scheduled so far has been written.
    pub async fn flushed(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    async fn run(
        storage: Arc<dyn StorageAdapter>,
        key: String,
        mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    ) {
        while let Some(cmd) = rx.recv().await {
            let mut latest = None;
            let mut waiters = Vec::new();
            match cmd {
                PersistCommand::Save(entries) => latest = Some(entries),
                PersistCommand::Flush(done) => waiters.push(done),
            }
            while let Ok(cmd) = rx.try_recv() {
                match cmd {
                    PersistCommand::Save(entries) => latest = Some(entries),
                    PersistCommand::Flush(done) => waiters.push(done),
                }
            }

            if let Some(entries) = latest {
                let storage = storage.clone();
                let key = key.clone();
                let count = entries.len();
                let result =
                    tokio::task::spawn_blocking(move || save_queue(storage.as_ref(), &key, &entries))
                        .await;
                match result {
                    Ok(Ok(())) => log::trace!("Persisted {count} queued entries"),
                    Ok(Err(e)) => log::warn!("Failed to persist offline queue: {e}"),
                    Err(e) => log::warn!("Queue persistence task failed: {e}"),
                }
            }
            for done in waiters {
                let _ = done.send(());
            }
        }
    }
}

/// Load the persisted queue off the async runtime. Failures are logged and
/// yield an empty queue.
pub async fn restore_queue(storage: Arc<dyn StorageAdapter>, key: String) -> Vec<QueueEntry> {
    let result = tokio::task::spawn_blocking(move || load_queue(storage.as_ref(), &key)).await;
    match result {
        Ok(Ok(entries)) => entries,
        Ok(Err(e)) => {
            log::warn!("Failed to load persisted offline queue: {e}");
            Vec::new()
        }
        Err(e) => {
            log::warn!("Queue restore task failed: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(key: &str, ts: u64) -> QueueEntry {
        QueueEntry {
            key: key.to_string(),
            value: vec![ts as u8],
            timestamp: HlcTimestamp::new(ts, 0, 7),
            packet: vec![1, ts as u8],
        }
    }

    struct FailingStorage;

    impl StorageAdapter for FailingStorage {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, MeshError> {
            Err(MeshError::Storage("disk on fire".into()))
        }
        fn set(&self, _key: &str, _value: &[u8]) -> Result<(), MeshError> {
            Err(MeshError::Storage("disk on fire".into()))
        }
        fn delete(&self, _key: &str) -> Result<(), MeshError> {
            Err(MeshError::Storage("disk on fire".into()))
        }
        fn scan_prefix(&self, _prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MeshError> {
            Err(MeshError::Storage("disk on fire".into()))
        }
        fn clear(&self) -> Result<(), MeshError> {
            Err(MeshError::Storage("disk on fire".into()))
        }
    }

    fn exercise_adapter(storage: &dyn StorageAdapter) {
        storage.set("a/1", b"one").unwrap();
        storage.set("a/2", b"two").unwrap();
        storage.set("b/1", b"other").unwrap();
        assert_eq!(storage.get("a/1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(storage.get("missing").unwrap(), None);

        let scanned = storage.scan_prefix("a/").unwrap();
        assert_eq!(
            scanned,
            vec![("a/1".to_string(), b"one".to_vec()), ("a/2".to_string(), b"two".to_vec())]
        );

        storage.delete("a/1").unwrap();
        assert_eq!(storage.get("a/1").unwrap(), None);

        storage.clear().unwrap();
        assert!(storage.scan_prefix("").unwrap().is_empty());
    }

    #[test]
    fn test_memory_adapter() {
        exercise_adapter(&MemoryStorage::new());
    }

    #[test]
    fn test_rocks_adapter() {
        let dir = TempDir::new().unwrap();
        let storage = RocksStorage::open(dir.path()).unwrap();
        exercise_adapter(&storage);
    }

    #[test]
    fn test_rocks_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let storage = RocksStorage::open(dir.path()).unwrap();
            save_queue(&storage, "logos-mesh/w/queue", &[entry("k", 5)]).unwrap();
        }
        let storage = RocksStorage::open(dir.path()).unwrap();
        let restored = load_queue(&storage, "logos-mesh/w/queue").unwrap();
        assert_eq!(restored, vec![entry("k", 5)]);
    }

    #[test]
    fn test_queue_snapshot_roundtrip() {
        let entries = vec![entry("a", 1), entry("b", 2)];
        assert_eq!(decode_queue(&encode_queue(&entries).unwrap()).unwrap(), entries);
    }

    #[test]
    fn test_corrupt_snapshot_is_error() {
        assert!(matches!(decode_queue(&[1, 2, 3]), Err(MeshError::Storage(_))));
    }

    #[test]
    fn test_empty_queue_deletes_key() {
        let storage = MemoryStorage::new();
        save_queue(&storage, "q", &[entry("a", 1)]).unwrap();
        assert_eq!(storage.len(), 1);
        save_queue(&storage, "q", &[]).unwrap();
        assert!(storage.is_empty());
        assert!(load_queue(&storage, "q").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_writes_latest_snapshot() {
        let storage = MemoryStorage::new();
        let persistence = QueuePersistence::spawn(Arc::new(storage.clone()), "q".into());
        persistence.save(vec![entry("a", 1)]);
        persistence.save(vec![entry("a", 1), entry("b", 2)]);
        persistence.flushed().await;
        let restored = restore_queue(Arc::new(storage), "q".into()).await;
        assert_eq!(restored.len(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_fatal() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(FailingStorage);
        let persistence = QueuePersistence::spawn(storage.clone(), "q".into());
        persistence.save(vec![entry("a", 1)]);
        persistence.flushed().await;
        assert!(restore_queue(storage, "q".into()).await.is_empty());
    }
}
