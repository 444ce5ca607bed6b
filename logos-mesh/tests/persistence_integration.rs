//! Offline queue persistence across client instances.
//!
//! These run on the real clock: persistence goes through blocking storage
//! calls off the driver task.

use std::sync::Arc;
use std::time::Duration;

use logos_mesh::protocol::InitPacket;
use logos_mesh::storage::load_queue;
use logos_mesh::testing::MemoryConnector;
use logos_mesh::{MemoryStorage, MeshClient, MeshConfig, RocksStorage, StorageAdapter, Topology, WirePacket};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

fn config() -> MeshConfig {
    MeshConfig::builder("ws-persist")
        .token("test_token")
        .peer_id("peer-a")
        .topology(Topology::Star)
        .heartbeat_interval(Duration::ZERO)
        .metrics_interval(Duration::ZERO)
        .build()
        .unwrap()
}

/// Poll until `check` holds or a few seconds pass.
async fn eventually<F: FnMut() -> bool>(mut check: F) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_queue_survives_client_restart() {
    let storage = MemoryStorage::new();
    let key = config().queue_storage_key();

    let (connector, _server) = MemoryConnector::new();
    let first = MeshClient::builder(config())
        .connector(connector)
        .storage(storage.clone())
        .build()
        .unwrap();
    first.set("title", b"Draft".to_vec()).await.unwrap();
    first.delete("obsolete").await.unwrap();

    eventually(|| load_queue(&storage, &key).map(|q| q.len() == 2).unwrap_or(false)).await;
    first.destroy().await.unwrap();

    let (connector, mut server) = MemoryConnector::new();
    let second = MeshClient::builder(config())
        .connector(connector)
        .storage(storage.clone())
        .build()
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while second.queue_len().await.unwrap() < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue never restored");
    assert_eq!(second.pending_keys().await.unwrap(), vec!["title", "obsolete"]);

    let c = second.clone();
    let pending = tokio::spawn(async move { c.connect().await });
    let mut conn = server.accept().await.unwrap();
    conn.send_packet(&WirePacket::Init(InitPacket::default()));
    pending.await.unwrap().unwrap();

    let op = conn.recv_op().await.unwrap();
    assert_eq!(op.key, "title");
    assert_eq!(op.value, b"Draft");
    let op = conn.recv_op().await.unwrap();
    assert_eq!(op.key, "obsolete");
    assert!(op.deleted);

    // The replayed queue is persisted empty.
    eventually(|| load_queue(&storage, &key).map(|q| q.is_empty()).unwrap_or(false)).await;
}

#[tokio::test]
async fn test_corrupt_persisted_queue_is_ignored() {
    let storage = MemoryStorage::new();
    let key = config().queue_storage_key();
    storage.set(&key, b"definitely not a queue").unwrap();

    let (connector, _server) = MemoryConnector::new();
    let client = MeshClient::builder(config())
        .connector(connector)
        .storage(storage.clone())
        .build()
        .unwrap();
    client.set("fresh", b"1".to_vec()).await.unwrap();

    eventually(|| {
        load_queue(&storage, &key)
            .map(|q| q.len() == 1 && q[0].key == "fresh")
            .unwrap_or(false)
    })
    .await;
    assert_eq!(client.queue_len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_rocksdb_backed_queue() {
    let dir = TempDir::new().unwrap();
    let key = config().queue_storage_key();
    {
        let storage = Arc::new(RocksStorage::open(dir.path()).unwrap());
        let (connector, _server) = MemoryConnector::new();
        let client = MeshClient::builder(config())
            .connector(connector)
            .storage(storage.clone())
            .build()
            .unwrap();
        client.set("persisted", b"on disk".to_vec()).await.unwrap();
        eventually(|| load_queue(&storage, &key).map(|q| q.len() == 1).unwrap_or(false)).await;
        client.destroy().await.unwrap();
    }

    // Reopen once the persistence worker has released the database lock.
    let storage = timeout(Duration::from_secs(5), async {
        loop {
            match RocksStorage::open(dir.path()) {
                Ok(storage) => return storage,
                Err(_) => sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("database never released");
    let entries = load_queue(&storage, &key).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "persisted");
    assert_eq!(entries[0].value, b"on disk");
}
