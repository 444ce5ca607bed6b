//! Seam to the conflict-resolution engine.
//!
//! The client never interprets values. Local writes go through
//! [`SyncCore::apply_local`], which returns the op to put on the wire;
//! inbound packets go through [`SyncCore::merge_remote`], which returns what
//! changed. [`LwwMap`] is the default engine: a last-writer-wins register
//! per key, ordered by HLC timestamp.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::protocol::{HlcTimestamp, OpPacket, WirePacket};

/// One observable change to the shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl Delta {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Conflict-resolution engine consumed by the client.
pub trait SyncCore: Send + 'static {
    /// Called once on the first `connect()`. An error is fatal.
    fn init(&mut self) -> Result<(), MeshError>;

    /// Apply a local write (`None` deletes) and produce the op to send.
    fn apply_local(
        &mut self,
        key: &str,
        value: Option<Vec<u8>>,
        timestamp: HlcTimestamp,
    ) -> Result<OpPacket, MeshError>;

    /// Merge a data-plane packet. Returns the keys whose visible value changed.
    fn merge_remote(&mut self, packet: &WirePacket) -> Result<Vec<Delta>, MeshError>;

    /// Merge an authoritative snapshot.
    fn load_snapshot(&mut self, snapshot: &[u8]) -> Result<Vec<Delta>, MeshError>;

    fn snapshot(&self) -> Vec<u8>;

    fn get(&self, key: &str) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Register {
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
    timestamp: HlcTimestamp,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    key: String,
    value: Option<Vec<u8>>,
    timestamp: u128,
}

/// Last-writer-wins map keyed by string.
#[derive(Debug, Default)]
pub struct LwwMap {
    registers: HashMap<String, Register>,
    initialized: bool,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.registers.values().filter(|r| r.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a write if it is newer than what the key holds.
    fn merge(&mut self, key: &str, value: Option<Vec<u8>>, timestamp: HlcTimestamp) -> Option<Delta> {
        if let Some(current) = self.registers.get(key) {
            if current.timestamp >= timestamp {
                return None;
            }
        }
        let previous = self
            .registers
            .insert(key.to_string(), Register { value: value.clone(), timestamp })
            .and_then(|r| r.value);
        if previous == value {
            return None;
        }
        Some(match value {
            Some(value) => Delta::Set {
                key: key.to_string(),
                value,
            },
            None => Delta::Delete {
                key: key.to_string(),
            },
        })
    }
}

impl SyncCore for LwwMap {
    fn init(&mut self) -> Result<(), MeshError> {
        self.initialized = true;
        Ok(())
    }

    fn apply_local(
        &mut self,
        key: &str,
        value: Option<Vec<u8>>,
        timestamp: HlcTimestamp,
    ) -> Result<OpPacket, MeshError> {
        if key.is_empty() {
            return Err(MeshError::Configuration("key must not be empty".into()));
        }
        self.merge(key, value.clone(), timestamp);
        Ok(match value {
            Some(v) => OpPacket::set(key, v, timestamp),
            None => OpPacket::delete(key, timestamp),
        })
    }

    fn merge_remote(&mut self, packet: &WirePacket) -> Result<Vec<Delta>, MeshError> {
        let deltas = match packet {
            WirePacket::Op(op) => {
                let value = if op.deleted { None } else { Some(op.value.clone()) };
                self.merge(&op.key, value, op.timestamp).into_iter().collect()
            }
            WirePacket::CompareAndSwap(cas) => {
                let current = self.get(&cas.key);
                if current == cas.expected {
                    self.merge(&cas.key, Some(cas.value.clone()), cas.timestamp)
                        .into_iter()
                        .collect()
                } else {
                    log::debug!("CompareAndSwap on '{}' rejected: value changed", cas.key);
                    Vec::new()
                }
            }
            WirePacket::Init(init) => self.load_snapshot(&init.snapshot)?,
            WirePacket::Sync(snapshot) => self.load_snapshot(snapshot)?,
            other => {
                log::debug!("LwwMap ignores {:?} packets", other.msg_type());
                Vec::new()
            }
        };
        Ok(deltas)
    }

    fn load_snapshot(&mut self, snapshot: &[u8]) -> Result<Vec<Delta>, MeshError> {
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }
        let (entries, _): (Vec<SnapshotEntry>, usize) =
            bincode::serde::decode_from_slice(snapshot, bincode::config::standard())
                .map_err(|e| MeshError::Storage(format!("invalid snapshot: {e}")))?;
        Ok(entries
            .into_iter()
            .filter_map(|e| self.merge(&e.key, e.value, HlcTimestamp::from_u128(e.timestamp)))
            .collect())
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut entries: Vec<SnapshotEntry> = self
            .registers
            .iter()
            .map(|(key, r)| SnapshotEntry {
                key: key.clone(),
                value: r.value.clone(),
                timestamp: r.timestamp.to_u128(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        match bincode::serde::encode_to_vec(&entries, bincode::config::standard()) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode snapshot of {} entries: {e}", entries.len());
                Vec::new()
            }
        }
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.registers.get(key).and_then(|r| r.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CompareAndSwapPacket;

    fn ts(physical: u64, node: u64) -> HlcTimestamp {
        HlcTimestamp::new(physical, 0, node)
    }

    #[test]
    fn test_local_write_produces_op() {
        let mut map = LwwMap::new();
        let op = map.apply_local("title", Some(b"A".to_vec()), ts(10, 1)).unwrap();
        assert_eq!(op.key, "title");
        assert!(!op.deleted);
        assert_eq!(map.get("title"), Some(b"A".to_vec()));

        let del = map.apply_local("title", None, ts(11, 1)).unwrap();
        assert!(del.deleted);
        assert_eq!(map.get("title"), None);
    }

    #[test]
    fn test_newer_remote_wins_older_ignored() {
        let mut map = LwwMap::new();
        map.apply_local("k", Some(b"local".to_vec()), ts(10, 1)).unwrap();

        let older = WirePacket::Op(OpPacket::set("k", b"old".to_vec(), ts(5, 2)));
        assert!(map.merge_remote(&older).unwrap().is_empty());

        let newer = WirePacket::Op(OpPacket::set("k", b"new".to_vec(), ts(20, 2)));
        assert_eq!(
            map.merge_remote(&newer).unwrap(),
            vec![Delta::Set { key: "k".into(), value: b"new".to_vec() }]
        );
    }

    #[test]
    fn test_merge_order_independent() {
        let a = WirePacket::Op(OpPacket::set("k", b"a".to_vec(), ts(10, 1)));
        let b = WirePacket::Op(OpPacket::set("k", b"b".to_vec(), ts(10, 2)));
        let mut m1 = LwwMap::new();
        let mut m2 = LwwMap::new();
        m1.merge_remote(&a).unwrap();
        m1.merge_remote(&b).unwrap();
        m2.merge_remote(&b).unwrap();
        m2.merge_remote(&a).unwrap();
        assert_eq!(m1.get("k"), m2.get("k"));
        assert_eq!(m1.get("k"), Some(b"b".to_vec()));
    }

    #[test]
    fn test_duplicate_op_is_idempotent() {
        let mut map = LwwMap::new();
        let op = WirePacket::Op(OpPacket::set("k", b"v".to_vec(), ts(10, 1)));
        assert_eq!(map.merge_remote(&op).unwrap().len(), 1);
        assert!(map.merge_remote(&op).unwrap().is_empty());
    }

    #[test]
    fn test_compare_and_swap() {
        let mut map = LwwMap::new();
        map.apply_local("n", Some(b"1".to_vec()), ts(1, 1)).unwrap();
        let stale = WirePacket::CompareAndSwap(CompareAndSwapPacket {
            key: "n".into(),
            expected: Some(b"0".to_vec()),
            value: b"2".to_vec(),
            timestamp: ts(5, 2),
            seq: 0,
        });
        assert!(map.merge_remote(&stale).unwrap().is_empty());
        let fresh = WirePacket::CompareAndSwap(CompareAndSwapPacket {
            expected: Some(b"1".to_vec()),
            ..match stale {
                WirePacket::CompareAndSwap(c) => c,
                _ => unreachable!(),
            }
        });
        assert_eq!(map.merge_remote(&fresh).unwrap().len(), 1);
        assert_eq!(map.get("n"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_tombstones() {
        let mut map = LwwMap::new();
        map.apply_local("a", Some(b"1".to_vec()), ts(1, 1)).unwrap();
        map.apply_local("b", Some(b"2".to_vec()), ts(2, 1)).unwrap();
        map.apply_local("b", None, ts(3, 1)).unwrap();

        let mut restored = LwwMap::new();
        let deltas = restored.load_snapshot(&map.snapshot()).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(restored.get("a"), Some(b"1".to_vec()));
        // The tombstone still beats an older concurrent write.
        let late = WirePacket::Op(OpPacket::set("b", b"zombie".to_vec(), ts(2, 9)));
        assert!(restored.merge_remote(&late).unwrap().is_empty());
    }

    #[test]
    fn test_empty_snapshot_is_empty_state() {
        let mut map = LwwMap::new();
        assert!(map.load_snapshot(&[]).unwrap().is_empty());
        assert!(map.is_empty());
        assert!(map.load_snapshot(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
