//! Who is in the workspace.
//!
//! A peer can be known through two sources: relay presence broadcasts and
//! open direct links. The tracker keeps one record per peer id with the set
//! of sources that currently vouch for it, so a peer seen both ways yields
//! one join and one leave.
//!
//! ```text
//! relay join(p) ──┐                       ┌── Joined(p)   first source added
//!                 ├──► sources[p] ────────┤
//! link open(p) ───┘    {relay, mesh}      └── Left(p)     last source removed
//! ```

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::protocol::{PresenceAction, PresencePacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceSource {
    Relay,
    Mesh,
}

impl PresenceSource {
    fn bit(self) -> u8 {
        match self {
            Self::Relay => 0b01,
            Self::Mesh => 0b10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(String),
    Left(String),
    /// Application state changed for an already-known peer.
    Updated(String),
}

#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub user_id: Option<String>,
    pub state: Option<Vec<u8>>,
    pub last_seen: Instant,
    sources: u8,
}

impl PeerPresence {
    pub fn via(&self, source: PresenceSource) -> bool {
        self.sources & source.bit() != 0
    }
}

pub struct PresenceTracker {
    local_id: String,
    peers: BTreeMap<String, PeerPresence>,
}

impl PresenceTracker {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            peers: BTreeMap::new(),
        }
    }

    pub fn join(&mut self, peer_id: &str, source: PresenceSource) -> Option<PresenceChange> {
        if peer_id == self.local_id || peer_id.is_empty() {
            return None;
        }
        let now = Instant::now();
        match self.peers.get_mut(peer_id) {
            Some(p) => {
                p.sources |= source.bit();
                p.last_seen = now;
                None
            }
            None => {
                self.peers.insert(
                    peer_id.to_string(),
                    PeerPresence {
                        user_id: None,
                        state: None,
                        last_seen: now,
                        sources: source.bit(),
                    },
                );
                Some(PresenceChange::Joined(peer_id.to_string()))
            }
        }
    }

    pub fn leave(&mut self, peer_id: &str, source: PresenceSource) -> Option<PresenceChange> {
        let p = self.peers.get_mut(peer_id)?;
        p.sources &= !source.bit();
        if p.sources == 0 {
            self.peers.remove(peer_id);
            Some(PresenceChange::Left(peer_id.to_string()))
        } else {
            None
        }
    }

    /// Refresh `last_seen` for traffic from a known peer.
    pub fn touch(&mut self, peer_id: &str) {
        if let Some(p) = self.peers.get_mut(peer_id) {
            p.last_seen = Instant::now();
        }
    }

    /// Apply a relay presence packet.
    pub fn apply(&mut self, packet: &PresencePacket) -> Vec<PresenceChange> {
        match packet.action {
            PresenceAction::Join | PresenceAction::Update => {
                let mut changes: Vec<PresenceChange> =
                    self.join(&packet.peer_id, PresenceSource::Relay).into_iter().collect();
                if let Some(p) = self.peers.get_mut(&packet.peer_id) {
                    if packet.user_id.is_some() {
                        p.user_id = packet.user_id.clone();
                    }
                    if packet.state.is_some() && p.state != packet.state {
                        p.state = packet.state.clone();
                        if changes.is_empty() {
                            changes.push(PresenceChange::Updated(packet.peer_id.clone()));
                        }
                    }
                }
                changes
            }
            PresenceAction::Leave => self
                .leave(&packet.peer_id, PresenceSource::Relay)
                .into_iter()
                .collect(),
            PresenceAction::Snapshot => self.apply_roster(&packet.peers),
        }
    }

    /// Make the relay source match `roster` exactly.
    pub fn apply_roster(&mut self, roster: &[String]) -> Vec<PresenceChange> {
        let gone: Vec<String> = self
            .peers
            .iter()
            .filter(|(id, p)| p.via(PresenceSource::Relay) && !roster.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();

        let mut changes = Vec::new();
        for id in gone {
            changes.extend(self.leave(&id, PresenceSource::Relay));
        }
        for id in roster {
            changes.extend(self.join(id, PresenceSource::Relay));
        }
        changes
    }

    /// Drop every record sourced from `source`.
    pub fn drop_source(&mut self, source: PresenceSource) -> Vec<PresenceChange> {
        let ids: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.via(source))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| self.leave(id, source)).collect()
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerPresence> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Known peer ids in sorted order.
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
