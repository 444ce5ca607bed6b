//! Round-based RTT probing.
//!
//! ```text
//! tick ──► start_round(peers) ──► Ping{id, sent_at} to each peer
//!                │
//!                ├── record_pong(peer, id) ... all answered ──► snapshot
//!                └── ping_timeout elapsed ─────────────────────► snapshot
//!                                              unanswered peers: rtt = -1
//! ```
//!
//! The collector does no I/O and reads no clock of its own; the caller
//! passes `now` in, which keeps it deterministic under a paused runtime.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::config::Topology;
use crate::protocol::hlc::wall_clock_ms;
use crate::protocol::PingPacket;
use crate::transport::HEARTBEAT_REQUEST_ID;

/// RTT reported for a peer that did not answer in time.
pub const RTT_UNKNOWN: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Reachable through the relay only.
    Relay,
    /// Direct link handshake in progress.
    Connecting,
    /// Direct link usable.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMetrics {
    pub peer_id: String,
    /// Milliseconds, or [`RTT_UNKNOWN`].
    pub rtt_ms: i64,
    pub status: PeerStatus,
}

/// Snapshot emitted at the end of each round. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMetrics {
    pub round: u64,
    pub topology: Topology,
    pub peers: Vec<PeerMetrics>,
}

impl MeshMetrics {
    pub fn peer(&self, peer_id: &str) -> Option<&PeerMetrics> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    pub fn direct_count(&self) -> usize {
        self.peers.iter().filter(|p| p.status == PeerStatus::Direct).count()
    }

    /// Mean RTT over peers that answered.
    pub fn mean_rtt_ms(&self) -> Option<f64> {
        let known: Vec<i64> = self
            .peers
            .iter()
            .map(|p| p.rtt_ms)
            .filter(|rtt| *rtt >= 0)
            .collect();
        if known.is_empty() {
            None
        } else {
            Some(known.iter().sum::<i64>() as f64 / known.len() as f64)
        }
    }
}

/// Finished round: RTT per peer, `RTT_UNKNOWN` for the silent ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResult {
    pub round: u64,
    pub rtts: BTreeMap<String, i64>,
}

/// Output of [`MetricsCollector::start_round`].
#[derive(Debug)]
pub struct RoundStart {
    /// The round that was still open, finished early.
    pub previous: Option<RoundResult>,
    pub pings: Vec<(String, PingPacket)>,
    /// Set when there was nobody to ping.
    pub done: Option<RoundResult>,
}

struct Outstanding {
    request_id: u32,
    sent: Instant,
}

pub struct MetricsCollector {
    round: u64,
    open: bool,
    next_request_id: u32,
    outstanding: BTreeMap<String, Outstanding>,
    rtts: BTreeMap<String, i64>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            round: 0,
            open: false,
            next_request_id: HEARTBEAT_REQUEST_ID + 1,
            outstanding: BTreeMap::new(),
            rtts: BTreeMap::new(),
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Begin a round. A round still open is finished first, its silent
    /// peers reported as [`RTT_UNKNOWN`]; an empty peer list finishes the
    /// new round immediately.
    pub fn start_round(&mut self, peers: &[String], now: Instant) -> RoundStart {
        let previous = self.open.then(|| self.finish());
        self.round += 1;
        self.open = true;
        self.outstanding.clear();
        self.rtts.clear();

        let sent_at = wall_clock_ms();
        let mut pings = Vec::with_capacity(peers.len());
        for peer in peers {
            let request_id = self.alloc_request_id();
            self.outstanding.insert(
                peer.clone(),
                Outstanding {
                    request_id,
                    sent: now,
                },
            );
            pings.push((peer.clone(), PingPacket { request_id, sent_at }));
        }
        let done = if self.outstanding.is_empty() {
            Some(self.finish())
        } else {
            None
        };
        RoundStart {
            previous,
            pings,
            done,
        }
    }

    /// Record an answer. Returns the round result once every peer answered.
    pub fn record_pong(&mut self, peer_id: &str, pong: &PingPacket, now: Instant) -> Option<RoundResult> {
        let matches = self
            .outstanding
            .get(peer_id)
            .is_some_and(|o| o.request_id == pong.request_id);
        if !self.open || !matches {
            log::trace!("Ignoring late or unknown pong from {peer_id}");
            return None;
        }
        if let Some(o) = self.outstanding.remove(peer_id) {
            let rtt = now.saturating_duration_since(o.sent).as_millis() as i64;
            self.rtts.insert(peer_id.to_string(), rtt);
        }
        if self.outstanding.is_empty() {
            Some(self.finish())
        } else {
            None
        }
    }

    /// The ping window for `round` elapsed.
    pub fn expire(&mut self, round: u64) -> Option<RoundResult> {
        if !self.open || round != self.round {
            return None;
        }
        Some(self.finish())
    }

    /// Abandon the current round without a result.
    pub fn cancel(&mut self) {
        self.open = false;
        self.outstanding.clear();
        self.rtts.clear();
    }

    fn finish(&mut self) -> RoundResult {
        let mut rtts = std::mem::take(&mut self.rtts);
        for (peer, _) in std::mem::take(&mut self.outstanding) {
            rtts.insert(peer, RTT_UNKNOWN);
        }
        self.open = false;
        RoundResult {
            round: self.round,
            rtts,
        }
    }

    fn alloc_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self.next_request_id == HEARTBEAT_REQUEST_ID {
            self.next_request_id = HEARTBEAT_REQUEST_ID + 1;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peers(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_silent_peer_reports_unknown() {
        let mut c = MetricsCollector::new();
        let t0 = Instant::now();
        let RoundStart { pings, done, .. } = c.start_round(&peers(&["a", "b"]), t0);
        assert!(done.is_none());
        assert_eq!(pings.len(), 2);

        let (_, ping_a) = &pings[0];
        assert!(c.record_pong("a", ping_a, t0 + Duration::from_millis(42)).is_none());

        let result = c.expire(c.round()).unwrap();
        assert_eq!(result.rtts["a"], 42);
        assert_eq!(result.rtts["b"], RTT_UNKNOWN);
        assert!(!c.is_open());
        assert!(c.expire(result.round).is_none());
    }

    #[test]
    fn test_round_completes_when_all_answer() {
        let mut c = MetricsCollector::new();
        let t0 = Instant::now();
        let pings = c.start_round(&peers(&["a", "b"]), t0).pings;
        assert!(c.record_pong("b", &pings[1].1, t0 + Duration::from_millis(5)).is_none());
        let result = c.record_pong("a", &pings[0].1, t0 + Duration::from_millis(9)).unwrap();
        assert_eq!(result.rtts["a"], 9);
        assert_eq!(result.rtts["b"], 5);
    }

    #[test]
    fn test_wrong_request_id_or_stale_round_ignored() {
        let mut c = MetricsCollector::new();
        let t0 = Instant::now();
        let first = c.start_round(&peers(&["a"]), t0).pings;
        let second = c.start_round(&peers(&["a"]), t0);
        assert_eq!(second.previous.unwrap().rtts["a"], RTT_UNKNOWN);
        assert!(c.record_pong("a", &first[0].1, t0).is_none());
        assert!(c.expire(1).is_none());
        assert!(c.expire(2).is_some());
    }

    #[test]
    fn test_overlapping_rounds_still_produce_results() {
        // Ticks arriving faster than the ping window: every round must
        // still end in a result.
        let mut c = MetricsCollector::new();
        let t0 = Instant::now();
        let mut results = Vec::new();
        for _ in 0..5 {
            let stale = c.round();
            let start = c.start_round(&peers(&["silent"]), t0);
            results.extend(start.previous);
            assert!(start.done.is_none());
            assert!(c.expire(stale).is_none());
        }
        results.extend(c.expire(c.round()));
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.rtts["silent"] == RTT_UNKNOWN));
        assert_eq!(
            results.iter().map(|r| r.round).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn test_empty_round_finishes_immediately() {
        let mut c = MetricsCollector::new();
        let start = c.start_round(&[], Instant::now());
        assert!(start.pings.is_empty());
        assert!(start.previous.is_none());
        assert!(start.done.unwrap().rtts.is_empty());
    }

    #[test]
    fn test_request_ids_skip_heartbeat() {
        let mut c = MetricsCollector::new();
        c.next_request_id = u32::MAX;
        assert_eq!(c.alloc_request_id(), u32::MAX);
        assert_eq!(c.alloc_request_id(), 1);
    }

    #[test]
    fn test_mean_rtt() {
        let m = MeshMetrics {
            round: 1,
            topology: Topology::Star,
            peers: vec![
                PeerMetrics { peer_id: "a".into(), rtt_ms: 10, status: PeerStatus::Relay },
                PeerMetrics { peer_id: "b".into(), rtt_ms: 30, status: PeerStatus::Direct },
                PeerMetrics { peer_id: "c".into(), rtt_ms: RTT_UNKNOWN, status: PeerStatus::Relay },
            ],
        };
        assert_eq!(m.mean_rtt_ms(), Some(20.0));
        assert_eq!(m.direct_count(), 1);
    }
}
