//! Direct peer links and their handshakes.
//!
//! ```text
//!  initiator (lower id)                          responder
//!  ────────────────────                          ─────────
//!  initiate_connection(p)
//!    link.create_offer() ─► LocalOffer ── Offer ──► handle_signal
//!                                                   link.accept_offer()
//!  handle_signal ◄── Answer ── LocalAnswer ◄────────┘
//!    link.accept_answer()
//!  ◄──────────── Candidate / Candidate ────────────►  (buffered until the
//!                                                      remote description)
//!  Open ─► send Hello ─────────────────────────────► Hello received
//!  Hello received ◄───────────────────────────────── Open ─► send Hello
//!  usable once Hello was both sent and received
//! ```
//!
//! The [`ConnectionManager`] exclusively owns one [`PeerLink`] per remote
//! peer; the client only sees [`ManagerOutput`]s and usability checks. A link that does
//! not become usable within the handshake timeout, or reports failure, is
//! torn down and surfaced as [`ManagerOutput::Disconnected`]; it is never a
//! client error.
//!
//! The WebRTC stack itself sits behind [`PeerConnector`]; the manager only
//! moves SDP and candidate strings and frames.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::protocol::{decode_frame, encode_frame, FrameClass, SignalEnvelope, SignalMessage, WirePacket};
use crate::timer::{self, TimerGuard};

/// Candidates buffered per peer until the remote description is applied.
/// The oldest is dropped when full.
const MAX_PENDING_CANDIDATES: usize = 64;

/// One direct data channel, driven by the manager.
///
/// Implementations report progress through the [`PeerEventSink`] they were
/// created with. Methods must not block.
pub trait PeerLink: Send {
    /// Start negotiation as the initiator; the offer arrives as
    /// [`PeerLinkEvent::LocalOffer`].
    fn create_offer(&mut self) -> Result<(), MeshError>;
    /// Apply the remote offer; the answer arrives as
    /// [`PeerLinkEvent::LocalAnswer`].
    fn accept_offer(&mut self, sdp: &str) -> Result<(), MeshError>;
    fn accept_answer(&mut self, sdp: &str) -> Result<(), MeshError>;
    fn add_candidate(&mut self, candidate: &str) -> Result<(), MeshError>;
    fn send(&mut self, frame: Vec<u8>) -> Result<(), MeshError>;
    fn close(&mut self);
}

/// Creates [`PeerLink`]s.
pub trait PeerConnector: Send + Sync + 'static {
    fn create(&self, peer_id: &str, sink: PeerEventSink) -> Result<Box<dyn PeerLink>, MeshError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLinkEvent {
    LocalOffer(String),
    LocalAnswer(String),
    LocalCandidate(String),
    /// Data channel open.
    Open,
    Frame(Vec<u8>),
    Closed(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    Link(PeerLinkEvent),
    HandshakeTimeout,
}

/// A peer link event tagged with the link session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub peer_id: String,
    pub session: u64,
    pub kind: PeerEventKind,
}

type Deliver = Arc<dyn Fn(PeerEvent) -> bool + Send + Sync>;

/// Where a [`PeerLink`] reports its events.
#[derive(Clone)]
pub struct PeerEventSink {
    peer_id: String,
    session: u64,
    deliver: Deliver,
}

impl PeerEventSink {
    pub fn new(peer_id: impl Into<String>, session: u64, deliver: Deliver) -> Self {
        Self {
            peer_id: peer_id.into(),
            session,
            deliver,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Post an event. Returns false once the owner is gone.
    pub fn emit(&self, event: PeerLinkEvent) -> bool {
        (self.deliver)(PeerEvent {
            peer_id: self.peer_id.clone(),
            session: self.session,
            kind: PeerEventKind::Link(event),
        })
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEventSink")
            .field("peer_id", &self.peer_id)
            .field("session", &self.session)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerOutput {
    /// Send this signal to the peer.
    Signal(SignalEnvelope),
    /// Link usable.
    Connected(String),
    Disconnected {
        peer_id: String,
        reason: String,
        /// The link never became usable.
        handshake_failed: bool,
    },
    Frame {
        peer_id: String,
        class: FrameClass,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Negotiating,
    /// Channel open, Hello exchange pending.
    Open,
    Ready,
}

struct PeerRecord {
    session: u64,
    link: Box<dyn PeerLink>,
    role: Role,
    phase: Phase,
    remote_description_set: bool,
    pending_candidates: VecDeque<String>,
    hello_sent: bool,
    hello_received: bool,
    handshake_timer: Option<TimerGuard>,
}

pub struct ConnectionManager<E> {
    local_id: String,
    connector: Arc<dyn PeerConnector>,
    events: mpsc::UnboundedSender<E>,
    handshake_timeout: Duration,
    peers: HashMap<String, PeerRecord>,
    early_candidates: HashMap<String, VecDeque<String>>,
    next_session: u64,
    handshake_failures: u32,
}

impl<E> ConnectionManager<E>
where
    E: From<PeerEvent> + Send + 'static,
{
    pub fn new(
        local_id: impl Into<String>,
        connector: Arc<dyn PeerConnector>,
        handshake_timeout: Duration,
        events: mpsc::UnboundedSender<E>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            connector,
            events,
            handshake_timeout,
            peers: HashMap::new(),
            early_candidates: HashMap::new(),
            next_session: 0,
            handshake_failures: 0,
        }
    }

    /// Glare avoidance: the lower id offers, the higher id answers.
    pub fn should_initiate(&self, remote_id: &str) -> bool {
        self.local_id.as_str() < remote_id
    }

    /// Start a handshake as the initiator. A no-op if a record exists.
    pub fn initiate_connection(&mut self, peer_id: &str) -> Result<(), MeshError> {
        if peer_id == self.local_id || self.peers.contains_key(peer_id) {
            return Ok(());
        }
        self.create_record(peer_id, Role::Initiator)?;
        let result = match self.peers.get_mut(peer_id) {
            Some(record) => record.link.create_offer(),
            None => Ok(()),
        };
        if let Err(e) = result {
            self.teardown(peer_id, &e.to_string(), true);
            return Err(MeshError::P2PHandshake {
                peer_id: peer_id.to_string(),
                reason: e.to_string(),
            });
        }
        log::info!("Offering direct link to {peer_id}");
        Ok(())
    }

    /// Apply a signal from a remote peer.
    pub fn handle_signal(&mut self, env: SignalEnvelope) -> Vec<ManagerOutput> {
        let peer_id = env.from;
        match env.message {
            SignalMessage::Offer { sdp } => self.handle_offer(&peer_id, &sdp),
            SignalMessage::Answer { sdp } => self.handle_answer(&peer_id, &sdp),
            SignalMessage::Candidate { candidate } => self.handle_candidate(&peer_id, candidate),
            SignalMessage::Join { .. } | SignalMessage::Relay { .. } => Vec::new(),
        }
    }

    pub fn handle_offer(&mut self, peer_id: &str, sdp: &str) -> Vec<ManagerOutput> {
        let mut out = Vec::new();
        if let Some(record) = self.peers.get(peer_id) {
            let glare = record.role == Role::Initiator && !record.remote_description_set;
            if glare && self.should_initiate(peer_id) {
                log::debug!("Ignoring colliding offer from {peer_id}; ours takes precedence");
                return out;
            }
            let was_ready = record.phase == Phase::Ready;
            if let Some(o) = self.teardown(peer_id, "replaced by new offer", false) {
                if was_ready {
                    out.push(o);
                }
            }
        }

        if let Err(e) = self.create_record(peer_id, Role::Responder) {
            log::warn!("Cannot create link for {peer_id}: {e}");
            self.handshake_failures += 1;
            return out;
        }
        let result = match self.peers.get_mut(peer_id) {
            Some(record) => {
                let r = record.link.accept_offer(sdp);
                if r.is_ok() {
                    record.remote_description_set = true;
                }
                r
            }
            None => Ok(()),
        };
        match result {
            Ok(()) => self.drain_candidates(peer_id),
            Err(e) => out.extend(self.teardown(peer_id, &format!("bad offer: {e}"), true)),
        }
        out
    }

    pub fn handle_answer(&mut self, peer_id: &str, sdp: &str) -> Vec<ManagerOutput> {
        let result = match self.peers.get_mut(peer_id) {
            Some(record) if record.role == Role::Initiator && !record.remote_description_set => {
                let r = record.link.accept_answer(sdp);
                if r.is_ok() {
                    record.remote_description_set = true;
                }
                r
            }
            _ => {
                log::warn!("Unexpected answer from {peer_id}");
                return Vec::new();
            }
        };
        match result {
            Ok(()) => {
                self.drain_candidates(peer_id);
                Vec::new()
            }
            Err(e) => self
                .teardown(peer_id, &format!("bad answer: {e}"), true)
                .into_iter()
                .collect(),
        }
    }

    pub fn handle_candidate(&mut self, peer_id: &str, candidate: String) -> Vec<ManagerOutput> {
        match self.peers.get_mut(peer_id) {
            Some(record) if record.remote_description_set => {
                if let Err(e) = record.link.add_candidate(&candidate) {
                    log::warn!("Rejected candidate from {peer_id}: {e}");
                }
            }
            Some(record) => buffer_candidate(&mut record.pending_candidates, peer_id, candidate),
            None => {
                let early = self.early_candidates.entry(peer_id.to_string()).or_default();
                buffer_candidate(early, peer_id, candidate);
            }
        }
        Vec::new()
    }

    /// Apply an event posted by a link or its handshake timer.
    pub fn handle_event(&mut self, event: PeerEvent) -> Vec<ManagerOutput> {
        let PeerEvent { peer_id, session, kind } = event;
        let Some(record) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };
        if record.session != session {
            log::trace!("Dropping stale event for {peer_id} (session {session})");
            return Vec::new();
        }
        match kind {
            PeerEventKind::HandshakeTimeout => {
                if record.phase == Phase::Ready {
                    return Vec::new();
                }
                log::warn!("Direct link handshake with {peer_id} timed out");
                self.teardown(&peer_id, "handshake timed out", true)
                    .into_iter()
                    .collect()
            }
            PeerEventKind::Link(PeerLinkEvent::LocalOffer(sdp)) => {
                vec![self.signal(&peer_id, SignalMessage::Offer { sdp })]
            }
            PeerEventKind::Link(PeerLinkEvent::LocalAnswer(sdp)) => {
                vec![self.signal(&peer_id, SignalMessage::Answer { sdp })]
            }
            PeerEventKind::Link(PeerLinkEvent::LocalCandidate(candidate)) => {
                vec![self.signal(&peer_id, SignalMessage::Candidate { candidate })]
            }
            PeerEventKind::Link(PeerLinkEvent::Open) => {
                if record.phase == Phase::Negotiating {
                    record.phase = Phase::Open;
                }
                let hello = encode_frame(FrameClass::Hello, self.local_id.as_bytes());
                match record.link.send(hello) {
                    Ok(()) => record.hello_sent = true,
                    Err(e) => {
                        return self
                            .teardown(&peer_id, &format!("hello failed: {e}"), true)
                            .into_iter()
                            .collect()
                    }
                }
                self.maybe_ready(&peer_id).into_iter().collect()
            }
            PeerEventKind::Link(PeerLinkEvent::Frame(bytes)) => self.on_frame(&peer_id, &bytes),
            PeerEventKind::Link(PeerLinkEvent::Closed(reason)) => {
                log::info!("Direct link to {peer_id} closed: {reason}");
                let failed = record.phase != Phase::Ready;
                self.teardown(&peer_id, &reason, failed).into_iter().collect()
            }
            PeerEventKind::Link(PeerLinkEvent::Failed(reason)) => {
                log::warn!("Direct link to {peer_id} failed: {reason}");
                let failed = record.phase != Phase::Ready;
                self.teardown(&peer_id, &reason, failed).into_iter().collect()
            }
        }
    }

    fn on_frame(&mut self, peer_id: &str, bytes: &[u8]) -> Vec<ManagerOutput> {
        let (class, payload) = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed frame from {peer_id}: {e}");
                return Vec::new();
            }
        };
        let Some(record) = self.peers.get_mut(peer_id) else {
            return Vec::new();
        };
        if class == FrameClass::Hello {
            if payload != peer_id.as_bytes() {
                log::warn!("Hello from {peer_id} carries a different id");
            }
            record.hello_received = true;
            return self.maybe_ready(peer_id).into_iter().collect();
        }
        if record.phase != Phase::Ready {
            log::debug!("Dropping {class:?} frame from {peer_id} before hello");
            return Vec::new();
        }
        vec![ManagerOutput::Frame {
            peer_id: peer_id.to_string(),
            class,
            payload: payload.to_vec(),
        }]
    }

    fn maybe_ready(&mut self, peer_id: &str) -> Option<ManagerOutput> {
        let record = self.peers.get_mut(peer_id)?;
        if record.phase == Phase::Ready || !(record.hello_sent && record.hello_received) {
            return None;
        }
        record.phase = Phase::Ready;
        record.handshake_timer = None;
        log::info!("Direct link to {peer_id} ready");
        Some(ManagerOutput::Connected(peer_id.to_string()))
    }

    /// Frame and send to one usable peer.
    pub fn send_frame(&mut self, peer_id: &str, class: FrameClass, payload: &[u8]) -> Result<(), MeshError> {
        match self.peers.get_mut(peer_id) {
            Some(record) if record.phase == Phase::Ready => record.link.send(encode_frame(class, payload)),
            _ => Err(MeshError::transient(format!("no direct link to {peer_id}"))),
        }
    }

    /// Send a full envelope to one usable peer.
    pub fn send_to_peer(&mut self, peer_id: &str, packet: &WirePacket) -> Result<(), MeshError> {
        self.send_frame(peer_id, FrameClass::Packet, &packet.encode())
    }

    /// Send to every usable peer. Returns the peers that accepted the frame.
    pub fn broadcast(&mut self, class: FrameClass, payload: &[u8]) -> Vec<String> {
        let frame = encode_frame(class, payload);
        let mut sent = Vec::new();
        for (peer_id, record) in self.peers.iter_mut() {
            if record.phase != Phase::Ready {
                continue;
            }
            match record.link.send(frame.clone()) {
                Ok(()) => sent.push(peer_id.clone()),
                Err(e) => log::warn!("Broadcast to {peer_id} failed: {e}"),
            }
        }
        sent.sort();
        sent
    }

    /// Intentionally close one link.
    pub fn close_peer(&mut self, peer_id: &str, reason: &str) -> Option<ManagerOutput> {
        self.early_candidates.remove(peer_id);
        self.teardown(peer_id, reason, false)
    }

    /// Tear down every link. Returns the ids that were open or pending.
    pub fn close_all(&mut self) -> Vec<String> {
        self.early_candidates.clear();
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        for id in &ids {
            self.teardown(id, "closing all links", false);
        }
        ids
    }

    pub fn is_usable(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|r| r.phase == Phase::Ready)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Handshakes that failed since the last reset.
    pub fn handshake_failures(&self) -> u32 {
        self.handshake_failures
    }

    pub fn reset_failures(&mut self) {
        self.handshake_failures = 0;
    }

    fn signal(&self, peer_id: &str, message: SignalMessage) -> ManagerOutput {
        ManagerOutput::Signal(SignalEnvelope::new(peer_id, self.local_id.as_str(), message))
    }

    fn create_record(&mut self, peer_id: &str, role: Role) -> Result<(), MeshError> {
        self.next_session += 1;
        let session = self.next_session;

        let tx = self.events.clone();
        let deliver: Deliver = Arc::new(move |ev: PeerEvent| tx.send(E::from(ev)).is_ok());
        let sink = PeerEventSink::new(peer_id, session, deliver);
        let link = self.connector.create(peer_id, sink)?;

        let handshake_timer = timer::after(
            self.handshake_timeout,
            self.events.clone(),
            E::from(PeerEvent {
                peer_id: peer_id.to_string(),
                session,
                kind: PeerEventKind::HandshakeTimeout,
            }),
        );
        let pending_candidates = self.early_candidates.remove(peer_id).unwrap_or_default();
        self.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                session,
                link,
                role,
                phase: Phase::Negotiating,
                remote_description_set: false,
                pending_candidates,
                hello_sent: false,
                hello_received: false,
                handshake_timer: Some(handshake_timer),
            },
        );
        Ok(())
    }

    fn drain_candidates(&mut self, peer_id: &str) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            for candidate in std::mem::take(&mut record.pending_candidates) {
                if let Err(e) = record.link.add_candidate(&candidate) {
                    log::warn!("Rejected buffered candidate from {peer_id}: {e}");
                }
            }
        }
    }

    /// Remove a record and close its link. `failed` counts the teardown as
    /// a handshake failure when the link never became usable.
    fn teardown(&mut self, peer_id: &str, reason: &str, failed: bool) -> Option<ManagerOutput> {
        let mut record = self.peers.remove(peer_id)?;
        record.link.close();
        let handshake_failed = record.phase != Phase::Ready;
        if failed && handshake_failed {
            self.handshake_failures += 1;
        }
        Some(ManagerOutput::Disconnected {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
            handshake_failed,
        })
    }
}

fn buffer_candidate(buf: &mut VecDeque<String>, peer_id: &str, candidate: String) {
    if buf.len() >= MAX_PENDING_CANDIDATES {
        log::debug!("Candidate buffer for {peer_id} full; dropping oldest");
        buf.pop_front();
    }
    buf.push_back(candidate);
}
