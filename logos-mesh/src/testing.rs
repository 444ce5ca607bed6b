//! In-memory doubles for the relay server, the signaling server and peer
//! data channels.
//!
//! ```text
//! MemoryConnector ──connect()──► MemoryServer::accept() ──► MemoryServerConn
//!   (client side)                  (test side)               send_* / recv*
//!
//! MemoryPeerConnector ──create()──► MemoryPeerNetwork::accept() ──► MemoryPeerHandle
//! ```
//!
//! Peer negotiation completes immediately: an offer is produced as soon as
//! it is requested and, depending on [`PeerMode`], the data channel opens
//! right after the remote description is applied. The test plays the
//! remote side of the data channel through the handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use url::Url;

use crate::error::MeshError;
use crate::peer::{PeerConnector, PeerEventSink, PeerLink, PeerLinkEvent};
use crate::protocol::{decode_frame, encode_frame, FrameClass, OpPacket, WirePacket};
use crate::transport::{Connector, Duplex, Inbound, Outbound};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Relay / signaling server ─────────────────────────────────────────

/// How the fake server answers connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    /// Fail immediately with a retryable error.
    Refuse,
    /// Never answer; the client's connection timeout fires.
    Hang,
}

struct ServerShared {
    mode: ConnectMode,
    connects: usize,
}

/// Client half: hand it to the client builder.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Mutex<ServerShared>>,
    accepted: mpsc::UnboundedSender<MemoryServerConn>,
}

/// Test half: accepts the connections the client opens.
pub struct MemoryServer {
    shared: Arc<Mutex<ServerShared>>,
    incoming: mpsc::UnboundedReceiver<MemoryServerConn>,
}

/// Server side of one accepted connection.
pub struct MemoryServerConn {
    url: Url,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryConnector {
    pub fn new() -> (MemoryConnector, MemoryServer) {
        let shared = Arc::new(Mutex::new(ServerShared {
            mode: ConnectMode::Accept,
            connects: 0,
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                shared: shared.clone(),
                accepted: tx,
            },
            MemoryServer {
                shared,
                incoming: rx,
            },
        )
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Duplex, MeshError>> {
        let mode = {
            let mut shared = lock(&self.shared);
            shared.connects += 1;
            shared.mode
        };
        let accepted = self.accepted.clone();
        Box::pin(async move {
            match mode {
                ConnectMode::Accept => {
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    let (in_tx, in_rx) = mpsc::unbounded_channel();
                    let conn = MemoryServerConn {
                        url,
                        to_client: in_tx,
                        from_client: out_rx,
                    };
                    accepted
                        .send(conn)
                        .map_err(|_| MeshError::transient("memory server dropped"))?;
                    Ok(Duplex { tx: out_tx, rx: in_rx })
                }
                ConnectMode::Refuse => Err(MeshError::transient("connection refused")),
                ConnectMode::Hang => futures_util::future::pending().await,
            }
        })
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryServerConn> {
        self.incoming.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryServerConn> {
        self.incoming.try_recv().ok()
    }

    /// Connection attempts so far, accepted or not.
    pub fn connect_count(&self) -> usize {
        lock(&self.shared).connects
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        lock(&self.shared).mode = mode;
    }
}

impl MemoryServerConn {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.to_client.send(Inbound::Binary(bytes));
    }

    pub fn send_packet(&self, packet: &WirePacket) {
        self.send_binary(packet.encode());
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(Inbound::Text(text.to_string()));
    }

    /// Close from the server side. `None` simulates a drop without a
    /// close frame.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        let _ = self.to_client.send(Inbound::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.from_client.recv().await
    }

    /// Next binary frame the client sent, decoded. Text frames are skipped.
    pub async fn recv_packet(&mut self) -> Option<WirePacket> {
        loop {
            match self.recv().await? {
                Outbound::Binary(bytes) => match crate::protocol::decode(&bytes) {
                    Ok(packet) => return Some(packet),
                    Err(e) => log::warn!("memory server got undecodable frame: {e}"),
                },
                Outbound::Text(_) => {}
                Outbound::Close { .. } => return None,
            }
        }
    }

    /// Next Op the client sent, skipping heartbeats and control traffic.
    pub async fn recv_op(&mut self) -> Option<OpPacket> {
        loop {
            if let WirePacket::Op(op) = self.recv_packet().await? {
                return Some(op);
            }
        }
    }
}

// ─── Peer data channels ───────────────────────────────────────────────

/// How a fake peer link behaves once its remote description is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Data channel opens.
    Open,
    /// Negotiation fails.
    Fail,
    /// Nothing happens; the handshake times out.
    Silent,
}

struct PeerNetShared {
    default_mode: PeerMode,
    modes: HashMap<String, PeerMode>,
    created: usize,
}

#[derive(Default)]
struct LinkShared {
    candidates: Vec<String>,
    closed: bool,
}

#[derive(Clone)]
pub struct MemoryPeerConnector {
    shared: Arc<Mutex<PeerNetShared>>,
    handles: mpsc::UnboundedSender<MemoryPeerHandle>,
}

pub struct MemoryPeerNetwork {
    shared: Arc<Mutex<PeerNetShared>>,
    incoming: mpsc::UnboundedReceiver<MemoryPeerHandle>,
}

struct MemoryPeerLink {
    sink: PeerEventSink,
    mode: PeerMode,
    sent: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<Mutex<LinkShared>>,
}

/// Remote end of one fake data channel.
pub struct MemoryPeerHandle {
    peer_id: String,
    sink: PeerEventSink,
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<Mutex<LinkShared>>,
}

impl MemoryPeerConnector {
    pub fn new() -> (MemoryPeerConnector, MemoryPeerNetwork) {
        let shared = Arc::new(Mutex::new(PeerNetShared {
            default_mode: PeerMode::Open,
            modes: HashMap::new(),
            created: 0,
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryPeerConnector {
                shared: shared.clone(),
                handles: tx,
            },
            MemoryPeerNetwork {
                shared,
                incoming: rx,
            },
        )
    }
}

impl PeerConnector for MemoryPeerConnector {
    fn create(&self, peer_id: &str, sink: PeerEventSink) -> Result<Box<dyn PeerLink>, MeshError> {
        let mode = {
            let mut shared = lock(&self.shared);
            shared.created += 1;
            shared
                .modes
                .get(peer_id)
                .copied()
                .unwrap_or(shared.default_mode)
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(LinkShared::default()));
        let handle = MemoryPeerHandle {
            peer_id: peer_id.to_string(),
            sink: sink.clone(),
            sent: rx,
            state: state.clone(),
        };
        self.handles
            .send(handle)
            .map_err(|_| MeshError::P2PHandshake {
                peer_id: peer_id.to_string(),
                reason: "memory network dropped".into(),
            })?;
        Ok(Box::new(MemoryPeerLink {
            sink,
            mode,
            sent: tx,
            state,
        }))
    }
}

impl MemoryPeerLink {
    fn settle(&self) {
        match self.mode {
            PeerMode::Open => {
                self.sink.emit(PeerLinkEvent::Open);
            }
            PeerMode::Fail => {
                self.sink.emit(PeerLinkEvent::Failed("ICE negotiation failed".into()));
            }
            PeerMode::Silent => {}
        }
    }

    fn ensure_open(&self) -> Result<(), MeshError> {
        if lock(&self.state).closed {
            Err(MeshError::P2PHandshake {
                peer_id: self.sink.peer_id().to_string(),
                reason: "link closed".into(),
            })
        } else {
            Ok(())
        }
    }
}

impl PeerLink for MemoryPeerLink {
    fn create_offer(&mut self) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.sink
            .emit(PeerLinkEvent::LocalOffer(format!("offer:{}", self.sink.peer_id())));
        Ok(())
    }

    fn accept_offer(&mut self, _sdp: &str) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.sink
            .emit(PeerLinkEvent::LocalAnswer(format!("answer:{}", self.sink.peer_id())));
        self.settle();
        Ok(())
    }

    fn accept_answer(&mut self, _sdp: &str) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.settle();
        Ok(())
    }

    fn add_candidate(&mut self, candidate: &str) -> Result<(), MeshError> {
        self.ensure_open()?;
        lock(&self.state).candidates.push(candidate.to_string());
        Ok(())
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.sent
            .send(frame)
            .map_err(|_| MeshError::transient("peer handle dropped"))
    }

    fn close(&mut self) {
        lock(&self.state).closed = true;
    }
}

impl MemoryPeerNetwork {
    pub async fn accept(&mut self) -> Option<MemoryPeerHandle> {
        self.incoming.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeerHandle> {
        self.incoming.try_recv().ok()
    }

    pub fn set_mode(&self, peer_id: &str, mode: PeerMode) {
        lock(&self.shared).modes.insert(peer_id.to_string(), mode);
    }

    pub fn set_default_mode(&self, mode: PeerMode) {
        lock(&self.shared).default_mode = mode;
    }

    /// Links created so far.
    pub fn created_count(&self) -> usize {
        lock(&self.shared).created
    }
}

impl MemoryPeerHandle {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Complete the readiness handshake from the remote side.
    pub fn hello(&self) {
        self.deliver(FrameClass::Hello, self.peer_id.as_bytes());
    }

    pub fn deliver(&self, class: FrameClass, payload: &[u8]) {
        self.sink.emit(PeerLinkEvent::Frame(encode_frame(class, payload)));
    }

    pub fn deliver_packet(&self, packet: &WirePacket) {
        self.deliver(FrameClass::Packet, &packet.encode());
    }

    pub fn open(&self) {
        self.sink.emit(PeerLinkEvent::Open);
    }

    pub fn close(&self, reason: &str) {
        self.sink.emit(PeerLinkEvent::Closed(reason.to_string()));
    }

    /// Next frame the local side sent on this channel.
    pub async fn recv(&mut self) -> Option<(FrameClass, Vec<u8>)> {
        loop {
            let bytes = self.sent.recv().await?;
            match decode_frame(&bytes) {
                Ok((class, payload)) => return Some((class, payload.to_vec())),
                Err(e) => log::warn!("memory peer got malformed frame: {e}"),
            }
        }
    }

    /// Next full envelope, skipping fast-path frames.
    pub async fn recv_packet(&mut self) -> Option<WirePacket> {
        loop {
            let (class, payload) = self.recv().await?;
            if class != FrameClass::Packet {
                continue;
            }
            match crate::protocol::decode(&payload) {
                Ok(packet) => return Some(packet),
                Err(e) => log::warn!("memory peer got undecodable packet: {e}"),
            }
        }
    }

    pub fn candidates(&self) -> Vec<String> {
        lock(&self.state).candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}
