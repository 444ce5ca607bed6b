//! Mesh client: one lifecycle state machine over relay, signaling and
//! direct peer links.
//!
//! Architecture:
//! ```text
//!  MeshClient (cloneable handle)
//!      │ Command + oneshot reply              watch<ConnectionStatus>
//!      ▼                                            ▲
//!  ┌──────────────────────── driver task ───────────┴──────────────────┐
//!  │  SyncCore   OfflineQueue   PresenceTracker   MetricsCollector      │
//!  │  Link(relay)   SignalingClient   ConnectionManager   EventHub      │
//!  └────────▲──────────────────▲──────────────────▲─────────────────────┘
//!           └──── DriverEvent inbox: socket frames, peer link events,
//!                 connect results, timers (all generation-tagged)
//! ```
//!
//! Lifecycle:
//! ```text
//! IDLE ─connect()─► INITIALIZING ─core ready─► CONNECTING ─socket open─► HANDSHAKING
//!                         │                       ▲    │                      │ Init
//!                         ▼ core init failed      │    ▼ lost, retries left   ▼
//!                       ERROR ◄── fatal close /   RECONNECTING            SYNCING
//!                               retries exhausted                             │ backlog replayed
//!  DISCONNECTED ◄── disconnect() / lost with auto-reconnect off        ACTIVE ◄┘
//! ```
//!
//! ACTIVE also needs the signaling link: while it retries, a synced client
//! sits in RECONNECTING, moves to CONNECTING on each attempt, and returns
//! to ACTIVE (replaying the queue) once signaling reopens or gives up.
//!
//! Only the driver task touches client state, one event at a time, so no
//! state is shared behind locks. Local writes go through the Sync Core
//! first; the resulting op is sent on the relay when ACTIVE and queued
//! otherwise, and fanned out on every usable direct link.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::{MeshConfig, Topology};
use crate::error::MeshError;
use crate::events::{EventHub, MeshEvent, Subscription};
use crate::metrics::{MeshMetrics, MetricsCollector, PeerMetrics, PeerStatus, RoundResult, RTT_UNKNOWN};
use crate::peer::{ConnectionManager, ManagerOutput, PeerConnector, PeerEvent};
use crate::presence::{PresenceChange, PresenceSource, PresenceTracker};
use crate::protocol::{
    ControlMessage, EncodePool, EphemeralPacket, FrameClass, HlcClock, PresencePacket,
    SignalEnvelope, SignalMessage, WirePacket,
};
use crate::queue::{OfflineQueue, QueueEntry};
use crate::signaling::{SignalingClient, SignalingOutput};
use crate::storage::{restore_queue, QueuePersistence, StorageAdapter};
use crate::sync_core::{LwwMap, SyncCore};
use crate::timer::{self, TimerGuard};
use crate::transport::{
    Connector, Inbound, Link, LinkEvent, LinkId, LinkOutput, LinkSettings, WsConnector,
    HEARTBEAT_REQUEST_ID,
};

/// Externally visible lifecycle state. Exactly one per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Idle,
    /// Loading the Sync Core.
    Initializing,
    Connecting,
    /// Socket open, awaiting the authoritative Init.
    Handshaking,
    /// Applying the snapshot and replaying the backlog.
    Syncing,
    Active,
    Reconnecting,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    /// Settled without a pending reconnect.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// A connection attempt is under way.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Connecting | Self::Handshaking | Self::Syncing | Self::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::Initializing => "INITIALIZING",
            Self::Connecting => "CONNECTING",
            Self::Handshaking => "HANDSHAKING",
            Self::Syncing => "SYNCING",
            Self::Active => "ACTIVE",
            Self::Reconnecting => "RECONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
        })
    }
}

/// One known peer, as reported by [`MeshClient::peers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub user_id: Option<String>,
    pub status: PeerStatus,
    /// From the last metrics round, or [`RTT_UNKNOWN`].
    pub rtt_ms: i64,
    pub last_seen: Instant,
}

// ─── Driver plumbing ──────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect(Reply<Result<(), MeshError>>),
    Ready(Reply<Result<(), MeshError>>),
    Disconnect(Reply<()>),
    Destroy(Reply<()>),
    Write {
        key: String,
        value: Option<Vec<u8>>,
        reply: Reply<Result<(), MeshError>>,
    },
    Get {
        key: String,
        reply: Reply<Option<Vec<u8>>>,
    },
    BroadcastEphemeral {
        payload: Vec<u8>,
        reply: Reply<Result<(), MeshError>>,
    },
    SendToPeer {
        peer_id: String,
        payload: Vec<u8>,
        reply: Reply<Result<(), MeshError>>,
    },
    Topology(Reply<Topology>),
    Peers(Reply<Vec<PeerInfo>>),
    Metrics(Reply<Option<MeshMetrics>>),
    QueueLen(Reply<usize>),
    PendingKeys(Reply<Vec<String>>),
}

enum DriverEvent {
    Link(LinkEvent),
    Peer(PeerEvent),
    MetricsTick,
    PingWindowElapsed(u64),
    QueueRestored(Vec<QueueEntry>),
}

impl From<LinkEvent> for DriverEvent {
    fn from(event: LinkEvent) -> Self {
        Self::Link(event)
    }
}

impl From<PeerEvent> for DriverEvent {
    fn from(event: PeerEvent) -> Self {
        Self::Peer(event)
    }
}

// ─── Public handle ────────────────────────────────────────────────────

/// Handle to a running client. Clones share the same client; the driver
/// stops once every handle is dropped.
#[derive(Clone)]
pub struct MeshClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    hub: EventHub,
    config: Arc<MeshConfig>,
    destroyed: Arc<AtomicBool>,
}

impl MeshClient {
    pub fn builder(config: MeshConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Connect and resolve once ACTIVE. Rejects if the client settles in
    /// ERROR or DISCONNECTED first.
    pub async fn connect(&self) -> Result<(), MeshError> {
        self.request(Command::Connect).await?
    }

    /// Resolve once ACTIVE without starting a connection.
    pub async fn ready(&self) -> Result<(), MeshError> {
        self.request(Command::Ready).await?
    }

    /// Cancel every timer, close every channel, settle in DISCONNECTED.
    pub async fn disconnect(&self) -> Result<(), MeshError> {
        self.request(Command::Disconnect).await
    }

    /// Disconnect, drop all listeners and in-memory state. Terminal.
    pub async fn destroy(&self) -> Result<(), MeshError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Destroy(tx)).is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<(), MeshError> {
        let key = key.into();
        let value = Some(value.into());
        self.request(|reply| Command::Write { key, value, reply }).await?
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<(), MeshError> {
        let key = key.into();
        self.request(|reply| Command::Write {
            key,
            value: None,
            reply,
        })
        .await?
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Vec<u8>>, MeshError> {
        let key = key.into();
        self.request(|reply| Command::Get { key, reply }).await
    }

    /// Best-effort broadcast to every peer. Never queued.
    pub async fn broadcast_ephemeral(&self, payload: impl Into<Vec<u8>>) -> Result<(), MeshError> {
        let payload = payload.into();
        self.request(|reply| Command::BroadcastEphemeral { payload, reply })
            .await?
    }

    /// Best-effort ephemeral message to one peer, direct when possible.
    pub async fn send_to_peer(
        &self,
        peer_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), MeshError> {
        let peer_id = peer_id.into();
        let payload = payload.into();
        self.request(|reply| Command::SendToPeer {
            peer_id,
            payload,
            reply,
        })
        .await?
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub async fn topology(&self) -> Result<Topology, MeshError> {
        self.request(Command::Topology).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, MeshError> {
        self.request(Command::Peers).await
    }

    /// Latest metrics snapshot, if a round has finished.
    pub async fn metrics(&self) -> Result<Option<MeshMetrics>, MeshError> {
        self.request(Command::Metrics).await
    }

    pub async fn queue_len(&self) -> Result<usize, MeshError> {
        self.request(Command::QueueLen).await
    }

    /// Keys of the queued mutations, oldest first.
    pub async fn pending_keys(&self) -> Result<Vec<String>, MeshError> {
        self.request(Command::PendingKeys).await
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(handler)
    }

    pub fn events(&self) -> mpsc::UnboundedReceiver<MeshEvent> {
        self.hub.channel()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, MeshError> {
        if self.is_destroyed() {
            return Err(MeshError::Destroyed);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| MeshError::Destroyed)?;
        rx.await.map_err(|_| MeshError::Destroyed)
    }
}

/// Wires collaborators into a [`MeshClient`].
pub struct ClientBuilder {
    config: MeshConfig,
    core: Option<Box<dyn SyncCore>>,
    connector: Option<Arc<dyn Connector>>,
    signaling_connector: Option<Arc<dyn Connector>>,
    peer_connector: Option<Arc<dyn PeerConnector>>,
    storage: Option<Arc<dyn StorageAdapter>>,
}

impl ClientBuilder {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            core: None,
            connector: None,
            signaling_connector: None,
            peer_connector: None,
            storage: None,
        }
    }

    /// Defaults to [`LwwMap`].
    pub fn sync_core(mut self, core: impl SyncCore) -> Self {
        self.core = Some(Box::new(core));
        self
    }

    /// Relay connector. Defaults to [`WsConnector`].
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Signaling connector. Defaults to the relay connector.
    pub fn signaling_connector(mut self, connector: impl Connector) -> Self {
        self.signaling_connector = Some(Arc::new(connector));
        self
    }

    /// Enables direct links. Required for mesh topology.
    pub fn peer_connector(mut self, connector: impl PeerConnector) -> Self {
        self.peer_connector = Some(Arc::new(connector));
        self
    }

    /// Enables offline queue persistence.
    pub fn storage(mut self, storage: impl StorageAdapter + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Spawn the driver. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<MeshClient, MeshError> {
        if self.config.topology == Topology::Mesh && self.peer_connector.is_none() {
            return Err(MeshError::Configuration(
                "mesh topology requires a peer connector".into(),
            ));
        }
        tokio::runtime::Handle::try_current().map_err(|_| {
            MeshError::Configuration("MeshClient must be built inside a tokio runtime".into())
        })?;
        if self.peer_connector.is_none() && self.config.topology == Topology::Hybrid {
            log::info!("No peer connector configured; hybrid topology runs relay-only");
        }

        let config = Arc::new(self.config);
        let connector = self.connector.unwrap_or_else(|| Arc::new(WsConnector));
        let signaling_connector = self.signaling_connector.unwrap_or_else(|| connector.clone());
        let core = self.core.unwrap_or_else(|| Box::new(LwwMap::new()));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        let hub = EventHub::new();
        let destroyed = Arc::new(AtomicBool::new(false));

        let relay = Link::new(
            LinkId::Relay,
            connector,
            link_settings(&config, config.relay_url()),
            events_tx.clone(),
        );
        let (signaling, peers) = match self.peer_connector {
            Some(peer_connector) => (
                Some(SignalingClient::new(
                    config.peer_id.clone(),
                    config.workspace_id.clone(),
                    signaling_connector,
                    link_settings(&config, config.signaling_url()),
                    events_tx.clone(),
                )),
                Some(ConnectionManager::new(
                    config.peer_id.clone(),
                    peer_connector,
                    config.handshake_timeout,
                    events_tx.clone(),
                )),
            ),
            None => (None, None),
        };

        let persistence = self.storage.map(|storage| {
            let key = config.queue_storage_key();
            let restore_tx = events_tx.clone();
            let restore_storage = storage.clone();
            let restore_key = key.clone();
            tokio::spawn(async move {
                let entries = restore_queue(restore_storage, restore_key).await;
                let _ = restore_tx.send(DriverEvent::QueueRestored(entries));
            });
            QueuePersistence::spawn(storage, key)
        });
        let restored = persistence.is_none();

        let driver = Driver {
            clock: HlcClock::new(&config.peer_id),
            queue: OfflineQueue::new(config.max_queue_size),
            presence: PresenceTracker::new(config.peer_id.clone()),
            topology: config.topology,
            config: config.clone(),
            events_tx,
            status_tx,
            status: ConnectionStatus::Idle,
            hub: hub.clone(),
            core,
            core_initialized: false,
            pool: EncodePool::default(),
            persistence,
            restored,
            relay,
            relay_synced: false,
            signaling,
            signaling_down: false,
            peers,
            metrics: MetricsCollector::new(),
            metrics_timer: None,
            ping_window: None,
            last_metrics: None,
            downgraded: false,
            waiters: Vec::new(),
            last_error: None,
            seq: 0,
        };
        tokio::spawn(driver.run(cmd_rx, events_rx));
        log::info!(
            "Mesh client for workspace {} created (peer {}, topology {})",
            config.workspace_id,
            config.peer_id,
            config.topology
        );

        Ok(MeshClient {
            commands: cmd_tx,
            status: status_rx,
            hub,
            config,
            destroyed,
        })
    }
}

fn link_settings(config: &MeshConfig, url: url::Url) -> LinkSettings {
    LinkSettings {
        url,
        policy: config.reconnect.clone(),
        connect_timeout: config.connection_timeout,
        heartbeat: config.heartbeat_interval,
        debug: config.debug,
    }
}

// ─── Driver ───────────────────────────────────────────────────────────

struct Driver {
    config: Arc<MeshConfig>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    status: ConnectionStatus,
    hub: EventHub,

    core: Box<dyn SyncCore>,
    core_initialized: bool,
    clock: HlcClock,
    pool: EncodePool,
    seq: u64,

    queue: OfflineQueue,
    persistence: Option<QueuePersistence>,
    /// Persisted entries merged in; saving earlier would overwrite them.
    restored: bool,

    relay: Link<DriverEvent>,
    /// Init received on the current relay socket.
    relay_synced: bool,
    signaling: Option<SignalingClient<DriverEvent>>,
    /// Signaling dropped and is retrying; ACTIVE waits for it.
    signaling_down: bool,
    peers: Option<ConnectionManager<DriverEvent>>,
    presence: PresenceTracker,

    topology: Topology,
    downgraded: bool,

    metrics: MetricsCollector,
    metrics_timer: Option<TimerGuard>,
    ping_window: Option<TimerGuard>,
    last_metrics: Option<MeshMetrics>,

    waiters: Vec<Reply<Result<(), MeshError>>>,
    last_error: Option<MeshError>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => {
                        log::debug!("All client handles dropped; shutting down");
                        self.teardown("client dropped");
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
    }

    /// Returns false once the driver should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect(reply) => self.connect(reply),
            Command::Ready(reply) => match self.status {
                ConnectionStatus::Active => {
                    let _ = reply.send(Ok(()));
                }
                ConnectionStatus::Error => {
                    let err = self
                        .last_error
                        .clone()
                        .unwrap_or_else(|| MeshError::terminal("client in error state", None));
                    let _ = reply.send(Err(err));
                }
                _ => self.waiters.push(reply),
            },
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Destroy(reply) => {
                self.destroy();
                let _ = reply.send(());
                return false;
            }
            Command::Write { key, value, reply } => {
                let _ = reply.send(self.local_write(key, value));
            }
            Command::Get { key, reply } => {
                let _ = reply.send(self.core.get(&key));
            }
            Command::BroadcastEphemeral { payload, reply } => {
                let _ = reply.send(self.broadcast_ephemeral(payload));
            }
            Command::SendToPeer {
                peer_id,
                payload,
                reply,
            } => {
                let packet = WirePacket::Ephemeral(EphemeralPacket {
                    from: Some(self.config.peer_id.clone()),
                    payload,
                });
                let _ = reply.send(self.send_to(&peer_id, &packet));
            }
            Command::Topology(reply) => {
                let _ = reply.send(self.topology);
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.peer_infos());
            }
            Command::Metrics(reply) => {
                let _ = reply.send(self.last_metrics.clone());
            }
            Command::QueueLen(reply) => {
                let _ = reply.send(self.queue.len());
            }
            Command::PendingKeys(reply) => {
                let _ = reply.send(self.queue.keys());
            }
        }
        true
    }

    fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Link(ev) => match ev.link {
                LinkId::Relay => {
                    let out = self.relay.handle(ev);
                    self.on_relay(out);
                }
                LinkId::Signaling => {
                    let outs = match self.signaling.as_mut() {
                        Some(signaling) => signaling.handle(ev),
                        None => Vec::new(),
                    };
                    for out in outs {
                        self.on_signaling(out);
                    }
                }
            },
            DriverEvent::Peer(ev) => {
                let outs = match self.peers.as_mut() {
                    Some(peers) => peers.handle_event(ev),
                    None => Vec::new(),
                };
                self.on_manager(outs);
            }
            DriverEvent::MetricsTick => self.start_metrics_round(),
            DriverEvent::PingWindowElapsed(round) => {
                if let Some(result) = self.metrics.expire(round) {
                    self.publish_metrics(result);
                }
            }
            DriverEvent::QueueRestored(entries) => self.on_queue_restored(entries),
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    fn set_status(&mut self, to: ConnectionStatus) {
        let from = self.status;
        if from == to {
            return;
        }
        self.status = to;
        self.status_tx.send_replace(to);
        log::info!("Status {from} → {to}");
        self.hub.emit(MeshEvent::StatusChanged { from, to });
    }

    fn connect(&mut self, reply: Reply<Result<(), MeshError>>) {
        if self.status == ConnectionStatus::Active {
            let _ = reply.send(Ok(()));
            return;
        }
        self.waiters.push(reply);
        if self.status.is_pending() {
            return;
        }

        self.last_error = None;
        self.relay_synced = false;
        self.signaling_down = false;
        self.topology = self.config.topology;
        self.downgraded = false;
        if let Some(peers) = self.peers.as_mut() {
            peers.reset_failures();
        }

        self.set_status(ConnectionStatus::Initializing);
        if !self.core_initialized {
            if let Err(e) = self.core.init() {
                let message = match e {
                    MeshError::SyncCoreInit(message) => message,
                    other => other.to_string(),
                };
                self.fail(MeshError::SyncCoreInit(message));
                return;
            }
            self.core_initialized = true;
        }

        self.set_status(ConnectionStatus::Connecting);
        self.relay.open();
        if let Some(signaling) = self.signaling.as_mut() {
            signaling.connect();
        }
        if !self.config.metrics_interval.is_zero() {
            self.metrics_timer = Some(timer::every(
                self.config.metrics_interval,
                self.events_tx.clone(),
                || DriverEvent::MetricsTick,
            ));
        }
    }

    fn resolve_waiters(&mut self, result: Result<(), MeshError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Close every channel and cancel every timer.
    fn teardown(&mut self, reason: &str) {
        self.relay_synced = false;
        self.signaling_down = false;
        self.metrics_timer = None;
        self.ping_window = None;
        self.metrics.cancel();
        self.relay.close(reason);
        if let Some(signaling) = self.signaling.as_mut() {
            signaling.disconnect();
        }
        let closed = self
            .peers
            .as_mut()
            .map(|peers| peers.close_all())
            .unwrap_or_default();
        for peer_id in closed {
            self.hub.emit(MeshEvent::PeerDisconnected {
                peer_id,
                reason: reason.to_string(),
            });
        }
        for peer_id in self.presence.peer_ids() {
            self.hub.emit(MeshEvent::PeerLeft(peer_id));
        }
        self.presence.clear();
    }

    fn disconnect(&mut self) {
        if self.status == ConnectionStatus::Idle {
            return;
        }
        log::info!("Disconnecting");
        self.teardown("disconnected by client");
        self.set_status(ConnectionStatus::Disconnected);
        self.resolve_waiters(Err(MeshError::terminal("disconnected by client", None)));
    }

    fn destroy(&mut self) {
        log::info!("Destroying mesh client");
        self.teardown("client destroyed");
        self.set_status(ConnectionStatus::Disconnected);
        self.resolve_waiters(Err(MeshError::Destroyed));
        self.hub.clear();
        // Keep what was persisted; only the in-memory copy goes.
        self.persistence = None;
        self.queue.clear();
        self.last_metrics = None;
    }

    /// Terminal failure.
    fn fail(&mut self, error: MeshError) {
        log::error!("Mesh client failed: {error}");
        self.teardown("client error");
        self.last_error = Some(error.clone());
        self.set_status(ConnectionStatus::Error);
        self.hub.emit(MeshEvent::Error(error.clone()));
        self.resolve_waiters(Err(error));
    }

    // ─── Relay ────────────────────────────────────────────────────────

    fn on_relay(&mut self, out: LinkOutput) {
        match out {
            LinkOutput::None => {}
            LinkOutput::Opened => self.set_status(ConnectionStatus::Handshaking),
            LinkOutput::Frame(Inbound::Binary(bytes)) => match crate::protocol::decode(&bytes) {
                Ok(packet) => self.on_packet(packet, None),
                Err(e) => self.on_malformed(e.into()),
            },
            LinkOutput::Frame(Inbound::Text(text)) => match ControlMessage::parse(&text) {
                Ok(packet) => self.on_packet(packet, None),
                Err(e) => self.on_malformed(e.into()),
            },
            LinkOutput::Frame(Inbound::Closed { .. }) => {}
            LinkOutput::Reconnecting { attempt, error, .. } => {
                log::warn!("Relay lost ({error}); reconnect attempt {attempt}");
                self.relay_synced = false;
                self.metrics.cancel();
                self.ping_window = None;
                let dropped = self.presence.drop_source(PresenceSource::Relay);
                self.on_presence_changes(dropped);
                self.set_status(ConnectionStatus::Reconnecting);
            }
            LinkOutput::Retrying => self.set_status(ConnectionStatus::Connecting),
            LinkOutput::Disconnected(error) => {
                log::warn!("Relay lost with auto-reconnect disabled: {error}");
                self.teardown("relay lost");
                self.set_status(ConnectionStatus::Disconnected);
                self.resolve_waiters(Err(error));
            }
            LinkOutput::Failed(error) => self.fail(error),
        }
    }

    fn on_malformed(&mut self, error: MeshError) {
        log::warn!("Dropping inbound message: {error}");
        self.hub.emit(MeshEvent::Error(error));
    }

    /// Route one inbound packet. `origin` is the sending peer for packets
    /// that arrived over a direct link or relay-forwarded signal.
    fn on_packet(&mut self, packet: WirePacket, origin: Option<String>) {
        match packet {
            WirePacket::Init(init) => {
                self.set_status(ConnectionStatus::Syncing);
                match self.core.load_snapshot(&init.snapshot) {
                    Ok(deltas) if !deltas.is_empty() => {
                        self.hub.emit(MeshEvent::RemoteChange { origin, deltas })
                    }
                    Ok(_) => {}
                    Err(e) => self.on_malformed(e),
                }
                self.relay_synced = true;
                self.hub.emit(MeshEvent::Synced);
                if self.signaling_down {
                    log::info!("Relay synced; waiting for signaling to return");
                    self.set_status(ConnectionStatus::Reconnecting);
                    return;
                }
                self.activate();
            }
            WirePacket::Op(ref op) => {
                self.clock.observe(op.timestamp);
                self.merge(&packet, origin);
            }
            WirePacket::CompareAndSwap(ref cas) => {
                self.clock.observe(cas.timestamp);
                self.merge(&packet, origin);
            }
            WirePacket::Sync(_) | WirePacket::Encrypted(_) => self.merge(&packet, origin),
            WirePacket::Ping(ping) => {
                let pong = WirePacket::Pong(ping);
                let result = match &origin {
                    Some(peer_id) => self.send_to(peer_id, &pong),
                    None => self.relay.send(pong.encode()),
                };
                if let Err(e) = result {
                    log::debug!("Could not answer ping: {e}");
                }
            }
            WirePacket::Pong(pong) => {
                if pong.request_id == HEARTBEAT_REQUEST_ID {
                    log::trace!("Heartbeat acknowledged");
                    return;
                }
                let Some(peer_id) = origin else {
                    return;
                };
                if let Some(result) = self.metrics.record_pong(&peer_id, &pong, Instant::now()) {
                    self.publish_metrics(result);
                }
            }
            WirePacket::Signal(env) => self.on_signal(env),
            WirePacket::Presence(p) => self.on_presence(&p),
            WirePacket::Ephemeral(e) => self.hub.emit(MeshEvent::Ephemeral {
                from: e.from.or(origin),
                payload: e.payload,
            }),
            WirePacket::Unknown(body) => {
                log::debug!("Ignoring packet of unknown type ({} bytes)", body.len());
            }
        }
    }

    /// Enter ACTIVE once the relay is synced, replaying anything queued
    /// while the client was not.
    fn activate(&mut self) {
        self.flush_queue();
        self.set_status(ConnectionStatus::Active);
        self.resolve_waiters(Ok(()));
    }

    fn merge(&mut self, packet: &WirePacket, origin: Option<String>) {
        match self.core.merge_remote(packet) {
            Ok(deltas) if !deltas.is_empty() => {
                if self.config.debug {
                    log::debug!("Merged {} remote changes", deltas.len());
                }
                self.hub.emit(MeshEvent::RemoteChange { origin, deltas });
            }
            Ok(_) => {}
            Err(e) => self.on_malformed(e),
        }
    }

    // ─── Local writes and the offline queue ──────────────────────────

    fn local_write(&mut self, key: String, value: Option<Vec<u8>>) -> Result<(), MeshError> {
        if key.is_empty() {
            return Err(MeshError::Configuration("key must not be empty".into()));
        }
        let timestamp = self.clock.now();
        let mut op = self.core.apply_local(&key, value.clone(), timestamp)?;
        self.seq += 1;
        op.actor = Some(self.config.peer_id.clone());
        op.seq = self.seq;
        let packet = WirePacket::Op(op);

        let direct = self.direct_enabled();
        let active = self.status == ConnectionStatus::Active;
        let bytes = self.pool.encode(&packet);

        if direct {
            if let Some(peers) = self.peers.as_mut() {
                peers.broadcast(FrameClass::Packet, bytes);
            }
        }
        if active && self.relay.send(bytes.to_vec()).is_ok() {
            if self.config.debug {
                log::debug!("relay → op '{key}' ({} bytes)", bytes.len());
            }
            return Ok(());
        }
        let entry = QueueEntry {
            key,
            value: value.unwrap_or_default(),
            timestamp,
            packet: bytes.to_vec(),
        };
        self.enqueue(entry);
        Ok(())
    }

    fn enqueue(&mut self, entry: QueueEntry) {
        log::debug!("Queueing op for '{}' while offline", entry.key);
        if let Some(evicted) = self.queue.enqueue(entry) {
            log::warn!("Offline queue full; dropped oldest entry '{}'", evicted.key);
            self.hub.emit(MeshEvent::QueueOverflow {
                dropped_key: evicted.key,
            });
        }
        self.hub.emit(MeshEvent::QueueSizeChanged(self.queue.len()));
        self.persist();
    }

    fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let relay = &self.relay;
        let report = self.queue.flush(|entry| relay.send(entry.packet.clone()));
        log::info!(
            "Replayed {} queued ops ({} requeued)",
            report.sent,
            report.requeued
        );
        self.hub.emit(MeshEvent::QueueSizeChanged(self.queue.len()));
        self.persist();
    }

    fn persist(&self) {
        if !self.restored {
            return;
        }
        if let Some(persistence) = &self.persistence {
            persistence.save(self.queue.entries().cloned().collect());
        }
    }

    fn on_queue_restored(&mut self, entries: Vec<QueueEntry>) {
        let count = entries.len();
        for evicted in self.queue.restore(entries) {
            self.hub.emit(MeshEvent::QueueOverflow {
                dropped_key: evicted.key,
            });
        }
        self.restored = true;
        if count > 0 {
            log::info!("Restored {count} persisted queued ops");
            self.hub.emit(MeshEvent::QueueSizeChanged(self.queue.len()));
        }
        self.persist();
        if self.status == ConnectionStatus::Active {
            self.flush_queue();
        }
    }

    // ─── Ephemeral traffic ────────────────────────────────────────────

    fn broadcast_ephemeral(&mut self, payload: Vec<u8>) -> Result<(), MeshError> {
        let direct = self.direct_enabled();
        let sent = match self.peers.as_mut() {
            Some(peers) if direct => peers.broadcast(FrameClass::Ephemeral, &payload),
            _ => Vec::new(),
        };
        let known = self.presence.len();
        if known > 0 && sent.len() >= known {
            return Ok(());
        }
        let packet = WirePacket::Ephemeral(EphemeralPacket {
            from: Some(self.config.peer_id.clone()),
            payload,
        });
        let bytes = self.pool.encode(&packet).to_vec();
        // Best effort: nothing is queued when the relay is down.
        if let Err(e) = self.relay.send(bytes) {
            log::debug!("Ephemeral broadcast not relayed: {e}");
        }
        Ok(())
    }

    /// Deliver a packet to one peer: direct link if usable, otherwise as a
    /// relay-forwarded signal.
    fn send_to(&mut self, peer_id: &str, packet: &WirePacket) -> Result<(), MeshError> {
        if let Some(peers) = self.peers.as_mut() {
            if peers.is_usable(peer_id) {
                return peers.send_to_peer(peer_id, packet);
            }
        }
        let env = SignalEnvelope::new(
            peer_id,
            self.config.peer_id.as_str(),
            SignalMessage::Relay {
                payload: packet.encode(),
            },
        );
        self.relay.send(WirePacket::Signal(env).encode())
    }

    // ─── Presence and signaling ───────────────────────────────────────

    fn on_presence(&mut self, packet: &PresencePacket) {
        let changes = self.presence.apply(packet);
        self.on_presence_changes(changes);
    }

    fn on_presence_changes(&mut self, changes: Vec<PresenceChange>) {
        let mut joined = Vec::new();
        for change in changes {
            match change {
                PresenceChange::Joined(peer_id) => {
                    self.hub.emit(MeshEvent::PeerJoined(peer_id.clone()));
                    joined.push(peer_id);
                }
                PresenceChange::Left(peer_id) => {
                    if let Some(out) = self
                        .peers
                        .as_mut()
                        .and_then(|peers| peers.close_peer(&peer_id, "peer left"))
                    {
                        self.on_manager(vec![out]);
                    }
                    self.hub.emit(MeshEvent::PeerLeft(peer_id));
                }
                PresenceChange::Updated(peer_id) => {
                    log::trace!("Presence state of {peer_id} updated");
                }
            }
        }
        self.check_topology();
        for peer_id in joined {
            self.maybe_connect(&peer_id);
        }
    }

    fn on_signaling(&mut self, out: SignalingOutput) {
        match out {
            SignalingOutput::Connected => {
                self.hub.emit(MeshEvent::SignalingState { connected: true });
                if std::mem::take(&mut self.signaling_down) && self.relay_synced {
                    log::info!("Signaling restored");
                    self.activate();
                }
                for peer_id in self.presence.peer_ids() {
                    self.maybe_connect(&peer_id);
                }
            }
            SignalingOutput::Retrying => {
                if self.signaling_down && self.relay_synced {
                    self.set_status(ConnectionStatus::Connecting);
                }
            }
            SignalingOutput::Signal(env) => self.on_signal(env),
            SignalingOutput::Presence(p) => self.on_presence(&p),
            SignalingOutput::Sync(bytes) => self.merge(&WirePacket::Sync(bytes), None),
            SignalingOutput::Lost { error, retrying } => {
                log::warn!("Signaling lost (retrying: {retrying}): {error}");
                self.hub.emit(MeshEvent::SignalingState { connected: false });
                self.hub.emit(MeshEvent::Error(error));
                if retrying {
                    self.signaling_down = true;
                    if self.relay_synced {
                        self.metrics.cancel();
                        self.ping_window = None;
                        self.set_status(ConnectionStatus::Reconnecting);
                    }
                } else if std::mem::take(&mut self.signaling_down) && self.relay_synced {
                    // Signaling gave up; signals keep flowing through the relay.
                    self.activate();
                }
            }
        }
    }

    fn on_signal(&mut self, env: SignalEnvelope) {
        let local = self.config.peer_id.as_str();
        if env.from == local || !env.is_for(local) {
            return;
        }
        match env.message {
            SignalMessage::Relay { ref payload } => match crate::protocol::decode(payload) {
                Ok(WirePacket::Signal(_)) => {
                    log::warn!("Dropping nested signal from {}", env.from);
                }
                Ok(inner) => {
                    self.presence.touch(&env.from);
                    self.on_packet(inner, Some(env.from));
                }
                Err(e) => self.on_malformed(e.into()),
            },
            SignalMessage::Join { ref workspace_id } => {
                if workspace_id == &self.config.workspace_id {
                    self.maybe_connect(&env.from);
                }
            }
            SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::Candidate { .. } => {
                if !self.direct_enabled() {
                    log::debug!("Ignoring {} from {}: direct links disabled", env.message.name(), env.from);
                    return;
                }
                let outs = match self.peers.as_mut() {
                    Some(peers) => peers.handle_signal(env),
                    None => Vec::new(),
                };
                self.on_manager(outs);
            }
        }
    }

    fn send_signal(&mut self, env: SignalEnvelope) {
        if let Some(signaling) = self.signaling.as_ref() {
            if signaling.is_connected() {
                if let Err(e) = signaling.send_envelope(env) {
                    log::warn!("{e}");
                }
                return;
            }
        }
        // Fall back to the relay, which forwards addressed signals.
        let kind = env.message.name();
        if let Err(e) = self.relay.send(WirePacket::Signal(env).encode()) {
            log::warn!("Dropping {kind} signal: {e}");
        }
    }

    // ─── Direct links and topology ───────────────────────────────────

    fn direct_enabled(&self) -> bool {
        self.peers.is_some() && self.topology != Topology::Star
    }

    fn maybe_connect(&mut self, peer_id: &str) {
        if !self.direct_enabled() {
            return;
        }
        let Some(peers) = self.peers.as_mut() else {
            return;
        };
        if peers.contains(peer_id) || !peers.should_initiate(peer_id) {
            return;
        }
        if let Err(e) = peers.initiate_connection(peer_id) {
            log::warn!("{e}");
            self.hub.emit(MeshEvent::Error(e));
            self.check_topology();
        }
    }

    fn on_manager(&mut self, outs: Vec<ManagerOutput>) {
        for out in outs {
            match out {
                ManagerOutput::Signal(env) => self.send_signal(env),
                ManagerOutput::Connected(peer_id) => {
                    if let Some(PresenceChange::Joined(id)) =
                        self.presence.join(&peer_id, PresenceSource::Mesh)
                    {
                        self.hub.emit(MeshEvent::PeerJoined(id));
                    }
                    self.hub.emit(MeshEvent::PeerConnected(peer_id));
                }
                ManagerOutput::Disconnected {
                    peer_id,
                    reason,
                    handshake_failed,
                } => {
                    if let Some(PresenceChange::Left(id)) =
                        self.presence.leave(&peer_id, PresenceSource::Mesh)
                    {
                        self.hub.emit(MeshEvent::PeerLeft(id));
                    }
                    if handshake_failed {
                        self.hub.emit(MeshEvent::Error(MeshError::P2PHandshake {
                            peer_id: peer_id.clone(),
                            reason: reason.clone(),
                        }));
                    }
                    self.hub.emit(MeshEvent::PeerDisconnected { peer_id, reason });
                    self.check_topology();
                }
                ManagerOutput::Frame {
                    peer_id,
                    class,
                    payload,
                } => self.on_direct_frame(peer_id, class, payload),
            }
        }
    }

    fn on_direct_frame(&mut self, peer_id: String, class: FrameClass, payload: Vec<u8>) {
        self.presence.touch(&peer_id);
        match class {
            FrameClass::Packet => match crate::protocol::decode(&payload) {
                Ok(packet) => self.on_packet(packet, Some(peer_id)),
                Err(e) => self.on_malformed(e.into()),
            },
            FrameClass::Signal => match SignalEnvelope::decode_body(&payload) {
                Ok(env) => self.on_signal(env),
                Err(e) => self.on_malformed(e.into()),
            },
            FrameClass::Ephemeral => self.hub.emit(MeshEvent::Ephemeral {
                from: Some(peer_id),
                payload,
            }),
            FrameClass::Hello => {}
        }
    }

    /// Fall back to star when the mesh gets too big or keeps failing.
    fn check_topology(&mut self) {
        if self.downgraded || self.topology == Topology::Star {
            return;
        }
        let peer_count = self.presence.len();
        let failures = self.peers.as_ref().map_or(0, |p| p.handshake_failures());
        let reason = if peer_count > self.config.max_direct_peers {
            format!(
                "{peer_count} peers exceed the direct link ceiling of {}",
                self.config.max_direct_peers
            )
        } else if failures >= self.config.direct_failure_threshold {
            format!("{failures} direct link handshakes failed")
        } else {
            return;
        };

        let from = self.topology;
        self.topology = Topology::Star;
        self.downgraded = true;
        log::warn!("Topology {from} → star: {reason}");

        let closed = self
            .peers
            .as_mut()
            .map(|peers| peers.close_all())
            .unwrap_or_default();
        for peer_id in closed {
            if let Some(PresenceChange::Left(id)) = self.presence.leave(&peer_id, PresenceSource::Mesh) {
                self.hub.emit(MeshEvent::PeerLeft(id));
            }
            self.hub.emit(MeshEvent::PeerDisconnected {
                peer_id,
                reason: "topology downgraded to star".into(),
            });
        }
        self.hub.emit(MeshEvent::TopologyChanged {
            from,
            to: Topology::Star,
            reason,
        });
    }

    // ─── Metrics ──────────────────────────────────────────────────────

    fn start_metrics_round(&mut self) {
        if self.status != ConnectionStatus::Active {
            return;
        }
        let peers = self.presence.peer_ids();
        let start = self.metrics.start_round(&peers, Instant::now());
        if let Some(previous) = start.previous {
            self.publish_metrics(previous);
        }
        for (peer_id, ping) in start.pings {
            if let Err(e) = self.send_to(&peer_id, &WirePacket::Ping(ping)) {
                log::debug!("Metrics ping to {peer_id} not sent: {e}");
            }
        }
        match start.done {
            Some(result) => self.publish_metrics(result),
            None => {
                self.ping_window = Some(timer::after(
                    self.config.ping_timeout,
                    self.events_tx.clone(),
                    DriverEvent::PingWindowElapsed(self.metrics.round()),
                ));
            }
        }
    }

    fn publish_metrics(&mut self, result: RoundResult) {
        self.ping_window = None;
        let peers = result
            .rtts
            .into_iter()
            .map(|(peer_id, rtt_ms)| PeerMetrics {
                status: self.peer_status(&peer_id),
                peer_id,
                rtt_ms,
            })
            .collect();
        let metrics = MeshMetrics {
            round: result.round,
            topology: self.topology,
            peers,
        };
        log::debug!(
            "Metrics round {}: {} peers, {} direct, mean rtt {:?} ms",
            metrics.round,
            metrics.peers.len(),
            metrics.direct_count(),
            metrics.mean_rtt_ms()
        );
        self.last_metrics = Some(metrics.clone());
        self.hub.emit(MeshEvent::Metrics(metrics));
    }

    fn peer_status(&self, peer_id: &str) -> PeerStatus {
        match self.peers.as_ref() {
            Some(peers) if peers.is_usable(peer_id) => PeerStatus::Direct,
            Some(peers) if peers.contains(peer_id) => PeerStatus::Connecting,
            _ => PeerStatus::Relay,
        }
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        self.presence
            .peer_ids()
            .into_iter()
            .filter_map(|peer_id| {
                let presence = self.presence.get(&peer_id)?;
                let rtt_ms = self
                    .last_metrics
                    .as_ref()
                    .and_then(|m| m.peer(&peer_id))
                    .map_or(RTT_UNKNOWN, |p| p.rtt_ms);
                Some(PeerInfo {
                    status: self.peer_status(&peer_id),
                    user_id: presence.user_id.clone(),
                    last_seen: presence.last_seen,
                    rtt_ms,
                    peer_id,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::protocol::{InitPacket, OpPacket, PresenceAction};
    use crate::testing::{MemoryConnector, MemoryServer};

    fn config(topology: Topology) -> MeshConfig {
        MeshConfig::builder("ws-test")
            .token("test_token")
            .peer_id("peer-a")
            .topology(topology)
            .heartbeat_interval(Duration::ZERO)
            .metrics_interval(Duration::ZERO)
            .build()
            .unwrap()
    }

    fn client(topology: Topology) -> (MeshClient, MemoryServer) {
        let (connector, server) = MemoryConnector::new();
        let client = MeshClient::builder(config(topology))
            .connector(connector)
            .build()
            .unwrap();
        (client, server)
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Active.to_string(), "ACTIVE");
        assert!(ConnectionStatus::Error.is_terminal());
        assert!(ConnectionStatus::Reconnecting.is_pending());
        assert!(!ConnectionStatus::Idle.is_pending());
    }

    #[tokio::test]
    async fn test_mesh_without_peer_connector_is_rejected() {
        let (connector, _server) = MemoryConnector::new();
        let result = MeshClient::builder(config(Topology::Mesh))
            .connector(connector)
            .build();
        assert!(matches!(result, Err(MeshError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_to_active() {
        let (client, mut server) = client(Topology::Star);
        let mut events = client.events();
        let c = client.clone();
        let connecting = tokio::spawn(async move { c.connect().await });

        let conn = server.accept().await.unwrap();
        conn.send_packet(&WirePacket::Init(InitPacket::default()));
        connecting.await.unwrap().unwrap();
        assert_eq!(client.status(), ConnectionStatus::Active);

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let MeshEvent::StatusChanged { to, .. } = ev {
                seen.push(to);
            }
        }
        assert_eq!(
            seen,
            vec![
                ConnectionStatus::Initializing,
                ConnectionStatus::Connecting,
                ConnectionStatus::Handshaking,
                ConnectionStatus::Syncing,
                ConnectionStatus::Active,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_go_to_relay_when_active() {
        let (client, mut server) = client(Topology::Star);
        let c = client.clone();
        let connecting = tokio::spawn(async move { c.connect().await });
        let mut conn = server.accept().await.unwrap();
        conn.send_packet(&WirePacket::Init(InitPacket::default()));
        connecting.await.unwrap().unwrap();

        client.set("title", b"Hello".to_vec()).await.unwrap();
        let op = conn.recv_op().await.unwrap();
        assert_eq!(op.key, "title");
        assert_eq!(op.value, b"Hello");
        assert_eq!(op.actor.as_deref(), Some("peer-a"));
        assert_eq!(op.seq, 1);
        assert_eq!(client.queue_len().await.unwrap(), 0);
        assert_eq!(client.get("title").await.unwrap(), Some(b"Hello".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_ping_is_answered() {
        let (client, mut server) = client(Topology::Star);
        let c = client.clone();
        let connecting = tokio::spawn(async move { c.connect().await });
        let mut conn = server.accept().await.unwrap();
        conn.send_packet(&WirePacket::Init(InitPacket::default()));
        connecting.await.unwrap().unwrap();

        let ping = crate::protocol::PingPacket { request_id: 9, sent_at: 1 };
        conn.send_packet(&WirePacket::Ping(ping));
        assert_eq!(conn.recv_packet().await, Some(WirePacket::Pong(ping)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_op_emits_change() {
        let (client, mut server) = client(Topology::Star);
        let mut events = client.events();
        let c = client.clone();
        let connecting = tokio::spawn(async move { c.connect().await });
        let conn = server.accept().await.unwrap();
        conn.send_packet(&WirePacket::Init(InitPacket::default()));
        connecting.await.unwrap().unwrap();

        let ts = crate::protocol::HlcTimestamp::new(1, 0, 7);
        conn.send_packet(&WirePacket::Op(OpPacket::set("k", b"v".to_vec(), ts)));
        loop {
            if let Some(MeshEvent::RemoteChange { origin, deltas }) = events.recv().await {
                assert_eq!(origin, None);
                assert_eq!(deltas.len(), 1);
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_dedup_and_ephemeral() {
        let (client, mut server) = client(Topology::Star);
        let mut events = client.events();
        let c = client.clone();
        let connecting = tokio::spawn(async move { c.connect().await });
        let mut conn = server.accept().await.unwrap();
        conn.send_packet(&WirePacket::Init(InitPacket::default()));
        connecting.await.unwrap().unwrap();

        conn.send_packet(&WirePacket::Presence(PresencePacket::new(PresenceAction::Join, "peer-b")));
        conn.send_packet(&WirePacket::Presence(PresencePacket::new(PresenceAction::Join, "peer-b")));
        client.broadcast_ephemeral(b"cursor".to_vec()).await.unwrap();

        match conn.recv_packet().await {
            Some(WirePacket::Ephemeral(e)) => {
                assert_eq!(e.payload, b"cursor");
                assert_eq!(e.from.as_deref(), Some("peer-a"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let peers = client.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status, PeerStatus::Relay);
        assert_eq!(peers[0].rtt_ms, RTT_UNKNOWN);

        let mut joins = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, MeshEvent::PeerJoined(_)) {
                joins += 1;
            }
        }
        assert_eq!(joins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_stops_driver() {
        let (client, mut server) = client(Topology::Star);
        let c = client.clone();
        let connecting = tokio::spawn(async move { c.connect().await });
        let mut conn = server.accept().await.unwrap();
        conn.send_packet(&WirePacket::Init(InitPacket::default()));
        connecting.await.unwrap().unwrap();
        drop(client);
        assert!(matches!(conn.recv().await, Some(crate::transport::Outbound::Close { .. })));
    }
}
