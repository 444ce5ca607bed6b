//! Duplex byte-stream transport and the reconnecting link state machine.
//!
//! ```text
//!            open()                 socket open                 close frame / error
//!   Idle ───────────► Connecting ─────────────────► Open ───────────────────────────┐
//!                      │   ▲  │ timeout / refused      │ heartbeat: Ping(0) every    │
//!                      │   │  ▼                        │ interval while open         │
//!                      │  Backoff ◄────────────────────┼─────── retries left ◄──────┤
//!                      │   min(max, base·growth^n) ±jitter                           │
//!                      ▼                                                             ▼
//!                   Failed  ◄──── retries exhausted / close code 4000..=4099 ────────┘
//! ```
//!
//! A [`Link`] is plain state owned by the client driver. Everything
//! asynchronous it starts (connect attempt, frame pump, timers) posts a
//! [`LinkEvent`] back into the driver inbox, stamped with the link
//! generation so that events from a superseded attempt are ignored.
//!
//! The [`Connector`] seam lets the same machine run over a real WebSocket
//! ([`WsConnector`]) or an in-memory pair ([`crate::testing::MemoryConnector`]).

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::ReconnectPolicy;
use crate::error::MeshError;
use crate::protocol::hlc::wall_clock_ms;
use crate::protocol::{PingPacket, WirePacket};
use crate::timer::{self, TimerGuard};

/// Close codes the server uses for "rejected, do not reconnect".
pub const FATAL_CLOSE_CODES: RangeInclusive<u16> = 4000..=4099;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Request id reserved for the relay heartbeat.
pub const HEARTBEAT_REQUEST_ID: u32 = 0;

pub fn is_fatal_close(code: Option<u16>) -> bool {
    code.is_some_and(|c| FATAL_CLOSE_CODES.contains(&c))
}

/// Frame received from the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Binary(Vec<u8>),
    Text(String),
    /// The stream ended. `code` is absent when no close frame arrived.
    Closed { code: Option<u16>, reason: String },
}

/// Frame to send to the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Text(String),
    Close { code: u16, reason: String },
}

/// An open connection: a sender for outbound frames and a receiver of
/// inbound ones, in order.
#[derive(Debug)]
pub struct Duplex {
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub rx: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens duplex connections.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Duplex, MeshError>>;
}

// ─── WebSocket connector ──────────────────────────────────────────────

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Duplex, MeshError>> {
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| MeshError::transient(format!("WebSocket connect failed: {e}")))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

            // Writer task: forward outbound frames to the socket.
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let (msg, last) = match frame {
                        Outbound::Binary(data) => (Message::Binary(data.into()), false),
                        Outbound::Text(text) => (Message::Text(text.into()), false),
                        Outbound::Close { code, reason } => (
                            Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })),
                            true,
                        ),
                    };
                    if let Err(e) = ws_writer.send(msg).await {
                        log::warn!("WebSocket write failed: {e}");
                        break;
                    }
                    if last {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: forward socket frames until close.
            tokio::spawn(async move {
                let closed = loop {
                    match ws_reader.next().await {
                        Some(Ok(Message::Binary(data))) => {
                            if in_tx.send(Inbound::Binary(data.into())).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(Inbound::Text(text.as_str().to_owned())).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(f) => Inbound::Closed {
                                    code: Some(u16::from(f.code)),
                                    reason: f.reason.as_str().to_owned(),
                                },
                                None => Inbound::Closed {
                                    code: None,
                                    reason: "closed without frame".into(),
                                },
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break Inbound::Closed {
                                code: None,
                                reason: e.to_string(),
                            }
                        }
                        None => {
                            break Inbound::Closed {
                                code: None,
                                reason: "stream ended".into(),
                            }
                        }
                    }
                };
                let _ = in_tx.send(closed);
            });

            Ok(Duplex { tx: out_tx, rx: in_rx })
        })
    }
}

// ─── Link state machine ───────────────────────────────────────────────

/// Which link an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkId {
    Relay,
    Signaling,
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Relay => "relay",
            Self::Signaling => "signaling",
        })
    }
}

#[derive(Debug)]
pub struct LinkEvent {
    pub link: LinkId,
    pub generation: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug)]
pub enum LinkEventKind {
    Connected(Result<Duplex, MeshError>),
    Inbound(Inbound),
    ConnectTimeout,
    RetryDue,
    HeartbeatDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    /// Waiting for the next reconnect attempt.
    Backoff,
    Failed,
}

/// What the owner of a link has to react to after an event.
#[derive(Debug)]
pub enum LinkOutput {
    None,
    /// The socket opened; the attempt counter was reset.
    Opened,
    Frame(Inbound),
    /// The link was lost and a retry is scheduled.
    Reconnecting {
        attempt: u32,
        delay: Duration,
        error: MeshError,
    },
    /// A scheduled retry started.
    Retrying,
    /// Lost with automatic reconnection disabled.
    Disconnected(MeshError),
    /// Terminal: retries exhausted or fatal close code.
    Failed(MeshError),
}

/// Connection parameters shared by relay and signaling links.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub url: Url,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    /// `Duration::ZERO` disables the heartbeat.
    pub heartbeat: Duration,
    pub debug: bool,
}

/// One reconnecting duplex connection.
pub struct Link<E> {
    id: LinkId,
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    events: mpsc::UnboundedSender<E>,
    state: LinkState,
    generation: u64,
    attempts: u32,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    connect_task: Option<TimerGuard>,
    connect_timer: Option<TimerGuard>,
    retry_timer: Option<TimerGuard>,
    heartbeat_timer: Option<TimerGuard>,
    pump: Option<TimerGuard>,
}

impl<E> Link<E>
where
    E: From<LinkEvent> + Send + 'static,
{
    pub fn new(
        id: LinkId,
        connector: Arc<dyn Connector>,
        settings: LinkSettings,
        events: mpsc::UnboundedSender<E>,
    ) -> Self {
        Self {
            id,
            connector,
            settings,
            events,
            state: LinkState::Idle,
            generation: 0,
            attempts: 0,
            outbound: None,
            connect_task: None,
            connect_timer: None,
            retry_timer: None,
            heartbeat_timer: None,
            pump: None,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Reconnect attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn url(&self) -> &Url {
        &self.settings.url
    }

    /// Start connecting from scratch. A no-op while connecting or open.
    pub fn open(&mut self) {
        if matches!(self.state, LinkState::Connecting | LinkState::Open) {
            return;
        }
        self.reset();
        self.attempts = 0;
        self.start_attempt();
    }

    /// Intentional close: cancel every timer, drop the socket, go idle.
    pub fn close(&mut self, reason: &str) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            });
        }
        self.reset();
        self.attempts = 0;
        self.state = LinkState::Idle;
    }

    /// Send a binary frame. Fails without side effects when not open.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), MeshError> {
        self.send_frame(Outbound::Binary(bytes))
    }

    pub fn send_text(&self, text: String) -> Result<(), MeshError> {
        self.send_frame(Outbound::Text(text))
    }

    fn send_frame(&self, frame: Outbound) -> Result<(), MeshError> {
        match (&self.outbound, self.state) {
            (Some(tx), LinkState::Open) => tx
                .send(frame)
                .map_err(|_| MeshError::transient(format!("{} channel closed", self.id))),
            _ => Err(MeshError::transient(format!("{} link not open", self.id))),
        }
    }

    /// Apply one event. Stale events (older generation) are dropped.
    pub fn handle(&mut self, event: LinkEvent) -> LinkOutput {
        if event.generation != self.generation {
            log::trace!("Dropping stale {} event (generation {})", self.id, event.generation);
            return LinkOutput::None;
        }

        match event.kind {
            LinkEventKind::Connected(result) => {
                if self.state != LinkState::Connecting {
                    return LinkOutput::None;
                }
                self.connect_task = None;
                self.connect_timer = None;
                match result {
                    Ok(duplex) => self.on_open(duplex),
                    Err(e) => {
                        log::warn!("{} connect failed: {e}", self.id);
                        self.on_lost(e)
                    }
                }
            }
            LinkEventKind::ConnectTimeout => {
                if self.state != LinkState::Connecting {
                    return LinkOutput::None;
                }
                log::warn!(
                    "{} connect timed out after {:?}",
                    self.id,
                    self.settings.connect_timeout
                );
                self.on_lost(MeshError::transient(format!(
                    "{} connection timed out after {}ms",
                    self.id,
                    self.settings.connect_timeout.as_millis()
                )))
            }
            LinkEventKind::RetryDue => {
                if self.state != LinkState::Backoff {
                    return LinkOutput::None;
                }
                self.retry_timer = None;
                log::info!("{} reconnect attempt {}", self.id, self.attempts);
                self.start_attempt();
                LinkOutput::Retrying
            }
            LinkEventKind::HeartbeatDue => {
                if self.state == LinkState::Open {
                    let ping = WirePacket::Ping(PingPacket {
                        request_id: HEARTBEAT_REQUEST_ID,
                        sent_at: wall_clock_ms(),
                    });
                    match self.send(ping.encode()) {
                        Ok(()) => log::trace!("{} heartbeat sent", self.id),
                        Err(e) => log::warn!("{} heartbeat failed: {e}", self.id),
                    }
                }
                LinkOutput::None
            }
            LinkEventKind::Inbound(Inbound::Closed { code, reason }) => {
                if self.state != LinkState::Open {
                    return LinkOutput::None;
                }
                log::info!("{} closed (code {code:?}): {reason}", self.id);
                if is_fatal_close(code) {
                    self.reset();
                    self.state = LinkState::Failed;
                    return LinkOutput::Failed(MeshError::terminal(
                        format!("{} rejected: {reason}", self.id),
                        code,
                    ));
                }
                self.on_lost(MeshError::Connection {
                    message: format!("{} closed abnormally: {reason}", self.id),
                    retryable: true,
                    close_code: code,
                })
            }
            LinkEventKind::Inbound(frame) => {
                if self.state != LinkState::Open {
                    return LinkOutput::None;
                }
                if self.settings.debug {
                    match &frame {
                        Inbound::Binary(b) => log::debug!("{} ← {} bytes", self.id, b.len()),
                        Inbound::Text(t) => log::debug!("{} ← text ({} chars)", self.id, t.len()),
                        Inbound::Closed { .. } => {}
                    }
                }
                LinkOutput::Frame(frame)
            }
        }
    }

    fn start_attempt(&mut self) {
        self.generation += 1;
        self.state = LinkState::Connecting;
        let generation = self.generation;
        let id = self.id;

        let fut = self.connector.connect(self.settings.url.clone());
        let tx = self.events.clone();
        self.connect_task = Some(TimerGuard::spawn(async move {
            let result = fut.await;
            let _ = tx.send(E::from(LinkEvent {
                link: id,
                generation,
                kind: LinkEventKind::Connected(result),
            }));
        }));
        self.connect_timer = Some(timer::after(
            self.settings.connect_timeout,
            self.events.clone(),
            E::from(LinkEvent {
                link: id,
                generation,
                kind: LinkEventKind::ConnectTimeout,
            }),
        ));
        log::info!("{} connecting to {}", self.id, redact(&self.settings.url));
    }

    fn on_open(&mut self, duplex: Duplex) -> LinkOutput {
        let Duplex { tx, mut rx } = duplex;
        let generation = self.generation;
        let id = self.id;

        let events = self.events.clone();
        self.pump = Some(TimerGuard::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closed = matches!(frame, Inbound::Closed { .. });
                let sent = events.send(E::from(LinkEvent {
                    link: id,
                    generation,
                    kind: LinkEventKind::Inbound(frame),
                }));
                if closed || sent.is_err() {
                    return;
                }
            }
            let _ = events.send(E::from(LinkEvent {
                link: id,
                generation,
                kind: LinkEventKind::Inbound(Inbound::Closed {
                    code: None,
                    reason: "transport dropped".into(),
                }),
            }));
        }));

        self.outbound = Some(tx);
        self.state = LinkState::Open;
        self.attempts = 0;

        if !self.settings.heartbeat.is_zero() {
            self.heartbeat_timer = Some(timer::every(
                self.settings.heartbeat,
                self.events.clone(),
                move || {
                    E::from(LinkEvent {
                        link: id,
                        generation,
                        kind: LinkEventKind::HeartbeatDue,
                    })
                },
            ));
        }
        log::info!("{} connected", self.id);
        LinkOutput::Opened
    }

    /// Abnormal loss: schedule a retry or give up.
    fn on_lost(&mut self, error: MeshError) -> LinkOutput {
        self.reset();

        if !error.is_retryable() {
            self.state = LinkState::Failed;
            return LinkOutput::Failed(error);
        }
        if !self.settings.policy.enabled {
            self.state = LinkState::Idle;
            return LinkOutput::Disconnected(error);
        }
        if !self.settings.policy.allows(self.attempts) {
            self.state = LinkState::Failed;
            log::error!(
                "{} giving up after {} reconnect attempts",
                self.id,
                self.attempts
            );
            return LinkOutput::Failed(MeshError::terminal(
                format!(
                    "{} reconnect attempts exhausted ({}): {error}",
                    self.id, self.attempts
                ),
                error_close_code(&error),
            ));
        }

        let delay = self.settings.policy.delay(self.attempts, &mut rand::rng());
        self.attempts += 1;
        self.state = LinkState::Backoff;
        self.retry_timer = Some(timer::after(
            delay,
            self.events.clone(),
            E::from(LinkEvent {
                link: self.id,
                generation: self.generation,
                kind: LinkEventKind::RetryDue,
            }),
        ));
        log::info!(
            "{} reconnecting in {}ms (attempt {}/{})",
            self.id,
            delay.as_millis(),
            self.attempts,
            self.settings.policy.max_attempts
        );
        LinkOutput::Reconnecting {
            attempt: self.attempts,
            delay,
            error,
        }
    }

    /// Drop every task and timer and invalidate in-flight events.
    fn reset(&mut self) {
        self.generation += 1;
        self.outbound = None;
        self.connect_task = None;
        self.connect_timer = None;
        self.retry_timer = None;
        self.heartbeat_timer = None;
        self.pump = None;
    }
}

fn error_close_code(error: &MeshError) -> Option<u16> {
    match error {
        MeshError::Connection { close_code, .. } => *close_code,
        _ => None,
    }
}

/// URL without its query (tokens stay out of logs).
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
