//! Signaling client: out-of-band control channel for mesh bootstrap.
//!
//! ```text
//!  MeshClient ──send_signal(to, msg)──► Link(Signaling) ──► signaling server ──► peer
//!      ▲                                      │
//!      └────── SignalingOutput ◄──── decode ──┘  Signal / Sync / Presence only
//! ```
//!
//! Rides the same reconnecting [`Link`] as the relay, so reconnection uses
//! the same backoff. Losing signaling never touches established direct
//! links; the owner only stops starting new ones.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::protocol::{
    ControlMessage, PresencePacket, SignalEnvelope, SignalMessage, WirePacket, BROADCAST_ADDRESS,
};
use crate::transport::{Connector, Inbound, Link, LinkEvent, LinkId, LinkOutput, LinkSettings, LinkState};

/// What the owner has to act on after a signaling event.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingOutput {
    /// Open and joined.
    Connected,
    /// A scheduled reconnect attempt started.
    Retrying,
    /// A signal addressed to this client (or broadcast) by another peer.
    Signal(SignalEnvelope),
    Presence(PresencePacket),
    Sync(Vec<u8>),
    /// The channel went away. `retrying` tells whether a reconnect is
    /// scheduled.
    Lost { error: MeshError, retrying: bool },
}

pub struct SignalingClient<E> {
    link: Link<E>,
    local_id: String,
    workspace_id: String,
}

impl<E> SignalingClient<E>
where
    E: From<LinkEvent> + Send + 'static,
{
    pub fn new(
        local_id: impl Into<String>,
        workspace_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        settings: LinkSettings,
        events: mpsc::UnboundedSender<E>,
    ) -> Self {
        Self {
            link: Link::new(LinkId::Signaling, connector, settings, events),
            local_id: local_id.into(),
            workspace_id: workspace_id.into(),
        }
    }

    pub fn connect(&mut self) {
        self.link.open();
    }

    pub fn disconnect(&mut self) {
        self.link.close("signaling closed by client");
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Address one message to one peer.
    pub fn send_signal(&self, to: &str, message: SignalMessage) -> Result<(), MeshError> {
        let env = SignalEnvelope::new(to, self.local_id.as_str(), message);
        self.send_envelope(env)
    }

    pub fn send_envelope(&self, env: SignalEnvelope) -> Result<(), MeshError> {
        let kind = env.message.name();
        self.link
            .send(WirePacket::Signal(env).encode())
            .map_err(|e| MeshError::Signaling(format!("cannot send {kind}: {e}")))
    }

    pub fn handle(&mut self, event: LinkEvent) -> Vec<SignalingOutput> {
        match self.link.handle(event) {
            LinkOutput::None => Vec::new(),
            LinkOutput::Retrying => vec![SignalingOutput::Retrying],
            LinkOutput::Opened => {
                let join = SignalMessage::Join {
                    workspace_id: self.workspace_id.clone(),
                };
                if let Err(e) = self.send_signal(BROADCAST_ADDRESS, join) {
                    log::warn!("Failed to send join: {e}");
                }
                vec![SignalingOutput::Connected]
            }
            LinkOutput::Frame(frame) => self.on_frame(frame).into_iter().collect(),
            LinkOutput::Reconnecting { error, .. } => vec![SignalingOutput::Lost {
                error: MeshError::Signaling(error.to_string()),
                retrying: true,
            }],
            LinkOutput::Disconnected(error) | LinkOutput::Failed(error) => {
                vec![SignalingOutput::Lost {
                    error: MeshError::Signaling(error.to_string()),
                    retrying: false,
                }]
            }
        }
    }

    fn on_frame(&self, frame: Inbound) -> Option<SignalingOutput> {
        let decoded = match frame {
            Inbound::Binary(bytes) => crate::protocol::decode(&bytes),
            Inbound::Text(text) => ControlMessage::parse(&text),
            Inbound::Closed { .. } => return None,
        };
        let packet = match decoded {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Dropping malformed signaling frame: {e}");
                return None;
            }
        };
        match packet {
            WirePacket::Signal(env) => {
                if env.from == self.local_id || !env.is_for(&self.local_id) {
                    return None;
                }
                Some(SignalingOutput::Signal(env))
            }
            WirePacket::Presence(p) => Some(SignalingOutput::Presence(p)),
            WirePacket::Sync(bytes) => Some(SignalingOutput::Sync(bytes)),
            other => {
                log::warn!(
                    "Unexpected {:?} packet on signaling channel",
                    other.msg_type()
                );
                None
            }
        }
    }
}
