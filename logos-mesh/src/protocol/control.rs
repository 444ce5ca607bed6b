//! Structured-text form of control traffic.
//!
//! Relays may send presence and control events as JSON text frames on the
//! same socket that carries binary envelopes. The receiver sniffs the frame
//! type and routes both forms through the same [`WirePacket`] handlers:
//!
//! ```text
//! {"type":"presence","action":"join","peerId":"p1","userId":"u1"}
//! {"type":"ping","requestId":7,"sentAt":1700000000000}
//! {"type":"signal","to":"p2","from":"p1","signal":{"kind":"offer","sdp":"..."}}
//! {"type":"ephemeral","from":"p1","payload":{"cursor":[3,4]}}
//! ```

use serde::{Deserialize, Serialize};

use super::packet::{EphemeralPacket, PingPacket, PresenceAction, PresencePacket, WirePacket};
use super::signal::{SignalEnvelope, SignalMessage};
use super::DecodeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Presence {
        action: PresenceAction,
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        peers: Vec<String>,
    },
    Ping {
        request_id: u32,
        sent_at: u64,
    },
    Pong {
        request_id: u32,
        sent_at: u64,
    },
    Signal {
        to: String,
        from: String,
        signal: SignalMessage,
    },
    Ephemeral {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        payload: serde_json::Value,
    },
}

impl ControlMessage {
    /// Parse a text frame straight into the packet it stands for.
    pub fn parse(text: &str) -> Result<WirePacket, DecodeError> {
        let msg: ControlMessage =
            serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        msg.into_packet()
    }

    pub fn into_packet(self) -> Result<WirePacket, DecodeError> {
        let packet = match self {
            Self::Presence {
                action,
                peer_id,
                user_id,
                state,
                peers,
            } => WirePacket::Presence(PresencePacket {
                action,
                peer_id,
                user_id,
                state: state
                    .map(|v| serde_json::to_vec(&v))
                    .transpose()
                    .map_err(|e| DecodeError::InvalidJson(e.to_string()))?,
                peers,
            }),
            Self::Ping { request_id, sent_at } => {
                WirePacket::Ping(PingPacket { request_id, sent_at })
            }
            Self::Pong { request_id, sent_at } => {
                WirePacket::Pong(PingPacket { request_id, sent_at })
            }
            Self::Signal { to, from, signal } => {
                WirePacket::Signal(SignalEnvelope::new(to, from, signal))
            }
            Self::Ephemeral { from, payload } => WirePacket::Ephemeral(EphemeralPacket {
                from,
                payload: serde_json::to_vec(&payload)
                    .map_err(|e| DecodeError::InvalidJson(e.to_string()))?,
            }),
        };
        Ok(packet)
    }

    /// Text form of a packet, for kinds that have one.
    ///
    /// Returns `None` for data-plane packets and for opaque payloads that
    /// are not valid JSON.
    pub fn from_packet(packet: &WirePacket) -> Option<Self> {
        match packet {
            WirePacket::Presence(p) => Some(Self::Presence {
                action: p.action,
                peer_id: p.peer_id.clone(),
                user_id: p.user_id.clone(),
                state: match &p.state {
                    Some(bytes) => Some(serde_json::from_slice(bytes).ok()?),
                    None => None,
                },
                peers: p.peers.clone(),
            }),
            WirePacket::Ping(p) => Some(Self::Ping {
                request_id: p.request_id,
                sent_at: p.sent_at,
            }),
            WirePacket::Pong(p) => Some(Self::Pong {
                request_id: p.request_id,
                sent_at: p.sent_at,
            }),
            WirePacket::Signal(env) => Some(Self::Signal {
                to: env.to.clone(),
                from: env.from.clone(),
                signal: env.message.clone(),
            }),
            WirePacket::Ephemeral(e) => Some(Self::Ephemeral {
                from: e.from.clone(),
                payload: serde_json::from_slice(&e.payload).ok()?,
            }),
            _ => None,
        }
    }

    pub fn to_text(&self) -> Result<String, DecodeError> {
        serde_json::to_string(self).map_err(|e| DecodeError::InvalidJson(e.to_string()))
    }
}
