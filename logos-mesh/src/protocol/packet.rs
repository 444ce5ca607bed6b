//! Typed packet bodies and the envelope codec.
//!
//! Envelope:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ msg_type │ type-specific body           │
//! │ 1 byte   │ variable                     │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! Op body:
//! ```text
//! ┌───────┬─────────┬───────────┬──────────┬───────────┬──────────┐
//! │ flags │ key     │ value     │ HLC      │ [actor]   │ seq      │
//! │ u8    │ u32+str │ u32+bytes │ u128 LE  │ u32+str   │ u64 LE   │
//! └───────┴─────────┴───────────┴──────────┴───────────┴──────────┘
//! flags: bit0 actor present, bit1 delete, bit2 encrypted
//! ```
//!
//! Optional fields are signalled in the flags byte and omitted when absent.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use super::codec::{GetField, PutField};
use super::hlc::HlcTimestamp;
use super::signal::SignalEnvelope;
use super::{DecodeError, MsgType};

const OP_HAS_ACTOR: u8 = 0b001;
const OP_DELETED: u8 = 0b010;
const OP_ENCRYPTED: u8 = 0b100;

/// A single key mutation produced by the Sync Core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpPacket {
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: HlcTimestamp,
    pub actor: Option<String>,
    pub deleted: bool,
    pub encrypted: bool,
    pub seq: u64,
}

impl OpPacket {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>, timestamp: HlcTimestamp) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            actor: None,
            deleted: false,
            encrypted: false,
            seq: 0,
        }
    }

    pub fn delete(key: impl Into<String>, timestamp: HlcTimestamp) -> Self {
        Self {
            deleted: true,
            ..Self::set(key, Vec::new(), timestamp)
        }
    }
}

/// Authoritative initial state sent by the relay after a connection opens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitPacket {
    pub snapshot: Vec<u8>,
    pub server_time: Option<u64>,
}

/// Body shared by Ping and Pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPacket {
    /// 0 is reserved for the relay heartbeat.
    pub request_id: u32,
    pub sent_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareAndSwapPacket {
    pub key: String,
    pub expected: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: HlcTimestamp,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPacket {
    pub key_id: Option<String>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PresenceAction {
    Join = 1,
    Leave = 2,
    Update = 3,
    /// Full roster of peers currently in the workspace.
    Snapshot = 4,
}

impl TryFrom<u8> for PresenceAction {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Join),
            2 => Ok(Self::Leave),
            3 => Ok(Self::Update),
            4 => Ok(Self::Snapshot),
            other => Err(DecodeError::InvalidTag {
                field: "presence action",
                value: other,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePacket {
    pub action: PresenceAction,
    pub peer_id: String,
    pub user_id: Option<String>,
    /// Application presence state (typically JSON), opaque here.
    pub state: Option<Vec<u8>>,
    /// Roster, only meaningful for `PresenceAction::Snapshot`.
    pub peers: Vec<String>,
}

impl PresencePacket {
    pub fn new(action: PresenceAction, peer_id: impl Into<String>) -> Self {
        Self {
            action,
            peer_id: peer_id.into(),
            user_id: None,
            state: None,
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralPacket {
    pub from: Option<String>,
    pub payload: Vec<u8>,
}

/// Every message kind carried over a relay socket or a peer data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePacket {
    /// Discriminant 0; body kept verbatim.
    Unknown(Vec<u8>),
    Op(OpPacket),
    Init(InitPacket),
    Ping(PingPacket),
    Pong(PingPacket),
    CompareAndSwap(CompareAndSwapPacket),
    Encrypted(EncryptedPacket),
    Signal(SignalEnvelope),
    Sync(Vec<u8>),
    Presence(PresencePacket),
    Ephemeral(EphemeralPacket),
}

impl WirePacket {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Unknown(_) => MsgType::Unknown,
            Self::Op(_) => MsgType::Op,
            Self::Init(_) => MsgType::Init,
            Self::Ping(_) => MsgType::Ping,
            Self::Pong(_) => MsgType::Pong,
            Self::CompareAndSwap(_) => MsgType::CompareAndSwap,
            Self::Encrypted(_) => MsgType::Encrypted,
            Self::Signal(_) => MsgType::Signal,
            Self::Sync(_) => MsgType::Sync,
            Self::Presence(_) => MsgType::Presence,
            Self::Ephemeral(_) => MsgType::Ephemeral,
        }
    }

    /// Serialize into `buf` (cleared first).
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.put_u8(self.msg_type() as u8);
        match self {
            Self::Unknown(body) => buf.put_slice(body),
            Self::Op(op) => {
                let mut flags = 0;
                if op.actor.is_some() {
                    flags |= OP_HAS_ACTOR;
                }
                if op.deleted {
                    flags |= OP_DELETED;
                }
                if op.encrypted {
                    flags |= OP_ENCRYPTED;
                }
                buf.put_u8(flags);
                buf.put_text(&op.key);
                buf.put_blob(&op.value);
                buf.put_u128_le(op.timestamp.to_u128());
                if let Some(actor) = &op.actor {
                    buf.put_text(actor);
                }
                buf.put_u64_le(op.seq);
            }
            Self::Init(init) => {
                buf.put_u8(init.server_time.is_some() as u8);
                buf.put_blob(&init.snapshot);
                if let Some(t) = init.server_time {
                    buf.put_u64_le(t);
                }
            }
            Self::Ping(p) | Self::Pong(p) => {
                buf.put_u32_le(p.request_id);
                buf.put_u64_le(p.sent_at);
            }
            Self::CompareAndSwap(cas) => {
                buf.put_u8(cas.expected.is_some() as u8);
                buf.put_text(&cas.key);
                if let Some(expected) = &cas.expected {
                    buf.put_blob(expected);
                }
                buf.put_blob(&cas.value);
                buf.put_u128_le(cas.timestamp.to_u128());
                buf.put_u64_le(cas.seq);
            }
            Self::Encrypted(enc) => {
                buf.put_u8(enc.key_id.is_some() as u8);
                if let Some(key_id) = &enc.key_id {
                    buf.put_text(key_id);
                }
                buf.put_blob(&enc.nonce);
                buf.put_blob(&enc.ciphertext);
            }
            Self::Signal(env) => env.write(buf),
            Self::Sync(payload) => buf.put_blob(payload),
            Self::Presence(p) => {
                buf.put_u8(p.action as u8);
                buf.put_u8(p.user_id.is_some() as u8 | (p.state.is_some() as u8) << 1);
                buf.put_text(&p.peer_id);
                if let Some(user) = &p.user_id {
                    buf.put_text(user);
                }
                if let Some(state) = &p.state {
                    buf.put_blob(state);
                }
                buf.put_u32_le(p.peers.len() as u32);
                for peer in &p.peers {
                    buf.put_text(peer);
                }
            }
            Self::Ephemeral(e) => {
                buf.put_u8(e.from.is_some() as u8);
                if let Some(from) = &e.from {
                    buf.put_text(from);
                }
                buf.put_blob(&e.payload);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.encode_into(&mut buf);
        buf
    }

    /// Total decoder: any malformed input yields a [`DecodeError`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let msg_type = MsgType::try_from(tag)?;
        let mut r = body;

        let packet = match msg_type {
            MsgType::Unknown => Self::Unknown(r.get_rest()),
            MsgType::Op => {
                let flags = r.get_tag()?;
                let key = r.get_text()?;
                let value = r.get_blob()?;
                let timestamp = HlcTimestamp::from_u128(r.get_u128_field()?);
                let actor = if flags & OP_HAS_ACTOR != 0 {
                    Some(r.get_text()?)
                } else {
                    None
                };
                let seq = r.get_u64_field()?;
                Self::Op(OpPacket {
                    key,
                    value,
                    timestamp,
                    actor,
                    deleted: flags & OP_DELETED != 0,
                    encrypted: flags & OP_ENCRYPTED != 0,
                    seq,
                })
            }
            MsgType::Init => {
                let flags = r.get_tag()?;
                let snapshot = r.get_blob()?;
                let server_time = if flags & 1 != 0 { Some(r.get_u64_field()?) } else { None };
                Self::Init(InitPacket { snapshot, server_time })
            }
            MsgType::Ping | MsgType::Pong => {
                let body = PingPacket {
                    request_id: r.get_u32_field()?,
                    sent_at: r.get_u64_field()?,
                };
                if msg_type == MsgType::Ping {
                    Self::Ping(body)
                } else {
                    Self::Pong(body)
                }
            }
            MsgType::CompareAndSwap => {
                let flags = r.get_tag()?;
                let key = r.get_text()?;
                let expected = if flags & 1 != 0 { Some(r.get_blob()?) } else { None };
                let value = r.get_blob()?;
                let timestamp = HlcTimestamp::from_u128(r.get_u128_field()?);
                let seq = r.get_u64_field()?;
                Self::CompareAndSwap(CompareAndSwapPacket {
                    key,
                    expected,
                    value,
                    timestamp,
                    seq,
                })
            }
            MsgType::Encrypted => {
                let flags = r.get_tag()?;
                let key_id = if flags & 1 != 0 { Some(r.get_text()?) } else { None };
                let nonce = r.get_blob()?;
                let ciphertext = r.get_blob()?;
                Self::Encrypted(EncryptedPacket {
                    key_id,
                    nonce,
                    ciphertext,
                })
            }
            MsgType::Signal => Self::Signal(SignalEnvelope::read(&mut r)?),
            MsgType::Sync => Self::Sync(r.get_blob()?),
            MsgType::Presence => {
                let action = PresenceAction::try_from(r.get_tag()?)?;
                let flags = r.get_tag()?;
                let peer_id = r.get_text()?;
                let user_id = if flags & 0b01 != 0 { Some(r.get_text()?) } else { None };
                let state = if flags & 0b10 != 0 { Some(r.get_blob()?) } else { None };
                let count = r.get_u32_field()? as usize;
                // Each roster entry needs at least its 4-byte length prefix.
                if count > r.len() / 4 {
                    return Err(DecodeError::Truncated {
                        needed: count.saturating_mul(4),
                        remaining: r.len(),
                    });
                }
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    peers.push(r.get_text()?);
                }
                Self::Presence(PresencePacket {
                    action,
                    peer_id,
                    user_id,
                    state,
                    peers,
                })
            }
            MsgType::Ephemeral => {
                let flags = r.get_tag()?;
                let from = if flags & 1 != 0 { Some(r.get_text()?) } else { None };
                let payload = r.get_blob()?;
                Self::Ephemeral(EphemeralPacket { from, payload })
            }
        };

        r.finish()?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::signal::SignalMessage;

    fn ts() -> HlcTimestamp {
        HlcTimestamp::new(1_717_171_717_171, 3, 0x1234_5678_9abc_def0)
    }

    fn roundtrip(packet: WirePacket) {
        let bytes = packet.encode();
        assert_eq!(bytes[0], packet.msg_type() as u8);
        assert_eq!(WirePacket::decode(&bytes), Ok(packet));
    }

    #[test]
    fn test_op_roundtrip_with_and_without_actor() {
        let mut op = OpPacket::set("title", b"New Title".to_vec(), ts());
        op.seq = 7;
        roundtrip(WirePacket::Op(op.clone()));

        op.actor = Some("peer-a".into());
        op.encrypted = true;
        roundtrip(WirePacket::Op(op));

        roundtrip(WirePacket::Op(OpPacket::delete("gone", ts())));
    }

    #[test]
    fn test_absent_actor_is_omitted_not_zero_filled() {
        let op = OpPacket::set("k", vec![1], ts());
        let without = WirePacket::Op(op.clone()).encode();
        let with = WirePacket::Op(OpPacket {
            actor: Some(String::new()),
            ..op
        })
        .encode();
        // An empty actor still costs its 4-byte length prefix.
        assert_eq!(with.len(), without.len() + 4);
        assert_eq!(without[1] & OP_HAS_ACTOR, 0);
    }

    #[test]
    fn test_op_layout_is_pinned() {
        let op = OpPacket {
            key: "k".into(),
            value: vec![9],
            timestamp: HlcTimestamp::from_u128(1),
            actor: None,
            deleted: true,
            encrypted: false,
            seq: 2,
        };
        let bytes = WirePacket::Op(op).encode();
        let mut expected = vec![1, OP_DELETED, 1, 0, 0, 0, b'k', 1, 0, 0, 0, 9];
        expected.extend_from_slice(&1u128.to_le_bytes());
        expected.extend_from_slice(&2u64.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_other_variants_roundtrip() {
        roundtrip(WirePacket::Unknown(vec![1, 2, 3]));
        roundtrip(WirePacket::Init(InitPacket::default()));
        roundtrip(WirePacket::Init(InitPacket {
            snapshot: vec![5; 40],
            server_time: Some(1_700_000_000_000),
        }));
        roundtrip(WirePacket::Ping(PingPacket { request_id: 0, sent_at: 12 }));
        roundtrip(WirePacket::Pong(PingPacket { request_id: 9, sent_at: 34 }));
        roundtrip(WirePacket::CompareAndSwap(CompareAndSwapPacket {
            key: "counter".into(),
            expected: Some(b"1".to_vec()),
            value: b"2".to_vec(),
            timestamp: ts(),
            seq: 4,
        }));
        roundtrip(WirePacket::Encrypted(EncryptedPacket {
            key_id: None,
            nonce: vec![0; 12],
            ciphertext: vec![7; 33],
        }));
        roundtrip(WirePacket::Signal(SignalEnvelope::new(
            "b",
            "a",
            SignalMessage::Candidate { candidate: "c".into() },
        )));
        roundtrip(WirePacket::Sync(vec![]));
        roundtrip(WirePacket::Presence(PresencePacket {
            action: PresenceAction::Snapshot,
            peer_id: "server".into(),
            user_id: Some("u1".into()),
            state: Some(br#"{"cursor":1}"#.to_vec()),
            peers: vec!["a".into(), "b".into()],
        }));
        roundtrip(WirePacket::Ephemeral(EphemeralPacket {
            from: Some("a".into()),
            payload: vec![1],
        }));
    }

    #[test]
    fn test_decode_short_input_is_error() {
        assert_eq!(WirePacket::decode(&[]), Err(DecodeError::Empty));
        assert!(matches!(
            WirePacket::decode(&[MsgType::Op as u8]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            WirePacket::decode(&[MsgType::Ping as u8, 1, 2]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_discriminant() {
        assert_eq!(WirePacket::decode(&[200, 1]), Err(DecodeError::UnknownType(200)));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = WirePacket::Ping(PingPacket { request_id: 1, sent_at: 2 }).encode();
        bytes.push(0);
        assert_eq!(WirePacket::decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_every_truncation_of_op_is_error() {
        let mut op = OpPacket::set("title", b"value".to_vec(), ts());
        op.actor = Some("peer".into());
        let bytes = WirePacket::Op(op).encode();
        for cut in 0..bytes.len() {
            assert!(WirePacket::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_presence_roster_count_bomb() {
        let mut bytes = vec![MsgType::Presence as u8, PresenceAction::Snapshot as u8, 0];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(b'p');
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            WirePacket::decode(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
