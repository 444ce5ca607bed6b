//! Binary wire protocol shared by relay sockets and peer data channels.
//!
//! ```text
//! relay socket / signaling socket        peer data channel
//! ┌──────────┬──────────────────┐        ┌───────┬────────┬─────────────┐
//! │ MsgType  │ body             │        │ class │ len LE │ payload     │
//! │ 1 byte   │ see packet.rs    │        │ 1 B   │ 4 B    │             │
//! └──────────┴──────────────────┘        └───────┴────────┴─────────────┘
//!      ▲                                      │ class = Packet
//!      └──────────────────────────────────────┘ wraps a full envelope
//! ```
//!
//! The first byte of every envelope is the [`MsgType`] discriminant. The
//! numeric assignment below is part of the protocol and must never be
//! reordered: peers running different builds still have to agree on it.
//!
//! Decoding is total. Any malformed, truncated or over-long input yields a
//! [`DecodeError`]; callers log it and drop the single message.

mod codec;
pub mod control;
pub mod frame;
pub mod hlc;
pub mod packet;
pub mod pool;
pub mod signal;

pub use control::ControlMessage;
pub use frame::{decode_frame, encode_frame, FrameClass, FRAME_HEADER_LEN};
pub use hlc::{HlcClock, HlcTimestamp};
pub use packet::{
    CompareAndSwapPacket, EncryptedPacket, EphemeralPacket, InitPacket, OpPacket, PingPacket,
    PresenceAction, PresencePacket, WirePacket,
};
pub use pool::EncodePool;
pub use signal::{SignalEnvelope, SignalMessage, BROADCAST_ADDRESS};

/// Envelope discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Unknown = 0,
    Op = 1,
    /// Authoritative snapshot sent by the relay when a socket opens.
    Init = 2,
    Ping = 3,
    Pong = 4,
    CompareAndSwap = 5,
    Encrypted = 6,
    Signal = 7,
    Sync = 8,
    Presence = 9,
    Ephemeral = 10,
}

impl TryFrom<u8> for MsgType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Op),
            2 => Ok(Self::Init),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Pong),
            5 => Ok(Self::CompareAndSwap),
            6 => Ok(Self::Encrypted),
            7 => Ok(Self::Signal),
            8 => Ok(Self::Sync),
            9 => Ok(Self::Presence),
            10 => Ok(Self::Ephemeral),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown message type: {0}")]
    UnknownType(u8),
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("invalid {field}: {value}")]
    InvalidTag { field: &'static str, value: u8 },
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
    #[error("frame length mismatch: header says {declared}, payload has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("invalid control text: {0}")]
    InvalidJson(String),
}

/// Encode a packet into a fresh buffer.
pub fn encode(packet: &WirePacket) -> Vec<u8> {
    packet.encode()
}

/// Decode one envelope.
pub fn decode(bytes: &[u8]) -> Result<WirePacket, DecodeError> {
    WirePacket::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_values_are_pinned() {
        let pinned = [
            (MsgType::Unknown, 0),
            (MsgType::Op, 1),
            (MsgType::Init, 2),
            (MsgType::Ping, 3),
            (MsgType::Pong, 4),
            (MsgType::CompareAndSwap, 5),
            (MsgType::Encrypted, 6),
            (MsgType::Signal, 7),
            (MsgType::Sync, 8),
            (MsgType::Presence, 9),
            (MsgType::Ephemeral, 10),
        ];
        for (ty, value) in pinned {
            assert_eq!(ty as u8, value);
            assert_eq!(MsgType::try_from(value), Ok(ty));
        }
        assert_eq!(MsgType::try_from(11), Err(DecodeError::UnknownType(11)));
    }

    #[test]
    fn test_short_input_never_panics() {
        for len in 0..4 {
            for first in 0..=255u8 {
                let mut bytes = vec![0u8; len];
                if let Some(b) = bytes.first_mut() {
                    *b = first;
                }
                let _ = decode(&bytes);
            }
        }
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            DecodeError::Truncated { needed: 4, remaining: 1 }.to_string(),
            "truncated: needed 4 bytes, 1 remaining"
        );
    }
}
