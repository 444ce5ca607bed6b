//! Header-only framing for peer data channels.
//!
//! ```text
//! ┌───────┬──────────────┬──────────────┐
//! │ class │ length       │ payload      │
//! │ 1 B   │ 4 B (u32 LE) │ length bytes │
//! └───────┴──────────────┴──────────────┘
//! ```
//!
//! Signals and ephemeral broadcasts skip the full envelope; everything else
//! travels as `FrameClass::Packet` wrapping an encoded [`WirePacket`].
//!
//! [`WirePacket`]: super::WirePacket

use bytes::{Buf, BufMut};

use super::DecodeError;

pub const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameClass {
    /// Link readiness handshake; payload is the sender's peer id.
    Hello = 1,
    Packet = 2,
    Signal = 3,
    Ephemeral = 4,
}

impl TryFrom<u8> for FrameClass {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Hello),
            2 => Ok(Self::Packet),
            3 => Ok(Self::Signal),
            4 => Ok(Self::Ephemeral),
            other => Err(DecodeError::InvalidTag {
                field: "frame class",
                value: other,
            }),
        }
    }
}

pub fn encode_frame(class: FrameClass, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.put_u8(class as u8);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    out
}

/// Split a frame into its class and payload without copying.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameClass, &[u8]), DecodeError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: FRAME_HEADER_LEN,
            remaining: bytes.len(),
        });
    }
    let mut payload = bytes;
    let class = FrameClass::try_from(payload.try_get_u8()?)?;
    let declared = payload.try_get_u32_le()? as usize;
    if payload.len() != declared {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok((class, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(FrameClass::Ephemeral, b"hi");
        assert_eq!(frame, vec![4, 2, 0, 0, 0, b'h', b'i']);
        assert_eq!(decode_frame(&frame), Ok((FrameClass::Ephemeral, &b"hi"[..])));
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame(FrameClass::Hello, &[]);
        assert_eq!(decode_frame(&frame), Ok((FrameClass::Hello, &[][..])));
    }

    #[test]
    fn test_short_header_is_error() {
        for len in 0..FRAME_HEADER_LEN {
            let bytes = vec![2u8; len];
            assert!(matches!(decode_frame(&bytes), Err(DecodeError::Truncated { .. })));
        }
    }

    #[test]
    fn test_length_mismatch() {
        let mut frame = encode_frame(FrameClass::Packet, &[1, 2, 3]);
        frame.pop();
        assert_eq!(
            decode_frame(&frame),
            Err(DecodeError::LengthMismatch { declared: 3, actual: 2 })
        );
    }

    #[test]
    fn test_unknown_class() {
        assert!(matches!(
            decode_frame(&[9, 0, 0, 0, 0]),
            Err(DecodeError::InvalidTag { field: "frame class", value: 9 })
        ));
    }
}
