//! Signaling messages exchanged before a direct peer link exists.
//!
//! Body layout (inside a `MsgType::Signal` envelope or a `FrameClass::Signal`
//! fast-path frame):
//! ```text
//! ┌──────┬──────────┬────────────┬────────────────────────┐
//! │ kind │ to (str) │ from (str) │ kind body              │
//! │ u8   │          │            │ str or bytes           │
//! └──────┴──────────┴────────────┴────────────────────────┘
//! ```

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::codec::{GetField, PutField};
use super::DecodeError;

/// Address used for signals meant for the signaling server or every peer.
pub const BROADCAST_ADDRESS: &str = "*";

/// Connection-establishment metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SignalMessage {
    /// Announce presence in a workspace.
    Join {
        #[serde(rename = "workspaceId")]
        workspace_id: String,
    },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
    /// Opaque payload forwarded to one peer through the signaling path.
    Relay { payload: Vec<u8> },
}

impl SignalMessage {
    fn tag(&self) -> u8 {
        match self {
            Self::Join { .. } => 1,
            Self::Offer { .. } => 2,
            Self::Answer { .. } => 3,
            Self::Candidate { .. } => 4,
            Self::Relay { .. } => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Relay { .. } => "relay",
        }
    }
}

/// An addressed [`SignalMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub to: String,
    pub from: String,
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn new(to: impl Into<String>, from: impl Into<String>, message: SignalMessage) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            message,
        }
    }

    /// Whether a client with `local_id` should act on this signal.
    pub fn is_for(&self, local_id: &str) -> bool {
        self.to == local_id || self.to == BROADCAST_ADDRESS
    }

    pub(crate) fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.message.tag());
        buf.put_text(&self.to);
        buf.put_text(&self.from);
        match &self.message {
            SignalMessage::Join { workspace_id } => buf.put_text(workspace_id),
            SignalMessage::Offer { sdp } | SignalMessage::Answer { sdp } => buf.put_text(sdp),
            SignalMessage::Candidate { candidate } => buf.put_text(candidate),
            SignalMessage::Relay { payload } => buf.put_blob(payload),
        }
    }

    pub(crate) fn read<B: Buf>(r: &mut B) -> Result<Self, DecodeError> {
        let tag = r.get_tag()?;
        let to = r.get_text()?;
        let from = r.get_text()?;
        let message = match tag {
            1 => SignalMessage::Join { workspace_id: r.get_text()? },
            2 => SignalMessage::Offer { sdp: r.get_text()? },
            3 => SignalMessage::Answer { sdp: r.get_text()? },
            4 => SignalMessage::Candidate { candidate: r.get_text()? },
            5 => SignalMessage::Relay { payload: r.get_blob()? },
            other => {
                return Err(DecodeError::InvalidTag {
                    field: "signal kind",
                    value: other,
                })
            }
        };
        Ok(Self { to, from, message })
    }

    /// Encode as a bare body (fast-path frames).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        self.write(&mut buf);
        buf
    }

    pub fn decode_body(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = bytes;
        let env = Self::read(&mut r)?;
        r.finish()?;
        Ok(env)
    }
}
