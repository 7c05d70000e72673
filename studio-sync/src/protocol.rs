//! Binary room protocol.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────────────────────────┐
//! │ msg_type │ client_id │ clock    │ payload                      │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable                     │
//! └──────────┴───────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! | msg_type  | payload                                   |
//! |-----------|-------------------------------------------|
//! | Join      | bincode [`JoinInfo`]                      |
//! | Update    | opaque document update (LZ4 + bincode)    |
//! | Snapshot  | opaque full document state, same shape    |
//! | Awareness | bincode [`AwarenessUpdate`]               |
//! | Leave     | empty                                     |
//!
//! `client_id` is ephemeral per session instance, distinct from the user id.
//!
//! [`AwarenessUpdate`]: crate::awareness::AwarenessUpdate

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on a decoded frame.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Room handshake carrying [`JoinInfo`]
    Join = 1,
    /// Incremental document update
    Update = 2,
    /// Full document state for catch-up or forced resync
    Snapshot = 3,
    /// Presence entries
    Awareness = 4,
    /// Clean disconnect notice
    Leave = 5,
}

/// Handshake payload sent first on every link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinInfo {
    pub room: String,
    pub user_id: String,
    pub name: String,
}

/// Room key derived from a project id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn for_project(project_id: &str) -> Self {
        Self(format!("studio-{project_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub msg_type: MessageType,
    pub client_id: Uuid,
    /// Sender's Lamport counter when the frame was produced (informational).
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn join(client_id: Uuid, info: &JoinInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Join,
            client_id,
            clock: 0,
            payload,
        })
    }

    pub fn update(client_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            client_id,
            clock,
            payload: update,
        }
    }

    pub fn snapshot(client_id: Uuid, clock: u64, state: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Snapshot,
            client_id,
            clock,
            payload: state,
        }
    }

    pub fn awareness(client_id: Uuid, entries: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            client_id,
            clock: 0,
            payload: entries,
        }
    }

    pub fn leave(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Leave,
            client_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
        let (frame, _) = bincode::serde::decode_from_slice(bytes, config)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the handshake payload.
    pub fn join_info(&self) -> Result<JoinInfo, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }

    /// Whether the payload is a document delta or snapshot.
    pub fn carries_document(&self) -> bool {
        matches!(self.msg_type, MessageType::Update | MessageType::Snapshot)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_key_for_project() {
        assert_eq!(RoomKey::for_project("p42").as_str(), "studio-p42");
        assert_eq!(RoomKey::for_project("p42"), RoomKey::for_project("p42"));
    }

    #[test]
    fn test_join_frame_carries_info() {
        let info = JoinInfo {
            room: "studio-p1".into(),
            user_id: "u1".into(),
            name: "Alice".into(),
        };
        let frame = Frame::join(Uuid::new_v4(), &info).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.join_info().unwrap(), info);
    }

    #[test]
    fn test_join_info_wrong_type() {
        let frame = Frame::leave(Uuid::new_v4());
        assert_eq!(frame.join_info(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_update_frame_header_is_small() {
        let frame = Frame::update(Uuid::new_v4(), 12, vec![0u8; 50]);
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 80, "encoded size {} too large", encoded.len());
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_carries_document() {
        let id = Uuid::new_v4();
        assert!(Frame::update(id, 1, vec![]).carries_document());
        assert!(Frame::snapshot(id, 1, vec![]).carries_document());
        assert!(!Frame::awareness(id, vec![]).carries_document());
        assert!(!Frame::leave(id).carries_document());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(Frame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::Update as u8, 2);
        assert_eq!(MessageType::Snapshot as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
        assert_eq!(MessageType::Leave as u8, 5);
    }
}
