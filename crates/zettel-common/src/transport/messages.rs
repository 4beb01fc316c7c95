//! Wire protocol for collaborative editing messages.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::SerDeError;

/// Messages exchanged between a client and the relay server.
///
/// Every frame on the wire is one postcard-encoded `CollabMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollabMessage {
    /// First frame of every connection.
    Auth {
        /// Document the session is bound to
        document: SmolStr,
        /// Bearer credential, checked by the server
        token: SmolStr,
        /// Local replica identity
        replica: u64,
        /// Display name for presence UI
        display_name: SmolStr,
        /// Collaborator colour (RGBA)
        color: u32,
    },

    /// Server accepted the credential.
    AuthOk,

    /// Server refused the credential. The connection is closed afterwards.
    AuthRejected { reason: SmolStr },

    /// CRDT update. Clients number their updates; relayed copies keep the
    /// sender's sequence number.
    Update {
        seq: u64,
        /// Serialized CRDT update bytes
        data: Vec<u8>,
    },

    /// Server received every update up to and including `seq`.
    Ack { seq: u64 },

    /// Ask peers for what the requester is missing.
    SyncRequest {
        replica: u64,
        /// Encoded version vector of what the requester already has
        version: Vec<u8>,
    },

    /// Answer to a sync request, routed to the requesting replica only.
    SyncResponse {
        to: u64,
        /// CRDT update bytes the requester is missing
        data: Vec<u8>,
    },

    /// Cursor position update (presence)
    Presence {
        replica: u64,
        display_name: SmolStr,
        color: u32,
        /// Cursor position in document
        position: usize,
        /// Optional selection range (anchor, head)
        selection: Option<(usize, usize)>,
    },

    /// Collaborator joined the document
    Join {
        replica: u64,
        display_name: SmolStr,
        color: u32,
    },

    /// Collaborator left the document
    Leave { replica: u64 },
}

impl CollabMessage {
    /// Serialize message to postcard bytes for wire transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerDeError> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// Deserialize message from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerDeError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabMessage::Auth { .. } => "auth",
            CollabMessage::AuthOk => "auth_ok",
            CollabMessage::AuthRejected { .. } => "auth_rejected",
            CollabMessage::Update { .. } => "update",
            CollabMessage::Ack { .. } => "ack",
            CollabMessage::SyncRequest { .. } => "sync_request",
            CollabMessage::SyncResponse { .. } => "sync_response",
            CollabMessage::Presence { .. } => "presence",
            CollabMessage::Join { .. } => "join",
            CollabMessage::Leave { .. } => "leave",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_update() {
        let msg = CollabMessage::Update {
            seq: 7,
            data: vec![1, 2, 3, 4],
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = CollabMessage::from_bytes(&bytes).unwrap();

        match decoded {
            CollabMessage::Update { seq, data } => {
                assert_eq!(seq, 7);
                assert_eq!(data, vec![1, 2, 3, 4]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_roundtrip_auth() {
        let msg = CollabMessage::Auth {
            document: "doc-1".into(),
            token: "secret".into(),
            replica: 42,
            display_name: "Alice".into(),
            color: 0xFF6B6BFF,
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(CollabMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(CollabMessage::from_bytes(&[0xFF, 0xFF, 0xFF]).is_err());
        assert!(CollabMessage::from_bytes(&[]).is_err());
    }
}
