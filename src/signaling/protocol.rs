#![forbid(unsafe_code)]

// Signaling protocol - control message types for WebSocket communication.
// The wire format is one JSON object per message; the "id" field selects the
// message type.

use crate::media::IceCandidateInfo;
use serde::{Deserialize, Serialize};

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a room under an identity
    JoinRoom { room: String, name: String },
    /// Request to receive a participant's stream (offer half of negotiation)
    #[serde(rename_all = "camelCase")]
    ReceiveVideoFrom { sender: String, sdp_offer: String },
    /// Leave the current room
    LeaveRoom,
    /// Relay a connectivity candidate toward the endpoint for `name`
    OnIceCandidate {
        candidate: IceCandidateInfo,
        name: String,
    },
    /// Attach the visual-effect filter to this participant's published stream
    StartFilter,
    /// Broadcast a text message to the sender's room
    Chat { sender: String, content: String },
    /// Forward-compatible no-op for unrecognized message ids
    #[serde(other)]
    Unknown,
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Snapshot of prior room members, sent to a joiner
    ExistingParticipants { data: Vec<String> },
    /// A new participant joined the room
    NewParticipant { name: String },
    /// Answer half of negotiation, addressed to the stream of `name`
    #[serde(rename_all = "camelCase")]
    ReceiveVideoAnswer { name: String, sdp_answer: String },
    /// Engine-generated candidate for the endpoint carrying `name`'s stream
    IceCandidate {
        candidate: IceCandidateInfo,
        name: String,
    },
    /// A participant left the room
    ParticipantLeft { name: String },
    /// Chat message broadcast within a room
    ReceiveTextAnswer { sender: String, content: String },
    /// Error response
    Error { message: String },
}
