//! Defines the AudioHook control-message protocol exchanged with the client.
//!
//! Parsing is two-stage: [`EnvelopeHeader`] peeks the `id`/`type`/`seq`
//! fields every control message must carry, then the full payload is parsed
//! into a [`ClientMessage`] variant. Handler logic never sees an untyped map.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol version carried in every outbound envelope.
pub const PROTOCOL_VERSION: &str = "2";

/// The envelope fields required on every inbound control message.
///
/// A frame missing any of these is malformed and is dropped without
/// affecting the connection.
#[derive(Deserialize, Debug)]
pub struct EnvelopeHeader {
    /// Opaque token echoed back in the reply.
    pub id: String,
    /// The message kind, matched against [`ClientMessage`] variants.
    #[serde(rename = "type")]
    pub kind: String,
    /// Client sequence number; must be exactly `client_seq + 1`.
    pub seq: u64,
}

/// Messages sent from the client to the server, tagged by `type`.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Starts a conversation (or probes connectivity with a nil
    /// conversation id). This is normally the first message.
    Open {
        #[serde(default)]
        parameters: Option<OpenParameters>,
    },
    /// Liveness check; answered with `pong`.
    Ping {
        #[serde(default)]
        parameters: Option<Value>,
    },
    /// Mid-session update. Logged only; extension point.
    Update {
        #[serde(default)]
        parameters: Option<Value>,
    },
    /// Ends the conversation; answered with `closed`, after which the
    /// client is expected to close the socket.
    Close {
        #[serde(default)]
        parameters: Option<CloseParameters>,
    },
    /// Client-reported failure. Logged only.
    Error {
        #[serde(default)]
        parameters: Option<ErrorParameters>,
    },
}

/// Parameters of an inbound `open` message.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct OpenParameters {
    #[serde(rename = "organizationId", default)]
    pub organization_id: Option<String>,
    #[serde(rename = "conversationId", default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub participant: Option<Participant>,
    #[serde(default)]
    pub media: Vec<MediaDescriptor>,
}

impl OpenParameters {
    /// A nil conversation id marks a connectivity probe: the client is only
    /// checking reachability and no conversation should be started.
    pub fn is_probe(&self) -> bool {
        self.conversation_id == Some(Uuid::nil())
    }
}

/// The caller the conversation belongs to.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Participant {
    #[serde(default)]
    pub ani: Option<String>,
    #[serde(rename = "aniName", default)]
    pub ani_name: Option<String>,
    #[serde(default)]
    pub dnis: Option<String>,
}

/// One media format offered by the client in `open.parameters.media`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MediaDescriptor {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub rate: u32,
}

impl MediaDescriptor {
    /// Whether this descriptor carries both conversation legs.
    pub fn is_stereo(&self) -> bool {
        self.channels.iter().any(|c| c == "internal")
            && self.channels.iter().any(|c| c == "external")
    }
}

/// Picks the media format to accept from an `open` offer: the first stereo
/// entry (both `internal` and `external` channels) if one exists, otherwise
/// the first entry. Returns `None` for an empty offer.
pub fn select_media(offered: &[MediaDescriptor]) -> Option<&MediaDescriptor> {
    offered
        .iter()
        .find(|m| m.is_stereo())
        .or_else(|| offered.first())
}

/// Parameters of an inbound `close` message.
#[derive(Deserialize, Debug, Clone)]
pub struct CloseParameters {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Parameters of an inbound `error` message.
#[derive(Deserialize, Debug, Clone)]
pub struct ErrorParameters {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "retryAfter", default)]
    pub retry_after: Option<String>,
}

/// Outbound message kinds produced by this server.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Opened,
    Pong,
    Closed,
    Disconnect,
}

/// Reasons carried by a `disconnect` reply.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectReason {
    Completed,
    Error,
    Unauthorized,
}

/// The full outbound envelope. `seq` is assigned by the send gate at
/// transmission time, never by handler code.
#[derive(Serialize, Debug)]
pub struct ServerFrame {
    pub version: &'static str,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub seq: u64,
    pub clientseq: u64,
    pub parameters: Value,
}

/// Per-session state owned by the protocol layer. The registry stores it but
/// never looks inside.
#[derive(Debug, Default)]
pub struct LogicalStorage {
    pub conversation_id: Option<Uuid>,
    pub open_transaction: Option<String>,
    pub audio_buffer: Vec<u8>,
}
