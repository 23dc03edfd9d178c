//! Wire protocol types for parent-worker communication.
//!
//! Every frame on the channel carries one JSON-serialized [`Envelope`]. The
//! envelope type set is closed on our side but open on the wire: a type string
//! this build does not know decodes to [`MessageType::Unknown`] and is ignored,
//! so a newer parent never breaks an older worker.

use serde::{Deserialize, Serialize};

/// Correlates a request with its response.
///
/// The side that starts a conversation assigns the id: the worker for its own
/// `Ready`, the parent for jobs. Responses reuse the request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(i64);

impl EnvelopeId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for EnvelopeId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A job (inbound) or a compilation result (outbound).
    Data,
    Heartbeat,
    Shutdown,
    Ready,
    Acknowledge,
    VersionInfo,
    Command,
    /// Terminal failure for a job; diagnostic text travels in `extra`.
    Error,
    /// Anything this build does not recognise.
    #[default]
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Data => "data",
            Self::Heartbeat => "heartbeat",
            Self::Shutdown => "shutdown",
            Self::Ready => "ready",
            Self::Acknowledge => "acknowledge",
            Self::VersionInfo => "version_info",
            Self::Command => "command",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The typed unit exchanged over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,

    #[serde(rename = "type", default)]
    pub kind: MessageType,

    /// Opaque bytes; a serialized job for inbound `Data`.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub payload: Vec<u8>,

    /// Side-channel diagnostics. Only ever appended to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl Envelope {
    pub fn new(id: EnvelopeId, kind: MessageType) -> Self {
        Self {
            id,
            kind,
            payload: Vec::new(),
            extra: None,
        }
    }

    pub fn ready(id: EnvelopeId) -> Self {
        Self::new(id, MessageType::Ready)
    }

    pub fn data(id: EnvelopeId, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::new(id, MessageType::Data)
        }
    }

    pub fn error(id: EnvelopeId, diagnostics: impl Into<String>) -> Self {
        Self {
            extra: Some(diagnostics.into()),
            ..Self::new(id, MessageType::Error)
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn append_extra(&mut self, text: &str) {
        match self.extra {
            Some(ref mut extra) => extra.push_str(text),
            None => self.extra = Some(text.to_string()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Byte blobs travel as standard base64 strings inside JSON documents.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
