//! Core identifiers and data structures shared across the realtime client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a user, as assigned by the host application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a user id from any string-like value
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier for a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Create a conversation id from any string-like value
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Display attributes of a counterparty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// User identifier
    pub user_id: UserId,
    /// Human-readable display name
    pub display_name: String,
    /// Optional avatar URL
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Create a profile with no avatar
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

/// Which media a call carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio-only call
    Audio,
    /// Audio plus video call
    Video,
}

/// Direction of a call relative to this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Call started locally
    Outbound,
    /// Call received from a remote peer
    Inbound,
}

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call in progress
    Idle,
    /// Ringing, waiting for local or remote accept
    Ringing,
    /// Call established, media flowing
    Active,
    /// Call finished normally or was cancelled
    Ended,
    /// Inbound call declined locally
    Rejected,
    /// Call aborted by a media or negotiation error
    Failed,
}

impl CallState {
    /// Whether this state holds media and negotiation resources
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ringing | Self::Active)
    }

    /// Whether this is a terminal state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Failed)
    }
}

/// A session description produced or consumed during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// Raw SDP text
    pub sdp: String,
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Proposed session parameters
    Offer,
    /// Response to an offer
    Answer,
}

/// One proposed network path for the media session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u32>,
}

/// Message identifier with a two-namespace rule
///
/// Server-assigned ids are authoritative. Local ids are generated for
/// optimistic sends and carry a `local:` prefix on the wire so a later
/// server copy can be matched and substituted rather than appended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageId {
    /// Id assigned by the server
    Server(String),
    /// Temporary id assigned locally before confirmation
    Local(Uuid),
}

impl MessageId {
    /// Generate a fresh temporary id
    pub fn new_local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    /// Whether this id is still in the temporary namespace
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MessageId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.strip_prefix("local:") {
            Some(raw) => Ok(Self::Local(Uuid::parse_str(raw)?)),
            None => Ok(Self::Server(s)),
        }
    }
}

/// Delivery status of a message
///
/// Monotonic except `Failed`, which is terminal for the local copy. A
/// late server confirmation may still regress `Failed` back to `Sent`
/// by substituting the server copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Optimistic local copy, not yet confirmed
    Sending,
    /// Accepted by the server
    Sent,
    /// Delivered to the recipient's device
    Delivered,
    /// Seen by the recipient
    Read,
    /// Transport failure; retry creates a new message
    Failed,
}

impl MessageStatus {
    /// Ordering rank for monotonic upgrades
    fn rank(self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }

    /// Apply a status update, keeping the progression monotonic
    ///
    /// `Failed` never upgrades into delivery states here; the only way
    /// out of `Failed` is substitution by a server copy.
    #[must_use]
    pub fn upgraded_to(self, next: Self) -> Self {
        if self == Self::Failed || next == Self::Failed {
            return if next == Self::Failed { Self::Failed } else { self };
        }
        if next.rank() > self.rank() {
            next
        } else {
            self
        }
    }
}

/// Kind of message content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text
    Text,
    /// Image URL with the text field as caption
    Image,
}

/// One chat entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identifier (server or temporary local namespace)
    pub id: MessageId,
    /// Conversation this message belongs to
    pub conversation_id: ConversationId,
    /// Sender identity
    pub sender_id: UserId,
    /// Content kind
    pub message_type: MessageType,
    /// Content payload (text, or image URL)
    pub content: String,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Delivery status
    pub status: MessageStatus,
}

/// Conversation metadata as served by the REST collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation identifier
    pub id: ConversationId,
    /// The other participant
    pub peer: Profile,
    /// Timestamp of the most recent message, if any
    pub last_message_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_uniqueness() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_message_id_namespaces() {
        let local = MessageId::new_local();
        assert!(local.is_local());
        assert!(local.to_string().starts_with("local:"));

        let server = MessageId::Server("m-42".to_string());
        assert!(!server.is_local());
        assert_eq!(server.to_string(), "m-42");
    }

    #[test]
    fn test_message_id_round_trip() {
        let local = MessageId::new_local();
        let parsed = MessageId::try_from(local.to_string()).unwrap();
        assert_eq!(parsed, local);

        let server = MessageId::Server("abc123".to_string());
        let parsed = MessageId::try_from(server.to_string()).unwrap();
        assert_eq!(parsed, server);
    }

    #[test]
    fn test_message_id_serde_as_string() {
        let server = MessageId::Server("m-7".to_string());
        let json = serde_json::to_string(&server).unwrap();
        assert_eq!(json, "\"m-7\"");

        let local = MessageId::Local(Uuid::nil());
        let json = serde_json::to_string(&local).unwrap();
        assert_eq!(json, format!("\"local:{}\"", Uuid::nil()));
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, local);
    }

    #[test]
    fn test_status_monotonic() {
        assert_eq!(
            MessageStatus::Sending.upgraded_to(MessageStatus::Sent),
            MessageStatus::Sent
        );
        assert_eq!(
            MessageStatus::Read.upgraded_to(MessageStatus::Delivered),
            MessageStatus::Read
        );
        assert_eq!(
            MessageStatus::Delivered.upgraded_to(MessageStatus::Read),
            MessageStatus::Read
        );
    }

    #[test]
    fn test_status_failed_is_terminal() {
        assert_eq!(
            MessageStatus::Failed.upgraded_to(MessageStatus::Sent),
            MessageStatus::Failed
        );
        assert_eq!(
            MessageStatus::Sending.upgraded_to(MessageStatus::Failed),
            MessageStatus::Failed
        );
    }

    #[test]
    fn test_call_state_classification() {
        assert!(CallState::Ringing.is_live());
        assert!(CallState::Active.is_live());
        assert!(!CallState::Idle.is_live());
        assert!(CallState::Ended.is_terminal());
        assert!(CallState::Rejected.is_terminal());
        assert!(CallState::Failed.is_terminal());
        assert!(!CallState::Active.is_terminal());
    }
}
