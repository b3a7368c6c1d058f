//! Wire contract for the event-multiplexed channel
//!
//! Events are JSON envelopes tagged by event name. The same logical
//! pipe carries call signaling, chat, and presence traffic; the tag is
//! the `event` field and payload fields are camelCase, matching the
//! server's contract.

use crate::types::{
    CallId, ConversationId, IceCandidate, MediaKind, Message, MessageId, MessageType, Profile,
    SessionDescription, UserId,
};
use serde::{Deserialize, Serialize};

/// Events emitted by this client toward the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
    /// Propose a call to another user
    #[serde(rename = "call:offer", rename_all = "camelCase")]
    CallOffer {
        /// Call identifier, generated by the caller
        call_id: CallId,
        /// Who is being called
        target_user_id: UserId,
        /// Local session description
        offer: SessionDescription,
        /// Audio or video
        media_kind: MediaKind,
    },

    /// Answer an incoming call
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    CallAnswer {
        /// Call identifier from the offer
        call_id: CallId,
        /// Local session description
        answer: SessionDescription,
    },

    /// Forward one locally-gathered network candidate
    #[serde(rename = "call:candidate", rename_all = "camelCase")]
    CallCandidate {
        /// Call identifier
        call_id: CallId,
        /// The counterparty the candidate is for
        target_user_id: UserId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Decline an incoming call
    #[serde(rename = "call:reject", rename_all = "camelCase")]
    CallReject {
        /// Call identifier
        call_id: CallId,
    },

    /// End a ringing or active call
    #[serde(rename = "call:end", rename_all = "camelCase")]
    CallEnd {
        /// Call identifier
        call_id: CallId,
        /// Human-readable reason
        reason: String,
    },

    /// Join a conversation room for live updates
    #[serde(rename = "join_conversation", rename_all = "camelCase")]
    JoinConversation {
        /// Conversation to join
        conversation_id: ConversationId,
    },

    /// Leave a conversation room
    #[serde(rename = "leave_conversation", rename_all = "camelCase")]
    LeaveConversation {
        /// Conversation to leave
        conversation_id: ConversationId,
    },

    /// Send a chat message
    #[serde(rename = "send_message", rename_all = "camelCase")]
    SendMessage {
        /// Target conversation
        conversation_id: ConversationId,
        /// Content payload
        content: String,
        /// Content kind
        message_type: MessageType,
    },

    /// Mark a message as read
    #[serde(rename = "message_read", rename_all = "camelCase")]
    MessageRead {
        /// The message that was read
        message_id: MessageId,
    },

    /// Signal that this user started typing
    #[serde(rename = "user_typing", rename_all = "camelCase")]
    UserTyping {
        /// Conversation being typed in
        conversation_id: ConversationId,
    },

    /// Signal that this user stopped typing
    #[serde(rename = "user_stopped_typing", rename_all = "camelCase")]
    UserStoppedTyping {
        /// Conversation no longer being typed in
        conversation_id: ConversationId,
    },
}

/// Events delivered by the server to this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    /// An incoming call offer
    #[serde(rename = "call:offer", rename_all = "camelCase")]
    CallOffer {
        /// Call identifier, generated by the caller
        call_id: CallId,
        /// Who is calling
        caller: Profile,
        /// The caller's session description
        offer: SessionDescription,
        /// Audio or video
        media_kind: MediaKind,
    },

    /// The callee answered our offer
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    CallAnswer {
        /// Call identifier
        call_id: CallId,
        /// The callee's session description
        answer: SessionDescription,
    },

    /// A network candidate from the counterparty
    #[serde(rename = "call:candidate", rename_all = "camelCase")]
    CallCandidate {
        /// Call identifier
        call_id: CallId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// The callee declined our offer
    #[serde(rename = "call:reject", rename_all = "camelCase")]
    CallReject {
        /// Call identifier
        call_id: CallId,
    },

    /// The counterparty ended the call
    #[serde(rename = "call:end", rename_all = "camelCase")]
    CallEnd {
        /// Call identifier
        call_id: CallId,
        /// Human-readable reason
        reason: String,
    },

    /// A new message in a joined conversation room
    ///
    /// Also the confirmation path for our own optimistic sends: the
    /// server broadcast carries the real id.
    #[serde(rename = "new_message", rename_all = "camelCase")]
    NewMessage {
        /// The server-confirmed message
        message: Message,
    },

    /// A previously sent message reached the recipient's device
    #[serde(rename = "message_delivered", rename_all = "camelCase")]
    MessageDelivered {
        /// The delivered message
        message_id: MessageId,
    },

    /// A previously sent message was read
    #[serde(rename = "message_read", rename_all = "camelCase")]
    MessageRead {
        /// The read message
        message_id: MessageId,
    },

    /// Another user started typing
    #[serde(rename = "user_typing", rename_all = "camelCase")]
    UserTyping {
        /// Who is typing
        user_id: UserId,
        /// Where they are typing
        conversation_id: ConversationId,
    },

    /// Another user stopped typing
    #[serde(rename = "user_stopped_typing", rename_all = "camelCase")]
    UserStoppedTyping {
        /// Who stopped typing
        user_id: UserId,
        /// Where they stopped typing
        conversation_id: ConversationId,
    },

    /// Snapshot of currently online users, sent on connect
    #[serde(rename = "online_users", rename_all = "camelCase")]
    OnlineUsers {
        /// Everyone currently online
        user_ids: Vec<UserId>,
    },

    /// A user came online
    #[serde(rename = "user_online", rename_all = "camelCase")]
    UserOnline {
        /// Who came online
        user_id: UserId,
    },

    /// A user went offline
    #[serde(rename = "user_offline", rename_all = "camelCase")]
    UserOffline {
        /// Who went offline
        user_id: UserId,
    },
}

impl ClientEvent {
    /// Event name, for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallOffer { .. } => "call:offer",
            Self::CallAnswer { .. } => "call:answer",
            Self::CallCandidate { .. } => "call:candidate",
            Self::CallReject { .. } => "call:reject",
            Self::CallEnd { .. } => "call:end",
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::SendMessage { .. } => "send_message",
            Self::MessageRead { .. } => "message_read",
            Self::UserTyping { .. } => "user_typing",
            Self::UserStoppedTyping { .. } => "user_stopped_typing",
        }
    }
}

impl ServerEvent {
    /// Event name, for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallOffer { .. } => "call:offer",
            Self::CallAnswer { .. } => "call:answer",
            Self::CallCandidate { .. } => "call:candidate",
            Self::CallReject { .. } => "call:reject",
            Self::CallEnd { .. } => "call:end",
            Self::NewMessage { .. } => "new_message",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageRead { .. } => "message_read",
            Self::UserTyping { .. } => "user_typing",
            Self::UserStoppedTyping { .. } => "user_stopped_typing",
            Self::OnlineUsers { .. } => "online_users",
            Self::UserOnline { .. } => "user_online",
            Self::UserOffline { .. } => "user_offline",
        }
    }

    /// Whether this event belongs to the call-signaling family
    #[must_use]
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            Self::CallOffer { .. }
                | Self::CallAnswer { .. }
                | Self::CallCandidate { .. }
                | Self::CallReject { .. }
                | Self::CallEnd { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SdpKind;

    #[test]
    fn test_call_offer_envelope() {
        let event = ClientEvent::CallOffer {
            call_id: CallId::new(),
            target_user_id: UserId::new("u-2"),
            offer: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".to_string(),
            },
            media_kind: MediaKind::Video,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"call:offer\""));
        assert!(json.contains("\"targetUserId\":\"u-2\""));
        assert!(json.contains("\"mediaKind\":\"video\""));

        let back: ClientEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_send_message_envelope() {
        let event = ClientEvent::SendMessage {
            conversation_id: ConversationId::new("c-1"),
            content: "hi".to_string(),
            message_type: MessageType::Text,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"send_message\""));
        assert!(json.contains("\"conversationId\":\"c-1\""));
        assert!(json.contains("\"messageType\":\"text\""));
    }

    #[test]
    fn test_server_event_signaling_classification() {
        let end = ServerEvent::CallEnd {
            call_id: CallId::new(),
            reason: "hangup".to_string(),
        };
        assert!(end.is_signaling());

        let online = ServerEvent::UserOnline {
            user_id: UserId::new("u-9"),
        };
        assert!(!online.is_signaling());
    }

    #[test]
    fn test_unknown_event_rejected() {
        let raw = r#"{"event":"call:mute","callId":"x"}"#;
        let parsed: Result<ServerEvent, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }
}
