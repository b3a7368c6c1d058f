//! Presence tracking
//!
//! Mirrors the server's view of who is online and who is typing
//! where. State is rebuilt from the `online_users` snapshot on every
//! connect, so presence self-heals after an outage.

use crate::types::{ConversationId, UserId};
use crate::wire::ServerEvent;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;

/// Presence notifications for the UI layer
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// A user's online status changed (or the snapshot was replaced)
    OnlineChanged,
    /// The typing set of a conversation changed
    TypingChanged {
        /// Which conversation's typing set changed
        conversation_id: ConversationId,
    },
}

#[derive(Default)]
struct PresenceState {
    online: HashSet<UserId>,
    typing: HashMap<ConversationId, HashSet<UserId>>,
}

/// Tracks online and typing state of other users
pub struct PresenceTracker {
    state: RwLock<PresenceState>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(PresenceState::default()),
            events,
        }
    }

    /// Subscribe to presence notifications
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Whether a user is currently online
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.state.read().online.contains(user)
    }

    /// Everyone currently online
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.state.read().online.iter().cloned().collect()
    }

    /// Who is typing in a conversation
    #[must_use]
    pub fn typing_in(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.state
            .read()
            .typing
            .get(conversation)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// React to a presence event from the channel
    pub fn handle_server_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::OnlineUsers { user_ids } => {
                let mut state = self.state.write();
                state.online = user_ids.iter().cloned().collect();
                drop(state);
                let _ = self.events.send(PresenceEvent::OnlineChanged);
            }
            ServerEvent::UserOnline { user_id } => {
                let changed = self.state.write().online.insert(user_id.clone());
                if changed {
                    let _ = self.events.send(PresenceEvent::OnlineChanged);
                }
            }
            ServerEvent::UserOffline { user_id } => {
                let touched = {
                    let mut state = self.state.write();
                    let was_online = state.online.remove(user_id);
                    // A disconnected user stops typing everywhere.
                    let mut cleared = Vec::new();
                    for (conversation, typers) in &mut state.typing {
                        if typers.remove(user_id) {
                            cleared.push(conversation.clone());
                        }
                    }
                    state.typing.retain(|_, typers| !typers.is_empty());
                    (was_online, cleared)
                };
                if touched.0 {
                    let _ = self.events.send(PresenceEvent::OnlineChanged);
                }
                for conversation_id in touched.1 {
                    let _ = self
                        .events
                        .send(PresenceEvent::TypingChanged { conversation_id });
                }
            }
            ServerEvent::UserTyping {
                user_id,
                conversation_id,
            } => {
                let changed = self
                    .state
                    .write()
                    .typing
                    .entry(conversation_id.clone())
                    .or_default()
                    .insert(user_id.clone());
                if changed {
                    let _ = self.events.send(PresenceEvent::TypingChanged {
                        conversation_id: conversation_id.clone(),
                    });
                }
            }
            ServerEvent::UserStoppedTyping {
                user_id,
                conversation_id,
            } => {
                let changed = {
                    let mut state = self.state.write();
                    match state.typing.get_mut(conversation_id) {
                        Some(typers) => {
                            let removed = typers.remove(user_id);
                            if typers.is_empty() {
                                state.typing.remove(conversation_id);
                            }
                            removed
                        }
                        None => false,
                    }
                };
                if changed {
                    let _ = self.events.send(PresenceEvent::TypingChanged {
                        conversation_id: conversation_id.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    /// Drop all state, used when the channel disconnects
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.online.clear();
        state.typing.clear();
        drop(state);
        let _ = self.events.send(PresenceEvent::OnlineChanged);
    }
}
