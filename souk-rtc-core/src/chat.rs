//! Chat store
//!
//! Holds conversation state and reconciles three sources of truth:
//! optimistic local sends, live room broadcasts from the channel, and
//! paginated REST history. Sends are optimistic: the message appears
//! immediately under a temporary local id with status `Sending`, and
//! the server's room broadcast of the same message substitutes the
//! authoritative copy in place rather than appending a duplicate.
//!
//! Exactly one conversation room is joined at a time, following the
//! selection; history for unselected conversations still updates
//! unread counts when broadcasts arrive.

use crate::api::{ApiError, ConversationApi};
use crate::cache::{CacheError, MessageCache};
use crate::channel::Channel;
use crate::types::{
    ConversationId, ConversationSummary, Message, MessageId, MessageStatus, MessageType, Profile,
    UserId,
};
use crate::wire::{ClientEvent, ServerEvent};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Chat store errors
#[derive(Error, Debug)]
pub enum ChatError {
    /// REST collaborator failure
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Cache failure serious enough to surface
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The conversation is not known to this store
    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    /// The message is not present in the conversation
    #[error("no such message: {0}")]
    NoSuchMessage(MessageId),

    /// Retry is only valid for failed messages
    #[error("message {0} has not failed")]
    NotFailed(MessageId),
}

/// Chat store configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// History page size for REST fetches
    pub page_size: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

/// Chat notifications for the UI layer
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// The conversation list changed
    ConversationsUpdated,
    /// A conversation's message list or unread count changed
    MessagesUpdated {
        /// Which conversation changed
        conversation_id: ConversationId,
    },
}

struct Conversation {
    summary: ConversationSummary,
    /// Oldest first
    messages: Vec<Message>,
    unread: u32,
    /// Next REST history page to fetch; pages start at 1
    next_page: u32,
    has_more: bool,
    loading_more: bool,
}

impl Conversation {
    fn new(summary: ConversationSummary) -> Self {
        Self {
            summary,
            messages: Vec::new(),
            unread: 0,
            next_page: 1,
            has_more: true,
            loading_more: false,
        }
    }
}

#[derive(Default)]
struct ChatState {
    conversations: HashMap<ConversationId, Conversation>,
    selected: Option<ConversationId>,
}

/// The chat store
pub struct ChatStore {
    me: UserId,
    channel: Arc<Channel>,
    api: Arc<dyn ConversationApi>,
    cache: Arc<MessageCache>,
    config: ChatConfig,
    state: RwLock<ChatState>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatStore {
    /// Create a chat store for the given local user
    #[must_use]
    pub fn new(
        me: UserId,
        channel: Arc<Channel>,
        api: Arc<dyn ConversationApi>,
        cache: Arc<MessageCache>,
        config: ChatConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            me,
            channel,
            api,
            cache,
            config,
            state: RwLock::new(ChatState::default()),
            events,
        }
    }

    /// Subscribe to chat notifications
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Load the conversation list from the authoritative store
    ///
    /// Existing in-memory messages survive a re-bootstrap; only the
    /// summaries are refreshed.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] when the fetch fails.
    pub async fn bootstrap(&self) -> Result<(), ChatError> {
        let summaries = self.api.conversations().await?;
        {
            let mut state = self.state.write();
            for summary in summaries {
                match state.conversations.entry(summary.id.clone()) {
                    Entry::Occupied(mut entry) => entry.get_mut().summary = summary,
                    Entry::Vacant(entry) => {
                        entry.insert(Conversation::new(summary));
                    }
                }
            }
        }
        let _ = self.events.send(ChatEvent::ConversationsUpdated);
        Ok(())
    }

    /// Create (or fetch) the direct conversation with a peer
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] when the request fails.
    pub async fn start_conversation(&self, peer: &UserId) -> Result<ConversationId, ChatError> {
        let summary = self.api.create_conversation(peer).await?;
        let id = summary.id.clone();
        {
            let mut state = self.state.write();
            state
                .conversations
                .entry(id.clone())
                .or_insert_with(|| Conversation::new(summary));
        }
        let _ = self.events.send(ChatEvent::ConversationsUpdated);
        Ok(id)
    }

    /// Conversation summaries, most recently active first
    #[must_use]
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        let state = self.state.read();
        let mut summaries: Vec<ConversationSummary> = state
            .conversations
            .values()
            .map(|c| c.summary.clone())
            .collect();
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        summaries
    }

    /// Messages of a conversation, oldest first
    #[must_use]
    pub fn messages(&self, id: &ConversationId) -> Vec<Message> {
        self.state
            .read()
            .conversations
            .get(id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Unread count of a conversation
    #[must_use]
    pub fn unread(&self, id: &ConversationId) -> u32 {
        self.state
            .read()
            .conversations
            .get(id)
            .map_or(0, |c| c.unread)
    }

    /// Whether older history pages remain for a conversation
    #[must_use]
    pub fn has_more(&self, id: &ConversationId) -> bool {
        self.state
            .read()
            .conversations
            .get(id)
            .is_some_and(|c| c.has_more)
    }

    /// The currently selected conversation
    #[must_use]
    pub fn selected(&self) -> Option<ConversationId> {
        self.state.read().selected.clone()
    }

    /// Select a conversation: join its room, render from cache, then
    /// reconcile against the authoritative first page
    ///
    /// The cached snapshot is published before the network round-trip
    /// so the conversation renders instantly; the REST fetch then
    /// merges over it, with server copies winning on id conflicts.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownConversation`] for an id the store
    /// has never seen, or [`ChatError::Api`] when the authoritative
    /// fetch fails (the cached view remains usable).
    pub async fn select_conversation(&self, id: &ConversationId) -> Result<(), ChatError> {
        {
            let mut state = self.state.write();
            if !state.conversations.contains_key(id) {
                return Err(ChatError::UnknownConversation(id.clone()));
            }
            if let Some(previous) = state.selected.take() {
                if previous != *id {
                    let _ = self.channel.emit(ClientEvent::LeaveConversation {
                        conversation_id: previous,
                    });
                }
            }
            state.selected = Some(id.clone());
        }
        let _ = self.channel.emit(ClientEvent::JoinConversation {
            conversation_id: id.clone(),
        });

        if let Err(e) = self.cache.touch_conversation(id) {
            tracing::warn!(conversation = %id, error = %e, "cache touch failed");
        }
        match self.cache.load_messages(id) {
            Ok(cached) if !cached.is_empty() => {
                let mut state = self.state.write();
                if let Some(convo) = state.conversations.get_mut(id) {
                    convo.messages = merge_messages(std::mem::take(&mut convo.messages), cached);
                }
                drop(state);
                self.notify(id);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(conversation = %id, error = %e, "cache read failed"),
        }

        let page = self.api.messages(id, 1, self.config.page_size).await?;
        let full_page = page.len() as u32 >= self.config.page_size;
        // REST pages are newest first; the store keeps oldest first.
        let mut fetched = page;
        fetched.reverse();

        let merged = {
            let mut state = self.state.write();
            let convo = state
                .conversations
                .get_mut(id)
                .ok_or_else(|| ChatError::UnknownConversation(id.clone()))?;
            convo.messages = merge_messages(std::mem::take(&mut convo.messages), fetched);
            convo.next_page = 2;
            convo.has_more = full_page;
            convo.messages.clone()
        };
        if let Err(e) = self.cache.replace_messages(id, &merged) {
            tracing::warn!(conversation = %id, error = %e, "cache write failed");
        }
        self.notify(id);
        Ok(())
    }

    /// Deselect the current conversation and leave its room
    pub fn leave_conversation(&self) {
        let previous = self.state.write().selected.take();
        if let Some(id) = previous {
            let _ = self
                .channel
                .emit(ClientEvent::LeaveConversation { conversation_id: id });
        }
    }

    /// Fetch the next older history page for a conversation
    ///
    /// A no-op when all history is loaded or a fetch is already in
    /// flight.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] when the fetch fails; the in-flight
    /// guard is released so the page can be retried.
    pub async fn load_more(&self, id: &ConversationId) -> Result<(), ChatError> {
        let page = {
            let mut state = self.state.write();
            let convo = state
                .conversations
                .get_mut(id)
                .ok_or_else(|| ChatError::UnknownConversation(id.clone()))?;
            if !convo.has_more || convo.loading_more {
                return Ok(());
            }
            convo.loading_more = true;
            convo.next_page
        };

        let fetched = match self.api.messages(id, page, self.config.page_size).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let mut state = self.state.write();
                if let Some(convo) = state.conversations.get_mut(id) {
                    convo.loading_more = false;
                }
                return Err(e.into());
            }
        };
        let full_page = fetched.len() as u32 >= self.config.page_size;
        let mut older = fetched;
        older.reverse();

        {
            let mut state = self.state.write();
            if let Some(convo) = state.conversations.get_mut(id) {
                convo.messages = merge_messages(std::mem::take(&mut convo.messages), older);
                convo.next_page = page + 1;
                convo.has_more = full_page;
                convo.loading_more = false;
            }
        }
        self.notify(id);
        Ok(())
    }

    /// Send a message optimistically
    ///
    /// The message is appended with a temporary local id and status
    /// `Sending` before anything touches the wire, so the server echo
    /// always finds the optimistic copy in place. If the channel is
    /// down the copy is marked `Failed`; the id is returned either way
    /// so the caller can offer a retry.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownConversation`] for an id the store
    /// has never seen.
    pub fn send_message(
        &self,
        id: &ConversationId,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Result<MessageId, ChatError> {
        let content = content.into();
        let message = Message {
            id: MessageId::new_local(),
            conversation_id: id.clone(),
            sender_id: self.me.clone(),
            message_type,
            content: content.clone(),
            timestamp: Utc::now(),
            status: MessageStatus::Sending,
        };

        {
            let mut state = self.state.write();
            let convo = state
                .conversations
                .get_mut(id)
                .ok_or_else(|| ChatError::UnknownConversation(id.clone()))?;
            convo.summary.last_message_at = Some(message.timestamp);
            convo.messages.push(message.clone());
        }
        if let Err(e) = self.cache.upsert_message(&message) {
            tracing::warn!(conversation = %id, error = %e, "cache write failed");
        }
        self.notify(id);

        let emitted = self.channel.emit(ClientEvent::SendMessage {
            conversation_id: id.clone(),
            content,
            message_type,
        });
        if emitted.is_err() {
            self.fail_in_place(id, &message.id);
        }
        Ok(message.id)
    }

    /// Flip one optimistic copy to `Failed` and republish it
    fn fail_in_place(&self, id: &ConversationId, message_id: &MessageId) {
        let failed = {
            let mut state = self.state.write();
            state
                .conversations
                .get_mut(id)
                .and_then(|convo| convo.messages.iter_mut().find(|m| m.id == *message_id))
                .map(|m| {
                    m.status = MessageStatus::Failed;
                    m.clone()
                })
        };
        if let Some(failed) = failed {
            if let Err(e) = self.cache.upsert_message(&failed) {
                tracing::warn!(conversation = %id, error = %e, "cache write failed");
            }
            self.notify(id);
        }
    }

    /// Retry a failed send as a brand-new message
    ///
    /// The failed copy is removed; the retry gets a fresh local id so
    /// server-side substitution works exactly as for a first send.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoSuchMessage`] when the id is not in the
    /// conversation, or [`ChatError::NotFailed`] when the message did
    /// not fail.
    pub fn retry_message(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<MessageId, ChatError> {
        let (content, message_type) = {
            let mut state = self.state.write();
            let convo = state
                .conversations
                .get_mut(id)
                .ok_or_else(|| ChatError::UnknownConversation(id.clone()))?;
            let position = convo
                .messages
                .iter()
                .position(|m| m.id == *message_id)
                .ok_or_else(|| ChatError::NoSuchMessage(message_id.clone()))?;
            if convo.messages[position].status != MessageStatus::Failed {
                return Err(ChatError::NotFailed(message_id.clone()));
            }
            let removed = convo.messages.remove(position);
            (removed.content, removed.message_type)
        };
        if let Err(e) = self.cache.remove_message(id, message_id) {
            tracing::warn!(conversation = %id, error = %e, "cache delete failed");
        }
        self.send_message(id, content, message_type)
    }

    /// Mark every unseen incoming message as read
    ///
    /// Emits one read receipt per message (ignored when the channel is
    /// down; the selection resync covers missed receipts) and zeroes
    /// the unread counter.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownConversation`] for an id the store
    /// has never seen.
    pub fn mark_read(&self, id: &ConversationId) -> Result<(), ChatError> {
        let unseen: Vec<MessageId> = {
            let mut state = self.state.write();
            let convo = state
                .conversations
                .get_mut(id)
                .ok_or_else(|| ChatError::UnknownConversation(id.clone()))?;
            convo.unread = 0;
            convo
                .messages
                .iter_mut()
                .filter(|m| m.sender_id != self.me && m.status != MessageStatus::Read)
                .map(|m| {
                    m.status = MessageStatus::Read;
                    m.id.clone()
                })
                .collect()
        };
        for message_id in unseen {
            let _ = self
                .channel
                .emit(ClientEvent::MessageRead { message_id });
        }
        self.notify(id);
        Ok(())
    }

    /// Broadcast a typing indicator for a conversation
    ///
    /// Best effort: a dead channel swallows the signal.
    pub fn set_typing(&self, id: &ConversationId, typing: bool) {
        let event = if typing {
            ClientEvent::UserTyping {
                conversation_id: id.clone(),
            }
        } else {
            ClientEvent::UserStoppedTyping {
                conversation_id: id.clone(),
            }
        };
        let _ = self.channel.emit(event);
    }

    /// React to a chat event from the channel
    pub fn handle_server_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::NewMessage { message } => self.handle_new_message(message.clone()),
            ServerEvent::MessageDelivered { message_id } => {
                self.apply_status(message_id, MessageStatus::Delivered);
            }
            ServerEvent::MessageRead { message_id } => {
                self.apply_status(message_id, MessageStatus::Read);
            }
            _ => {}
        }
    }

    /// Resync after the channel reconnected
    ///
    /// Rejoins the selected room, then reconciles the selected
    /// conversation against the authoritative first page to pick up
    /// anything missed during the outage.
    pub async fn handle_reconnected(&self) {
        let selected = self.selected();
        let Some(id) = selected else { return };
        let _ = self.channel.emit(ClientEvent::JoinConversation {
            conversation_id: id.clone(),
        });

        match self.api.messages(&id, 1, self.config.page_size).await {
            Ok(page) => {
                let mut fetched = page;
                fetched.reverse();
                let merged = {
                    let mut state = self.state.write();
                    match state.conversations.get_mut(&id) {
                        Some(convo) => {
                            convo.messages =
                                merge_messages(std::mem::take(&mut convo.messages), fetched);
                            convo.messages.clone()
                        }
                        None => return,
                    }
                };
                if let Err(e) = self.cache.replace_messages(&id, &merged) {
                    tracing::warn!(conversation = %id, error = %e, "cache write failed");
                }
                self.notify(&id);
            }
            Err(e) => {
                tracing::warn!(conversation = %id, error = %e, "resync fetch failed");
            }
        }
    }

    /// Degrade in-flight optimistic sends after the channel dropped
    ///
    /// A queued send the wire may never have delivered cannot stay
    /// `Sending` forever; `Failed` makes it retryable. If the server
    /// did receive it, the echo after reconnect substitutes the copy
    /// and restores the delivered status.
    pub fn handle_disconnected(&self) {
        let stalled: Vec<Message> = {
            let mut state = self.state.write();
            let mut stalled = Vec::new();
            for convo in state.conversations.values_mut() {
                for message in &mut convo.messages {
                    if message.id.is_local() && message.status == MessageStatus::Sending {
                        message.status = MessageStatus::Failed;
                        stalled.push(message.clone());
                    }
                }
            }
            stalled
        };
        for message in &stalled {
            if let Err(e) = self.cache.upsert_message(message) {
                tracing::warn!(
                    conversation = %message.conversation_id,
                    error = %e,
                    "cache write failed"
                );
            }
        }
        let mut notified = HashSet::new();
        for message in stalled {
            if notified.insert(message.conversation_id.clone()) {
                self.notify(&message.conversation_id);
            }
        }
    }

    fn handle_new_message(&self, message: Message) {
        let id = message.conversation_id.clone();
        let own = message.sender_id == self.me;
        let substituted_local: Option<MessageId>;
        {
            let mut state = self.state.write();
            let selected = state.selected.clone();
            if !state.conversations.contains_key(&id) {
                if own {
                    return;
                }
                // First contact: a room broadcast can precede the
                // conversation list refresh. Synthesize a summary from
                // the sender until bootstrap catches up.
                let sender = message.sender_id.as_str();
                let summary = ConversationSummary {
                    id: id.clone(),
                    peer: Profile::new(sender, sender),
                    last_message_at: None,
                };
                state
                    .conversations
                    .insert(id.clone(), Conversation::new(summary));
            }
            let Some(convo) = state.conversations.get_mut(&id) else {
                return;
            };

            if convo.messages.iter().any(|m| m.id == message.id) {
                // Duplicate delivery; at-least-once is expected.
                return;
            }

            if own {
                // Substitution: the broadcast is the confirmation of
                // our earliest unconfirmed optimistic copy. A copy
                // degraded to `Failed` by a disconnect qualifies too;
                // the late echo proves the send did land.
                let local = convo.messages.iter().position(|m| {
                    m.id.is_local()
                        && matches!(m.status, MessageStatus::Sending | MessageStatus::Failed)
                        && m.content == message.content
                        && m.message_type == message.message_type
                });
                match local {
                    Some(position) => {
                        substituted_local = Some(convo.messages[position].id.clone());
                        convo.messages[position] = message.clone();
                    }
                    None => {
                        // Sent from another device, or the local copy
                        // already resolved. Append in order.
                        substituted_local = None;
                        convo.messages.push(message.clone());
                    }
                }
            } else {
                substituted_local = None;
                convo.messages.push(message.clone());
                if selected.as_ref() != Some(&id) {
                    convo.unread += 1;
                }
            }
            convo
                .messages
                .sort_by(|a, b| (a.timestamp, a.id.to_string()).cmp(&(b.timestamp, b.id.to_string())));
            convo.summary.last_message_at = Some(
                convo
                    .summary
                    .last_message_at
                    .map_or(message.timestamp, |t| t.max(message.timestamp)),
            );
        }

        if let Some(old_id) = substituted_local {
            if let Err(e) = self.cache.remove_message(&id, &old_id) {
                tracing::warn!(conversation = %id, error = %e, "cache delete failed");
            }
        }
        if let Err(e) = self.cache.upsert_message(&message) {
            tracing::warn!(conversation = %id, error = %e, "cache write failed");
        }
        self.notify(&id);
        let _ = self.events.send(ChatEvent::ConversationsUpdated);
    }

    fn apply_status(&self, message_id: &MessageId, next: MessageStatus) {
        let updated: Option<(ConversationId, Message)> = {
            let mut state = self.state.write();
            let mut found = None;
            for (id, convo) in &mut state.conversations {
                if let Some(message) =
                    convo.messages.iter_mut().find(|m| m.id == *message_id)
                {
                    message.status = message.status.upgraded_to(next);
                    found = Some((id.clone(), message.clone()));
                    break;
                }
            }
            found
        };
        if let Some((id, message)) = updated {
            if let Err(e) = self.cache.upsert_message(&message) {
                tracing::warn!(conversation = %id, error = %e, "cache write failed");
            }
            self.notify(&id);
        }
    }

    fn notify(&self, id: &ConversationId) {
        let _ = self.events.send(ChatEvent::MessagesUpdated {
            conversation_id: id.clone(),
        });
    }
}

/// Merge two message lists keyed by id
///
/// On id conflict the `incoming` copy wins (it is the more
/// authoritative source at every call site). The result is sorted by
/// timestamp with the id as tiebreaker, so merging is deterministic
/// regardless of arrival interleaving.
pub(crate) fn merge_messages(existing: Vec<Message>, incoming: Vec<Message>) -> Vec<Message> {
    let mut by_id: HashMap<MessageId, Message> = HashMap::with_capacity(existing.len());
    let mut order: Vec<MessageId> = Vec::with_capacity(existing.len() + incoming.len());
    for message in existing {
        if !by_id.contains_key(&message.id) {
            order.push(message.id.clone());
        }
        by_id.insert(message.id.clone(), message);
    }
    for message in incoming {
        if !by_id.contains_key(&message.id) {
            order.push(message.id.clone());
        }
        by_id.insert(message.id.clone(), message);
    }
    let mut merged: Vec<Message> = order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect();
    merged.sort_by(|a, b| (a.timestamp, a.id.to_string()).cmp(&(b.timestamp, b.id.to_string())));
    merged
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn message(id: &str, ts_ms: i64, content: &str) -> Message {
        Message {
            id: MessageId::Server(id.to_string()),
            conversation_id: ConversationId::from("c1"),
            sender_id: UserId::from("alice"),
            message_type: MessageType::Text,
            content: content.to_string(),
            timestamp: Utc.timestamp_millis_opt(ts_ms).single().unwrap(),
            status: MessageStatus::Sent,
        }
    }

    #[test]
    fn test_merge_dedupes_and_sorts() {
        let existing = vec![message("m1", 1_000, "a"), message("m3", 3_000, "c")];
        let incoming = vec![message("m2", 2_000, "b"), message("m3", 3_000, "c")];
        let merged = merge_messages(existing, incoming);
        let ids: Vec<String> = merged.iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_merge_incoming_wins_on_conflict() {
        let mut stale = message("m1", 1_000, "a");
        stale.status = MessageStatus::Sending;
        let mut fresh = message("m1", 1_000, "a");
        fresh.status = MessageStatus::Read;

        let merged = merge_messages(vec![stale], vec![fresh]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, MessageStatus::Read);
    }

    #[test]
    fn test_merge_keeps_local_optimistic_copies() {
        let mut local = message("ignored", 5_000, "pending");
        local.id = MessageId::new_local();
        local.status = MessageStatus::Sending;

        let merged = merge_messages(vec![local.clone()], vec![message("m1", 1_000, "a")]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].id, local.id);
    }

    proptest! {
        #[test]
        fn prop_merge_is_deduped_and_ordered(
            a_ids in proptest::collection::vec(0u32..20, 0..12),
            b_ids in proptest::collection::vec(0u32..20, 0..12),
        ) {
            let make = |ids: &[u32]| -> Vec<Message> {
                ids.iter()
                    .map(|i| message(&format!("m{i}"), i64::from(*i) * 1_000, "x"))
                    .collect()
            };
            let merged = merge_messages(make(&a_ids), make(&b_ids));

            // No duplicate ids survive.
            let mut seen = std::collections::HashSet::new();
            for m in &merged {
                prop_assert!(seen.insert(m.id.clone()));
            }
            // Timestamps are non-decreasing.
            for pair in merged.windows(2) {
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }
            // Merging again with the same input changes nothing.
            let again = merge_messages(merged.clone(), make(&b_ids));
            prop_assert_eq!(again, merged);
        }
    }
}
