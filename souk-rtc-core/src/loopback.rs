//! In-process loopback implementations of every collaborator seam
//!
//! A [`LoopbackRouter`] plays the server: it accepts connections from
//! any number of in-process clients, routes call signaling between
//! them, broadcasts chat messages with server-assigned ids, and tracks
//! presence. [`LoopbackEngine`] is a deterministic negotiation engine
//! and [`FakeMediaSource`] hands out real [`MediaStream`] values
//! without touching hardware.
//!
//! Integration tests and the demo binary run entire multi-client
//! scenarios on these types with no network and no media devices.

use crate::api::{ApiError, ConversationApi};
use crate::channel::{ChannelError, WireSink, WireStream, WireTransport};
use crate::media::{MediaError, MediaSource, MediaStream};
use crate::negotiator::{
    EngineConnectionState, EngineEvent, EngineFactory, NegotiationEngine, NegotiationError,
};
use crate::types::{
    CallId, ConversationId, ConversationSummary, IceCandidate, MediaKind, Message, MessageId,
    MessageStatus, Profile, SdpKind, SessionDescription, UserId,
};
use crate::wire::{ClientEvent, ServerEvent};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct RouterInner {
    profiles: HashMap<UserId, Profile>,
    connections: HashMap<UserId, mpsc::UnboundedSender<ServerEvent>>,
    rooms: HashMap<ConversationId, HashSet<UserId>>,
    conversations: HashMap<ConversationId, (UserId, UserId)>,
    history: HashMap<ConversationId, Vec<Message>>,
    calls: HashMap<CallId, (UserId, UserId)>,
    log: Vec<(UserId, ClientEvent)>,
    next_message: u64,
    last_timestamp: Option<chrono::DateTime<Utc>>,
}

/// The in-process server
pub struct LoopbackRouter {
    inner: Mutex<RouterInner>,
}

impl Default for LoopbackRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRouter {
    /// Create an empty router
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner::default()),
        }
    }

    /// Register a user and get the wire their client connects through
    #[must_use]
    pub fn wire_for(self: &Arc<Self>, profile: Profile) -> Arc<LoopbackWire> {
        let user = profile.user_id.clone();
        self.inner.lock().profiles.insert(user.clone(), profile);
        Arc::new(LoopbackWire {
            router: Arc::clone(self),
            user,
        })
    }

    /// The REST collaborator for a registered user
    #[must_use]
    pub fn api_for(self: &Arc<Self>, user: UserId) -> Arc<InMemoryApi> {
        Arc::new(InMemoryApi {
            router: Arc::clone(self),
            me: user,
        })
    }

    /// Seed a direct conversation between two users
    pub fn add_conversation(&self, id: ConversationId, a: UserId, b: UserId) {
        let mut inner = self.inner.lock();
        inner.conversations.insert(id.clone(), (a, b));
        inner.history.entry(id).or_default();
    }

    /// Append a message to history without broadcasting, as if it
    /// predated every connection
    pub fn seed_message(&self, conversation: &ConversationId, sender: &UserId, content: &str) {
        let mut inner = self.inner.lock();
        let message = Self::build_message(&mut inner, conversation, sender, content);
        inner
            .history
            .entry(conversation.clone())
            .or_default()
            .push(message);
    }

    /// Sever a user's connection, as a network drop would
    pub fn drop_connection(&self, user: &UserId) {
        let mut inner = self.inner.lock();
        if inner.connections.remove(user).is_some() {
            Self::broadcast_except(&inner, user, ServerEvent::UserOffline {
                user_id: user.clone(),
            });
        }
    }

    /// Every client event this user's client has sent
    #[must_use]
    pub fn sent_events(&self, user: &UserId) -> Vec<ClientEvent> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Server-side message history of a conversation, oldest first
    #[must_use]
    pub fn history(&self, conversation: &ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .history
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    fn attach(&self, user: &UserId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.connections.insert(user.clone(), tx.clone());
        let online: Vec<UserId> = inner.connections.keys().cloned().collect();
        let _ = tx.send(ServerEvent::OnlineUsers { user_ids: online });
        Self::broadcast_except(&inner, user, ServerEvent::UserOnline {
            user_id: user.clone(),
        });
        rx
    }

    fn handle(&self, from: &UserId, event: ClientEvent) {
        let mut inner = self.inner.lock();
        inner.log.push((from.clone(), event.clone()));
        match event {
            ClientEvent::CallOffer {
                call_id,
                target_user_id,
                offer,
                media_kind,
            } => {
                inner
                    .calls
                    .insert(call_id, (from.clone(), target_user_id.clone()));
                let caller = inner
                    .profiles
                    .get(from)
                    .cloned()
                    .unwrap_or_else(|| Profile::new(from.as_str(), from.as_str()));
                Self::deliver(&inner, &target_user_id, ServerEvent::CallOffer {
                    call_id,
                    caller,
                    offer,
                    media_kind,
                });
            }
            ClientEvent::CallAnswer { call_id, answer } => {
                if let Some(target) = Self::call_counterparty(&inner, call_id, from) {
                    Self::deliver(&inner, &target, ServerEvent::CallAnswer { call_id, answer });
                }
            }
            ClientEvent::CallCandidate {
                call_id,
                target_user_id,
                candidate,
            } => {
                Self::deliver(&inner, &target_user_id, ServerEvent::CallCandidate {
                    call_id,
                    candidate,
                });
            }
            ClientEvent::CallReject { call_id } => {
                if let Some(target) = Self::call_counterparty(&inner, call_id, from) {
                    Self::deliver(&inner, &target, ServerEvent::CallReject { call_id });
                }
                inner.calls.remove(&call_id);
            }
            ClientEvent::CallEnd { call_id, reason } => {
                if let Some(target) = Self::call_counterparty(&inner, call_id, from) {
                    Self::deliver(&inner, &target, ServerEvent::CallEnd { call_id, reason });
                }
                inner.calls.remove(&call_id);
            }
            ClientEvent::JoinConversation { conversation_id } => {
                inner
                    .rooms
                    .entry(conversation_id)
                    .or_default()
                    .insert(from.clone());
            }
            ClientEvent::LeaveConversation { conversation_id } => {
                if let Some(members) = inner.rooms.get_mut(&conversation_id) {
                    members.remove(from);
                }
            }
            ClientEvent::SendMessage {
                conversation_id,
                content,
                message_type,
            } => {
                let Some((a, b)) = inner.conversations.get(&conversation_id).cloned() else {
                    return;
                };
                let mut message =
                    Self::build_message(&mut inner, &conversation_id, from, &content);
                message.message_type = message_type;
                inner
                    .history
                    .entry(conversation_id.clone())
                    .or_default()
                    .push(message.clone());

                // The broadcast includes the sender; that echo is how
                // optimistic sends resolve to server ids.
                for member in [&a, &b] {
                    Self::deliver(&inner, member, ServerEvent::NewMessage {
                        message: message.clone(),
                    });
                }
                let recipient = if a == *from { &b } else { &a };
                if inner.connections.contains_key(recipient) {
                    Self::deliver(&inner, from, ServerEvent::MessageDelivered {
                        message_id: message.id,
                    });
                }
            }
            ClientEvent::MessageRead { message_id } => {
                let mut sender = None;
                for messages in inner.history.values_mut() {
                    if let Some(message) =
                        messages.iter_mut().find(|m| m.id == message_id)
                    {
                        message.status = MessageStatus::Read;
                        sender = Some(message.sender_id.clone());
                        break;
                    }
                }
                if let Some(sender) = sender {
                    Self::deliver(&inner, &sender, ServerEvent::MessageRead { message_id });
                }
            }
            ClientEvent::UserTyping { conversation_id } => {
                Self::forward_typing(&inner, from, &conversation_id, true);
            }
            ClientEvent::UserStoppedTyping { conversation_id } => {
                Self::forward_typing(&inner, from, &conversation_id, false);
            }
        }
    }

    fn forward_typing(
        inner: &RouterInner,
        from: &UserId,
        conversation_id: &ConversationId,
        typing: bool,
    ) {
        let Some((a, b)) = inner.conversations.get(conversation_id) else {
            return;
        };
        let other = if a == from { b } else { a };
        let event = if typing {
            ServerEvent::UserTyping {
                user_id: from.clone(),
                conversation_id: conversation_id.clone(),
            }
        } else {
            ServerEvent::UserStoppedTyping {
                user_id: from.clone(),
                conversation_id: conversation_id.clone(),
            }
        };
        Self::deliver(inner, other, event);
    }

    fn build_message(
        inner: &mut RouterInner,
        conversation: &ConversationId,
        sender: &UserId,
        content: &str,
    ) -> Message {
        inner.next_message += 1;
        // Strictly increasing timestamps keep history ordering
        // deterministic even when messages land in the same instant.
        let mut timestamp = Utc::now();
        if let Some(last) = inner.last_timestamp {
            if timestamp <= last {
                timestamp = last + chrono::Duration::milliseconds(1);
            }
        }
        inner.last_timestamp = Some(timestamp);
        Message {
            id: MessageId::Server(format!("m{}", inner.next_message)),
            conversation_id: conversation.clone(),
            sender_id: sender.clone(),
            message_type: crate::types::MessageType::Text,
            content: content.to_string(),
            timestamp,
            status: MessageStatus::Sent,
        }
    }

    fn call_counterparty(inner: &RouterInner, call_id: CallId, from: &UserId) -> Option<UserId> {
        inner.calls.get(&call_id).map(|(caller, callee)| {
            if caller == from {
                callee.clone()
            } else {
                caller.clone()
            }
        })
    }

    fn deliver(inner: &RouterInner, to: &UserId, event: ServerEvent) {
        if let Some(sender) = inner.connections.get(to) {
            let _ = sender.send(event);
        }
    }

    fn broadcast_except(inner: &RouterInner, except: &UserId, event: ServerEvent) {
        for (user, sender) in &inner.connections {
            if user != except {
                let _ = sender.send(event.clone());
            }
        }
    }
}

/// [`WireTransport`] connecting one user to a [`LoopbackRouter`]
pub struct LoopbackWire {
    router: Arc<LoopbackRouter>,
    user: UserId,
}

#[async_trait]
impl WireTransport for LoopbackWire {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn WireSink>, Box<dyn WireStream>), ChannelError> {
        let rx = self.router.attach(&self.user);
        Ok((
            Box::new(LoopbackSink {
                router: Arc::clone(&self.router),
                user: self.user.clone(),
            }),
            Box::new(LoopbackStream { rx }),
        ))
    }
}

struct LoopbackSink {
    router: Arc<LoopbackRouter>,
    user: UserId,
}

#[async_trait]
impl WireSink for LoopbackSink {
    async fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError> {
        self.router.handle(&self.user, event);
        Ok(())
    }
}

struct LoopbackStream {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
impl WireStream for LoopbackStream {
    async fn next_event(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

#[derive(Default)]
struct EngineState {
    remote_description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    attached: bool,
    closed: bool,
}

/// Deterministic in-process negotiation engine
pub struct LoopbackEngine {
    events: mpsc::UnboundedSender<EngineEvent>,
    fail_negotiation: bool,
    state: Mutex<EngineState>,
}

impl LoopbackEngine {
    fn local_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn emit(&self, event: EngineEvent) {
        if !self.state.lock().closed {
            let _ = self.events.send(event);
        }
    }

    /// Remote candidates applied so far, in application order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Whether the engine has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether local tracks were attached before offer/answer creation
    #[must_use]
    pub fn tracks_attached(&self) -> bool {
        self.state.lock().attached
    }
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.fail_negotiation {
            return Err(NegotiationError::Failed("injected failure".to_string()));
        }
        self.emit(EngineEvent::LocalCandidate(Self::local_candidate()));
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 loopback offer".to_string(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.fail_negotiation {
            return Err(NegotiationError::Failed("injected failure".to_string()));
        }
        if self.state.lock().remote_description.is_none() {
            return Err(NegotiationError::InvalidDescription(
                "answer requested before remote offer".to_string(),
            ));
        }
        self.emit(EngineEvent::LocalCandidate(Self::local_candidate()));
        self.emit(EngineEvent::ConnectionState(EngineConnectionState::Connected));
        self.emit(EngineEvent::RemoteTrack(MediaStream::for_kind(
            MediaKind::Audio,
        )));
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 loopback answer".to_string(),
        })
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let is_answer = desc.kind == SdpKind::Answer;
        self.state.lock().remote_description = Some(desc);
        if is_answer {
            // The caller side completes once the answer is applied.
            self.emit(EngineEvent::ConnectionState(EngineConnectionState::Connected));
            self.emit(EngineEvent::RemoteTrack(MediaStream::for_kind(
                MediaKind::Audio,
            )));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn attach_local_tracks(&self, _stream: &MediaStream) -> Result<(), NegotiationError> {
        self.state.lock().attached = true;
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Factory producing [`LoopbackEngine`]s, with failure injection
#[derive(Default)]
pub struct LoopbackEngineFactory {
    fail_negotiation: AtomicBool,
    created: Mutex<Vec<Arc<LoopbackEngine>>>,
}

impl LoopbackEngineFactory {
    /// Create a factory producing healthy engines
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequently created engine fail negotiation
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Every engine created so far, in creation order
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<LoopbackEngine>> {
        self.created.lock().clone()
    }
}

impl EngineFactory for LoopbackEngineFactory {
    fn create(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Arc<dyn NegotiationEngine> {
        let engine = Arc::new(LoopbackEngine {
            events,
            fail_negotiation: self.fail_negotiation.load(Ordering::SeqCst),
            state: Mutex::new(EngineState::default()),
        });
        self.created.lock().push(Arc::clone(&engine));
        engine
    }
}

/// [`MediaSource`] that fabricates streams without hardware
#[derive(Default)]
pub struct FakeMediaSource {
    deny: AtomicBool,
    acquired: AtomicU64,
    streams: Mutex<Vec<MediaStream>>,
}

impl FakeMediaSource {
    /// Create a source that grants every acquisition
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent acquisitions fail with a permission error
    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Number of successful acquisitions
    #[must_use]
    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Whether every stream ever handed out has been stopped
    #[must_use]
    pub fn all_streams_stopped(&self) -> bool {
        self.streams.lock().iter().all(MediaStream::all_stopped)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(
                "media access denied".to_string(),
            ));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let stream = MediaStream::for_kind(kind);
        self.streams.lock().push(stream.clone());
        Ok(stream)
    }
}

/// [`ConversationApi`] answering from the router's state
pub struct InMemoryApi {
    router: Arc<LoopbackRouter>,
    me: UserId,
}

#[async_trait]
impl ConversationApi for InMemoryApi {
    async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let inner = self.router.inner.lock();
        let mut summaries = Vec::new();
        for (id, (a, b)) in &inner.conversations {
            if a != &self.me && b != &self.me {
                continue;
            }
            let peer_id = if a == &self.me { b } else { a };
            let peer = inner
                .profiles
                .get(peer_id)
                .cloned()
                .unwrap_or_else(|| Profile::new(peer_id.as_str(), peer_id.as_str()));
            let last_message_at = inner
                .history
                .get(id)
                .and_then(|messages| messages.last())
                .map(|m| m.timestamp);
            summaries.push(ConversationSummary {
                id: id.clone(),
                peer,
                last_message_at,
            });
        }
        Ok(summaries)
    }

    async fn messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let inner = self.router.inner.lock();
        let mut messages = inner
            .history
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        // Newest first, paged from the tail of history.
        messages.reverse();
        let start = (page.saturating_sub(1) * limit) as usize;
        Ok(messages
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .collect())
    }

    async fn create_conversation(&self, peer: &UserId) -> Result<ConversationSummary, ApiError> {
        let mut inner = self.router.inner.lock();
        let existing = inner
            .conversations
            .iter()
            .find(|(_, (a, b))| {
                (a == &self.me && b == peer) || (a == peer && b == &self.me)
            })
            .map(|(id, _)| id.clone());
        let id = match existing {
            Some(id) => id,
            None => {
                let id = ConversationId::new(format!("dm-{}-{}", self.me, peer));
                inner
                    .conversations
                    .insert(id.clone(), (self.me.clone(), peer.clone()));
                inner.history.entry(id.clone()).or_default();
                id
            }
        };
        let profile = inner
            .profiles
            .get(peer)
            .cloned()
            .unwrap_or_else(|| Profile::new(peer.as_str(), peer.as_str()));
        let last_message_at = inner
            .history
            .get(&id)
            .and_then(|messages| messages.last())
            .map(|m| m.timestamp);
        Ok(ConversationSummary {
            id,
            peer: profile,
            last_message_at,
        })
    }
}
