//! Client composition root
//!
//! Wires the channel, call machine, chat store and presence tracker
//! together and runs the single dispatch loop that routes incoming
//! channel traffic to the right component. Everything else in the
//! crate is a component; this is the only place that knows them all.

use crate::api::ConversationApi;
use crate::cache::MessageCache;
use crate::call::{CallConfig, CallMachine};
use crate::channel::{Channel, ChannelConfig, ChannelEvent, WireTransport};
use crate::chat::{ChatConfig, ChatStore};
use crate::media::MediaSource;
use crate::negotiator::EngineFactory;
use crate::presence::PresenceTracker;
use crate::types::UserId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Aggregated tuning for all components
#[derive(Debug, Clone, Default)]
pub struct RtcConfig {
    /// Channel reconnection tuning
    pub channel: ChannelConfig,
    /// Call machine tuning
    pub call: CallConfig,
    /// Chat store tuning
    pub chat: ChatConfig,
}

/// The realtime client
///
/// One instance per authenticated session. Construct with collaborators
/// (the wire, the REST API, the cache, the media source, the engine
/// factory), call [`RtcClient::start`], and subscribe to the component
/// event streams.
pub struct RtcClient {
    channel: Arc<Channel>,
    calls: Arc<CallMachine>,
    chat: Arc<ChatStore>,
    presence: Arc<PresenceTracker>,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RtcClient {
    /// Assemble a client from its collaborators
    #[must_use]
    pub fn new(
        me: UserId,
        wire: Arc<dyn WireTransport>,
        api: Arc<dyn ConversationApi>,
        cache: Arc<MessageCache>,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn EngineFactory>,
        config: RtcConfig,
    ) -> Self {
        let channel = Arc::new(Channel::new(wire, config.channel));
        let calls = Arc::new(CallMachine::new(
            Arc::clone(&channel),
            media,
            engines,
            config.call,
        ));
        let chat = Arc::new(ChatStore::new(
            me,
            Arc::clone(&channel),
            api,
            cache,
            config.chat,
        ));
        let presence = Arc::new(PresenceTracker::new());
        Self {
            channel,
            calls,
            chat,
            presence,
            dispatch: parking_lot::Mutex::new(None),
        }
    }

    /// Connect the channel and start routing its traffic
    ///
    /// Idempotent: a second call while running is a no-op.
    pub fn start(&self) {
        let mut dispatch = self.dispatch.lock();
        if dispatch.is_some() {
            return;
        }
        // Subscribe before connecting so the first Connected event is
        // not missed.
        let events = self.channel.subscribe();
        self.channel.connect();
        *dispatch = Some(tokio::spawn(Self::dispatch_loop(
            events,
            Arc::clone(&self.calls),
            Arc::clone(&self.chat),
            Arc::clone(&self.presence),
        )));
    }

    /// Shut the client down: end any call, stop routing, disconnect
    pub async fn shutdown(&self) {
        let _ = self.calls.hang_up().await;
        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
        self.channel.disconnect();
    }

    /// The transport channel
    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// The call state machine
    #[must_use]
    pub fn calls(&self) -> &Arc<CallMachine> {
        &self.calls
    }

    /// The chat store
    #[must_use]
    pub fn chat(&self) -> &Arc<ChatStore> {
        &self.chat
    }

    /// The presence tracker
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    async fn dispatch_loop(
        mut events: broadcast::Receiver<ChannelEvent>,
        calls: Arc<CallMachine>,
        chat: Arc<ChatStore>,
        presence: Arc<PresenceTracker>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "dispatch lagged behind the channel");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                ChannelEvent::Incoming(server_event) => {
                    if server_event.is_signaling() {
                        calls.handle_signal(server_event).await;
                    } else {
                        chat.handle_server_event(&server_event);
                        presence.handle_server_event(&server_event);
                    }
                }
                ChannelEvent::Reconnected => {
                    tracing::info!("channel reconnected, resyncing");
                    chat.handle_reconnected().await;
                }
                ChannelEvent::Disconnected => {
                    // In-flight sends may have died with the wire.
                    chat.handle_disconnected();
                    // Presence is server truth; a stale view is worse
                    // than an empty one.
                    presence.clear();
                }
                ChannelEvent::Connected => {}
            }
        }
    }
}

impl Drop for RtcClient {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
    }
}
