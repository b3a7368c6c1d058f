//! Souk realtime client core
//!
//! Client-side engine for Souk's realtime features: one-to-one
//! audio/video calls, chat with optimistic sends, and presence, all
//! multiplexed over a single persistent channel to the server. The
//! crate owns state and protocol; media capture, the peer-connection
//! engine, and the UI are injected at the seams.
//!
//! - **Transport channel**: one connection for signaling, chat and
//!   presence, with bounded reconnection and at-least-once delivery
//! - **Call machine**: a single-call state machine with a uniform
//!   teardown path, so no transition leaks a live camera or microphone
//! - **Chat store**: optimistic sends under temporary local ids,
//!   reconciled against room broadcasts and paginated REST history
//! - **Message cache**: bounded SQLite cache for instant conversation
//!   rendering
//! - **Presence**: online and typing state, rebuilt from the server
//!   snapshot on every connect
//!
//! # Examples
//!
//! ```rust,no_run
//! use souk_rtc_core::cache::{CacheConfig, MessageCache};
//! use souk_rtc_core::client::{RtcClient, RtcConfig};
//! use souk_rtc_core::loopback::{FakeMediaSource, LoopbackEngineFactory, LoopbackRouter};
//! use souk_rtc_core::types::{MediaKind, Profile, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let router = Arc::new(LoopbackRouter::new());
//! let me = Profile::new("alice", "Alice");
//!
//! let client = RtcClient::new(
//!     me.user_id.clone(),
//!     router.wire_for(me.clone()),
//!     router.api_for(me.user_id.clone()),
//!     Arc::new(MessageCache::open_in_memory(CacheConfig::default())?),
//!     Arc::new(FakeMediaSource::new()),
//!     Arc::new(LoopbackEngineFactory::new()),
//!     RtcConfig::default(),
//! );
//! client.start();
//!
//! let bob = Profile::new("bob", "Bob");
//! let call_id = client.calls().start_call(bob, MediaKind::Video).await?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core identifiers and data structures
pub mod types;

/// Wire contract for the event-multiplexed channel
pub mod wire;

/// Transport channel with reconnection
pub mod channel;

/// WebSocket wire transport
pub mod ws;

/// Media stream handles and the capture seam
pub mod media;

/// Peer-connection negotiation with candidate gating
pub mod negotiator;

/// Call state machine
pub mod call;

/// Conversation REST API
pub mod api;

/// Bounded SQLite message cache
pub mod cache;

/// Chat store with optimistic sends
pub mod chat;

/// Online and typing state
pub mod presence;

/// Client composition root
pub mod client;

/// In-process loopback collaborators for tests and demos
pub mod loopback;

pub use call::{CallConfig, CallError, CallEvent, CallMachine, CallSnapshot};
pub use channel::{Channel, ChannelConfig, ChannelError, ChannelEvent};
pub use chat::{ChatConfig, ChatError, ChatEvent, ChatStore};
pub use client::{RtcClient, RtcConfig};
pub use presence::{PresenceEvent, PresenceTracker};
pub use types::{
    CallDirection, CallId, CallState, ConversationId, ConversationSummary, MediaKind, Message,
    MessageId, MessageStatus, MessageType, Profile, UserId,
};
