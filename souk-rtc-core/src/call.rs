//! Call state machine
//!
//! Owns one call's lifecycle and is the unit of truth for "is there an
//! active call, with whom, in what state". The channel, media source
//! and engine factory are constructor-injected so the machine can be
//! tested without a live socket.
//!
//! State machine:
//!
//! ```text
//! IDLE --(start_call)--> RINGING(outbound)
//! IDLE --(incoming offer)--> RINGING(inbound)
//! RINGING(outbound) --(remote answer)--> ACTIVE
//! RINGING(outbound) --(remote reject | timeout)--> ENDED
//! RINGING(inbound) --(accept)--> ACTIVE
//! RINGING(inbound) --(reject | remote end | timeout)--> REJECTED|ENDED
//! ACTIVE --(hang_up | remote end | connection lost)--> ENDED
//! any --(negotiation error)--> FAILED
//! ```
//!
//! Every transition out of a live state runs the same teardown: stop
//! all tracks, detach the negotiator atomically, notify the remote
//! peer unless the transition was remote-caused, clear the ring timer.
//! Media acquisition and offer/answer creation are suspension points;
//! the call slot is re-validated at every resumption via a per-call
//! epoch, and ring timers validate call identity at fire time, so a
//! stale timer is structurally a no-op.

use crate::channel::Channel;
use crate::media::{MediaError, MediaSource, MediaStream};
use crate::negotiator::{
    EngineConnectionState, EngineEvent, EngineFactory, NegotiationError, Negotiator,
};
use crate::types::{
    CallDirection, CallId, CallState, IceCandidate, MediaKind, Profile, SessionDescription,
};
use crate::wire::{ClientEvent, ServerEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Call machine errors
#[derive(Error, Debug)]
pub enum CallError {
    /// A call cannot start without a live channel
    #[error("cannot place a call while the channel is disconnected")]
    ChannelDown,

    /// Media acquisition failed; the call attempt is over but the
    /// client is fine
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Negotiation failed; the call transitioned to `Failed`
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// No call exists to operate on
    #[error("no call in progress")]
    NoActiveCall,

    /// The operation is not valid in the call's current state
    #[error("invalid call state: {0:?}")]
    InvalidState(CallState),

    /// Another call replaced this one while setup was suspended
    #[error("call superseded during setup")]
    Superseded,
}

/// Call machine configuration
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long a call may ring before it is forced to end
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
        }
    }
}

/// Observable snapshot of the current call
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Call identifier
    pub id: CallId,
    /// Outbound or inbound
    pub direction: CallDirection,
    /// Audio or video
    pub media_kind: MediaKind,
    /// Current state
    pub state: CallState,
    /// The other participant
    pub counterparty: Profile,
    /// Whether remote media has arrived
    pub has_remote_media: bool,
}

/// Call notifications for the UI layer
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An inbound call is ringing
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: Profile,
        /// Audio or video
        media_kind: MediaKind,
    },
    /// The call moved to a new live state
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// New state
        state: CallState,
    },
    /// The remote media stream became available
    RemoteMediaReady {
        /// Call identifier
        call_id: CallId,
    },
    /// The call reached a terminal state and all resources are released
    Ended {
        /// Call identifier
        call_id: CallId,
        /// Terminal state (`Ended`, `Rejected` or `Failed`)
        state: CallState,
        /// Human-readable reason, when one exists
        reason: Option<String>,
    },
}

/// How teardown notifies the counterparty
enum Notify {
    /// The transition was remote-caused; emitting would loop
    Silent,
    /// Decline an inbound ring
    Reject,
    /// End with a reason
    End(String),
}

struct ActiveCall {
    id: CallId,
    epoch: u64,
    direction: CallDirection,
    media_kind: MediaKind,
    counterparty: Profile,
    state: CallState,
    local_media: Option<MediaStream>,
    remote_media: Option<MediaStream>,
    negotiator: Option<Arc<Negotiator>>,
    remote_offer: Option<SessionDescription>,
    /// Remote candidates that arrived before the negotiator existed
    pending_candidates: Vec<IceCandidate>,
    ring_timer: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(
        id: CallId,
        epoch: u64,
        direction: CallDirection,
        media_kind: MediaKind,
        counterparty: Profile,
    ) -> Self {
        Self {
            id,
            epoch,
            direction,
            media_kind,
            counterparty,
            state: CallState::Idle,
            local_media: None,
            remote_media: None,
            negotiator: None,
            remote_offer: None,
            pending_candidates: Vec::new(),
            ring_timer: None,
            pump: None,
        }
    }

    fn matches(&self, id: CallId, epoch: u64) -> bool {
        self.id == id && self.epoch == epoch
    }
}

/// The call state machine
pub struct CallMachine {
    channel: Arc<Channel>,
    media: Arc<dyn MediaSource>,
    engines: Arc<dyn EngineFactory>,
    config: CallConfig,
    slot: Mutex<Option<ActiveCall>>,
    epoch: AtomicU64,
    events: broadcast::Sender<CallEvent>,
}

impl CallMachine {
    /// Create a call machine with injected collaborators
    #[must_use]
    pub fn new(
        channel: Arc<Channel>,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn EngineFactory>,
        config: CallConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            channel,
            media,
            engines,
            config,
            slot: Mutex::new(None),
            epoch: AtomicU64::new(0),
            events,
        }
    }

    /// Subscribe to call notifications
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the current call, if one exists
    pub async fn current(&self) -> Option<CallSnapshot> {
        let slot = self.slot.lock().await;
        slot.as_ref().map(|call| CallSnapshot {
            id: call.id,
            direction: call.direction,
            media_kind: call.media_kind,
            state: call.state,
            counterparty: call.counterparty.clone(),
            has_remote_media: call.remote_media.is_some(),
        })
    }

    /// Current call state, `Idle` when no call exists
    pub async fn state(&self) -> CallState {
        self.slot
            .lock()
            .await
            .as_ref()
            .map_or(CallState::Idle, |call| call.state)
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start an outbound call
    ///
    /// Any existing call is fully torn down first, synchronously,
    /// before new resource acquisition begins. Setup order: acquire
    /// local media, create the negotiator, attach tracks, generate the
    /// offer, transmit, enter `Ringing`. Failure at any step releases
    /// everything acquired so far.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ChannelDown`] when the channel is
    /// disconnected, [`CallError::Media`] when acquisition fails,
    /// [`CallError::Negotiation`] on offer failure, or
    /// [`CallError::Superseded`] when another call replaced this one
    /// while setup was suspended.
    #[tracing::instrument(skip(self, callee), fields(callee = %callee.user_id))]
    pub async fn start_call(
        self: &Arc<Self>,
        callee: Profile,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        if !self.channel.is_connected() {
            return Err(CallError::ChannelDown);
        }

        let call_id = CallId::new();
        let epoch = self.next_epoch();
        {
            let mut slot = self.slot.lock().await;
            // Hard precondition: full teardown of any existing call
            // before the new one acquires anything.
            if let Some(existing) = slot.take() {
                self.teardown(
                    existing,
                    CallState::Ended,
                    Notify::End("superseded by new call".to_string()),
                    Some("superseded by new call".to_string()),
                )
                .await;
            }
            *slot = Some(ActiveCall::new(
                call_id,
                epoch,
                CallDirection::Outbound,
                media_kind,
                callee.clone(),
            ));
        }

        match self.run_outbound_setup(call_id, epoch, callee, media_kind).await {
            Ok(()) => {
                tracing::info!(call_id = %call_id, "outbound call ringing");
                Ok(call_id)
            }
            Err(CallError::Superseded) => Err(CallError::Superseded),
            Err(e) => {
                let terminal = match e {
                    CallError::Media(_) => CallState::Ended,
                    _ => CallState::Failed,
                };
                self.clear_failed_setup(call_id, epoch, terminal, e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn run_outbound_setup(
        self: &Arc<Self>,
        call_id: CallId,
        epoch: u64,
        callee: Profile,
        media_kind: MediaKind,
    ) -> Result<(), CallError> {
        let local = self.media.acquire(media_kind).await?;

        // Re-check at resumption: the slot may have been taken over
        // while acquisition was suspended.
        {
            let slot = self.slot.lock().await;
            let still_ours = slot
                .as_ref()
                .is_some_and(|call| call.matches(call_id, epoch));
            if !still_ours {
                local.stop_all();
                return Err(CallError::Superseded);
            }
        }

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = self.engines.create(engine_tx);
        let negotiator = Negotiator::new(engine);

        if let Err(e) = negotiator.attach_local_tracks(&local).await {
            local.stop_all();
            negotiator.detach().await;
            return Err(e.into());
        }
        let offer = match negotiator.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                local.stop_all();
                negotiator.detach().await;
                return Err(e.into());
            }
        };

        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(call) if call.matches(call_id, epoch) => {
                let emitted = self.channel.emit(ClientEvent::CallOffer {
                    call_id,
                    target_user_id: callee.user_id,
                    offer,
                    media_kind,
                });
                if emitted.is_err() {
                    local.stop_all();
                    negotiator.detach().await;
                    return Err(CallError::ChannelDown);
                }
                call.local_media = Some(local);
                call.negotiator = Some(Arc::new(negotiator));
                call.state = CallState::Ringing;
                call.ring_timer = Some(self.spawn_ring_timer(call_id, epoch));
                call.pump = Some(self.spawn_engine_pump(call_id, epoch, engine_rx));
                let _ = self.events.send(CallEvent::StateChanged {
                    call_id,
                    state: CallState::Ringing,
                });
                Ok(())
            }
            _ => {
                local.stop_all();
                negotiator.detach().await;
                Err(CallError::Superseded)
            }
        }
    }

    /// Accept the ringing inbound call
    ///
    /// Media acquisition is deferred to this point, so a ring that is
    /// never answered never touches the camera or microphone. Enters
    /// `Active` optimistically once the answer is transmitted; the
    /// negotiator's connection-state signal confirms.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] or
    /// [`CallError::InvalidState`] when nothing is ringing inbound,
    /// [`CallError::Media`] when acquisition fails (the call ends and
    /// the caller is notified), or [`CallError::Negotiation`] when
    /// answering fails (the call transitions to `Failed`).
    #[tracing::instrument(skip(self))]
    pub async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        let (call_id, epoch, media_kind, remote_offer) = {
            let slot = self.slot.lock().await;
            let call = slot.as_ref().ok_or(CallError::NoActiveCall)?;
            if call.direction != CallDirection::Inbound || call.state != CallState::Ringing {
                return Err(CallError::InvalidState(call.state));
            }
            let offer = call
                .remote_offer
                .clone()
                .ok_or(CallError::InvalidState(call.state))?;
            (call.id, call.epoch, call.media_kind, offer)
        };

        let local = match self.media.acquire(media_kind).await {
            Ok(stream) => stream,
            Err(e) => {
                // The caller must not be left ringing against a dead
                // accept; decline and release the slot.
                let mut slot = self.slot.lock().await;
                if let Some(call) = slot.take_if(|c| c.matches(call_id, epoch)) {
                    self.teardown(call, CallState::Ended, Notify::Reject, Some(e.to_string()))
                        .await;
                }
                return Err(e.into());
            }
        };

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = self.engines.create(engine_tx);
        let negotiator = Arc::new(Negotiator::new(engine));

        let mut slot = self.slot.lock().await;
        // Re-check at resumption.
        let still_ringing = slot
            .as_ref()
            .is_some_and(|call| call.matches(call_id, epoch) && call.state == CallState::Ringing);
        if !still_ringing {
            local.stop_all();
            negotiator.detach().await;
            return Err(CallError::Superseded);
        }

        // Publish the negotiator and drain the pre-negotiator buffer
        // under the same lock so candidate arrival order is preserved.
        let pending = match slot.as_mut() {
            Some(call) => {
                call.negotiator = Some(Arc::clone(&negotiator));
                std::mem::take(&mut call.pending_candidates)
            }
            None => Vec::new(),
        };

        let setup = async {
            for candidate in pending {
                negotiator.add_remote_candidate(candidate).await?;
            }
            negotiator.attach_local_tracks(&local).await?;
            negotiator.create_answer(remote_offer).await
        };
        let answer = match setup.await {
            Ok(answer) => answer,
            Err(e) => {
                if let Some(call) = slot.take_if(|c| c.matches(call_id, epoch)) {
                    self.teardown_with_stream(
                        call,
                        local,
                        CallState::Failed,
                        Notify::End("negotiation failed".to_string()),
                        Some(e.to_string()),
                    )
                    .await;
                }
                return Err(e.into());
            }
        };

        if self
            .channel
            .emit(ClientEvent::CallAnswer { call_id, answer })
            .is_err()
        {
            if let Some(call) = slot.take_if(|c| c.matches(call_id, epoch)) {
                self.teardown_with_stream(
                    call,
                    local,
                    CallState::Failed,
                    Notify::Silent,
                    Some("channel unavailable".to_string()),
                )
                .await;
            }
            return Err(CallError::ChannelDown);
        }

        if let Some(call) = slot.as_mut() {
            call.local_media = Some(local);
            call.state = CallState::Active;
            if let Some(timer) = call.ring_timer.take() {
                timer.abort();
            }
            call.pump = Some(self.spawn_engine_pump(call_id, epoch, engine_rx));
            let _ = self.events.send(CallEvent::StateChanged {
                call_id,
                state: CallState::Active,
            });
            tracing::info!(call_id = %call_id, "inbound call accepted");
        }
        Ok(())
    }

    /// Decline the ringing inbound call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] or
    /// [`CallError::InvalidState`] when nothing is ringing inbound.
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self) -> Result<(), CallError> {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(call)
                if call.direction == CallDirection::Inbound
                    && call.state == CallState::Ringing =>
            {
                if let Some(call) = slot.take() {
                    self.teardown(call, CallState::Rejected, Notify::Reject, None)
                        .await;
                }
                Ok(())
            }
            Some(call) => Err(CallError::InvalidState(call.state)),
            None => Err(CallError::NoActiveCall),
        }
    }

    /// End the current call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] when no call exists.
    #[tracing::instrument(skip(self))]
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(call) => {
                self.teardown(
                    call,
                    CallState::Ended,
                    Notify::End("hangup".to_string()),
                    None,
                )
                .await;
                Ok(())
            }
            None => Err(CallError::NoActiveCall),
        }
    }

    /// React to a signaling event from the channel
    ///
    /// Idempotent to duplicate delivery: every reaction is guarded by
    /// call identity and current state.
    pub async fn handle_signal(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::CallOffer {
                call_id,
                caller,
                offer,
                media_kind,
            } => self.handle_offer(call_id, caller, offer, media_kind).await,
            ServerEvent::CallAnswer { call_id, answer } => {
                self.handle_answer(call_id, answer).await;
            }
            ServerEvent::CallCandidate { call_id, candidate } => {
                self.handle_candidate(call_id, candidate).await;
            }
            ServerEvent::CallReject { call_id } => self.handle_reject(call_id).await,
            ServerEvent::CallEnd { call_id, reason } => {
                self.handle_remote_end(call_id, reason).await;
            }
            _ => {}
        }
    }

    async fn handle_offer(
        self: &Arc<Self>,
        call_id: CallId,
        caller: Profile,
        offer: SessionDescription,
        media_kind: MediaKind,
    ) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|call| call.id == call_id) {
            // Duplicate delivery of the same offer.
            return;
        }
        // The busy path, including offer glare: the teardown
        // precondition applies before this call may take the slot.
        if let Some(existing) = slot.take() {
            tracing::info!(
                existing = %existing.id,
                incoming = %call_id,
                "tearing down existing call for incoming offer"
            );
            self.teardown(
                existing,
                CallState::Ended,
                Notify::End("superseded by incoming call".to_string()),
                Some("superseded by incoming call".to_string()),
            )
            .await;
        }

        let epoch = self.next_epoch();
        let mut call = ActiveCall::new(
            call_id,
            epoch,
            CallDirection::Inbound,
            media_kind,
            caller.clone(),
        );
        // No media acquisition here: deferred until accept.
        call.state = CallState::Ringing;
        call.remote_offer = Some(offer);
        call.ring_timer = Some(self.spawn_ring_timer(call_id, epoch));
        *slot = Some(call);

        tracing::info!(call_id = %call_id, caller = %caller.user_id, "inbound call ringing");
        let _ = self.events.send(CallEvent::IncomingCall {
            call_id,
            caller,
            media_kind,
        });
        let _ = self.events.send(CallEvent::StateChanged {
            call_id,
            state: CallState::Ringing,
        });
    }

    async fn handle_answer(&self, call_id: CallId, answer: SessionDescription) {
        let mut slot = self.slot.lock().await;
        let negotiator = match slot.as_ref() {
            Some(call)
                if call.id == call_id
                    && call.direction == CallDirection::Outbound
                    && call.state == CallState::Ringing =>
            {
                match call.negotiator.clone() {
                    Some(negotiator) => negotiator,
                    None => return,
                }
            }
            _ => return,
        };

        match negotiator.set_remote_description(answer).await {
            Ok(()) => {
                if let Some(call) = slot.as_mut() {
                    call.state = CallState::Active;
                    if let Some(timer) = call.ring_timer.take() {
                        timer.abort();
                    }
                    tracing::info!(call_id = %call_id, "outbound call answered");
                    let _ = self.events.send(CallEvent::StateChanged {
                        call_id,
                        state: CallState::Active,
                    });
                }
            }
            Err(e) => {
                if let Some(call) = slot.take() {
                    self.teardown(
                        call,
                        CallState::Failed,
                        Notify::End("negotiation failed".to_string()),
                        Some(e.to_string()),
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_candidate(&self, call_id: CallId, candidate: IceCandidate) {
        let mut slot = self.slot.lock().await;
        let negotiator = match slot.as_mut() {
            Some(call) if call.id == call_id => match call.negotiator.clone() {
                Some(negotiator) => negotiator,
                None => {
                    // Candidates may legitimately arrive before the
                    // answer decision; hold them for the negotiator.
                    call.pending_candidates.push(candidate);
                    return;
                }
            },
            _ => return,
        };

        if let Err(e) = negotiator.add_remote_candidate(candidate).await {
            if let Some(call) = slot.take() {
                self.teardown(
                    call,
                    CallState::Failed,
                    Notify::End("negotiation failed".to_string()),
                    Some(e.to_string()),
                )
                .await;
            }
        }
    }

    async fn handle_reject(&self, call_id: CallId) {
        let mut slot = self.slot.lock().await;
        let rejectable = slot.as_ref().is_some_and(|call| {
            call.id == call_id
                && call.direction == CallDirection::Outbound
                && call.state == CallState::Ringing
        });
        if rejectable {
            if let Some(call) = slot.take() {
                self.teardown(
                    call,
                    CallState::Ended,
                    Notify::Silent,
                    Some("call rejected".to_string()),
                )
                .await;
            }
        }
    }

    async fn handle_remote_end(&self, call_id: CallId, reason: String) {
        let mut slot = self.slot.lock().await;
        if let Some(call) = slot.take_if(|call| call.id == call_id) {
            // Remote-caused: notifying back would loop.
            self.teardown(call, CallState::Ended, Notify::Silent, Some(reason))
                .await;
        }
    }

    fn spawn_ring_timer(self: &Arc<Self>, call_id: CallId, epoch: u64) -> JoinHandle<()> {
        let machine = Arc::clone(self);
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            machine.on_ring_timeout(call_id, epoch).await;
        })
    }

    async fn on_ring_timeout(&self, call_id: CallId, epoch: u64) {
        let mut slot = self.slot.lock().await;
        // Identity check at fire time: a stale timer is a no-op even if
        // abort raced the fire.
        let expired = slot
            .as_ref()
            .is_some_and(|call| call.matches(call_id, epoch) && call.state == CallState::Ringing);
        if expired {
            if let Some(call) = slot.take() {
                tracing::warn!(call_id = %call_id, "ring timer expired");
                self.teardown(
                    call,
                    CallState::Ended,
                    Notify::End("ring timeout".to_string()),
                    Some("no answer".to_string()),
                )
                .await;
            }
        }
    }

    fn spawn_engine_pump(
        self: &Arc<Self>,
        call_id: CallId,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let machine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                machine.on_engine_event(call_id, epoch, event).await;
            }
        })
    }

    async fn on_engine_event(&self, call_id: CallId, epoch: u64, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                let slot = self.slot.lock().await;
                if let Some(call) = slot.as_ref() {
                    if call.matches(call_id, epoch) {
                        // Candidate exchange is independent of
                        // offer/answer timing.
                        let _ = self.channel.emit(ClientEvent::CallCandidate {
                            call_id,
                            target_user_id: call.counterparty.user_id.clone(),
                            candidate,
                        });
                    }
                }
            }
            EngineEvent::RemoteTrack(stream) => {
                let mut slot = self.slot.lock().await;
                if let Some(call) = slot.as_mut() {
                    if call.matches(call_id, epoch) {
                        call.remote_media = Some(stream);
                        let _ = self.events.send(CallEvent::RemoteMediaReady { call_id });
                    }
                }
            }
            EngineEvent::ConnectionState(state) => {
                self.on_connection_state(call_id, epoch, state).await;
            }
        }
    }

    async fn on_connection_state(
        &self,
        call_id: CallId,
        epoch: u64,
        state: EngineConnectionState,
    ) {
        let mut slot = self.slot.lock().await;
        let current = match slot.as_ref() {
            Some(call) if call.matches(call_id, epoch) => call.state,
            _ => return,
        };
        match state {
            EngineConnectionState::Connecting | EngineConnectionState::Connected => {
                // Active was already entered optimistically; the
                // Connected signal confirms it.
            }
            EngineConnectionState::Failed => {
                if let Some(call) = slot.take() {
                    self.teardown(
                        call,
                        CallState::Failed,
                        Notify::End("negotiation failed".to_string()),
                        Some("connection negotiation failed".to_string()),
                    )
                    .await;
                }
            }
            EngineConnectionState::Disconnected => {
                if current == CallState::Active {
                    if let Some(call) = slot.take() {
                        self.teardown(
                            call,
                            CallState::Ended,
                            Notify::End("connection lost".to_string()),
                            Some("connection lost".to_string()),
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn clear_failed_setup(
        &self,
        call_id: CallId,
        epoch: u64,
        terminal: CallState,
        reason: String,
    ) {
        let mut slot = self.slot.lock().await;
        if let Some(call) = slot.take_if(|call| call.matches(call_id, epoch)) {
            self.teardown(call, terminal, Notify::Silent, Some(reason))
                .await;
        }
    }

    async fn teardown_with_stream(
        &self,
        mut call: ActiveCall,
        stream: MediaStream,
        terminal: CallState,
        notify: Notify,
        reason: Option<String>,
    ) {
        // A stream acquired during setup that never made it into the
        // slot still must be released.
        debug_assert!(call.local_media.is_none());
        call.local_media = Some(stream);
        self.teardown(call, terminal, notify, reason).await;
    }

    /// The single safety-critical cleanup sequence
    ///
    /// Runs on every transition out of a live state, unconditionally:
    /// clear the ring timer, detach the negotiator's callbacks before
    /// releasing it, stop every media track, notify the remote peer
    /// unless the transition was remote-caused.
    async fn teardown(
        &self,
        mut call: ActiveCall,
        terminal: CallState,
        notify: Notify,
        reason: Option<String>,
    ) {
        if let Some(timer) = call.ring_timer.take() {
            timer.abort();
        }
        if let Some(pump) = call.pump.take() {
            pump.abort();
        }
        if let Some(negotiator) = call.negotiator.take() {
            negotiator.detach().await;
        }
        if let Some(media) = call.local_media.take() {
            media.stop_all();
        }
        if let Some(media) = call.remote_media.take() {
            media.stop_all();
        }
        match notify {
            Notify::Silent => {}
            Notify::Reject => {
                let _ = self.channel.emit(ClientEvent::CallReject { call_id: call.id });
            }
            Notify::End(end_reason) => {
                let _ = self.channel.emit(ClientEvent::CallEnd {
                    call_id: call.id,
                    reason: end_reason,
                });
            }
        }
        tracing::info!(call_id = %call.id, state = ?terminal, "call torn down");
        let _ = self.events.send(CallEvent::Ended {
            call_id: call.id,
            state: terminal,
            reason,
        });
    }
}
