//! Session negotiator
//!
//! Per-call wrapper around one ICE/SDP negotiation engine. The
//! negotiator owns no call-lifecycle knowledge; it is purely the
//! negotiation primitive plus the one ordering hazard it exists to
//! absorb: remote candidates that arrive before the remote description
//! are buffered and replayed in arrival order exactly once.

use crate::media::MediaStream;
use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Negotiation errors
///
/// Distinguishable from media errors at the call machine boundary:
/// negotiation failure drives `Failed` plus full teardown.
#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    /// A description could not be produced or applied
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    /// A candidate could not be applied
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// The underlying connection negotiation failed
    #[error("negotiation failed: {0}")]
    Failed(String),

    /// Operation attempted after detach
    #[error("negotiator is detached")]
    Detached,
}

/// Peer-connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionState {
    /// Negotiation in progress
    Connecting,
    /// Media path established
    Connected,
    /// Media path lost
    Disconnected,
    /// Negotiation failed permanently
    Failed,
}

/// Events emitted by a negotiation engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A locally-gathered network candidate ready for transmission
    LocalCandidate(IceCandidate),
    /// The remote media stream became available
    RemoteTrack(MediaStream),
    /// Connection state changed
    ConnectionState(EngineConnectionState),
}

/// One ICE-based peer connection negotiation
///
/// The engine is an injected collaborator (the platform peer-connection
/// object); [`crate::loopback::LoopbackEngine`] is the deterministic
/// in-process implementation used by tests and the demo.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Produce the local offer
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] if the offer cannot be generated.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Produce the local answer to a previously-set remote offer
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] if the answer cannot be generated.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply the remote session description
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] on a malformed description.
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply one remote network candidate
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] on a malformed candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Attach the local capture tracks
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] if the tracks cannot be attached.
    async fn attach_local_tracks(&self, stream: &MediaStream) -> Result<(), NegotiationError>;

    /// Release the engine's resources and stop emitting events
    async fn close(&self);
}

/// Factory for negotiation engines, injected into the call machine
pub trait EngineFactory: Send + Sync {
    /// Create a fresh engine that reports through `events`
    fn create(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Arc<dyn NegotiationEngine>;
}

#[derive(Default)]
struct CandidateGate {
    have_remote_description: bool,
    buffered: Vec<IceCandidate>,
}

/// Per-call negotiation wrapper
pub struct Negotiator {
    engine: Arc<dyn NegotiationEngine>,
    gate: Mutex<CandidateGate>,
    detached: AtomicBool,
}

impl Negotiator {
    /// Wrap an engine for one call
    #[must_use]
    pub fn new(engine: Arc<dyn NegotiationEngine>) -> Self {
        Self {
            engine,
            gate: Mutex::new(CandidateGate::default()),
            detached: AtomicBool::new(false),
        }
    }

    fn check_attached(&self) -> Result<(), NegotiationError> {
        if self.detached.load(Ordering::SeqCst) {
            Err(NegotiationError::Detached)
        } else {
            Ok(())
        }
    }

    /// Produce the local offer
    ///
    /// # Errors
    ///
    /// Propagates engine errors; fails after detach.
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.check_attached()?;
        self.engine.create_offer().await
    }

    /// Set the remote offer and produce the local answer
    ///
    /// Buffered remote candidates are replayed before the answer is
    /// generated.
    ///
    /// # Errors
    ///
    /// Propagates engine errors; fails after detach.
    pub async fn create_answer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.set_remote_description(remote_offer).await?;
        self.engine.create_answer().await
    }

    /// Apply the remote description, then replay buffered candidates
    /// in arrival order, each exactly once
    ///
    /// # Errors
    ///
    /// Propagates engine errors; fails after detach.
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check_attached()?;
        let mut gate = self.gate.lock().await;
        self.engine.set_remote_description(desc).await?;
        gate.have_remote_description = true;
        let buffered = std::mem::take(&mut gate.buffered);
        for candidate in buffered {
            self.engine.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Apply a remote candidate, buffering it if the remote description
    /// has not been set yet
    ///
    /// # Errors
    ///
    /// Propagates engine errors; fails after detach.
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        self.check_attached()?;
        let mut gate = self.gate.lock().await;
        if gate.have_remote_description {
            self.engine.add_ice_candidate(candidate).await
        } else {
            tracing::debug!("buffering early remote candidate");
            gate.buffered.push(candidate);
            Ok(())
        }
    }

    /// Attach local capture tracks
    ///
    /// # Errors
    ///
    /// Propagates engine errors; fails after detach.
    pub async fn attach_local_tracks(
        &self,
        stream: &MediaStream,
    ) -> Result<(), NegotiationError> {
        self.check_attached()?;
        self.engine.attach_local_tracks(stream).await
    }

    /// Atomically detach and release the engine
    ///
    /// After this returns, no further engine callback can reach the
    /// owning call; every subsequent operation fails with
    /// [`NegotiationError::Detached`].
    pub async fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SdpKind;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct Recording {
        remote_description: Option<SessionDescription>,
        applied_candidates: Vec<IceCandidate>,
        closed: bool,
    }

    #[derive(Default)]
    struct RecordingEngine {
        state: SyncMutex<Recording>,
    }

    #[async_trait]
    impl NegotiationEngine for RecordingEngine {
        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "offer".to_string(),
            })
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            if self.state.lock().remote_description.is_none() {
                return Err(NegotiationError::InvalidDescription(
                    "no remote offer".to_string(),
                ));
            }
            Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "answer".to_string(),
            })
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), NegotiationError> {
            self.state.lock().remote_description = Some(desc);
            Ok(())
        }

        async fn add_ice_candidate(
            &self,
            candidate: IceCandidate,
        ) -> Result<(), NegotiationError> {
            self.state.lock().applied_candidates.push(candidate);
            Ok(())
        }

        async fn attach_local_tracks(
            &self,
            _stream: &MediaStream,
        ) -> Result<(), NegotiationError> {
            Ok(())
        }

        async fn close(&self) {
            self.state.lock().closed = true;
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn offer() -> SessionDescription {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".to_string(),
        }
    }

    #[tokio::test]
    async fn early_candidates_buffered_and_replayed_in_order() {
        let engine = Arc::new(RecordingEngine::default());
        let negotiator = Negotiator::new(engine.clone());

        negotiator.add_remote_candidate(candidate(1)).await.unwrap();
        negotiator.add_remote_candidate(candidate(2)).await.unwrap();
        assert!(engine.state.lock().applied_candidates.is_empty());

        negotiator.set_remote_description(offer()).await.unwrap();

        let applied = engine.state.lock().applied_candidates.clone();
        assert_eq!(applied, vec![candidate(1), candidate(2)]);
    }

    #[tokio::test]
    async fn late_candidates_applied_immediately() {
        let engine = Arc::new(RecordingEngine::default());
        let negotiator = Negotiator::new(engine.clone());

        negotiator.set_remote_description(offer()).await.unwrap();
        negotiator.add_remote_candidate(candidate(7)).await.unwrap();

        assert_eq!(engine.state.lock().applied_candidates, vec![candidate(7)]);
    }

    #[tokio::test]
    async fn buffered_candidates_applied_exactly_once() {
        let engine = Arc::new(RecordingEngine::default());
        let negotiator = Negotiator::new(engine.clone());

        negotiator.add_remote_candidate(candidate(1)).await.unwrap();
        negotiator.set_remote_description(offer()).await.unwrap();
        // A second description set must not replay the drained buffer.
        negotiator.set_remote_description(offer()).await.unwrap();

        assert_eq!(engine.state.lock().applied_candidates.len(), 1);
    }

    #[tokio::test]
    async fn create_answer_sets_remote_offer_first() {
        let engine = Arc::new(RecordingEngine::default());
        let negotiator = Negotiator::new(engine.clone());

        negotiator.add_remote_candidate(candidate(3)).await.unwrap();
        let answer = negotiator.create_answer(offer()).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(engine.state.lock().applied_candidates.len(), 1);
    }

    #[tokio::test]
    async fn detach_closes_engine_and_blocks_operations() {
        let engine = Arc::new(RecordingEngine::default());
        let negotiator = Negotiator::new(engine.clone());

        negotiator.detach().await;
        assert!(engine.state.lock().closed);

        let result = negotiator.add_remote_candidate(candidate(1)).await;
        assert!(matches!(result, Err(NegotiationError::Detached)));
        let result = negotiator.create_offer().await;
        assert!(matches!(result, Err(NegotiationError::Detached)));
    }
}
