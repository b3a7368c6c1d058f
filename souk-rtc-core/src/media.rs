//! Media device ownership
//!
//! Camera and microphone are exclusively owned by at most one call at a
//! time. Acquisition is deferred as late as possible and release is
//! unconditional on every terminal transition; track handles record
//! stops so tests can verify nothing leaks.

use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media acquisition errors
///
/// Fatal to the call attempt only, never the client; the call machine
/// translates these into a state transition plus a user-visible reason.
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// The user denied camera/microphone access
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture device
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Kind of an individual track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone capture
    Audio,
    /// Camera capture
    Video,
}

/// Handle to one capture track
///
/// Clones share the stop flag, so every holder observes a stop.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    /// Track identifier
    pub id: Uuid,
    /// Audio or video
    pub kind: TrackKind,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    /// Create a live track
    #[must_use]
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the track, releasing the device
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether the track has been stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A set of tracks owned together
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    /// The tracks in this stream
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Build a stream with the tracks a call of this kind needs
    #[must_use]
    pub fn for_kind(kind: MediaKind) -> Self {
        let mut tracks = vec![MediaTrack::new(TrackKind::Audio)];
        if kind == MediaKind::Video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        Self { tracks }
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Whether every track has been stopped
    #[must_use]
    pub fn all_stopped(&self) -> bool {
        self.tracks.iter().all(MediaTrack::is_stopped)
    }
}

/// Source of local capture streams
///
/// The production implementation wraps the platform capture layer; the
/// call machine receives it by injection so the state machine can be
/// tested without devices.
#[async_trait::async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire camera/microphone for a call of the given kind
    ///
    /// # Errors
    ///
    /// Returns [`MediaError`] when permission is denied or no device is
    /// available.
    async fn acquire(&self, kind: MediaKind) -> Result<MediaStream, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_shape_follows_kind() {
        let audio = MediaStream::for_kind(MediaKind::Audio);
        assert_eq!(audio.tracks.len(), 1);

        let video = MediaStream::for_kind(MediaKind::Video);
        assert_eq!(video.tracks.len(), 2);
        assert!(video.tracks.iter().any(|t| t.kind == TrackKind::Video));
    }

    #[test]
    fn test_stop_visible_through_clones() {
        let stream = MediaStream::for_kind(MediaKind::Video);
        let clone = stream.clone();
        stream.stop_all();
        assert!(clone.all_stopped());
    }
}
