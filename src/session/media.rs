//! Local media handed to the session layer
//!
//! The engine never flips track state itself; it only forwards the toggle
//! calls to whoever owns the tracks.

use crate::error::{MatchmakingError, Result};
use crate::utils::generate_peer_id;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Control over the enabled state of the local tracks
pub trait TrackControl: Send + Sync {
    /// Flip the audio track, returning whether it is now enabled
    fn toggle_audio(&self) -> bool;
    /// Flip the video track, returning whether it is now enabled
    fn toggle_video(&self) -> bool;
}

/// Track switches kept in memory
#[derive(Debug)]
pub struct StaticTracks {
    audio: AtomicBool,
    video: AtomicBool,
}

impl Default for StaticTracks {
    fn default() -> Self {
        Self {
            audio: AtomicBool::new(true),
            video: AtomicBool::new(true),
        }
    }
}

impl StaticTracks {
    pub fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }
}

impl TrackControl for StaticTracks {
    fn toggle_audio(&self) -> bool {
        !self.audio.fetch_xor(true, Ordering::SeqCst)
    }

    fn toggle_video(&self) -> bool {
        !self.video.fetch_xor(true, Ordering::SeqCst)
    }
}

/// Captured local stream, shared by reference with the session layer
#[derive(Clone)]
pub struct LocalMedia {
    pub stream_id: String,
    tracks: Arc<dyn TrackControl>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Arc<dyn TrackControl>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn toggle_audio(&self) -> bool {
        self.tracks.toggle_audio()
    }

    pub fn toggle_video(&self) -> bool {
        self.tracks.toggle_video()
    }
}

/// Where the engine gets its local media from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia>;
}

/// Media source producing a stream with in-memory tracks
#[derive(Debug)]
pub struct SyntheticMediaSource {
    available: bool,
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self { available: true }
    }

    /// A source that always fails, as if no camera were present
    pub fn unavailable() -> Self {
        Self { available: false }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia> {
        if !self.available {
            return Err(MatchmakingError::MediaUnavailable {
                reason: "no capture device".to_string(),
            }
            .into());
        }
        Ok(LocalMedia::new(
            format!("stream-{}", generate_peer_id()),
            Arc::new(StaticTracks::default()),
        ))
    }
}
