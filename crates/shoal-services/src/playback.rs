//! Playback state shared by the neighbor manager and the segment orchestrator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use shoal_core::wire::StreamType;

/// Whether the local player is playing, and the bitrate last requested per
/// stream type. A bitrate of 0 means nothing has been requested yet.
#[derive(Debug, Default)]
pub struct PlaybackState {
    playing: AtomicBool,
    video: AtomicU64,
    audio: AtomicU64,
}

impl PlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_playing(&self, playing: bool) -> bool {
        self.playing.swap(playing, Ordering::AcqRel)
    }

    fn slot(&self, stream: StreamType) -> &AtomicU64 {
        match stream {
            StreamType::Video => &self.video,
            StreamType::Audio => &self.audio,
        }
    }

    pub fn bitrate(&self, stream: StreamType) -> u64 {
        self.slot(stream).load(Ordering::Acquire)
    }

    pub fn video_bitrate(&self) -> u64 {
        self.bitrate(StreamType::Video)
    }

    /// Record the bitrate of a request. Returns the previous value.
    pub fn set_bitrate(&self, stream: StreamType, bitrate: u64) -> u64 {
        self.slot(stream).swap(bitrate, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.video.store(0, Ordering::Release);
        self.audio.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrates_are_tracked_per_stream() {
        let state = PlaybackState::new();
        assert_eq!(state.set_bitrate(StreamType::Video, 1_000_000), 0);
        assert_eq!(state.set_bitrate(StreamType::Audio, 128_000), 0);
        assert_eq!(state.set_bitrate(StreamType::Video, 2_500_000), 1_000_000);
        assert_eq!(state.video_bitrate(), 2_500_000);
        assert_eq!(state.bitrate(StreamType::Audio), 128_000);
        state.reset();
        assert_eq!(state.video_bitrate(), 0);
    }
}
