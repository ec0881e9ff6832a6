use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::decode::TrackMetadata;

/// Counters updated by the sink consumer and its producers.
#[derive(Debug, Default)]
pub struct SinkCounters {
    /// Frames of real audio handed to the output.
    pub played_frames: AtomicU64,
    /// Frames released from the hold-back queue into the block queue.
    pub released_frames: AtomicU64,
    /// Number of times the queue ran dry while playing.
    pub underrun_events: AtomicU64,
    /// Frames of silence emitted because of underruns.
    pub underrun_frames: AtomicU64,
}

impl SinkCounters {
    pub fn add_played(&self, frames: usize) {
        if frames > 0 {
            self.played_frames.fetch_add(frames as u64, Ordering::Relaxed);
        }
    }

    pub fn add_released(&self, frames: usize) {
        self.released_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn add_underrun(&self, silent_frames: usize) {
        self.underrun_events.fetch_add(1, Ordering::Relaxed);
        self.underrun_frames
            .fetch_add(silent_frames as u64, Ordering::Relaxed);
    }

    pub fn add_silence(&self, silent_frames: usize) {
        self.underrun_frames
            .fetch_add(silent_frames as u64, Ordering::Relaxed);
    }
}

/// Point-in-time view of the sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub sample_rate: u32,
    pub channels: usize,
    pub played_frames: u64,
    pub released_frames: u64,
    pub underrun_events: u64,
    pub underrun_frames: u64,
    pub queued_blocks: usize,
    pub buffering: bool,
}

impl SinkStats {
    pub fn snapshot(
        counters: &SinkCounters,
        sample_rate: u32,
        channels: usize,
        queued_blocks: usize,
        buffering: bool,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            played_frames: counters.played_frames.load(Ordering::Relaxed),
            released_frames: counters.released_frames.load(Ordering::Relaxed),
            underrun_events: counters.underrun_events.load(Ordering::Relaxed),
            underrun_frames: counters.underrun_frames.load(Ordering::Relaxed),
            queued_blocks,
            buffering,
        }
    }

    /// Played time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.played_frames.saturating_mul(1000) / self.sample_rate as u64
    }
}

/// What the request processor reports to its listener.
#[derive(Clone, Debug, Default)]
pub struct TrackStatus {
    pub path: PathBuf,
    pub metadata: TrackMetadata,
    /// Seconds into the track.
    pub position: f64,
    /// Track length in seconds, `0.0` when unknown.
    pub duration: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_elapsed() {
        let counters = SinkCounters::default();
        counters.add_played(96_000);
        let stats = SinkStats::snapshot(&counters, 48_000, 2, 3, false);
        assert_eq!(stats.elapsed_ms(), 2000);
        assert_eq!(stats.queued_blocks, 3);
    }

    #[test]
    fn underruns_count_events_and_frames() {
        let counters = SinkCounters::default();
        counters.add_underrun(128);
        counters.add_silence(256);
        let stats = SinkStats::snapshot(&counters, 44_100, 2, 0, true);
        assert_eq!(stats.underrun_events, 1);
        assert_eq!(stats.underrun_frames, 384);
        assert!(stats.buffering);
    }

    #[test]
    fn zero_rate_has_no_elapsed_time() {
        assert_eq!(SinkStats::default().elapsed_ms(), 0);
    }
}
