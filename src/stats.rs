//! Per-stream counters.
//!
//! All counters are monotonic atomics updated by the owning worker and read
//! by the admin surface and the CSV logger. They are never consulted for
//! control decisions. Counters survive reconnects; only the frame clock is
//! reset by a recycle.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Default)]
pub struct StreamStats {
    pub read_frames: AtomicU64,
    pub encoded_frames: AtomicU64,
    pub skipped_frames: AtomicU64,
    pub errors: AtomicU64,
    pub ignored_errors: AtomicU64,
    pub start_attempts: AtomicU64,
    source_fps_bits: AtomicU64,
    current_fps_bits: AtomicU64,
    width: AtomicU32,
    height: AtomicU32,
    source_codec: Mutex<Option<String>>,
}

impl StreamStats {
    pub fn set_source(&self, fps: f64, width: u32, height: u32, codec: Option<&str>) {
        self.source_fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        self.width.store(width, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        *self.source_codec.lock().unwrap() = codec.map(str::to_string);
    }

    pub fn set_current_fps(&self, fps: f64) {
        self.current_fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn source_fps(&self) -> f64 {
        f64::from_bits(self.source_fps_bits.load(Ordering::Relaxed))
    }

    pub fn current_fps(&self) -> f64 {
        f64::from_bits(self.current_fps_bits.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self, state: &str, uptime_secs: u64) -> StatsSnapshot {
        let width = self.width.load(Ordering::Relaxed);
        let height = self.height.load(Ordering::Relaxed);
        StatsSnapshot {
            state: state.to_string(),
            read_frames: self.read_frames.load(Ordering::Relaxed),
            encoded_frames: self.encoded_frames.load(Ordering::Relaxed),
            skipped_frames: self.skipped_frames.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            ignored_errors: self.ignored_errors.load(Ordering::Relaxed),
            start_attempts: self.start_attempts.load(Ordering::Relaxed),
            source_fps: self.source_fps(),
            current_fps: self.current_fps(),
            resolution: if width > 0 && height > 0 {
                format!("{width}x{height}")
            } else {
                "unknown".to_string()
            },
            source_codec: self.source_codec.lock().unwrap().clone(),
            uptime_secs,
        }
    }
}

/// Point-in-time copy of a stream's counters, safe to serialize.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub state: String,
    pub read_frames: u64,
    pub encoded_frames: u64,
    pub skipped_frames: u64,
    pub errors: u64,
    pub ignored_errors: u64,
    pub start_attempts: u64,
    pub source_fps: f64,
    pub current_fps: f64,
    pub resolution: String,
    pub source_codec: Option<String>,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters_and_source_metadata() {
        let stats = StreamStats::default();
        stats.read_frames.fetch_add(30, Ordering::Relaxed);
        stats.encoded_frames.fetch_add(10, Ordering::Relaxed);
        stats.set_source(25.0, 1920, 1080, Some("h264"));
        stats.set_current_fps(9.7);

        let snap = stats.snapshot("RUNNING", 12);
        assert_eq!(snap.read_frames, 30);
        assert_eq!(snap.encoded_frames, 10);
        assert_eq!(snap.resolution, "1920x1080");
        assert_eq!(snap.source_codec.as_deref(), Some("h264"));
        assert_eq!(snap.state, "RUNNING");
        assert!((snap.current_fps - 9.7).abs() < 1e-9);
    }

    #[test]
    fn unknown_resolution_before_first_connect() {
        let stats = StreamStats::default();
        assert_eq!(stats.snapshot("QUEUED", 0).resolution, "unknown");
    }
}
