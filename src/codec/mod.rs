//! Codec adapters: the seam between the stream pipeline and the FFmpeg
//! processes that do the actual decoding and muxing.
//!
//! The pipeline only ever talks to the [`Grabber`], [`Recorder`] and
//! [`CodecFactory`] traits, so the whole service can be driven by the
//! in-process [`mock`] codecs in tests. All FFmpeg option strings live in
//! [`ffmpeg`] and nowhere else.

pub mod ffmpeg;
pub mod mock;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CodecError;

/// One decoded video frame.
///
/// Owns its pixel buffer; releasing the frame (dropping it) is what returns
/// the buffer. The optional tracker is installed by the mock factory so tests
/// can prove the pipeline releases every frame it grabs.
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    tracker: Option<Arc<FrameTracker>>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            tracker: None,
        }
    }

    pub(crate) fn tracked(
        data: Vec<u8>,
        width: u32,
        height: u32,
        tracker: Arc<FrameTracker>,
    ) -> Self {
        tracker.allocated.fetch_add(1, Ordering::Relaxed);
        Self {
            data,
            width,
            height,
            tracker: Some(tracker),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// A frame is usable only if it carries pixels and positive dimensions.
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty() && self.width > 0 && self.height > 0
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Allocation/release bookkeeping for frames handed out by a factory.
#[derive(Default)]
pub struct FrameTracker {
    allocated: AtomicU64,
    released: AtomicU64,
}

impl FrameTracker {
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Frames currently held somewhere. Zero once a stream is fully stopped.
    pub fn live(&self) -> i64 {
        self.allocated() as i64 - self.released() as i64
    }
}

/// Options applied when opening an RTSP source.
///
/// Defaults are tuned for live cameras on lossy links: TCP transport, patient
/// socket timeouts, a large reorder queue and error concealment.
#[derive(Clone, Debug)]
pub struct GrabberOptions {
    pub transport_tcp: bool,
    pub socket_timeout_us: u64,
    pub analyze_duration_us: u64,
    pub probe_size_bytes: u64,
    pub reorder_queue_size: u32,
    pub buffer_size_bytes: u64,
    pub discard_corrupt: bool,
    pub error_concealment: bool,
}

impl Default for GrabberOptions {
    fn default() -> Self {
        Self {
            transport_tcp: true,
            socket_timeout_us: 60_000_000,
            analyze_duration_us: 5_000_000,
            probe_size_bytes: 5_000_000,
            reorder_queue_size: 8192,
            buffer_size_bytes: 8_192_000,
            discard_corrupt: true,
            error_concealment: true,
        }
    }
}

/// Options applied when creating an HLS sink.
#[derive(Clone, Debug)]
pub struct RecorderOptions {
    pub target_fps: u32,
    pub segment_secs: u32,
    pub playlist_size: u32,
    pub crf: u32,
    /// Insert an `EXT-X-DISCONTINUITY` marker at the head of this recording.
    /// Set on every reopen after a reconnect.
    pub discontinuity: bool,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            target_fps: 10,
            segment_secs: 4,
            playlist_size: 3,
            crf: 26,
            discontinuity: false,
        }
    }
}

/// Live decoder pulling frames from an RTSP source.
#[async_trait]
pub trait Grabber: Send {
    /// Pull the next decoded frame. `Ok(None)` means the source produced
    /// nothing within the read window (a "null frame").
    async fn grab(&mut self) -> Result<Option<Frame>, CodecError>;

    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Source frame rate as advertised by the stream; `0.0` when unknown.
    fn source_fps(&self) -> f64;

    fn codec_name(&self) -> Option<&str>;

    async fn close(&mut self);
}

/// HLS muxer consuming frames and writing `.ts` segments plus the playlist.
#[async_trait]
pub trait Recorder: Send {
    async fn record(&mut self, frame: &Frame) -> Result<(), CodecError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait CodecFactory: Send + Sync {
    async fn open_rtsp(
        &self,
        url: &str,
        opts: &GrabberOptions,
    ) -> Result<Box<dyn Grabber>, CodecError>;

    async fn create_hls(
        &self,
        dir: &Path,
        width: u32,
        height: u32,
        opts: &RecorderOptions,
    ) -> Result<Box<dyn Recorder>, CodecError>;
}

/// Ordered connection candidates for an RTSP source: the URL as given, then
/// the stream paths cameras commonly expose.
pub(crate) fn fallback_candidates(url: &str) -> Vec<String> {
    let base = url.trim_end_matches('/');
    let mut out = vec![url.to_string()];
    for suffix in ["/Streaming/Channels/101", "/live"] {
        if base.ends_with(suffix) {
            continue;
        }
        let candidate = format!("{base}{suffix}");
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_candidates_start_with_original_url() {
        let candidates = fallback_candidates("rtsp://cam:554/feed");
        assert_eq!(candidates[0], "rtsp://cam:554/feed");
        assert_eq!(candidates.len(), 3);
        assert!(candidates[1].ends_with("/Streaming/Channels/101"));
        assert!(candidates[2].ends_with("/live"));
    }

    #[test]
    fn fallback_candidates_skip_already_present_path() {
        let candidates = fallback_candidates("rtsp://cam/live");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], "rtsp://cam/live");
    }

    #[test]
    fn frame_validity() {
        assert!(Frame::new(vec![0u8; 12], 2, 2).is_valid());
        assert!(!Frame::new(Vec::new(), 2, 2).is_valid());
        assert!(!Frame::new(vec![0u8; 12], 0, 2).is_valid());
    }

    #[test]
    fn tracker_counts_allocation_and_release() {
        let tracker = Arc::new(FrameTracker::default());
        let frame = Frame::tracked(vec![1, 2, 3], 1, 1, tracker.clone());
        assert_eq!(tracker.live(), 1);
        drop(frame);
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.allocated(), 1);
        assert_eq!(tracker.released(), 1);
    }
}
