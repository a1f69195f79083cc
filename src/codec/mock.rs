//! Deterministic in-process codecs.
//!
//! The factory keys behavior off the URL path the way cameras key off vendor
//! paths, so tests (and `mock://` sources in a dev config) can exercise every
//! failure mode without FFmpeg:
//!
//! - `/ok` (or anything else): healthy frames at the configured rate
//! - `/one-then-null`: a single frame, then empty grabs forever
//! - `/nulls`: empty grabs from the start
//! - `/refuse`: the open itself fails
//! - `/flaky`: healthy, but with periodic empty grabs and decoder noise
//!
//! Every open, close, frame allocation and frame release is counted so the
//! suite can prove the pipeline leaks nothing.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;

use super::{
    CodecFactory, Frame, FrameTracker, Grabber, GrabberOptions, Recorder, RecorderOptions,
};
use crate::error::CodecError;

const MOCK_WIDTH: u32 = 320;
const MOCK_HEIGHT: u32 = 240;

#[derive(Default)]
pub struct MockCounters {
    pub open_attempts: AtomicU64,
    pub grabbers_opened: AtomicU64,
    pub grabbers_closed: AtomicU64,
    pub recorders_opened: AtomicU64,
    pub recorders_closed: AtomicU64,
    pub frames_recorded: AtomicU64,
}

impl MockCounters {
    pub fn grabbers_live(&self) -> i64 {
        self.grabbers_opened.load(Ordering::Relaxed) as i64
            - self.grabbers_closed.load(Ordering::Relaxed) as i64
    }

    pub fn recorders_live(&self) -> i64 {
        self.recorders_opened.load(Ordering::Relaxed) as i64
            - self.recorders_closed.load(Ordering::Relaxed) as i64
    }
}

pub struct MockCodecs {
    pub counters: Arc<MockCounters>,
    pub frames: Arc<FrameTracker>,
    source_fps: f64,
    frame_limit: Option<u64>,
    open_log: Mutex<Vec<(String, Instant)>>,
}

impl MockCodecs {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(MockCounters::default()),
            frames: Arc::new(FrameTracker::default()),
            source_fps: 25.0,
            frame_limit: None,
            open_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_source_fps(mut self, fps: f64) -> Self {
        self.source_fps = fps;
        self
    }

    /// Serve this many frames per grabber, then empty grabs forever.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Every successful grabber open, in order, with its timestamp.
    pub fn open_log(&self) -> Vec<(String, Instant)> {
        self.open_log.lock().unwrap().clone()
    }
}

impl Default for MockCodecs {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum GrabMode {
    Healthy,
    OneThenNull,
    Nulls,
    Flaky,
}

#[async_trait]
impl CodecFactory for MockCodecs {
    async fn open_rtsp(
        &self,
        url: &str,
        _opts: &GrabberOptions,
    ) -> Result<Box<dyn Grabber>, CodecError> {
        self.counters.open_attempts.fetch_add(1, Ordering::Relaxed);
        if url.contains("/refuse") {
            return Err(CodecError::Open {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let mode = if url.contains("/one-then-null") {
            GrabMode::OneThenNull
        } else if url.contains("/nulls") {
            GrabMode::Nulls
        } else if url.contains("/flaky") {
            GrabMode::Flaky
        } else {
            GrabMode::Healthy
        };

        self.counters.grabbers_opened.fetch_add(1, Ordering::Relaxed);
        self.open_log
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));

        Ok(Box::new(MockGrabber {
            mode,
            counters: self.counters.clone(),
            frames: self.frames.clone(),
            source_fps: self.source_fps,
            frame_limit: self.frame_limit,
            grabs: 0,
            served: 0,
            closed: false,
        }))
    }

    async fn create_hls(
        &self,
        _dir: &Path,
        _width: u32,
        _height: u32,
        _opts: &RecorderOptions,
    ) -> Result<Box<dyn Recorder>, CodecError> {
        self.counters
            .recorders_opened
            .fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockRecorder {
            counters: self.counters.clone(),
            closed: false,
        }))
    }
}

struct MockGrabber {
    mode: GrabMode,
    counters: Arc<MockCounters>,
    frames: Arc<FrameTracker>,
    source_fps: f64,
    frame_limit: Option<u64>,
    grabs: u64,
    served: u64,
    closed: bool,
}

impl MockGrabber {
    fn next_frame(&mut self) -> Frame {
        self.served += 1;
        let data = vec![0x2a; (MOCK_WIDTH * MOCK_HEIGHT * 3) as usize];
        Frame::tracked(data, MOCK_WIDTH, MOCK_HEIGHT, self.frames.clone())
    }

    fn mark_closed(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.grabbers_closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Grabber for MockGrabber {
    async fn grab(&mut self) -> Result<Option<Frame>, CodecError> {
        self.grabs += 1;
        if let Some(limit) = self.frame_limit {
            if self.served >= limit {
                return Ok(None);
            }
        }
        match self.mode {
            GrabMode::Healthy => Ok(Some(self.next_frame())),
            GrabMode::OneThenNull => {
                if self.served == 0 {
                    Ok(Some(self.next_frame()))
                } else {
                    Ok(None)
                }
            }
            GrabMode::Nulls => Ok(None),
            GrabMode::Flaky => {
                // Deterministic noise: one empty grab in a hundred, decoder
                // chatter every twentieth grab.
                if self.grabs % 100 == 0 {
                    Ok(None)
                } else if self.grabs % 20 == 0 {
                    Err(CodecError::Transient("no frame!".to_string()))
                } else {
                    Ok(Some(self.next_frame()))
                }
            }
        }
    }

    fn width(&self) -> u32 {
        MOCK_WIDTH
    }

    fn height(&self) -> u32 {
        MOCK_HEIGHT
    }

    fn source_fps(&self) -> f64 {
        self.source_fps
    }

    fn codec_name(&self) -> Option<&str> {
        Some("mock")
    }

    async fn close(&mut self) {
        self.mark_closed();
    }
}

impl Drop for MockGrabber {
    // Abort paths drop the grabber without a close() call; the counter must
    // still balance.
    fn drop(&mut self) {
        self.mark_closed();
    }
}

struct MockRecorder {
    counters: Arc<MockCounters>,
    closed: bool,
}

impl MockRecorder {
    fn mark_closed(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters
                .recorders_closed
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Recorder for MockRecorder {
    async fn record(&mut self, frame: &Frame) -> Result<(), CodecError> {
        if !frame.is_valid() {
            return Err(CodecError::EncoderFailure("empty frame".to_string()));
        }
        self.counters.frames_recorded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&mut self) {
        self.mark_closed();
    }
}

impl Drop for MockRecorder {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthy_source_serves_frames_until_the_limit() {
        let codecs = MockCodecs::new().with_frame_limit(2);
        let mut grabber = codecs
            .open_rtsp("rtsp://mock/ok", &GrabberOptions::default())
            .await
            .unwrap();
        assert!(grabber.grab().await.unwrap().is_some());
        assert!(grabber.grab().await.unwrap().is_some());
        assert!(grabber.grab().await.unwrap().is_none());
        grabber.close().await;
        assert_eq!(codecs.counters.grabbers_live(), 0);
        assert_eq!(codecs.frames.live(), 0);
    }

    #[tokio::test]
    async fn refuse_url_fails_to_open() {
        let codecs = MockCodecs::new();
        let err = codecs
            .open_rtsp("rtsp://mock/refuse", &GrabberOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CodecError::Open { .. }));
        assert_eq!(codecs.counters.grabbers_opened.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn dropping_without_close_still_balances_counters() {
        let codecs = MockCodecs::new();
        let grabber = codecs
            .open_rtsp("rtsp://mock/ok", &GrabberOptions::default())
            .await
            .unwrap();
        drop(grabber);
        assert_eq!(codecs.counters.grabbers_live(), 0);
    }
}
