//! Stream registry: the single shared structure through which the service,
//! the per-stream workers and the periodic scanners communicate.
//!
//! Concurrency contract: the map itself is locked only for insert, lookup and
//! removal. Each value is an `Arc<StreamEntry>` whose mutable parts are
//! atomics, so a worker mutates its own entry without touching the map while
//! the health scanner observes it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use crate::stats::StreamStats;

/// Lifecycle of one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Queued = 0,
    Starting = 1,
    Running = 2,
    Reconnecting = 3,
    Stopped = 4,
    Failed = 5,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Queued => "QUEUED",
            StreamState::Starting => "STARTING",
            StreamState::Running => "RUNNING",
            StreamState::Reconnecting => "RECONNECTING",
            StreamState::Stopped => "STOPPED",
            StreamState::Failed => "FAILED",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Queued,
            1 => StreamState::Starting,
            2 => StreamState::Running,
            3 => StreamState::Reconnecting,
            4 => StreamState::Stopped,
            _ => StreamState::Failed,
        }
    }
}

/// Everything the service knows about one registered stream.
pub struct StreamEntry {
    pub name: String,
    pub rtsp_url: String,
    pub playlist_path: String,
    pub output_dir: PathBuf,
    pub queue_pos: u64,
    pub started_at: Instant,
    pub stats: StreamStats,
    state: AtomicU8,
    stop: AtomicBool,
    last_frame_ms: AtomicU64,
    recycles: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamEntry {
    pub(crate) fn new(
        name: String,
        rtsp_url: String,
        playlist_path: String,
        output_dir: PathBuf,
        queue_pos: u64,
    ) -> Self {
        Self {
            name,
            rtsp_url,
            playlist_path,
            output_dir,
            queue_pos,
            started_at: Instant::now(),
            stats: StreamStats::default(),
            state: AtomicU8::new(StreamState::Queued as u8),
            stop: AtomicBool::new(false),
            // The frame clock starts at registration so the health scanner
            // grants a full timeout of grace before the first frame.
            last_frame_ms: AtomicU64::new(epoch_millis()),
            recycles: AtomicU32::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Advance the frame clock. Called only for validated frames.
    pub(crate) fn mark_frame(&self) {
        self.last_frame_ms.store(epoch_millis(), Ordering::Relaxed);
    }

    pub(crate) fn reset_frame_clock(&self) {
        self.mark_frame();
    }

    pub fn last_frame_age(&self) -> Duration {
        let last = self.last_frame_ms.load(Ordering::Relaxed);
        Duration::from_millis(epoch_millis().saturating_sub(last))
    }

    pub fn recycles(&self) -> u32 {
        self.recycles.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_recycles(&self) -> u32 {
        self.recycles.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_recycles(&self) {
        self.recycles.store(0, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub(crate) fn install_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap().take()
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) enum RegisterError {
    Duplicate(Arc<StreamEntry>),
    CapacityExceeded(usize),
}

pub struct StreamRegistry {
    streams: Mutex<HashMap<String, Arc<StreamEntry>>>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check and insert under one lock so a burst of starts cannot
    /// race past the capacity limit.
    pub(crate) fn register(
        &self,
        entry: Arc<StreamEntry>,
        max_streams: usize,
    ) -> Result<(), RegisterError> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(existing) = streams.get(&entry.name) {
            return Err(RegisterError::Duplicate(existing.clone()));
        }
        if streams.len() >= max_streams {
            return Err(RegisterError::CapacityExceeded(streams.len()));
        }
        streams.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<StreamEntry>> {
        self.streams.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<StreamEntry>> {
        self.streams.lock().unwrap().remove(name)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<StreamEntry>> {
        self.streams.lock().unwrap().drain().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<Arc<StreamEntry>> {
        self.streams.lock().unwrap().values().cloned().collect()
    }

    pub fn count_state(&self, state: StreamState) -> usize {
        self.streams
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.state() == state)
            .count()
    }
}
