//! The service facade: admission, lifecycle control and the library surface
//! consumed by the HTTP layer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::codec::ffmpeg::FfmpegCodecs;
use crate::codec::CodecFactory;
use crate::config::AppConfig;
use crate::error::StartError;
use crate::registry::{RegisterError, StreamEntry, StreamRegistry, StreamState};
use crate::stats::StatsSnapshot;
use crate::supervisor;
use crate::telemetry::{self, ProcessCpuSampler, SystemStats};
use crate::watchdog;

pub type SharedService = Arc<StreamService>;

/// Public view of a stream's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    NotFound,
    Starting,
    Running,
    Stopped,
}

/// One row of the admin stream listing.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub source: String,
    pub playlist: String,
    pub state: String,
    pub queue_pos: u64,
    pub recycles: u32,
    pub uptime_secs: u64,
    pub stats: StatsSnapshot,
}

pub struct StreamService {
    config: AppConfig,
    registry: StreamRegistry,
    codecs: Arc<dyn CodecFactory>,
    startup_gate: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    queue_seq: AtomicU64,
    shutting_down: AtomicBool,
    dead_streams: AtomicU64,
    cpu_sampler: Mutex<ProcessCpuSampler>,
}

impl StreamService {
    /// Production construction: FFmpeg-backed codecs.
    pub fn new(config: AppConfig) -> Arc<Self> {
        let codecs = Arc::new(FfmpegCodecs::new(
            config.server.ffmpeg_binary.clone(),
            config.server.ffprobe_binary.clone(),
        ));
        Self::with_codecs(config, codecs)
    }

    /// Construction with an injected codec factory (tests, `mock://` demos).
    pub fn with_codecs(config: AppConfig, codecs: Arc<dyn CodecFactory>) -> Arc<Self> {
        clean_hls_root(&config.server.hls_root);
        let workers = config.limits.worker_threads.max(1);
        Arc::new(Self {
            registry: StreamRegistry::new(),
            codecs,
            startup_gate: Arc::new(Semaphore::new(1)),
            workers: Arc::new(Semaphore::new(workers)),
            queue_seq: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            dead_streams: AtomicU64::new(0),
            cpu_sampler: Mutex::new(ProcessCpuSampler::new()),
            config,
        })
    }

    /// Register a stream and schedule its worker.
    ///
    /// Returns the playlist path synchronously; the path is in the registry
    /// before the worker starts, so callers observe a URL even while the
    /// stream is still connecting. Starting an already-registered name is a
    /// no-op that returns the existing path.
    pub fn start(self: &Arc<Self>, rtsp_url: &str, stream_name: &str) -> Result<String, StartError> {
        if self.is_shutting_down() {
            return Err(StartError::ShuttingDown);
        }
        if rtsp_url.trim().is_empty() {
            return Err(StartError::InvalidUrl);
        }
        let name = sanitize_name(stream_name);
        if name.is_empty() {
            return Err(StartError::InvalidName(stream_name.to_string()));
        }

        let playlist_path = format!("/hls/{name}/stream.m3u8");
        let output_dir = Path::new(&self.config.server.hls_root).join(&name);
        let entry = Arc::new(StreamEntry::new(
            name.clone(),
            rtsp_url.to_string(),
            playlist_path.clone(),
            output_dir.clone(),
            self.queue_seq.fetch_add(1, Ordering::Relaxed),
        ));

        match self.registry.register(entry.clone(), self.config.limits.max_streams) {
            Ok(()) => {}
            Err(RegisterError::Duplicate(existing)) => {
                return Ok(existing.playlist_path.clone());
            }
            Err(RegisterError::CapacityExceeded(count)) => {
                return Err(StartError::CapacityExceeded(count));
            }
        }

        if let Err(err) = std::fs::create_dir_all(&output_dir) {
            self.registry.remove(&name);
            return Err(StartError::Io(err));
        }

        info!(
            "Stream [{}] admitted (queue position {}), source {}",
            name, entry.queue_pos, rtsp_url
        );
        let handle = tokio::spawn(supervisor::supervise(self.clone(), entry.clone()));
        entry.install_worker(handle);
        Ok(playlist_path)
    }

    /// Stop a stream and delete its on-disk segments. Unknown names are a
    /// no-op.
    pub async fn stop(&self, stream_name: &str) {
        let name = sanitize_name(stream_name);
        let Some(entry) = self.registry.remove(&name) else {
            return;
        };
        self.halt(&entry, StreamState::Stopped).await;
        info!("Stream [{}] stopped and files deleted", name);
    }

    /// Signal stop, give the worker `stop_wait_ms` to exit on its own, then
    /// abort it, and delete the stream directory.
    pub(crate) async fn halt(&self, entry: &Arc<StreamEntry>, final_state: StreamState) {
        entry.request_stop();
        if let Some(mut handle) = entry.take_worker() {
            let wait = Duration::from_millis(self.config.recovery.stop_wait_ms);
            if tokio::time::timeout(wait, &mut handle).await.is_err() {
                warn!("Stream [{}] did not exit within {:?}; aborting worker", entry.name, wait);
                handle.abort();
                let _ = handle.await;
            }
        }
        entry.set_state(final_state);
        remove_stream_dir(entry);
    }

    /// Health-scanner path: cancel the worker outright (it may be wedged in
    /// a blocking grab), reset the frame clock and resubmit the stream.
    pub(crate) async fn recycle(self: &Arc<Self>, entry: &Arc<StreamEntry>) {
        // A stop may have raced the scanner's snapshot; never resurrect a
        // stream that is being torn down.
        if entry.stop_requested() || self.is_shutting_down() {
            return;
        }
        if let Some(handle) = entry.take_worker() {
            handle.abort();
            let _ = handle.await;
        }
        entry.reset_frame_clock();
        entry.set_state(StreamState::Reconnecting);
        let handle = tokio::spawn(supervisor::supervise(self.clone(), entry.clone()));
        entry.install_worker(handle);
    }

    /// Health-scanner path: the recycle budget is exhausted, retire the
    /// stream for good.
    pub(crate) async fn finalize_dead(&self, entry: &Arc<StreamEntry>) {
        self.registry.remove(&entry.name);
        self.dead_streams.fetch_add(1, Ordering::Relaxed);
        self.halt(entry, StreamState::Failed).await;
        let snapshot = entry.stats.snapshot(entry.state().as_str(), entry.uptime_secs());
        error!(
            "Stream [{}] finalized as dead after {} recycles (read {}, encoded {}, errors {})",
            entry.name,
            entry.recycles(),
            snapshot.read_frames,
            snapshot.encoded_frames,
            snapshot.errors
        );
    }

    pub fn status(&self, stream_name: &str) -> StreamStatus {
        let name = sanitize_name(stream_name);
        match self.registry.get(&name) {
            None => StreamStatus::NotFound,
            Some(entry) => match entry.state() {
                StreamState::Queued | StreamState::Starting => StreamStatus::Starting,
                StreamState::Running | StreamState::Reconnecting => StreamStatus::Running,
                StreamState::Stopped | StreamState::Failed => StreamStatus::Stopped,
            },
        }
    }

    pub fn stats(&self, stream_name: &str) -> Option<StatsSnapshot> {
        let name = sanitize_name(stream_name);
        let entry = self.registry.get(&name)?;
        Some(entry.stats.snapshot(entry.state().as_str(), entry.uptime_secs()))
    }

    pub fn list(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|entry| StreamInfo {
                name: entry.name.clone(),
                source: entry.rtsp_url.clone(),
                playlist: entry.playlist_path.clone(),
                state: entry.state().as_str().to_string(),
                queue_pos: entry.queue_pos,
                recycles: entry.recycles(),
                uptime_secs: entry.uptime_secs(),
                stats: entry.stats.snapshot(entry.state().as_str(), entry.uptime_secs()),
            })
            .collect();
        streams.sort_by_key(|info| info.queue_pos);
        streams
    }

    pub fn system_stats(&self) -> SystemStats {
        let process_cpu = self.cpu_sampler.lock().unwrap().sample();
        telemetry::sample(self, process_cpu)
    }

    /// Spawn the periodic guardians: health scanner, memory governor and CSV
    /// logger. They exit on their own once shutdown begins.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            watchdog::spawn_health_scanner(self.clone()),
            watchdog::spawn_memory_governor(self.clone()),
            telemetry::spawn_csv_logger(self.clone()),
        ]
    }

    /// Stop everything: refuse new admits, drain all streams inside the
    /// grace period, then force-abort stragglers.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = self.registry.drain();
        info!("Shutting down: stopping {} streams", entries.len());

        let mut tasks = JoinSet::new();
        for entry in entries {
            let service = self.clone();
            tasks.spawn(async move {
                service.halt(&entry, StreamState::Stopped).await;
            });
        }
        let grace = Duration::from_millis(self.config.recovery.shutdown_grace_ms);
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Shutdown grace of {:?} expired; aborting remaining workers", grace);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("Shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn config(&self) -> &AppConfig {
        &self.config
    }

    pub(crate) fn codecs(&self) -> &Arc<dyn CodecFactory> {
        &self.codecs
    }

    pub(crate) fn startup_gate(&self) -> &Arc<Semaphore> {
        &self.startup_gate
    }

    pub(crate) fn workers(&self) -> &Arc<Semaphore> {
        &self.workers
    }

    pub(crate) fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub(crate) fn worker_pool_size(&self) -> usize {
        self.config.limits.worker_threads.max(1)
    }

    pub(crate) fn dead_streams(&self) -> u64 {
        self.dead_streams.load(Ordering::Relaxed)
    }

    pub fn hls_root(&self) -> &str {
        &self.config.server.hls_root
    }
}

/// Stream names are path segments; everything outside `[A-Za-z0-9_-]` becomes
/// an underscore and the result is capped at 64 characters.
pub(crate) fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

/// Wipe leftovers from a previous run and recreate the root.
fn clean_hls_root(root: &str) {
    let root = Path::new(root);
    if root.exists() {
        if let Err(err) = std::fs::remove_dir_all(root) {
            warn!("Failed to clean HLS root {:?}: {}", root, err);
        }
    }
    if let Err(err) = std::fs::create_dir_all(root) {
        warn!("Failed to create HLS root {:?}: {}", root, err);
    }
}

fn remove_stream_dir(entry: &Arc<StreamEntry>) {
    if !entry.output_dir.exists() {
        return;
    }
    if let Err(err) = std::fs::remove_dir_all(&entry.output_dir) {
        warn!(
            "Failed to delete stream directory {:?}: {}",
            entry.output_dir, err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_name("cam_1"), "cam_1");
        assert_eq!(sanitize_name("cam/../bad name"), "cam____bad_name");
        assert_eq!(sanitize_name("Füße"), "F__e");
        assert_eq!(sanitize_name("a.b:c"), "a_b_c");
        let long = "x".repeat(80);
        assert_eq!(sanitize_name(&long).len(), 64);
        assert_eq!(sanitize_name(""), "");
    }

    #[test]
    fn sanitized_names_contain_only_allowed_characters() {
        for raw in ["../../etc", "name with spaces", "emoji🎥cam", "ŽüЯ"] {
            let name = sanitize_name(raw);
            assert!(
                name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
                "bad char in {name:?}"
            );
        }
    }
}
