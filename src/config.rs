use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, loaded from YAML (see `camgate.yaml`).
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub streams: Vec<StreamSeed>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    #[serde(default = "default_ffprobe_binary")]
    pub ffprobe_binary: String,

    /// HLS segment root. Point this at a RAM-backed mount to spare flash.
    #[serde(default = "default_hls_root")]
    pub hls_root: String,

    #[serde(default = "default_csv_log_path")]
    pub csv_log_path: String,
}

/// Admission and pool sizing.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    /// Hard cap on registered streams.
    pub max_streams: usize,
    /// Fixed number of pipelines allowed to decode at once.
    pub worker_threads: usize,
    /// Spacing enforced behind the startup gate between first grabs.
    pub startup_delay_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_streams: 100,
            worker_threads: 64,
            startup_delay_ms: 800,
        }
    }
}

/// Frame loop tuning.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Output frame rate written to the HLS playlist.
    pub target_fps: u32,
    /// Consecutive empty grabs before the run is declared stalled.
    pub max_null_frames: u32,
    /// No successful encode for this long ends the run.
    pub encode_timeout_ms: u64,
    pub max_consecutive_encode_errors: u32,
    pub segment_secs: u32,
    pub playlist_size: u32,
    pub crf: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_fps: 10,
            max_null_frames: 500,
            encode_timeout_ms: 180_000,
            max_consecutive_encode_errors: 20,
            segment_secs: 4,
            playlist_size: 3,
            crf: 26,
        }
    }
}

/// Reconnect, health scan and shutdown timing.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Base linear backoff between reconnect attempts.
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// No frames for this long makes the health scanner intervene.
    pub stream_timeout_ms: u64,
    /// Scanner recycles before a frameless stream is finalized.
    pub max_health_recycles: u32,
    pub health_check_interval_ms: u64,
    pub memory_check_interval_ms: u64,
    pub csv_log_interval_ms: u64,
    /// How long `stop` waits for a worker to exit on its own.
    pub stop_wait_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5_000,
            max_reconnect_delay_ms: 60_000,
            stream_timeout_ms: 600_000,
            max_health_recycles: 10,
            health_check_interval_ms: 120_000,
            memory_check_interval_ms: 60_000,
            csv_log_interval_ms: 180_000,
            stop_wait_ms: 3_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

/// Streams brought up at boot.
#[derive(Debug, Deserialize, Clone)]
pub struct StreamSeed {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auto_start: bool,
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_binary() -> String {
    "ffprobe".to_string()
}

fn default_hls_root() -> String {
    "./hls".to_string()
}

fn default_csv_log_path() -> String {
    "./stream-stats.csv".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            ffmpeg_binary: default_ffmpeg_binary(),
            ffprobe_binary: default_ffprobe_binary(),
            hls_root: default_hls_root(),
            csv_log_path: default_csv_log_path(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            pipeline: PipelineConfig::default(),
            recovery: RecoveryConfig::default(),
            streams: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_in_defaults() {
        let config: AppConfig = serde_yaml::from_str("server:\n  listen: 0.0.0.0:3000\n").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:3000");
        assert_eq!(config.server.ffmpeg_binary, "ffmpeg");
        assert_eq!(config.limits.max_streams, 100);
        assert_eq!(config.limits.startup_delay_ms, 800);
        assert_eq!(config.pipeline.target_fps, 10);
        assert_eq!(config.pipeline.max_null_frames, 500);
        assert_eq!(config.recovery.stream_timeout_ms, 600_000);
        assert_eq!(config.recovery.max_health_recycles, 10);
        assert!(config.streams.is_empty());
    }

    #[test]
    fn seeded_streams_parse() {
        let yaml = r#"
server:
  listen: 127.0.0.1:9000
  hls_root: /dev/shm/hls
streams:
  - name: lobby
    url: rtsp://10.0.0.10/Streaming/Channels/101
    auto_start: true
  - name: yard
    url: rtsp://10.0.0.11/live
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.hls_root, "/dev/shm/hls");
        assert_eq!(config.streams.len(), 2);
        assert!(config.streams[0].auto_start);
        assert!(!config.streams[1].auto_start);
    }
}
