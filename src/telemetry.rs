//! System-wide reporting: the stats snapshot behind `/sys/status` and the
//! periodic CSV append.
//!
//! Nothing here feeds back into control decisions.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::StreamState;
use crate::service::StreamService;

/// Frozen header: 14 fields, consumed by downstream tooling as-is.
pub const CSV_HEADER: &str = "Timestamp,ActiveStreams,WorkerThreads,ActiveThreads,QueueSize,\
UsedMemoryMB,MaxMemoryMB,MemoryUsagePercent,\
SystemCPULoad,ProcessCPULoad,TotalReadFrames,TotalEncodedFrames,\
TotalErrors,DeadStreams";

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub active_streams: usize,
    pub queue_size: usize,
    pub pool: PoolStats,
    pub memory: MemoryStats,
    pub cpu: Option<CpuStats>,
    pub total_read_frames: u64,
    pub total_encoded_frames: u64,
    pub total_errors: u64,
    pub dead_streams: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub total: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub used_mb: u64,
    pub max_mb: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuStats {
    pub system_load: f64,
    pub process_load: f64,
}

pub(crate) fn sample(service: &StreamService, process_cpu: f64) -> SystemStats {
    let registry = service.registry();
    let pool_total = service.worker_pool_size();
    let pool_active = pool_total.saturating_sub(service.workers().available_permits());
    let queued = registry.count_state(StreamState::Queued);

    let mut total_read = 0u64;
    let mut total_encoded = 0u64;
    let mut total_errors = 0u64;
    for entry in registry.snapshot() {
        total_read += entry.stats.read_frames.load(Ordering::Relaxed);
        total_encoded += entry.stats.encoded_frames.load(Ordering::Relaxed);
        total_errors += entry.stats.errors.load(Ordering::Relaxed);
    }

    let memory = match sys_info::mem_info() {
        Ok(mem) if mem.total > 0 => {
            let used_kb = mem.total.saturating_sub(mem.avail);
            MemoryStats {
                used_mb: used_kb / 1024,
                max_mb: mem.total / 1024,
                used_percent: 100.0 * used_kb as f64 / mem.total as f64,
            }
        }
        _ => MemoryStats {
            used_mb: 0,
            max_mb: 0,
            used_percent: 0.0,
        },
    };

    let cpu = sys_info::loadavg().ok().map(|load| CpuStats {
        system_load: load.one,
        process_load: process_cpu,
    });

    SystemStats {
        active_streams: registry.len(),
        queue_size: queued,
        pool: PoolStats {
            active: pool_active,
            total: pool_total,
            queue_size: queued,
        },
        memory,
        cpu,
        total_read_frames: total_read,
        total_encoded_frames: total_encoded,
        total_errors,
        dead_streams: service.dead_streams(),
    }
}

pub(crate) fn spawn_csv_logger(service: Arc<StreamService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(service.config().recovery.csv_log_interval_ms);
        let path = service.config().server.csv_log_path.clone();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if service.is_shutting_down() {
                break;
            }
            let stats = service.system_stats();
            let row = format_row(Utc::now(), &stats);
            if let Err(err) = append_row(Path::new(&path), &row) {
                warn!("Failed to append metrics row to {}: {}", path, err);
            } else {
                debug!("Metrics row appended to {}", path);
            }
        }
    })
}

pub(crate) fn format_row(now: DateTime<Utc>, stats: &SystemStats) -> String {
    let (system_load, process_load) = stats
        .cpu
        .as_ref()
        .map(|cpu| (cpu.system_load, cpu.process_load))
        .unwrap_or((0.0, 0.0));
    format!(
        "{},{},{},{},{},{},{},{:.1},{:.2},{:.2},{},{},{},{}",
        now.format("%Y-%m-%d %H:%M:%S"),
        stats.active_streams,
        stats.pool.total,
        stats.pool.active,
        stats.queue_size,
        stats.memory.used_mb,
        stats.memory.max_mb,
        stats.memory.used_percent,
        system_load,
        process_load,
        stats.total_read_frames,
        stats.total_encoded_frames,
        stats.total_errors,
        stats.dead_streams,
    )
}

fn append_row(path: &Path, row: &str) -> io::Result<()> {
    let write_header = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if write_header {
        writeln!(file, "{CSV_HEADER}")?;
    }
    writeln!(file, "{row}")
}

/// Process CPU utilisation from `/proc/self/stat` deltas. Reports 0.0 where
/// procfs is unavailable.
pub(crate) struct ProcessCpuSampler {
    last_ticks: u64,
    last_at: Instant,
}

impl ProcessCpuSampler {
    pub(crate) fn new() -> Self {
        Self {
            last_ticks: read_process_ticks().unwrap_or(0),
            last_at: Instant::now(),
        }
    }

    /// Percent of one CPU used by this process since the previous sample.
    pub(crate) fn sample(&mut self) -> f64 {
        let Some(ticks) = read_process_ticks() else {
            return 0.0;
        };
        let elapsed = self.last_at.elapsed().as_secs_f64();
        let delta = ticks.saturating_sub(self.last_ticks);
        self.last_ticks = ticks;
        self.last_at = Instant::now();
        if elapsed <= 0.0 {
            return 0.0;
        }
        // USER_HZ is 100 on every Linux we deploy to.
        100.0 * (delta as f64 / 100.0) / elapsed
    }
}

#[cfg(target_os = "linux")]
fn read_process_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields 14 and 15 (utime, stime), counted after the parenthesized comm
    // which may itself contain spaces.
    let rest = stat.rsplit_once(')').map(|(_, rest)| rest)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_process_ticks() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stats() -> SystemStats {
        SystemStats {
            active_streams: 12,
            queue_size: 2,
            pool: PoolStats {
                active: 10,
                total: 64,
                queue_size: 2,
            },
            memory: MemoryStats {
                used_mb: 2048,
                max_mb: 8192,
                used_percent: 25.0,
            },
            cpu: Some(CpuStats {
                system_load: 1.25,
                process_load: 37.5,
            }),
            total_read_frames: 123_456,
            total_encoded_frames: 45_678,
            total_errors: 9,
            dead_streams: 1,
        }
    }

    #[test]
    fn header_has_exactly_fourteen_fields() {
        assert_eq!(CSV_HEADER.split(',').count(), 14);
    }

    #[test]
    fn rows_match_the_header_shape() {
        let now = DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let row = format_row(now, &sample_stats());
        assert_eq!(row.split(',').count(), 14);
        assert!(row.starts_with("2025-06-01 12:00:00,12,64,10,2,"));
        assert!(row.ends_with(",123456,45678,9,1"));
    }

    #[test]
    fn rows_without_cpu_still_have_fourteen_fields() {
        let mut stats = sample_stats();
        stats.cpu = None;
        let row = format_row(Utc::now(), &stats);
        assert_eq!(row.split(',').count(), 14);
    }
}
