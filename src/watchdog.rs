//! Periodic guardians.
//!
//! The health scanner recycles streams that have stopped producing frames and
//! retires them once the recycle budget is spent. The memory governor watches
//! process-wide memory and sheds the oldest streams at the emergency
//! watermark. Both are deliberately dumb: all state they consult lives in the
//! registry entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::registry::StreamState;
use crate::service::StreamService;

const MEMORY_WARN_PERCENT: f64 = 85.0;
const MEMORY_EVICT_PERCENT: f64 = 95.0;
/// Streams stopped per emergency eviction, oldest first.
const EVICT_BATCH: usize = 5;

pub(crate) fn spawn_health_scanner(service: Arc<StreamService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(service.config().recovery.health_check_interval_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if service.is_shutting_down() {
                break;
            }
            scan_once(&service, period).await;
        }
    })
}

/// One pass over the registry.
pub(crate) async fn scan_once(service: &Arc<StreamService>, scan_period: Duration) {
    let recovery = &service.config().recovery;
    let timeout = Duration::from_millis(recovery.stream_timeout_ms);

    for entry in service.registry().snapshot() {
        match entry.state() {
            // Still waiting for a pool permit, or already on the way out; a
            // recycle would accomplish nothing.
            StreamState::Queued | StreamState::Stopped | StreamState::Failed => continue,
            _ => {}
        }
        if entry.stop_requested() {
            continue;
        }

        let age = entry.last_frame_age();
        if age > timeout {
            let recycles = entry.bump_recycles();
            if recycles > recovery.max_health_recycles {
                service.finalize_dead(&entry).await;
            } else {
                warn!(
                    "Stream [{}] produced no frames for {:?}. Recycle {}/{}.",
                    entry.name, age, recycles, recovery.max_health_recycles
                );
                service.recycle(&entry).await;
            }
        } else if age <= scan_period {
            // Frames were observed since the previous scan; the stream has
            // recovered and earns its full recycle budget back.
            entry.reset_recycles();
        }
    }
}

pub(crate) fn spawn_memory_governor(service: Arc<StreamService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(service.config().recovery.memory_check_interval_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if service.is_shutting_down() {
                break;
            }
            govern_once(&service).await;
        }
    })
}

pub(crate) async fn govern_once(service: &Arc<StreamService>) {
    let mem = match sys_info::mem_info() {
        Ok(mem) => mem,
        Err(err) => {
            warn!("Failed to read memory info: {}", err);
            return;
        }
    };
    if mem.total == 0 {
        return;
    }
    let used_percent = 100.0 * (mem.total.saturating_sub(mem.avail)) as f64 / mem.total as f64;

    if used_percent > MEMORY_EVICT_PERCENT {
        error!(
            "Memory at {:.1}% — emergency eviction of the {} oldest streams",
            used_percent, EVICT_BATCH
        );
        let mut entries = service.registry().snapshot();
        entries.sort_by_key(|entry| entry.started_at);
        for entry in entries.into_iter().take(EVICT_BATCH) {
            error!("Evicting stream [{}] to relieve memory pressure", entry.name);
            service.stop(&entry.name).await;
        }
    } else if used_percent > MEMORY_WARN_PERCENT {
        warn!("Memory pressure at {:.1}%", used_percent);
    }
}
