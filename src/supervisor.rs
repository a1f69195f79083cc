//! Per-stream supervision: runs the pipeline inside an auto-reconnect loop.
//!
//! Reconnects are unbounded here — a camera may come back minutes later. The
//! health scanner (see `watchdog`) is the only authority that retires a
//! stream which stays frameless.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::pipeline::{self, PipelineExit};
use crate::registry::{StreamEntry, StreamState};
use crate::service::StreamService;

pub(crate) async fn supervise(service: Arc<StreamService>, entry: Arc<StreamEntry>) {
    let mut attempt: u32 = 0;
    let mut first_run = true;

    loop {
        if entry.stop_requested() || service.is_shutting_down() {
            break;
        }

        entry.stats.start_attempts.fetch_add(1, Ordering::Relaxed);
        let read_before = entry.stats.read_frames.load(Ordering::Relaxed);

        // The permit bounds how many pipelines decode at once; waiting here
        // is what the QUEUED state means.
        let permit = match service.workers().clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let outcome = pipeline::run_once(&service, &entry, first_run).await;
        drop(permit);
        first_run = false;

        match outcome {
            Ok(PipelineExit::StopRequested) => {
                info!("Stream [{}] exiting: stop requested", entry.name);
                break;
            }
            Ok(PipelineExit::Shutdown) => break,
            Err(err) => {
                entry.stats.errors.fetch_add(1, Ordering::Relaxed);
                if entry.stop_requested() || service.is_shutting_down() {
                    break;
                }

                // A run that produced frames was a good connection; restart
                // the backoff ladder from the bottom.
                if entry.stats.read_frames.load(Ordering::Relaxed) > read_before {
                    attempt = 0;
                }
                attempt = attempt.saturating_add(1);
                let delay = reconnect_delay(&service.config().recovery, attempt);
                entry.set_state(StreamState::Reconnecting);
                warn!(
                    "Stream [{}] pipeline exited ({}). Reconnect #{} in {:?}",
                    entry.name, err, attempt, delay
                );
                if !sleep_unless_stopped(&service, &entry, delay).await {
                    break;
                }
            }
        }
    }
}

/// Linear backoff, capped.
fn reconnect_delay(recovery: &RecoveryConfig, attempt: u32) -> Duration {
    let ms = recovery
        .reconnect_delay_ms
        .saturating_mul(attempt as u64)
        .min(recovery.max_reconnect_delay_ms);
    Duration::from_millis(ms)
}

/// Sleep in short slices so a stop request interrupts the backoff promptly.
/// Returns false if the stream should exit instead of reconnecting.
async fn sleep_unless_stopped(
    service: &Arc<StreamService>,
    entry: &Arc<StreamEntry>,
    total: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + total;
    loop {
        if entry.stop_requested() || service.is_shutting_down() {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        let slice = (deadline - now).min(Duration::from_millis(50));
        tokio::time::sleep(slice).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        let recovery = RecoveryConfig::default();
        assert_eq!(reconnect_delay(&recovery, 1), Duration::from_secs(5));
        assert_eq!(reconnect_delay(&recovery, 3), Duration::from_secs(15));
        assert_eq!(reconnect_delay(&recovery, 12), Duration::from_secs(60));
        assert_eq!(reconnect_delay(&recovery, 1000), Duration::from_secs(60));
    }
}
