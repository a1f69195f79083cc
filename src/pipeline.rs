//! The per-stream frame loop: everything between "open the grabber" and
//! "hand control back to the supervisor".
//!
//! One run = one connection. The loop paces reads to the source cadence,
//! skip-selects frames down to the target output rate, and releases every
//! frame before the next grab on every control-flow path.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{
    fallback_candidates, CodecFactory, Grabber, GrabberOptions, Recorder, RecorderOptions,
};
use crate::error::CodecError;
use crate::registry::{StreamEntry, StreamState};
use crate::service::StreamService;

/// Candidate-list passes attempted per connection, with linear backoff
/// between passes.
const CONNECT_CYCLES: u32 = 3;
/// First-frame liveness budget: attempts x retry interval.
const LIVENESS_ATTEMPTS: u32 = 70;
const LIVENESS_RETRY: Duration = Duration::from_millis(100);
/// Cadence for the current-fps update and the per-stream progress line.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);
const TRANSIENT_ERROR_SLEEP: Duration = Duration::from_millis(5);

/// Why a run ended without an error.
pub(crate) enum PipelineExit {
    StopRequested,
    Shutdown,
}

/// Run one connection to completion. The recorder and grabber are closed on
/// every exit path before the result is returned.
pub(crate) async fn run_once(
    service: &Arc<StreamService>,
    entry: &Arc<StreamEntry>,
    first_run: bool,
) -> Result<PipelineExit, CodecError> {
    let cfg = service.config();
    entry.set_state(if first_run {
        StreamState::Starting
    } else {
        StreamState::Reconnecting
    });

    // The first grab of a newly admitted stream is serialized behind the
    // startup gate so a herd of admissions cannot race through codec init
    // together. Reconnects skip the gate; a flapping camera must not starve
    // admissions.
    let mut grabber = if first_run {
        let _permit = service
            .startup_gate()
            .acquire()
            .await
            .expect("startup gate closed");
        let grabber = connect(service, entry).await?;
        tokio::time::sleep(Duration::from_millis(cfg.limits.startup_delay_ms)).await;
        grabber
    } else {
        connect(service, entry).await?
    };

    let source_fps = clamp_source_fps(grabber.source_fps());
    let target_fps = cfg.pipeline.target_fps.max(1);
    let skip_ratio = skip_ratio(source_fps, target_fps);
    entry
        .stats
        .set_source(source_fps, grabber.width(), grabber.height(), grabber.codec_name());

    // Any reopen after prior output is a discontinuity for players, whether
    // the supervisor reconnected or the health scanner recycled us.
    let recorder_opts = RecorderOptions {
        target_fps,
        segment_secs: cfg.pipeline.segment_secs,
        playlist_size: cfg.pipeline.playlist_size,
        crf: cfg.pipeline.crf,
        discontinuity: entry.stats.encoded_frames.load(Ordering::Relaxed) > 0,
    };
    let recorder = service
        .codecs()
        .create_hls(
            &entry.output_dir,
            grabber.width(),
            grabber.height(),
            &recorder_opts,
        )
        .await;
    let mut recorder = match recorder {
        Ok(recorder) => recorder,
        Err(err) => {
            grabber.close().await;
            return Err(err);
        }
    };

    info!(
        "Stream [{}] connected: {}x{} @ {:.1} fps -> {} fps (encoding 1 of every {} frames)",
        entry.name,
        grabber.width(),
        grabber.height(),
        source_fps,
        target_fps,
        skip_ratio
    );
    entry.set_state(StreamState::Running);

    let result = frame_loop(
        service,
        entry,
        grabber.as_mut(),
        recorder.as_mut(),
        source_fps,
        skip_ratio,
    )
    .await;

    // Release order mirrors acquisition in reverse, on every path.
    recorder.close().await;
    grabber.close().await;
    result
}

/// Try the candidate URL list until one produces a decodable frame.
async fn connect(
    service: &Arc<StreamService>,
    entry: &Arc<StreamEntry>,
) -> Result<Box<dyn Grabber>, CodecError> {
    let opts = GrabberOptions::default();
    let candidates = fallback_candidates(&entry.rtsp_url);
    let mut last_err: Option<CodecError> = None;

    for cycle in 0..CONNECT_CYCLES {
        if cycle > 0 {
            tokio::time::sleep(Duration::from_secs(cycle as u64)).await;
        }
        for url in &candidates {
            if entry.stop_requested() || service.is_shutting_down() {
                return Err(CodecError::Open {
                    url: url.clone(),
                    reason: "stopped while connecting".to_string(),
                });
            }
            match service.codecs().open_rtsp(url, &opts).await {
                Ok(mut grabber) => match await_first_frame(entry, grabber.as_mut()).await {
                    Ok(()) => {
                        if url != &entry.rtsp_url {
                            info!("Stream [{}] connected via fallback path {}", entry.name, url);
                        }
                        return Ok(grabber);
                    }
                    Err(err) => {
                        warn!("Stream [{}] opened {} but got no frames: {}", entry.name, url, err);
                        grabber.close().await;
                        last_err = Some(err);
                    }
                },
                Err(err) => {
                    debug!("Stream [{}] failed to open {}: {}", entry.name, url, err);
                    last_err = Some(err);
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CodecError::Open {
        url: entry.rtsp_url.clone(),
        reason: "no candidate produced frames".to_string(),
    }))
}

/// A source counts as connected only once it has produced a valid frame. The
/// probe frame is released immediately.
async fn await_first_frame(
    entry: &Arc<StreamEntry>,
    grabber: &mut dyn Grabber,
) -> Result<(), CodecError> {
    for _ in 0..LIVENESS_ATTEMPTS {
        if entry.stop_requested() {
            break;
        }
        match grabber.grab().await {
            Ok(Some(frame)) => {
                let valid = frame.is_valid();
                drop(frame);
                if valid {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(err) if err.is_transient() => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep(LIVENESS_RETRY).await;
    }
    Err(CodecError::Open {
        url: entry.rtsp_url.clone(),
        reason: "no valid frame within the liveness window".to_string(),
    })
}

async fn frame_loop(
    service: &Arc<StreamService>,
    entry: &Arc<StreamEntry>,
    grabber: &mut dyn Grabber,
    recorder: &mut dyn Recorder,
    source_fps: f64,
    skip_ratio: u64,
) -> Result<PipelineExit, CodecError> {
    let cfg = service.config();
    let frame_interval = Duration::from_secs_f64(1.0 / source_fps);
    let encode_timeout = Duration::from_millis(cfg.pipeline.encode_timeout_ms);
    let max_nulls = cfg.pipeline.max_null_frames;
    let max_encode_errors = cfg.pipeline.max_consecutive_encode_errors;

    let mut nulls: u32 = 0;
    let mut frame_counter: u64 = 0;
    let mut consecutive_encode_errors: u32 = 0;
    let mut last_read = Instant::now() - frame_interval;
    let mut last_encode = Instant::now();
    let mut last_report = Instant::now();
    let mut encoded_at_report = entry.stats.encoded_frames.load(Ordering::Relaxed);

    loop {
        if entry.stop_requested() {
            return Ok(PipelineExit::StopRequested);
        }
        if service.is_shutting_down() {
            return Ok(PipelineExit::Shutdown);
        }

        // Pace reads to the source cadence so the reader cannot gallop ahead
        // of a momentarily buffering network.
        let since_read = last_read.elapsed();
        if since_read < frame_interval {
            tokio::time::sleep(frame_interval - since_read).await;
        }
        last_read = Instant::now();

        let grabbed = match grabber.grab().await {
            Ok(grabbed) => grabbed,
            Err(err) if err.is_transient() => {
                entry.stats.ignored_errors.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(TRANSIENT_ERROR_SLEEP).await;
                continue;
            }
            Err(err) => return Err(err),
        };

        let Some(frame) = grabbed else {
            nulls += 1;
            if nulls >= max_nulls {
                warn!("Stream [{}] stalled: {} consecutive empty grabs", entry.name, nulls);
                return Err(CodecError::Stalled(nulls));
            }
            tokio::time::sleep(null_backoff(nulls)).await;
            continue;
        };
        nulls = 0;

        if !frame.is_valid() {
            drop(frame);
            tokio::time::sleep(TRANSIENT_ERROR_SLEEP).await;
            continue;
        }

        entry.mark_frame();
        entry.stats.read_frames.fetch_add(1, Ordering::Relaxed);
        frame_counter += 1;

        if frame_counter % skip_ratio == 0 {
            match recorder.record(&frame).await {
                Ok(()) => {
                    entry.stats.encoded_frames.fetch_add(1, Ordering::Relaxed);
                    consecutive_encode_errors = 0;
                    last_encode = Instant::now();
                }
                Err(err) => {
                    entry.stats.errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_encode_errors += 1;
                    if consecutive_encode_errors >= max_encode_errors {
                        drop(frame);
                        return Err(CodecError::EncoderFailure(format!(
                            "{consecutive_encode_errors} consecutive encode errors, last: {err}"
                        )));
                    }
                    debug!("Stream [{}] encode error ({}): {}", entry.name, consecutive_encode_errors, err);
                }
            }
        } else {
            entry.stats.skipped_frames.fetch_add(1, Ordering::Relaxed);
        }

        // The frame's buffer is released here, before the next grab, on
        // every path through the loop body.
        drop(frame);

        if last_encode.elapsed() > encode_timeout {
            return Err(CodecError::EncodeTimeout(encode_timeout.as_secs()));
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            let encoded = entry.stats.encoded_frames.load(Ordering::Relaxed);
            let fps = (encoded - encoded_at_report) as f64 / last_report.elapsed().as_secs_f64();
            entry.stats.set_current_fps(fps);
            info!(
                "Stream [{}]: read {}, encoded {} @ {:.1} fps ({} skipped, {} ignored errors)",
                entry.name,
                entry.stats.read_frames.load(Ordering::Relaxed),
                encoded,
                fps,
                entry.stats.skipped_frames.load(Ordering::Relaxed),
                entry.stats.ignored_errors.load(Ordering::Relaxed),
            );
            encoded_at_report = encoded;
            last_report = Instant::now();
        }
    }
}

/// Cameras advertise anything from 0 to garbage; clamp to [1, 60] and assume
/// the IP-camera default when unknown.
pub(crate) fn clamp_source_fps(fps: f64) -> f64 {
    if fps.is_finite() && (1.0..=60.0).contains(&fps) {
        fps
    } else {
        25.0
    }
}

/// Encode every Nth read frame to hit the target output rate.
pub(crate) fn skip_ratio(source_fps: f64, target_fps: u32) -> u64 {
    ((source_fps / target_fps as f64).round() as u64).max(1)
}

/// Sleep ladder for consecutive empty grabs: quick retries at first, longer
/// as the gap grows.
fn null_backoff(nulls: u32) -> Duration {
    let ms = if nulls < 10 {
        5
    } else if nulls < 100 {
        10
    } else if nulls < 300 {
        20
    } else {
        50
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_ratio_follows_the_rounding_law() {
        assert_eq!(skip_ratio(25.0, 10), 3); // round(2.5) away from zero
        assert_eq!(skip_ratio(25.0, 25), 1);
        assert_eq!(skip_ratio(50.0, 10), 5);
        assert_eq!(skip_ratio(8.0, 10), 1); // never below 1
        assert_eq!(skip_ratio(60.0, 8), 8);
    }

    #[test]
    fn source_fps_clamps_to_sane_camera_rates() {
        assert_eq!(clamp_source_fps(25.0), 25.0);
        assert_eq!(clamp_source_fps(0.0), 25.0);
        assert_eq!(clamp_source_fps(-5.0), 25.0);
        assert_eq!(clamp_source_fps(90.0), 25.0);
        assert_eq!(clamp_source_fps(f64::NAN), 25.0);
        assert_eq!(clamp_source_fps(1.0), 1.0);
        assert_eq!(clamp_source_fps(60.0), 60.0);
    }

    #[test]
    fn null_backoff_grows_with_the_counter() {
        assert_eq!(null_backoff(1), Duration::from_millis(5));
        assert_eq!(null_backoff(10), Duration::from_millis(10));
        assert_eq!(null_backoff(150), Duration::from_millis(20));
        assert_eq!(null_backoff(499), Duration::from_millis(50));
    }
}
