//! End-to-end properties of the stream service, driven entirely by the mock
//! codecs. Timings are scaled down so every failure path fits in a few
//! seconds of wall clock.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use camgate::codec::mock::MockCodecs;
use camgate::codec::CodecFactory;
use camgate::{AppConfig, StartError, StreamService, StreamStatus};

fn test_config(root: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.hls_root = root.path().join("hls").to_string_lossy().into_owned();
    config.server.csv_log_path = root.path().join("stats.csv").to_string_lossy().into_owned();
    config.limits.startup_delay_ms = 0;
    config.pipeline.target_fps = 10;
    config.recovery.reconnect_delay_ms = 50;
    config.recovery.max_reconnect_delay_ms = 200;
    config.recovery.stop_wait_ms = 500;
    // Scanner timings are overridden per test; keep them inert by default.
    config.recovery.stream_timeout_ms = 60_000;
    config.recovery.health_check_interval_ms = 60_000;
    config.recovery.memory_check_interval_ms = 60_000;
    config.recovery.csv_log_interval_ms = 60_000;
    config
}

fn service_with(config: AppConfig, codecs: Arc<MockCodecs>) -> Arc<StreamService> {
    StreamService::with_codecs(config, codecs as Arc<dyn CodecFactory>)
}

async fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_is_idempotent_and_publishes_the_playlist_path() {
    let root = TempDir::new().unwrap();
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(test_config(&root), codecs.clone());

    let first = service.start("rtsp://mock/ok", "cam_1").unwrap();
    assert_eq!(first, "/hls/cam_1/stream.m3u8");
    // The path is observable immediately, even while the stream is still
    // connecting.
    assert_ne!(service.status("cam_1"), StreamStatus::NotFound);

    let second = service.start("rtsp://mock/ok", "cam_1").unwrap();
    assert_eq!(second, first);
    assert_eq!(service.list().len(), 1);

    assert!(
        wait_until(Duration::from_secs(5), || {
            service.stats("cam_1").map(|s| s.read_frames).unwrap_or(0) > 0
        })
        .await
    );
    // Idempotent start never opened a second grabber.
    assert_eq!(codecs.counters.grabbers_opened.load(Ordering::Relaxed), 1);

    service.stop("cam_1").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn names_are_sanitized_into_safe_path_segments() {
    let root = TempDir::new().unwrap();
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(test_config(&root), codecs);

    let path = service.start("rtsp://mock/ok", "cam/../bad name").unwrap();
    assert_eq!(path, "/hls/cam____bad_name/stream.m3u8");
    assert_ne!(service.status("cam/../bad name"), StreamStatus::NotFound);

    service.stop("cam/../bad name").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn validation_failures_register_nothing() {
    let root = TempDir::new().unwrap();
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(test_config(&root), codecs);

    assert!(matches!(
        service.start("", "cam_1"),
        Err(StartError::InvalidUrl)
    ));
    assert!(matches!(
        service.start("rtsp://mock/ok", ""),
        Err(StartError::InvalidName(_))
    ));
    assert!(service.list().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_gate_rejects_and_recovers() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config.limits.max_streams = 2;
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(config, codecs);

    service.start("rtsp://mock/ok", "a").unwrap();
    service.start("rtsp://mock/ok", "b").unwrap();
    assert!(matches!(
        service.start("rtsp://mock/ok", "c"),
        Err(StartError::CapacityExceeded(2))
    ));

    service.stop("a").await;
    service.start("rtsp://mock/ok", "c").unwrap();

    service.stop("b").await;
    service.stop("c").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_cleans_disk_and_releases_every_resource() {
    let root = TempDir::new().unwrap();
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(test_config(&root), codecs.clone());

    service.start("rtsp://mock/ok", "cam_x").unwrap();
    let dir = root.path().join("hls").join("cam_x");
    assert!(dir.exists());

    assert!(
        wait_until(Duration::from_secs(5), || {
            service.stats("cam_x").map(|s| s.read_frames).unwrap_or(0) >= 5
        })
        .await
    );

    let stopped_at = Instant::now();
    service.stop("cam_x").await;
    assert!(stopped_at.elapsed() < Duration::from_millis(3_500));

    assert!(!dir.exists());
    assert_eq!(service.status("cam_x"), StreamStatus::NotFound);
    assert_eq!(codecs.counters.grabbers_live(), 0);
    assert_eq!(codecs.counters.recorders_live(), 0);
    assert_eq!(codecs.frames.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_grabs_are_serialized_behind_the_startup_gate() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config.limits.startup_delay_ms = 300;
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(config, codecs.clone());

    service.start("rtsp://mock/ok", "cam_a").unwrap();
    service.start("rtsp://mock/ok", "cam_b").unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || codecs.open_log().len() >= 2).await
    );
    let log = codecs.open_log();
    let gap = log[1].1.duration_since(log[0].1);
    assert!(
        gap >= Duration::from_millis(250),
        "second open began only {gap:?} after the first"
    );

    service.stop("cam_a").await;
    service.stop("cam_b").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frame_skipping_hits_the_target_ratio() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    // 50 fps source against the 10 fps target: encode one frame in five.
    let codecs = Arc::new(MockCodecs::new().with_source_fps(50.0).with_frame_limit(90));
    let service = service_with(config, codecs.clone());

    service.start("rtsp://mock/ok", "cam_skip").unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            service.stats("cam_skip").map(|s| s.read_frames).unwrap_or(0) >= 85
        })
        .await
    );

    let stats = service.stats("cam_skip").unwrap();
    let expected = stats.read_frames as f64 / 5.0;
    assert!(
        (stats.encoded_frames as f64 - expected).abs() <= 2.0,
        "read {} encoded {} (expected about {:.0})",
        stats.read_frames,
        stats.encoded_frames,
        expected
    );
    assert_eq!(
        stats.read_frames,
        stats.encoded_frames + stats.skipped_frames
    );

    service.stop("cam_skip").await;
    assert_eq!(codecs.frames.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_stalled_source_triggers_reconnect_cycles() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config.pipeline.max_null_frames = 10;
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(config, codecs.clone());

    // One frame satisfies the liveness probe, then the source goes silent;
    // every run ends in a stall and the supervisor reconnects.
    service.start("rtsp://mock/one-then-null", "cam_stall").unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            service
                .stats("cam_stall")
                .map(|s| s.start_attempts)
                .unwrap_or(0)
                >= 3
        })
        .await
    );

    service.stop("cam_stall").await;
    assert_eq!(codecs.frames.live(), 0);
    assert_eq!(codecs.counters.grabbers_live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn health_scanner_finalizes_a_dead_stream() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config.recovery.stream_timeout_ms = 200;
    config.recovery.health_check_interval_ms = 100;
    config.recovery.max_health_recycles = 2;
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(config, codecs.clone());
    let _guardians = service.spawn_background_tasks();

    service.start("rtsp://mock/refuse", "cam_dead").unwrap();
    let dir = root.path().join("hls").join("cam_dead");

    assert!(
        wait_until(Duration::from_secs(10), || {
            service.status("cam_dead") == StreamStatus::NotFound
        })
        .await,
        "stream was never finalized"
    );
    assert!(!dir.exists());
    assert_eq!(service.system_stats().dead_streams, 1);
    assert_eq!(codecs.frames.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_stops_everything_and_refuses_new_admits() {
    let root = TempDir::new().unwrap();
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(test_config(&root), codecs.clone());

    service.start("rtsp://mock/ok", "one").unwrap();
    service.start("rtsp://mock/ok", "two").unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            service.stats("one").map(|s| s.read_frames).unwrap_or(0) > 0
                && service.stats("two").map(|s| s.read_frames).unwrap_or(0) > 0
        })
        .await
    );

    service.shutdown().await;

    assert_eq!(service.status("one"), StreamStatus::NotFound);
    assert_eq!(service.status("two"), StreamStatus::NotFound);
    assert!(matches!(
        service.start("rtsp://mock/ok", "three"),
        Err(StartError::ShuttingDown)
    ));
    assert_eq!(codecs.counters.grabbers_live(), 0);
    assert_eq!(codecs.counters.recorders_live(), 0);
    assert_eq!(codecs.frames.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decoder_noise_is_counted_but_never_fatal() {
    let root = TempDir::new().unwrap();
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(test_config(&root), codecs.clone());

    service.start("rtsp://mock/flaky", "cam_flaky").unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let stats = service.stats("cam_flaky");
            stats
                .map(|s| s.read_frames >= 25 && s.ignored_errors >= 1)
                .unwrap_or(false)
        })
        .await
    );

    let stats = service.stats("cam_flaky").unwrap();
    assert_eq!(stats.errors, 0, "transient noise must not count as errors");
    assert_eq!(stats.start_attempts, 1, "noise must not trigger reconnects");

    service.stop("cam_flaky").await;
    assert_eq!(codecs.frames.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn system_stats_reflect_the_pool_and_registry() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config.limits.worker_threads = 8;
    let codecs = Arc::new(MockCodecs::new());
    let service = service_with(config, codecs);

    service.start("rtsp://mock/ok", "s1").unwrap();
    service.start("rtsp://mock/ok", "s2").unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            service.system_stats().pool.active == 2
        })
        .await
    );

    let stats = service.system_stats();
    assert_eq!(stats.active_streams, 2);
    assert_eq!(stats.pool.total, 8);
    assert_eq!(stats.queue_size, 0);

    service.stop("s1").await;
    service.stop("s2").await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            service.system_stats().pool.active == 0
        })
        .await
    );
}
