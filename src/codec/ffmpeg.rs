//! FFmpeg-backed codec adapters.
//!
//! The grabber drives an `ffmpeg` child that decodes the RTSP source to
//! packed BGR frames on stdout; the recorder drives a second child that muxes
//! raw frames from stdin into a sliding-window HLS playlist. Dimensions and
//! the advertised frame rate come from a one-shot `ffprobe` run before the
//! decoder starts.
//!
//! Decoder log classification by substring lives here and must not leak into
//! the rest of the crate.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{CodecFactory, Frame, Grabber, GrabberOptions, Recorder, RecorderOptions};
use crate::error::CodecError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Decoder noise that must never end a pipeline run.
const TRANSIENT_PATTERNS: &[&str] = &[
    "no frame",
    "missing picture",
    "Could not find reference",
    "error while decoding MB",
    "corrupted frame",
    "bytestream",
];

/// Lines that mean the source itself is gone.
const FATAL_PATTERNS: &[&str] = &[
    "Connection refused",
    "Connection reset",
    "Connection timed out",
    "Network is unreachable",
    "End of file",
    "Server returned 4",
    "Server returned 5",
];

fn classify_decoder_line(line: &str) -> Option<CodecError> {
    if TRANSIENT_PATTERNS.iter().any(|p| line.contains(p)) {
        return Some(CodecError::Transient(line.to_string()));
    }
    if FATAL_PATTERNS.iter().any(|p| line.contains(p)) {
        return Some(CodecError::ConnectionLost(line.to_string()));
    }
    None
}

/// Factory producing subprocess-backed grabbers and recorders.
pub struct FfmpegCodecs {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl FfmpegCodecs {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    async fn probe(&self, url: &str, opts: &GrabberOptions) -> Result<ProbedStream, CodecError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.arg("-v")
            .arg("error")
            .arg("-rtsp_transport")
            .arg(if opts.transport_tcp { "tcp" } else { "udp" })
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=codec_name,width,height,avg_frame_rate")
            .arg("-of")
            .arg("csv=p=0")
            .arg(url);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| CodecError::Open {
                url: url.to_string(),
                reason: "probe timed out".to_string(),
            })?
            .map_err(CodecError::Io)?;

        if !output.status.success() {
            return Err(CodecError::Open {
                url: url.to_string(),
                reason: format!("probe exited with {}", output.status),
            });
        }

        parse_probe_line(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            CodecError::Open {
                url: url.to_string(),
                reason: "probe returned no video stream".to_string(),
            }
        })
    }
}

#[async_trait]
impl CodecFactory for FfmpegCodecs {
    async fn open_rtsp(
        &self,
        url: &str,
        opts: &GrabberOptions,
    ) -> Result<Box<dyn Grabber>, CodecError> {
        let probed = self.probe(url, opts).await?;

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-hide_banner").arg("-loglevel").arg("warning").arg("-nostats");
        if opts.transport_tcp {
            cmd.arg("-rtsp_transport").arg("tcp");
            cmd.arg("-rtsp_flags").arg("prefer_tcp");
        }
        cmd.arg("-stimeout").arg(opts.socket_timeout_us.to_string());
        cmd.arg("-rw_timeout").arg(opts.socket_timeout_us.to_string());
        cmd.arg("-analyzeduration").arg(opts.analyze_duration_us.to_string());
        cmd.arg("-probesize").arg(opts.probe_size_bytes.to_string());
        cmd.arg("-reorder_queue_size").arg(opts.reorder_queue_size.to_string());
        cmd.arg("-buffer_size").arg(opts.buffer_size_bytes.to_string());
        if opts.discard_corrupt {
            cmd.arg("-fflags").arg("+discardcorrupt+genpts");
        } else {
            cmd.arg("-fflags").arg("+genpts");
        }
        if opts.error_concealment {
            cmd.arg("-err_detect").arg("ignore_err");
            cmd.arg("-ec").arg("favor_inter+guess_mvs+deblock");
        }
        cmd.arg("-allowed_media_types").arg("video");
        cmd.arg("-use_wallclock_as_timestamps").arg("1");
        cmd.arg("-i").arg(url);
        cmd.arg("-an");
        cmd.arg("-pix_fmt").arg("bgr24");
        cmd.arg("-f").arg("rawvideo");
        cmd.arg("-");

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(CodecError::Io)?;
        let stdout = child.stdout.take().ok_or_else(|| CodecError::Open {
            url: url.to_string(),
            reason: "decoder stdout not captured".to_string(),
        })?;

        // Decoder chatter is classified off the hot path; the grabber drains
        // the channel on every grab.
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        if let Some(stderr) = child.stderr.take() {
            let url = url.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("decoder [{}]: {}", url, line);
                    if let Some(err) = classify_decoder_line(&line) {
                        if stderr_tx.send(err).is_err() {
                            break;
                        }
                    }
                }
            });
        }

        let read_timeout = grab_timeout(probed.fps);
        Ok(Box::new(FfmpegGrabber {
            child,
            stdout,
            stderr_rx,
            frame_len: probed.width as usize * probed.height as usize * 3,
            width: probed.width,
            height: probed.height,
            fps: probed.fps,
            codec: probed.codec,
            read_timeout,
        }))
    }

    async fn create_hls(
        &self,
        dir: &Path,
        width: u32,
        height: u32,
        opts: &RecorderOptions,
    ) -> Result<Box<dyn Recorder>, CodecError> {
        let playlist = dir.join("stream.m3u8");
        let segments = dir.join("s%d.ts");
        let fps = opts.target_fps.max(1);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        cmd.arg("-f").arg("rawvideo");
        cmd.arg("-pix_fmt").arg("bgr24");
        cmd.arg("-s").arg(format!("{width}x{height}"));
        cmd.arg("-r").arg(fps.to_string());
        cmd.arg("-i").arg("-");
        cmd.arg("-an");
        if let Some((sw, sh)) = scaled_dims(width, height) {
            cmd.arg("-vf").arg(format!("scale={sw}:{sh}"));
        }
        cmd.arg("-c:v").arg("libx264");
        cmd.arg("-preset").arg("ultrafast");
        cmd.arg("-tune").arg("zerolatency");
        cmd.arg("-crf").arg(opts.crf.to_string());
        cmd.arg("-maxrate").arg("800k");
        cmd.arg("-bufsize").arg("1200k");
        cmd.arg("-g").arg((fps * 2).to_string());
        cmd.arg("-keyint_min").arg(fps.to_string());
        cmd.arg("-sc_threshold").arg("0");
        cmd.arg("-refs").arg("1");
        cmd.arg("-bf").arg("0");
        cmd.arg("-threads").arg("1");
        cmd.arg("-fps_mode").arg("cfr");
        cmd.arg("-f").arg("hls");
        cmd.arg("-hls_time").arg(opts.segment_secs.to_string());
        cmd.arg("-hls_list_size").arg(opts.playlist_size.to_string());
        cmd.arg("-hls_flags").arg(hls_flags(opts.discontinuity));
        cmd.arg("-hls_segment_type").arg("mpegts");
        cmd.arg("-hls_allow_cache").arg("0");
        cmd.arg("-hls_segment_filename").arg(&segments);
        cmd.arg(&playlist);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(CodecError::Io)?;
        let stdin = child.stdin.take().ok_or_else(|| CodecError::EncoderFailure(
            "encoder stdin not captured".to_string(),
        ))?;

        if let Some(stderr) = child.stderr.take() {
            let name = playlist.display().to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("encoder [{}]: {}", name, line);
                }
            });
        }

        Ok(Box::new(FfmpegRecorder {
            child,
            stdin: Some(stdin),
            frame_len: width as usize * height as usize * 3,
        }))
    }
}

struct ProbedStream {
    codec: Option<String>,
    width: u32,
    height: u32,
    fps: f64,
}

/// Parse one `csv=p=0` probe line, e.g. `h264,1920,1080,25/1`.
fn parse_probe_line(out: &str) -> Option<ProbedStream> {
    let line = out.lines().find(|l| !l.trim().is_empty())?;
    let mut parts = line.trim().split(',');
    let codec = parts.next().map(str::to_string).filter(|c| !c.is_empty());
    let width: u32 = parts.next()?.trim().parse().ok()?;
    let height: u32 = parts.next()?.trim().parse().ok()?;
    let fps = parts.next().map(parse_rate).unwrap_or(0.0);
    if width == 0 || height == 0 {
        return None;
    }
    Some(ProbedStream {
        codec,
        width,
        height,
        fps,
    })
}

/// Parse an FFmpeg rational rate such as `25/1`; `0/0` means unknown.
fn parse_rate(raw: &str) -> f64 {
    let raw = raw.trim();
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => raw.parse().unwrap_or(0.0),
    }
}

/// How long one grab may wait before it counts as a null frame: four source
/// frame intervals, never less than half a second.
fn grab_timeout(fps: f64) -> Duration {
    let interval_ms = if fps > 0.0 { 1000.0 / fps } else { 250.0 };
    Duration::from_millis(((interval_ms * 4.0) as u64).max(500))
}

/// Downscale anything above 720p to fit 1280x720, preserving aspect ratio and
/// forcing even dimensions (libx264 yuv420p requirement).
fn scaled_dims(width: u32, height: u32) -> Option<(u32, u32)> {
    if width <= 1280 && height <= 720 {
        return None;
    }
    let scale = f64::min(1280.0 / width as f64, 720.0 / height as f64);
    let w = ((width as f64 * scale) as u32) & !1;
    let h = ((height as f64 * scale) as u32) & !1;
    Some((w.max(2), h.max(2)))
}

fn hls_flags(discontinuity: bool) -> &'static str {
    if discontinuity {
        "delete_segments+append_list+program_date_time+discont_start"
    } else {
        "delete_segments+append_list+program_date_time"
    }
}

struct FfmpegGrabber {
    child: Child,
    stdout: ChildStdout,
    stderr_rx: mpsc::UnboundedReceiver<CodecError>,
    frame_len: usize,
    width: u32,
    height: u32,
    fps: f64,
    codec: Option<String>,
    read_timeout: Duration,
}

#[async_trait]
impl Grabber for FfmpegGrabber {
    async fn grab(&mut self) -> Result<Option<Frame>, CodecError> {
        if let Ok(err) = self.stderr_rx.try_recv() {
            return Err(err);
        }

        let mut buf = vec![0u8; self.frame_len];
        match tokio::time::timeout(self.read_timeout, self.stdout.read_exact(&mut buf)).await {
            // Nothing arrived inside the read window.
            Err(_) => Ok(None),
            Ok(Ok(_)) => Ok(Some(Frame::new(buf, self.width, self.height))),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(
                CodecError::ConnectionLost("decoder process exited".to_string()),
            ),
            Ok(Err(err)) => Err(CodecError::Io(err)),
        }
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn source_fps(&self) -> f64 {
        self.fps
    }

    fn codec_name(&self) -> Option<&str> {
        self.codec.as_deref()
    }

    async fn close(&mut self) {
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.child.wait()).await;
    }
}

struct FfmpegRecorder {
    child: Child,
    stdin: Option<ChildStdin>,
    frame_len: usize,
}

#[async_trait]
impl Recorder for FfmpegRecorder {
    async fn record(&mut self, frame: &Frame) -> Result<(), CodecError> {
        if frame.data().len() != self.frame_len {
            return Err(CodecError::EncoderFailure(format!(
                "frame size {} does not match configured {}",
                frame.data().len(),
                self.frame_len
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CodecError::EncoderFailure("encoder already closed".to_string()))?;
        stdin.write_all(frame.data()).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::BrokenPipe {
                CodecError::EncoderFailure("encoder process exited".to_string())
            } else {
                CodecError::Io(err)
            }
        })
    }

    async fn close(&mut self) {
        // Dropping stdin signals EOF so the muxer can flush the playlist.
        drop(self.stdin.take());
        if tokio::time::timeout(CLOSE_TIMEOUT, self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }
}
