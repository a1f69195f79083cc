//! camgate — an RTSP to HLS video-ingest gateway.
//!
//! The core is [`StreamService`]: admit a stream by name, get a playlist path
//! back synchronously, and the service keeps the transcode alive — paced
//! decoding, skip-selection down to the target output rate, auto-reconnect
//! with backoff, health-based recycling and memory-pressure eviction — until
//! it is stopped. The HTTP layer in `web/` is a thin axum shell over the
//! service.

pub mod codec;
pub mod config;
pub mod error;
mod pipeline;
mod registry;
pub mod service;
pub mod stats;
mod supervisor;
pub mod telemetry;
mod watchdog;
pub mod web;

pub use config::AppConfig;
pub use error::{CodecError, StartError};
pub use service::{SharedService, StreamInfo, StreamService, StreamStatus};
pub use stats::StatsSnapshot;
