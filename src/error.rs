use std::io;

use thiserror::Error;

/// Errors reported synchronously by [`crate::StreamService::start`].
///
/// A duplicate start is not an error: the existing playlist path is returned
/// unchanged.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("RTSP URL must not be empty")]
    InvalidUrl,

    #[error("stream name {0:?} is empty after sanitization")]
    InvalidName(String),

    #[error("stream capacity exceeded ({0} streams registered)")]
    CapacityExceeded(usize),

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("failed to prepare output directory: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the codec adapters and the frame loop.
///
/// Transient decoder noise is counted and swallowed by the pipeline; every
/// other variant ends the current run and hands control back to the
/// supervisor.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to open video source {url}: {reason}")]
    Open { url: String, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("stream stalled after {0} consecutive empty grabs")]
    Stalled(u32),

    #[error("encoder failure: {0}")]
    EncoderFailure(String),

    #[error("no successful encode for {0} seconds")]
    EncodeTimeout(u64),

    #[error("transient decoder error: {0}")]
    Transient(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CodecError::Transient(_))
    }
}
