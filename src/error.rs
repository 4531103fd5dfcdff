//! Error types for the frame pipeline and capture session

use std::io;

use thiserror::Error;

use crate::capture::device::RequestTag;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is stopped")]
    AlreadyStopped,
    #[error("failed to spawn consumer thread: {0}")]
    SpawnFailed(#[source] io::Error),
    #[error("consumer thread panicked outside the detector boundary")]
    ConsumerPanicked,
    #[error("buffer from pool {owner} does not belong to pool {pool}")]
    UnknownBuffer { pool: u64, owner: u64 },
    #[error("cpu core {0} is not available for pinning")]
    AffinityUnavailable(usize),
}

/// Errors raised by a camera backend. All of them are recoverable: the
/// session logs them and falls back to plain preview.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera access revoked: {0}")]
    AccessRevoked(String),
    #[error("camera is closed")]
    Closed,
    #[error("unsupported camera configuration: {0}")]
    Unsupported(String),
    #[error("{tag:?} request failed: {reason}")]
    RequestFailed { tag: RequestTag, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("frame pipeline failed to start: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("camera failed to start: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn capture control thread: {0}")]
    ControlSpawn(#[source] io::Error),
    #[error("capture control thread panicked")]
    ControlThreadPanicked,
}

/// Error reported by a detector for a single frame.
pub type DetectorError = Box<dyn std::error::Error + Send + Sync + 'static>;
