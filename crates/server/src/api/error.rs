use thiserror::Error;

use fluxstep_core::PipelineError;

/// Problems with a client frame. Reported back on the socket; the
/// connection stays open.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} data: {reason}")]
    InvalidData { kind: &'static str, reason: String },
}

/// Failures of the session coordinator.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active session, send prepare_latents first")]
    NoSession,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("generation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
