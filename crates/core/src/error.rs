use thiserror::Error;

/// Errors surfaced by the step-wise generation pipeline.
///
/// `Validation` and `Config` are raised by `prepare` before any session
/// state is replaced. Everything else comes out of a running step; after
/// such a failure the session must be prepared again.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("missing or invalid configuration: {0}")]
    Config(String),

    #[error("unexpected shape: {0}")]
    Shape(String),

    #[error("tokenizer failure: {0}")]
    Tokenizer(String),

    #[error("step callback failed: {0}")]
    Callback(String),

    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor op failed: {0}")]
    Candle(#[from] candle_core::Error),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// True for errors raised while checking a request, which leave any
    /// existing session untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(
            PipelineError::validation("prompt is empty").to_string(),
            "invalid request: prompt is empty"
        );
        assert_eq!(
            PipelineError::config("base_shift").to_string(),
            "missing or invalid configuration: base_shift"
        );
        assert_eq!(
            PipelineError::shape("15 image tokens").to_string(),
            "unexpected shape: 15 image tokens"
        );
    }

    #[test]
    fn candle_errors_convert() {
        let err: PipelineError = candle_core::Error::Msg("boom".into()).into();
        assert!(matches!(err, PipelineError::Candle(_)));
        assert!(!err.is_rejection());
    }

    #[test]
    fn rejections_are_request_level() {
        assert!(PipelineError::validation("x").is_rejection());
        assert!(PipelineError::config("x").is_rejection());
        assert!(!PipelineError::Callback("x".into()).is_rejection());
    }
}
