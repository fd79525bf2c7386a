use thiserror::Error;

/// Capture and dispatch errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Fatal to `start_session`: the source was denied or nothing matched the selector.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Per-frame transport failure (connect, timeout, undecodable body).
    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    /// The service answered with an `error` field.
    #[error("endpoint error: {0}")]
    EndpointError(String),

    #[error("no active capture session")]
    NoActiveSession,

    #[error("sampling interval must be greater than zero")]
    InvalidInterval,

    #[error("dispatcher is no longer running")]
    DispatcherClosed,
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        CaptureError::DispatchFailure(err.to_string())
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, CaptureError>;
