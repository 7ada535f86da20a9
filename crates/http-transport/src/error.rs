use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpTransportError {
    #[error("request deadline is closer than the configured threshold")]
    DeadlineTooClose,

    #[error("request was canceled before admission")]
    ContextCanceled,

    #[error("invalid limiter configuration: {0}")]
    InvalidLimiterConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

pub type HttpTransportResult<T> = Result<T, HttpTransportError>;
