use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Envelope(#[from] cqrs_envelope::EnvelopeError),

    #[error("no type registered for canonical name '{0}'")]
    NotRegistered(String),

    #[error("registered factory for '{name}' does not match the handler's declared type")]
    TypeMismatch { name: String },

    #[error("handler panicked: {0}")]
    Recovered(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("handler exceeded retry budget after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("{0}")]
    Handler(String),

    #[error("router close timed out before all workers drained")]
    CloseTimedOut,
}

pub type RouterResult<T> = Result<T, RouterError>;
