//! Error taxonomy for the outbox forwarder (C6).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("forwarder topic is required")]
    ForwarderTopicRequired,

    #[error("failed to subscribe to forwarder topic '{topic}': {source}")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: cqrs_bus::PublisherError,
    },

    /// Returned by `close` when the shutdown deadline elapses before the
    /// underlying relay finished draining. The relay itself keeps running
    /// to completion in the background; this error reports only that the
    /// caller's wait timed out, per §4.6's "leaves no background goroutines
    /// (the underlying close still drains)".
    #[error("close timed out waiting for the forwarder to drain")]
    CloseTimedOut,
}

pub type ForwarderResult<T> = Result<T, ForwarderError>;
