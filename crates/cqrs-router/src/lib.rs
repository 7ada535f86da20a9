//! Handler adapter and router (C7): binds canonical-named handlers to
//! subscriber topics and dispatches inbound envelopes through a
//! Recover/CircuitBreaker/Retry/Timeout decorator chain, with an optional
//! dead-letter handoff on exhaustion.

mod adapter;
mod context;
mod error;
mod router;

pub use adapter::{Handler, HandlerAdapter, HandlerDecoratorConfig};
pub use context::HandlerContext;
pub use error::{RouterError, RouterResult};
pub use router::{EnvelopeHandler, Router, RouterBuilder};
