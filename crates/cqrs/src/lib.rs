//! # Client shell (C11)
//!
//! Assembles the bus, router, outbox forwarder, and HTTP transport into one
//! runnable unit, the library-level equivalent of the teacher's per-service
//! `main.rs` wiring (connect dependencies, spawn the background workers,
//! wait for a shutdown signal, drain everything in reverse order). The
//! binary entrypoint itself — argument parsing, config loading, concrete
//! transport/database driver construction — is left to the host
//! application, per the "CLI/config loading are external collaborators"
//! non-goal.
//!
//! [`Client::run`] mirrors `identity-service`'s `main` body: start the
//! background relay and router workers, then block until `shutdown_signal`
//! (here, a caller-supplied `Future`) resolves, then close every component
//! in the order that makes later components safe to stop first.

use std::sync::Arc;
use std::time::Duration;

use cqrs_bus::Bus;
use cqrs_router::Router;
use http_transport::HttpTransport;
use outbox_forwarder::OutboxForwarder;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Bus(#[from] cqrs_bus::BusError),
    #[error(transparent)]
    Router(#[from] cqrs_router::RouterError),
    #[error(transparent)]
    Forwarder(#[from] outbox_forwarder::ForwarderError),
    #[error(transparent)]
    Transport(#[from] http_transport::HttpTransportError),
}

/// How long [`Client::close`] waits for the router and forwarder to drain
/// before giving up (the background workers keep running to completion
/// regardless; this only bounds how long the caller's shutdown blocks).
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    pub router_timeout: Duration,
    pub forwarder_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            router_timeout: Duration::from_secs(30),
            forwarder_timeout: Duration::from_secs(30),
        }
    }
}

/// Bundles the handles a running service needs: the publish-side [`Bus`],
/// the inbound [`Router`], the [`OutboxForwarder`] relay, and the outbound
/// [`HttpTransport`]. Generic over the bus's marshaler the same way [`Bus`]
/// itself is, so a caller can choose [`cqrs_envelope::JsonMarshaler`] or the
/// protobuf marshaler without `Client` caring.
pub struct Client<M> {
    pub bus: Arc<Bus<M>>,
    pub router: Router,
    pub forwarder: OutboxForwarder,
    pub transport: Arc<HttpTransport>,
}

impl<M> Client<M> {
    pub fn new(bus: Arc<Bus<M>>, router: Router, forwarder: OutboxForwarder, transport: Arc<HttpTransport>) -> Self {
        Self {
            bus,
            router,
            forwarder,
            transport,
        }
    }

    /// Starts the router's per-topic workers and the outbox forwarder relay,
    /// then blocks until `shutdown` resolves. Mirrors the teacher's
    /// `serve_with_shutdown` pattern: the background work and the shutdown
    /// wait run concurrently, and `shutdown` resolving is what triggers
    /// `close`.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>, config: ShutdownConfig) -> Result<(), ClientError> {
        let router = self.router.clone();
        let forwarder = self.forwarder.clone();

        let router_task = tokio::spawn(async move { router.run().await });
        let forwarder_task = tokio::spawn(async move { forwarder.run().await });

        shutdown.await;
        info!("shutdown signal received, closing client");

        self.close(config).await?;

        // The worker tasks resolve once `close` unblocks their loops; join
        // them so a caller awaiting `run` observes every background task as
        // fully stopped, not merely signaled.
        let _ = router_task.await;
        let _ = forwarder_task.await;

        Ok(())
    }

    /// Idempotent. Stops the forwarder first (so no new envelopes enter the
    /// bus while the router is still draining in-flight handlers), then the
    /// router, then the HTTP transport's host-state sweeper.
    pub async fn close(&self, config: ShutdownConfig) -> Result<(), ClientError> {
        self.forwarder.close(config.forwarder_timeout).await?;
        self.router.close(config.router_timeout).await?;
        self.transport.close().await;
        Ok(())
    }
}
