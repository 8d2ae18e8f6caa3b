//! gRPC service implementation for progressive search refinement.
//!
//! This module defines [`SearchService`], the concrete implementation of the
//! [`SearchRefiner`] gRPC service. Every `Refine` call gets a session id from
//! a counter owned by the service, a bounded response channel, and its own
//! task running [`drive_session`]. The response stream handed back to tonic
//! is the receiving end of that channel, so the session closing its sender is
//! what ends the call.
//!
//! ## Responsibilities
//!
//! - Assign session ids and track in-flight sessions.
//! - Spawn one instrumented session task per stream.
//! - Refuse new streams and drain or cancel live ones on shutdown.

use crate::server::{
    config::ServerConfig,
    session::{CallSession, drive_session},
    telemetry::{
        decrement_sessions_inflight, increment_sessions, increment_sessions_inflight,
        record_session_duration,
    },
};
use core::{pin::Pin, time::Duration};
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use revstream_core::{
    Error,
    generator::{Generate, HashScoreGenerator},
    proto::{RequestContext, ResponseBatch, search_refiner_server::SearchRefiner},
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::Instrument;

/// Server side of the refinement protocol.
///
/// Cheap to clone; all clones share the session counter, the in-flight count
/// and the shutdown token.
#[derive(Clone)]
pub struct SearchService {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    generator: Arc<dyn Generate>,
    next_session: AtomicU64,
    inflight: AtomicUsize,
    draining: AtomicBool,
    shutdown_token: CancellationToken,
}

/// Keeps the in-flight count accurate however a session task exits.
struct InflightGuard {
    inner: Arc<Inner>,
}

impl InflightGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.inflight.fetch_add(1, Ordering::AcqRel);
        increment_sessions_inflight();
        Self { inner }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_sessions_inflight();
    }
}

impl SearchService {
    /// Creates a service backed by the default [`HashScoreGenerator`].
    pub fn new(config: ServerConfig) -> Self {
        Self::with_generator(config, Arc::new(HashScoreGenerator))
    }

    pub fn with_generator(config: ServerConfig, generator: Arc<dyn Generate>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                generator,
                next_session: AtomicU64::new(0),
                inflight: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
            }),
        }
    }

    /// Number of sessions whose task has not yet finished.
    pub fn sessions_inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    /// Gracefully shuts the service down.
    ///
    /// - New streams are refused with `UNAVAILABLE`.
    /// - Live sessions get `shutdown_timeout` to finish on their own.
    /// - Whatever is left is cancelled, which also tears down armed timers.
    pub async fn shutdown(&self) -> Result<(), Error> {
        // === Phase 0: Stop accepting new streams ===
        tracing::info!("Refusing new sessions");
        self.inner.draining.store(true, Ordering::Release);

        // === Phase 1: Let in-flight sessions finish ===
        tracing::info!(
            "Draining in-flight sessions ({} active)",
            self.sessions_inflight()
        );
        let drained = timeout(self.inner.config.shutdown_timeout, self.wait_for_idle()).await;

        match drained {
            Ok(()) => tracing::debug!("All in-flight sessions drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} sessions still active)",
                self.sessions_inflight()
            ),
        }

        // === Phase 2: Cancel the rest ===
        self.inner.shutdown_token.cancel();
        if timeout(Duration::from_secs(1), self.wait_for_idle())
            .await
            .is_err()
        {
            tracing::error!(
                "{} sessions ignored cancellation",
                self.sessions_inflight()
            );
        }

        tracing::info!("Search service shutdown complete");
        Ok(())
    }

    async fn wait_for_idle(&self) {
        while self.sessions_inflight() > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tonic::async_trait]
impl SearchRefiner for SearchService {
    type RefineStream = Pin<Box<dyn Stream<Item = Result<ResponseBatch, Status>> + Send>>;

    /// Accepts one bidirectional refinement stream.
    ///
    /// Returns immediately with the response stream; the session task keeps
    /// running until the deferred revision is sent or the call is abandoned.
    async fn refine(
        &self,
        req: Request<Streaming<RequestContext>>,
    ) -> Result<Response<Self::RefineStream>, Status> {
        if self.inner.draining.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown.into());
        }

        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let call = CallSession::new(session_id);
        increment_sessions();

        tracing::info!(
            session_id,
            remote = ?req.remote_addr(),
            "New bidirectional stream opened"
        );

        let (resp_tx, resp_rx) = mpsc::channel(self.inner.config.stream_buffer_size);
        let inbound = req.into_inner();
        let guard = InflightGuard::new(Arc::clone(&self.inner));
        let generator = Arc::clone(&self.inner.generator);
        let session_config = self.inner.config.session;
        let shutdown = self.inner.shutdown_token.clone();

        let fut = async move {
            let _guard = guard;
            let started = call.started_at;

            if let Err(e) =
                drive_session(call, inbound, resp_tx, generator, session_config, shutdown).await
            {
                tracing::warn!(session_id, error = %e, "Session aborted");
            }

            record_session_duration(started.elapsed().as_secs_f64() * 1000.0);
        }
        .instrument(tracing::info_span!("session", session_id));

        tokio::spawn(fut);

        Ok(Response::new(Box::pin(ReceiverStream::new(resp_rx))))
    }
}
