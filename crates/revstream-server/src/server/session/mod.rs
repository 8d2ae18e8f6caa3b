//! Per-stream server state machine.
//!
//! One [`drive_session`] future runs per accepted `Refine` call. It owns the
//! inbound half of the stream and the sender feeding the outbound half, and
//! walks the following states:
//!
//! ```text
//! AwaitingFirst  --ctx--> emit(r1) --> AwaitingSecond
//! AwaitingSecond --ctx--> emit(r2), arm(D_fin) --> AwaitingFinalTimer
//! AwaitingFinalTimer --timer--> emit(r3), close --> Closed
//! any --recv error / write failure / strict extra ctx--> Closed (abort)
//! ```
//!
//! The deferred revision 3 is not a detached task: its deadline lives inside
//! the same `select!` loop that watches the client, so a disconnect, a
//! transport error or service shutdown tears it down before it can write into
//! a dead stream.


use crate::server::telemetry::{
    increment_batches_sent, increment_deferred_cancelled, increment_extra_contexts,
    increment_stream_errors, record_generation_latency,
};
use core::time::Duration;
use futures::{Stream, StreamExt};
use revstream_core::{
    Error, Result,
    generator::Generate,
    proto::{RequestContext, ResponseBatch},
    timing::{FINAL_DELAY, FINAL_REVISION, FIRST_REVISION},
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Tunables for a single session. Defaults match the wire contract.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Delay between context #2 arriving and revision 3 being sent.
    pub final_delay: Duration,
    /// How long to wait for the next context before giving up on the call.
    pub idle_timeout: Duration,
    /// Abort the call on a third context instead of ignoring it.
    pub strict_protocol: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            final_delay: FINAL_DELAY,
            idle_timeout: Duration::from_secs(5),
            strict_protocol: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingFirst,
    AwaitingSecond,
    AwaitingFinalTimer { deadline: Instant },
    Closed,
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// All three revisions were sent.
    Completed,
    /// The client half-closed before sending its second context.
    HalfClosedEarly,
    /// The client went silent before sending its second context.
    IdleTimeout,
}

/// Bookkeeping for one accepted stream.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: u64,
    pub started_at: Instant,
    pub requests_seen: u32,
    pub extra_requests: u32,
    pub batches_sent: u32,
}

impl CallSession {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            requests_seen: 0,
            extra_requests: 0,
            batches_sent: 0,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Final state of a session that ended without error.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: CallSession,
    pub end: SessionEnd,
}

struct Session<S, G: ?Sized> {
    call: CallSession,
    state: SessionState,
    inbound: S,
    inbound_open: bool,
    last_context: Option<RequestContext>,
    idle_deadline: Instant,
    resp_tx: mpsc::Sender<core::result::Result<ResponseBatch, Status>>,
    generator: Arc<G>,
    config: SessionConfig,
}

/// Drives one stream from accept to close.
///
/// Reads contexts from `inbound`, writes batches to `resp_tx`, and returns
/// once the deferred revision has been sent or the call was abandoned.
/// Dropping `resp_tx` on return is what closes the server's send direction.
///
/// # Errors
///
/// - [`Error::Transport`] if reading from the client fails.
/// - [`Error::ClientGone`] if the client disconnects before the call is
///   complete.
/// - [`Error::ProtocolViolation`] on a third context in strict mode.
/// - [`Error::ServiceShutdown`] if `shutdown` fires first.
pub async fn drive_session<S, G>(
    call: CallSession,
    inbound: S,
    resp_tx: mpsc::Sender<core::result::Result<ResponseBatch, Status>>,
    generator: Arc<G>,
    config: SessionConfig,
    shutdown: CancellationToken,
) -> Result<SessionReport>
where
    S: Stream<Item = core::result::Result<RequestContext, Status>> + Unpin,
    G: Generate + ?Sized,
{
    let mut session = Session {
        idle_deadline: Instant::now() + config.idle_timeout,
        call,
        state: SessionState::AwaitingFirst,
        inbound,
        inbound_open: true,
        last_context: None,
        resp_tx,
        generator,
        config,
    };

    let result = session.run(&shutdown).await;
    if let Err(e) = &result {
        increment_stream_errors();
        if matches!(session.state, SessionState::AwaitingFinalTimer { .. }) {
            increment_deferred_cancelled();
            tracing::info!(
                session_id = session.call.id,
                reason = %e,
                "Cancelled deferred revision"
            );
        }
        session.state = SessionState::Closed;
    }
    result
}

impl<S, G> Session<S, G>
where
    S: Stream<Item = core::result::Result<RequestContext, Status>> + Unpin,
    G: Generate + ?Sized,
{
    async fn run(&mut self, shutdown: &CancellationToken) -> Result<SessionReport> {
        loop {
            let deferred = match self.state {
                SessionState::AwaitingFinalTimer { deadline } => Some(deadline),
                _ => None,
            };
            let awaiting_context = matches!(
                self.state,
                SessionState::AwaitingFirst | SessionState::AwaitingSecond
            );

            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    let _ = self.resp_tx.try_send(Err(Error::ServiceShutdown.into()));
                    return Err(Error::ServiceShutdown);
                }
                () = self.resp_tx.closed() => {
                    tracing::warn!(
                        session_id = self.call.id,
                        contexts_received = self.call.requests_seen,
                        "Client dropped the response stream"
                    );
                    return Err(Error::ClientGone);
                }
                () = sleep_until(deferred.unwrap_or(self.idle_deadline)), if deferred.is_some() => {
                    self.send_final().await?;
                    return Ok(self.finish(SessionEnd::Completed));
                }
                () = sleep_until(self.idle_deadline), if awaiting_context => {
                    tracing::warn!(
                        session_id = self.call.id,
                        contexts_received = self.call.requests_seen,
                        idle_ms = self.config.idle_timeout.as_millis() as u64,
                        "No further context before idle timeout, closing"
                    );
                    return Ok(self.finish(SessionEnd::IdleTimeout));
                }
                next = self.inbound.next(), if self.inbound_open => match next {
                    Some(Ok(context)) => self.on_context(context).await?,
                    Some(Err(status)) => {
                        tracing::error!(
                            session_id = self.call.id,
                            contexts_processed = self.call.requests_seen,
                            error = %status,
                            session_elapsed_ms = self.call.elapsed_ms(),
                            "Error in bidirectional stream"
                        );
                        let _ = self.resp_tx.try_send(Err(status.clone()));
                        return Err(Error::Transport(status));
                    }
                    None => {
                        self.inbound_open = false;
                        tracing::info!(
                            session_id = self.call.id,
                            contexts_received = self.call.requests_seen,
                            session_elapsed_ms = self.call.elapsed_ms(),
                            "Client half-closed stream"
                        );
                        if awaiting_context {
                            return Ok(self.finish(SessionEnd::HalfClosedEarly));
                        }
                    }
                },
            }
        }
    }

    async fn on_context(&mut self, context: RequestContext) -> Result<()> {
        let received_at = Instant::now();
        self.call.requests_seen += 1;

        tracing::info!(
            session_id = self.call.id,
            context_number = self.call.requests_seen,
            query = %context.query,
            subject_id = %context.subject_id,
            refinement_len = context.refinement.len(),
            session_elapsed_ms = self.call.elapsed_ms(),
            "Received context"
        );

        match self.state {
            SessionState::AwaitingFirst => {
                self.emit(&context, FIRST_REVISION).await?;
                self.last_context = Some(context);
                self.idle_deadline = received_at + self.config.idle_timeout;
                self.state = SessionState::AwaitingSecond;
            }
            SessionState::AwaitingSecond => {
                self.emit(&context, FIRST_REVISION + 1).await?;
                self.last_context = Some(context);
                // Anchored at arrival so revision 2's generation time is
                // absorbed into the delay.
                let deadline = received_at + self.config.final_delay;
                tracing::info!(
                    session_id = self.call.id,
                    delay_ms = self.config.final_delay.as_millis() as u64,
                    "Scheduled deferred revision"
                );
                self.state = SessionState::AwaitingFinalTimer { deadline };
            }
            SessionState::AwaitingFinalTimer { .. } | SessionState::Closed => {
                self.call.extra_requests += 1;
                increment_extra_contexts();
                if self.config.strict_protocol {
                    let reason = format!(
                        "unexpected context #{} (at most 2 per call)",
                        self.call.requests_seen
                    );
                    tracing::warn!(session_id = self.call.id, %reason, "Rejecting call");
                    let violation = Error::ProtocolViolation { reason };
                    let _ = self.resp_tx.try_send(Err(violation.clone().into()));
                    return Err(violation);
                }
                tracing::warn!(
                    session_id = self.call.id,
                    context_number = self.call.requests_seen,
                    "Ignoring extra context"
                );
            }
        }
        Ok(())
    }

    async fn send_final(&mut self) -> Result<()> {
        let Some(context) = self.last_context.take() else {
            return Err(Error::ChannelError {
                context: "deferred revision armed without a context".into(),
            });
        };
        self.emit(&context, FINAL_REVISION).await?;
        self.state = SessionState::Closed;
        Ok(())
    }

    async fn emit(&mut self, context: &RequestContext, revision: u32) -> Result<()> {
        let started = std::time::Instant::now();
        let batch = self.generator.generate(context, revision);
        let generation_ms = started.elapsed().as_secs_f64() * 1000.0;
        record_generation_latency(generation_ms);

        tracing::info!(
            session_id = self.call.id,
            revision,
            items = batch.items.len(),
            generation_ms,
            session_elapsed_ms = self.call.elapsed_ms(),
            "Sending batch"
        );
        for (index, item) in batch.items.iter().enumerate() {
            tracing::debug!(
                session_id = self.call.id,
                revision,
                index,
                item_id = %item.item_id,
                score = format_args!("{:.3}", item.score),
                "Batch item"
            );
        }

        if self.resp_tx.send(Ok(batch)).await.is_err() {
            tracing::warn!(
                session_id = self.call.id,
                revision,
                "Failed to send batch, receiver dropped"
            );
            return Err(Error::ClientGone);
        }

        self.call.batches_sent += 1;
        increment_batches_sent();
        Ok(())
    }

    fn finish(&mut self, end: SessionEnd) -> SessionReport {
        self.state = SessionState::Closed;
        tracing::info!(
            session_id = self.call.id,
            ?end,
            contexts_received = self.call.requests_seen,
            batches_sent = self.call.batches_sent,
            total_duration_ms = self.call.elapsed_ms(),
            "Session closed"
        );
        SessionReport {
            session: self.call.clone(),
            end,
        }
    }
}
