//! Client side of one refinement call.
//!
//! [`run_exchange`] drives a call over an already-open stream: it sends the
//! two contexts, half-closes, races a random decision window against the
//! server and returns the highest revision it buffered. It is generic over
//! the transport halves so the same logic runs against tonic streams and
//! in-memory channels.
//!
//! ```text
//! send ctx#1 ── sleep D_ctx ── send ctx#2 ── half-close ── wait T_dec ── pick max
//!      └─────────────── receive task fills the VersionBuffer ───────────────┘
//! ```
//!
//! The wait phases end early only when the receive side is definitively
//! done (the server closed, or the stream failed) or the caller cancels.

#[cfg(test)]
mod tests;

use core::time::Duration;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use revstream_core::{
    VersionBuffer,
    proto::{RequestContext, ResponseBatch},
    timing::{CONTEXT_DELAY, DecisionWindow, FINAL_REVISION, FIRST_REVISION},
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

/// Timing knobs for a call. Defaults are the wire contract.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeParams {
    pub context_delay: Duration,
    pub decision_window: DecisionWindow,
}

impl ExchangeParams {
    pub fn new(context_delay: Duration, decision_window: DecisionWindow) -> Self {
        Self {
            context_delay,
            decision_window,
        }
    }
}

impl Default for ExchangeParams {
    fn default() -> Self {
        Self::new(CONTEXT_DELAY, DecisionWindow::default())
    }
}

/// Caller-supplied search intent for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub query: String,
    pub subject_id: String,
    pub refinement: String,
}

impl CallRequest {
    pub fn new(
        query: impl Into<String>,
        subject_id: impl Into<String>,
        refinement: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            subject_id: subject_id.into(),
            refinement: refinement.into(),
        }
    }

    fn first_context(&self) -> RequestContext {
        RequestContext {
            query: self.query.clone(),
            subject_id: self.subject_id.clone(),
            refinement: String::new(),
        }
    }

    fn second_context(&self) -> RequestContext {
        RequestContext {
            query: self.query.clone(),
            subject_id: self.subject_id.clone(),
            refinement: self.refinement.clone(),
        }
    }
}

/// Why the client stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The decision window elapsed.
    DecisionTimeout,
    /// The server closed its send direction; nothing more could arrive.
    ServerClosed,
    /// The stream failed with the given status code.
    StreamFailed(Code),
    /// A context could not be written; the request side is gone.
    SendFailed,
    /// The caller abandoned the call.
    Cancelled,
}

/// Everything a call produced.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Highest-revision batch received, if any.
    pub selected: Option<ResponseBatch>,
    /// Buffered revisions in ascending order.
    pub revisions: Vec<u32>,
    /// Decision timeout drawn for this call; `None` if the call ended before
    /// the draw.
    pub decision_timeout: Option<Duration>,
    pub termination: Termination,
    /// Time from the start of the exchange to finalization.
    pub elapsed: Duration,
}

impl CallOutcome {
    pub(crate) fn cancelled_before_open() -> Self {
        Self {
            selected: None,
            revisions: Vec::new(),
            decision_timeout: None,
            termination: Termination::Cancelled,
            elapsed: Duration::ZERO,
        }
    }

    pub fn found(&self) -> bool {
        self.selected.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveEnd {
    Completed,
    Failed(Code),
    Stopped,
}

impl From<ReceiveEnd> for Termination {
    fn from(end: ReceiveEnd) -> Self {
        match end {
            ReceiveEnd::Completed => Self::ServerClosed,
            ReceiveEnd::Failed(code) => Self::StreamFailed(code),
            ReceiveEnd::Stopped => Self::Cancelled,
        }
    }
}

enum Wake {
    Elapsed,
    Cancelled,
    Receive(ReceiveEnd),
}

/// Handle on the spawned receive task.
struct ReceiveSide {
    end_rx: oneshot::Receiver<ReceiveEnd>,
    ended: Option<ReceiveEnd>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ReceiveSide {
    fn spawn<R>(responses: R, buffer: Arc<Mutex<VersionBuffer>>, started: Instant) -> Self
    where
        R: Stream<Item = Result<ResponseBatch, Status>> + Send + Unpin + 'static,
    {
        let stop = CancellationToken::new();
        let (end_tx, end_rx) = oneshot::channel();
        let task = tokio::spawn({
            let stop = stop.clone();
            async move {
                let end = receive_loop(responses, buffer, started, stop).await;
                let _ = end_tx.send(end);
            }
        });

        Self {
            end_rx,
            ended: None,
            stop,
            task,
        }
    }

    /// Resolves once the receive loop has ended. Cancel safe.
    async fn ended(&mut self) -> ReceiveEnd {
        if let Some(end) = self.ended {
            return end;
        }
        let end = (&mut self.end_rx).await.unwrap_or(ReceiveEnd::Stopped);
        self.ended = Some(end);
        end
    }

    /// Stops the loop and waits for it to drop the response stream.
    async fn release(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("Receive task failed: {e}");
        }
    }
}

async fn wait_until(deadline: Instant, cancel: &CancellationToken, recv: &mut ReceiveSide) -> Wake {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Wake::Cancelled,
        end = recv.ended() => Wake::Receive(end),
        () = sleep_until(deadline) => Wake::Elapsed,
    }
}

async fn receive_loop<R>(
    mut responses: R,
    buffer: Arc<Mutex<VersionBuffer>>,
    started: Instant,
    stop: CancellationToken,
) -> ReceiveEnd
where
    R: Stream<Item = Result<ResponseBatch, Status>> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            () = stop.cancelled() => return ReceiveEnd::Stopped,
            next = responses.next() => next,
        };

        match next {
            Some(Ok(batch)) => store(&buffer, batch, started),
            Some(Err(status)) => {
                tracing::warn!(
                    code = ?status.code(),
                    error = %status.message(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Stream error occurred"
                );
                return ReceiveEnd::Failed(status.code());
            }
            None => {
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    versions_received = buffer.lock().len(),
                    "Server completed response stream"
                );
                return ReceiveEnd::Completed;
            }
        }
    }
}

fn store(buffer: &Mutex<VersionBuffer>, batch: ResponseBatch, started: Instant) {
    let revision = batch.revision;
    let items = batch.items.len();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if !(FIRST_REVISION..=FINAL_REVISION).contains(&revision) {
        tracing::warn!(revision, "Revision outside the protocol range");
    }

    let mut buffer = buffer.lock();
    if buffer.highest_revision().is_some_and(|highest| revision < highest) {
        tracing::warn!(
            revision,
            highest = buffer.highest_revision(),
            "Revision arrived out of order"
        );
    }

    match buffer.insert(batch) {
        Some(old) => tracing::info!(
            revision,
            old_items = old.items.len(),
            new_items = items,
            elapsed_ms,
            "Replaced batch in buffer"
        ),
        None => tracing::info!(revision, items, elapsed_ms, "Received batch"),
    }
}

/// Queues context #1 on the request side.
///
/// Returns when it was queued, or `None` if the request side is already gone.
/// Callers that must write before the stream is fully open (tonic only
/// resolves the open once response headers arrive) call this first and then
/// [`resume_exchange`].
pub async fn send_first_context(
    request: &CallRequest,
    ctx_tx: &mpsc::Sender<RequestContext>,
) -> Option<Instant> {
    tracing::info!(
        query = %request.query,
        subject_id = %request.subject_id,
        refinement_provided = !request.refinement.is_empty(),
        "Starting bidirectional stream"
    );
    tracing::info!(context_number = 1, refinement_empty = true, "Sending context");
    ctx_tx
        .send(request.first_context())
        .await
        .ok()
        .map(|()| Instant::now())
}

/// Runs one call over an open stream.
///
/// `ctx_tx` feeds the request side; dropping it is the half-close.
/// `responses` is the response side. Cancelling `cancel` abandons the call:
/// every pending sleep and read is interrupted and the response stream is
/// dropped before this returns.
///
/// Never fails: transport trouble degrades into whatever was buffered.
pub async fn run_exchange<R>(
    request: &CallRequest,
    ctx_tx: mpsc::Sender<RequestContext>,
    responses: R,
    params: ExchangeParams,
    cancel: CancellationToken,
) -> CallOutcome
where
    R: Stream<Item = Result<ResponseBatch, Status>> + Send + Unpin + 'static,
{
    let started = Instant::now();
    let first_sent = send_first_context(request, &ctx_tx).await;
    resume_exchange(request, ctx_tx, responses, params, cancel, started, first_sent).await
}

/// Continues a call whose first context went through [`send_first_context`].
///
/// `started` is the call's reference point; `first_sent` is what
/// `send_first_context` returned.
pub async fn resume_exchange<R>(
    request: &CallRequest,
    ctx_tx: mpsc::Sender<RequestContext>,
    responses: R,
    params: ExchangeParams,
    cancel: CancellationToken,
    started: Instant,
    first_sent: Option<Instant>,
) -> CallOutcome
where
    R: Stream<Item = Result<ResponseBatch, Status>> + Send + Unpin + 'static,
{
    let buffer = Arc::new(Mutex::new(VersionBuffer::new()));
    let mut recv = ReceiveSide::spawn(responses, Arc::clone(&buffer), started);
    let mut decision_timeout = None;

    let termination = 'exchange: {
        let Some(first_sent) = first_sent else {
            break 'exchange Termination::SendFailed;
        };

        match wait_until(first_sent + params.context_delay, &cancel, &mut recv).await {
            Wake::Elapsed => {}
            Wake::Cancelled => break 'exchange Termination::Cancelled,
            Wake::Receive(end) => break 'exchange end.into(),
        }

        tracing::info!(
            context_number = 2,
            refinement_len = request.refinement.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sending context"
        );
        if ctx_tx.send(request.second_context()).await.is_err() {
            break 'exchange Termination::SendFailed;
        }
        drop(ctx_tx);
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Half-closed client stream"
        );

        let timeout = params.decision_window.sample();
        decision_timeout = Some(timeout);
        tracing::info!(
            timeout_ms = timeout.as_millis() as u64,
            min_timeout_ms = params.decision_window.min().as_millis() as u64,
            max_timeout_ms = params.decision_window.max().as_millis() as u64,
            "Drew decision timeout"
        );

        match wait_until(Instant::now() + timeout, &cancel, &mut recv).await {
            Wake::Elapsed => Termination::DecisionTimeout,
            Wake::Cancelled => Termination::Cancelled,
            Wake::Receive(end) => end.into(),
        }
    };

    recv.release().await;

    let buffer = Arc::try_unwrap(buffer)
        .map(Mutex::into_inner)
        .unwrap_or_else(|shared| shared.lock().clone());
    let revisions = buffer.revisions();
    let selected = buffer.into_latest();
    let elapsed = started.elapsed();

    match &selected {
        Some(batch) => tracing::info!(
            selected_revision = batch.revision,
            items = batch.items.len(),
            ?termination,
            total_duration_ms = elapsed.as_millis() as u64,
            versions_considered = revisions.len(),
            "Selected batch"
        ),
        None => tracing::warn!(
            ?termination,
            total_duration_ms = elapsed.as_millis() as u64,
            "No batch received before the decision"
        ),
    }

    CallOutcome {
        selected,
        revisions,
        decision_timeout,
        termination,
        elapsed,
    }
}
