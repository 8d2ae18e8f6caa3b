//! Channel management and the public `call` entry points.

use crate::client::{
    config::ClientConfig,
    exchange::{CallOutcome, CallRequest, resume_exchange, send_first_context},
};
use revstream_core::{
    Error, Result,
    proto::{ResponseBatch, search_refiner_client::SearchRefinerClient},
};
use tokio::{
    sync::mpsc,
    time::{Instant, timeout},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{
    Request, Status,
    codec::CompressionEncoding,
    transport::{Channel, Endpoint},
};

/// A connected refinement client.
///
/// Cheap to clone. Every call opens its own stream on the shared channel, so
/// concurrent calls never share buffers or timers.
#[derive(Debug, Clone)]
pub struct SearchClient {
    inner: SearchRefinerClient<Channel>,
    config: ClientConfig,
}

impl SearchClient {
    /// Establishes the channel eagerly so an unreachable server surfaces as
    /// [`Error::Connect`] here rather than as a failed call later.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let connect_err = |reason: String| Error::Connect {
            endpoint: config.server_url.clone(),
            reason,
        };

        let endpoint = Endpoint::from_shared(config.server_url.clone())
            .map_err(|e| connect_err(e.to_string()))?
            .connect_timeout(config.connect_timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        tracing::debug!(endpoint = %config.server_url, "Connected");
        Ok(Self::with_channel(channel, config))
    }

    pub fn with_channel(channel: Channel, config: ClientConfig) -> Self {
        let inner = SearchRefinerClient::new(channel)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Deflate);
        Self { inner, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs one call and returns the highest revision received, or `None` if
    /// nothing arrived before the decision.
    pub async fn call(
        &self,
        query: &str,
        subject_id: &str,
        refinement: &str,
    ) -> Result<Option<ResponseBatch>> {
        let request = CallRequest::new(query, subject_id, refinement);
        let outcome = self
            .call_with_cancel(&request, CancellationToken::new())
            .await?;
        Ok(outcome.selected)
    }

    /// Like [`call`](Self::call) but reports how the call ended and can be
    /// abandoned through `cancel`.
    ///
    /// Context #1 is queued before the stream is opened, so a server that
    /// holds its response headers until it has read a context still answers.
    /// Opening is bounded by the connect timeout.
    ///
    /// Fails only if the stream cannot be opened in time. Anything that goes
    /// wrong afterwards degrades into the returned outcome.
    pub async fn call_with_cancel(
        &self,
        request: &CallRequest,
        cancel: CancellationToken,
    ) -> Result<CallOutcome> {
        let (ctx_tx, ctx_rx) = mpsc::channel(2);
        let mut client = self.inner.clone();

        let started = Instant::now();
        let first_sent = send_first_context(request, &ctx_tx).await;
        let open_timeout = self.config.connect_timeout;

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(CallOutcome::cancelled_before_open()),
            opened = timeout(open_timeout, client.refine(Request::new(ReceiverStream::new(ctx_rx)))) => opened,
        };
        let responses = opened
            .map_err(|_| {
                Error::StreamOpen(Status::deadline_exceeded(format!(
                    "stream not opened within {}ms",
                    open_timeout.as_millis()
                )))
            })?
            .map_err(Error::StreamOpen)?
            .into_inner();

        Ok(resume_exchange(
            request,
            ctx_tx,
            responses,
            self.config.exchange,
            cancel,
            started,
            first_sent,
        )
        .await)
    }
}
