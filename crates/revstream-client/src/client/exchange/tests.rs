use super::*;
use core::future::Future;
use revstream_core::{proto::ResponseItem, timing::FINAL_DELAY};
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;

type Responses = ReceiverStream<Result<ResponseBatch, Status>>;

fn coffee_maker() -> CallRequest {
    CallRequest::new("coffee maker", "B000123", "premium coffee brewing equipment")
}

fn params(window: Duration) -> ExchangeParams {
    ExchangeParams::new(CONTEXT_DELAY, DecisionWindow::fixed(window))
}

fn batch(revision: u32, item: &str) -> ResponseBatch {
    ResponseBatch {
        items: vec![ResponseItem {
            subject_id: "B000123".into(),
            item_id: item.into(),
            score: 0.5,
        }],
        revision,
    }
}

fn assert_near(actual: Duration, expected: Duration) {
    let slack = Duration::from_millis(2);
    assert!(
        actual >= expected && actual <= expected + slack,
        "expected ~{expected:?}, got {actual:?}"
    );
}

/// Wires a scripted server to in-memory channels. The script gets the
/// request receiver and response sender; its output is whatever it recorded.
fn open_call<F, Fut, T>(script: F) -> (mpsc::Sender<RequestContext>, Responses, JoinHandle<T>)
where
    F: FnOnce(mpsc::Receiver<RequestContext>, mpsc::Sender<Result<ResponseBatch, Status>>) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (ctx_tx, ctx_rx) = mpsc::channel(4);
    let (resp_tx, resp_rx) = mpsc::channel(8);
    let server = tokio::spawn(script(ctx_rx, resp_tx));
    (ctx_tx, ReceiverStream::new(resp_rx), server)
}

/// Well-behaved peer: one batch per context, a deferred revision 3 after the
/// second, then close. Returns the contexts it saw.
async fn protocol_server(
    mut ctx_rx: mpsc::Receiver<RequestContext>,
    resp_tx: mpsc::Sender<Result<ResponseBatch, Status>>,
) -> Vec<RequestContext> {
    let mut seen = Vec::new();
    while let Some(ctx) = ctx_rx.recv().await {
        seen.push(ctx);
        let revision = seen.len() as u32;
        let _ = resp_tx.send(Ok(batch(revision, "live"))).await;

        if revision == 2 {
            tokio::select! {
                () = sleep(FINAL_DELAY) => {
                    let _ = resp_tx.send(Ok(batch(3, "final"))).await;
                }
                () = resp_tx.closed() => {}
            }
            while let Some(extra) = ctx_rx.recv().await {
                seen.push(extra);
            }
            break;
        }
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn decision_before_final_revision_selects_revision_two() {
    let (ctx_tx, responses, server) = open_call(protocol_server);

    // Half-close at t=50ms, decision at t=90ms, revision 3 due at t=100ms.
    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(40)),
        CancellationToken::new(),
    )
    .await;

    let selected = outcome.selected.expect("revision 2 was buffered");
    assert_eq!(selected.revision, 2);
    assert_eq!(outcome.revisions, vec![1, 2]);
    assert_eq!(outcome.termination, Termination::DecisionTimeout);
    assert_eq!(outcome.decision_timeout, Some(Duration::from_millis(40)));
    assert_near(outcome.elapsed, Duration::from_millis(90));

    let seen = server.await.unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].refinement.is_empty());
    assert_eq!(seen[1].refinement, "premium coffee brewing equipment");
    assert!(seen.iter().all(|ctx| ctx.query == "coffee maker" && ctx.subject_id == "B000123"));
}

#[tokio::test(start_paused = true)]
async fn server_close_ends_the_wait_early() {
    let (ctx_tx, responses, server) = open_call(protocol_server);

    // 90ms window from the half-close ends at t=140ms; the server is done at
    // t=100ms.
    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(90)),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.selected.map(|b| b.revision), Some(3));
    assert_eq!(outcome.revisions, vec![1, 2, 3]);
    assert_eq!(outcome.termination, Termination::ServerClosed);
    assert_near(outcome.elapsed, CONTEXT_DELAY + FINAL_DELAY);
    assert_eq!(server.await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn empty_buffer_is_not_found() {
    let (ctx_tx, responses, server) = open_call(|mut ctx_rx, resp_tx| async move {
        let mut seen = 0;
        while ctx_rx.recv().await.is_some() {
            seen += 1;
        }
        // Hold the response side open until the client lets go.
        resp_tx.closed().await;
        seen
    });

    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(30)),
        CancellationToken::new(),
    )
    .await;

    assert!(!outcome.found());
    assert!(outcome.revisions.is_empty());
    assert_eq!(outcome.termination, Termination::DecisionTimeout);
    assert_near(outcome.elapsed, CONTEXT_DELAY + Duration::from_millis(30));
    assert_eq!(server.await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn stream_error_finalizes_with_partial_buffer() {
    let (ctx_tx, responses, _server) = open_call(|mut ctx_rx, resp_tx| async move {
        let _ = ctx_rx.recv().await;
        let _ = resp_tx.send(Ok(batch(1, "live"))).await;
        sleep(Duration::from_millis(10)).await;
        let _ = resp_tx.send(Err(Status::unavailable("connection reset"))).await;
        ctx_rx
    });

    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(120)),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.selected.map(|b| b.revision), Some(1));
    assert_eq!(outcome.termination, Termination::StreamFailed(Code::Unavailable));
    assert_eq!(outcome.decision_timeout, None);
    assert_near(outcome.elapsed, Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn stream_error_with_empty_buffer_is_not_found() {
    let (ctx_tx, responses, _server) = open_call(|ctx_rx, resp_tx| async move {
        let _ = resp_tx.send(Err(Status::internal("boom"))).await;
        ctx_rx
    });

    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(120)),
        CancellationToken::new(),
    )
    .await;

    assert!(!outcome.found());
    assert_eq!(outcome.termination, Termination::StreamFailed(Code::Internal));
    assert!(outcome.elapsed < CONTEXT_DELAY);
}

#[tokio::test(start_paused = true)]
async fn duplicate_lower_revision_does_not_change_selection() {
    let (ctx_tx, responses, _server) = open_call(|mut ctx_rx, resp_tx| async move {
        let _ = ctx_rx.recv().await;
        let _ = resp_tx.send(Ok(batch(1, "original"))).await;
        let _ = ctx_rx.recv().await;
        let _ = resp_tx.send(Ok(batch(2, "second"))).await;
        let _ = resp_tx.send(Ok(batch(1, "dup"))).await;
        resp_tx.closed().await;
    });

    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(30)),
        CancellationToken::new(),
    )
    .await;

    let selected = outcome.selected.unwrap();
    assert_eq!(selected.revision, 2);
    assert_eq!(selected.items[0].item_id, "second");
    assert_eq!(outcome.revisions, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_revision_is_still_buffered() {
    let (ctx_tx, responses, _server) = open_call(|mut ctx_rx, resp_tx| async move {
        let _ = ctx_rx.recv().await;
        let _ = resp_tx.send(Ok(batch(7, "rogue"))).await;
        let _ = resp_tx.send(Ok(batch(2, "late"))).await;
        resp_tx.closed().await;
    });

    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(30)),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.selected.map(|b| b.revision), Some(7));
    assert_eq!(outcome.revisions, vec![2, 7]);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_context_delay_releases_the_stream() {
    let (ctx_tx, responses, server) = open_call(|mut ctx_rx, resp_tx| async move {
        let mut seen = 0;
        while ctx_rx.recv().await.is_some() {
            seen += 1;
            let _ = resp_tx.send(Ok(batch(seen, "live"))).await;
        }
        // Request side ended; the response side must be dropped by now too.
        resp_tx.closed().await;
        seen
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        }
    });

    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(120)),
        cancel,
    )
    .await;

    assert_eq!(outcome.termination, Termination::Cancelled);
    assert_near(outcome.elapsed, Duration::from_millis(10));
    assert_eq!(outcome.selected.map(|b| b.revision), Some(1));
    assert_eq!(outcome.decision_timeout, None);
    // Only the first context went out.
    assert_eq!(server.await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_decision_wait_returns_promptly() {
    let (ctx_tx, responses, server) = open_call(protocol_server);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            sleep(CONTEXT_DELAY + Duration::from_millis(20)).await;
            cancel.cancel();
        }
    });

    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_secs(10)),
        cancel,
    )
    .await;

    assert_eq!(outcome.termination, Termination::Cancelled);
    assert_near(outcome.elapsed, CONTEXT_DELAY + Duration::from_millis(20));
    assert_eq!(outcome.selected.map(|b| b.revision), Some(2));
    // The peer saw its response side close before the deferred revision.
    assert_eq!(server.await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn send_failure_finalizes_with_buffer() {
    let (ctx_tx, responses, _server) = open_call(|mut ctx_rx, resp_tx| async move {
        let _ = ctx_rx.recv().await;
        let _ = resp_tx.send(Ok(batch(1, "live"))).await;
        // Stop reading requests but keep responding side open.
        drop(ctx_rx);
        resp_tx.closed().await;
    });

    let outcome = run_exchange(
        &coffee_maker(),
        ctx_tx,
        responses,
        params(Duration::from_millis(30)),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.termination, Termination::SendFailed);
    assert_eq!(outcome.selected.map(|b| b.revision), Some(1));
    assert_near(outcome.elapsed, CONTEXT_DELAY);
}
