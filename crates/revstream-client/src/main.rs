use clap::Parser;
use core::time::Duration;
use revstream_client::{
    CallRequest, SearchClient, Termination,
    client::config::{CliArgs, ClientConfig},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ClientConfig::try_from(&args)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        )
        .try_init()?;

    let client = SearchClient::connect(config).await?;
    let request = CallRequest::new(&args.query, &args.subject_id, &args.refinement);

    let mut found = 0;
    for call in 1..=args.repeat {
        let cancel = CancellationToken::new();
        if let Some(ms) = args.cancel_after_ms {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(ms)) => cancel.cancel(),
                    () = cancel.cancelled() => {}
                }
            });
        }

        let outcome = client
            .call_with_cancel(&request, cancel.clone())
            .instrument(tracing::info_span!("call", call))
            .await?;
        // Releases the cancel timer if the call finished first.
        cancel.cancel();

        match (&outcome.selected, outcome.termination) {
            (Some(batch), _) => {
                found += 1;
                tracing::info!(
                    call,
                    revision = batch.revision,
                    items = batch.items.len(),
                    top_item = batch.items.first().map(|item| item.item_id.as_str()),
                    duration_ms = outcome.elapsed.as_millis() as u64,
                    "Final result"
                );
            }
            (None, Termination::Cancelled) => tracing::warn!(call, "Call cancelled before any result"),
            (None, termination) => tracing::warn!(call, ?termination, "No result available"),
        }
    }

    tracing::info!(calls = args.repeat, found, "Done");
    Ok(())
}
