use crate::client::exchange::ExchangeParams;
use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use revstream_core::timing::DecisionWindow;

/// Runtime configuration for the `revstream-client` binary.
///
/// Values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "revstream-client",
    version,
    about = "Runs progressive search refinement calls against a revstream server"
)]
pub struct CliArgs {
    /// Server endpoint URL.
    ///
    /// Environment variable: `SERVER_URL`
    #[arg(long, env = "SERVER_URL", default_value_t = String::from("http://127.0.0.1:50051"))]
    pub server_url: String,

    /// Search query sent in both contexts.
    #[arg(long, default_value_t = String::from("coffee maker"))]
    pub query: String,

    /// Subject the results are for.
    #[arg(long, default_value_t = String::from("B000123"))]
    pub subject_id: String,

    /// Refinement carried by the second context.
    #[arg(long, default_value_t = String::from("premium coffee brewing equipment"))]
    pub refinement: String,

    /// Delay in milliseconds between the first and second context.
    ///
    /// Environment variable: `CONTEXT_DELAY_MS`
    #[arg(long, env = "CONTEXT_DELAY_MS", default_value_t = 50)]
    pub context_delay_ms: u64,

    /// Lower bound of the decision window, in milliseconds.
    ///
    /// Environment variable: `DECISION_MIN_MS`
    #[arg(long, env = "DECISION_MIN_MS", default_value_t = 30)]
    pub decision_min_ms: u64,

    /// Upper bound of the decision window, in milliseconds.
    ///
    /// Environment variable: `DECISION_MAX_MS`
    #[arg(long, env = "DECISION_MAX_MS", default_value_t = 120)]
    pub decision_max_ms: u64,

    /// Connection establishment timeout, in milliseconds.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_MS`
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 1_000)]
    pub connect_timeout_ms: u64,

    /// Number of sequential calls to run over the same connection.
    #[arg(long, default_value_t = 1)]
    pub repeat: u32,

    /// Abandon each call after this many milliseconds.
    #[arg(long)]
    pub cancel_after_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub connect_timeout: Duration,
    pub exchange: ExchangeParams,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeParams) -> Self {
        self.exchange = exchange;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::from("http://127.0.0.1:50051"),
            connect_timeout: Duration::from_secs(1),
            exchange: ExchangeParams::default(),
        }
    }
}

impl TryFrom<&CliArgs> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CliArgs) -> Result<Self, Self::Error> {
        if args.server_url.trim().is_empty() {
            bail!("SERVER_URL must not be empty");
        }

        if args.connect_timeout_ms == 0 {
            bail!("CONNECT_TIMEOUT_MS must be greater than 0");
        }

        let Some(window) = DecisionWindow::new(
            Duration::from_millis(args.decision_min_ms),
            Duration::from_millis(args.decision_max_ms),
        ) else {
            bail!(
                "DECISION_MIN_MS ({}) must not exceed DECISION_MAX_MS ({})",
                args.decision_min_ms,
                args.decision_max_ms
            );
        };

        Ok(Self {
            server_url: args.server_url.clone(),
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            exchange: ExchangeParams::new(Duration::from_millis(args.context_delay_ms), window),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revstream_core::timing::{CONTEXT_DELAY, DECISION_MAX, DECISION_MIN};

    fn parse(args: &[&str]) -> anyhow::Result<ClientConfig> {
        let cli = CliArgs::try_parse_from(std::iter::once("revstream-client").chain(args.iter().copied()))?;
        ClientConfig::try_from(&cli)
    }

    #[test]
    fn defaults_match_the_wire_contract() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.exchange.context_delay, CONTEXT_DELAY);
        assert_eq!(config.exchange.decision_window.min(), DECISION_MIN);
        assert_eq!(config.exchange.decision_window.max(), DECISION_MAX);
    }

    #[test]
    fn rejects_inverted_window() {
        assert!(parse(&["--decision-min-ms", "200", "--decision-max-ms", "100"]).is_err());
    }

    #[test]
    fn accepts_degenerate_window() {
        let config = parse(&["--decision-min-ms", "75", "--decision-max-ms", "75"]).unwrap();
        assert_eq!(config.exchange.decision_window.sample(), Duration::from_millis(75));
    }

    #[test]
    fn rejects_zero_connect_timeout() {
        assert!(parse(&["--connect-timeout-ms", "0"]).is_err());
    }
}
