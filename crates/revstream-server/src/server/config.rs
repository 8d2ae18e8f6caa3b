use crate::server::session::SessionConfig;
use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `revstream-server` binary.
///
/// Values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first). The timing defaults are the protocol's wire
/// contract; changing them breaks interoperability with other clients and is
/// meant for experiments and tests.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "revstream-server",
    version,
    about = "A gRPC service streaming progressively refined search results"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/revstream.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Delay in milliseconds between the second context and the deferred
    /// final revision.
    ///
    /// Environment variable: `FINAL_DELAY_MS`
    #[arg(long, env = "FINAL_DELAY_MS", default_value_t = 50)]
    pub final_delay_ms: u64,

    /// How long a session waits for the next context before closing.
    ///
    /// Covers clients that send one context and then go silent without
    /// half-closing.
    ///
    /// Environment variable: `IDLE_TIMEOUT_MS`
    #[arg(long, env = "IDLE_TIMEOUT_MS", default_value_t = 5_000)]
    pub idle_timeout_ms: u64,

    /// Capacity of the per-session response buffer feeding the gRPC stream.
    ///
    /// A call produces at most three batches, so anything above that never
    /// applies backpressure.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Abort a call with `INVALID_ARGUMENT` when a client sends more than two
    /// contexts, instead of ignoring the extras.
    ///
    /// Environment variable: `STRICT_PROTOCOL`
    #[arg(long, env = "STRICT_PROTOCOL", default_value_t = false)]
    pub strict_protocol: bool,

    /// Seconds to wait for in-flight sessions to drain on shutdown before they
    /// are cancelled.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: String::from("0.0.0.0:50051"),
            uds: false,
            stream_buffer_size: 8,
            shutdown_timeout: Duration::from_secs(3),
            session: SessionConfig::default(),
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.server_addr.trim().is_empty() {
            bail!("SERVER_ADDR must not be empty");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.idle_timeout_ms <= args.final_delay_ms {
            bail!(
                "IDLE_TIMEOUT_MS ({}) must exceed FINAL_DELAY_MS ({})",
                args.idle_timeout_ms,
                args.final_delay_ms
            );
        }

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            stream_buffer_size: args.stream_buffer_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            session: SessionConfig {
                final_delay: Duration::from_millis(args.final_delay_ms),
                idle_timeout: Duration::from_millis(args.idle_timeout_ms),
                strict_protocol: args.strict_protocol,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revstream_core::timing::FINAL_DELAY;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let cli = CliArgs::try_parse_from(std::iter::once("revstream-server").chain(args.iter().copied()))?;
        ServerConfig::try_from(cli)
    }

    #[test]
    fn defaults_match_the_wire_contract() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.session.final_delay, FINAL_DELAY);
        assert!(!config.session.strict_protocol);
        assert_eq!(config.stream_buffer_size, 8);
        assert!(!config.uds);
    }

    #[test]
    fn rejects_zero_buffer() {
        assert!(parse(&["--stream-buffer-size", "0"]).is_err());
    }

    #[test]
    fn rejects_idle_timeout_shorter_than_final_delay() {
        assert!(parse(&["--final-delay-ms", "100", "--idle-timeout-ms", "80"]).is_err());
    }

    #[test]
    fn parses_overrides() {
        let config = parse(&["--strict-protocol", "--final-delay-ms", "10", "--uds"]).unwrap();
        assert!(config.session.strict_protocol);
        assert_eq!(config.session.final_delay, Duration::from_millis(10));
        assert!(config.uds);
    }
}
