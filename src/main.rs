//! charla-relay: single-instance long-polling chat relay server.
//!
//! All chat state is volatile process memory; a restart starts empty.  The
//! relay must run as exactly one instance — a poll parked on one process is
//! never woken by a message posted to another.  Scaling out would require an
//! external shared bus, which this server deliberately does not implement.

use std::time::Duration;

use clap::Parser;

use charla::relay::{app, RelayConfig, RelayState};
use charla::{logging, tlog};

/// Long-polling chat relay.
///
/// Serves a single `/chat` endpoint: `GET` long-polls for new messages,
/// `POST` dispatches `join`/`message`/`leave`/`logout` commands.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "charla-relay", version, about)]
struct Cli {
    /// HTTP server bind address [env: CHARLA_BIND] [default: 127.0.0.1:3000]
    #[arg(long, short = 'b')]
    bind: Option<String>,

    /// Message log retention bound [env: CHARLA_RETAIN] [default: 100]
    #[arg(long)]
    retain: Option<usize>,

    /// Long-poll deadline in seconds [env: CHARLA_POLL_DEADLINE_SECS] [default: 25]
    #[arg(long)]
    poll_deadline_secs: Option<u64>,

    /// Presence liveness window in seconds [env: CHARLA_PRESENCE_WINDOW_SECS] [default: 120]
    #[arg(long)]
    presence_window_secs: Option<u64>,
}

struct Config {
    bind_addr: String,
    relay: RelayConfig,
}

impl Config {
    fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("CHARLA_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:3000".to_string());

        let retain_messages = cli
            .retain
            .or_else(|| env_parsed("CHARLA_RETAIN"))
            .unwrap_or(100);

        let poll_deadline_secs = cli
            .poll_deadline_secs
            .or_else(|| env_parsed("CHARLA_POLL_DEADLINE_SECS"))
            .unwrap_or(25);

        let presence_window_secs = cli
            .presence_window_secs
            .or_else(|| env_parsed("CHARLA_PRESENCE_WINDOW_SECS"))
            .unwrap_or(120);

        Self {
            bind_addr,
            relay: RelayConfig {
                retain_messages,
                poll_deadline: Duration::from_secs(poll_deadline_secs),
                presence_window: Duration::from_secs(presence_window_secs),
            },
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    logging::init();

    tlog!("charla-relay starting");
    tlog!("  retention: {} message(s)", config.relay.retain_messages);
    tlog!(
        "  poll deadline: {}s, presence window: {}s",
        config.relay.poll_deadline.as_secs(),
        config.relay.presence_window.as_secs()
    );

    let state = RelayState::new(config.relay);
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.bind_addr));
    tlog!("charla-relay listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));
}
