use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cmux_relay::executor::{self, BackendKind};
use cmux_relay::{run_server, AppState, BridgeConfig, KeepaliveConfig, ResolverConfig};

#[derive(Parser)]
#[command(name = "cmux-relay")]
#[command(about = "WebSocket terminal relay for container exec sessions")]
#[command(version)]
struct Cli {
    /// Host to bind to
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "RELAY_PORT", default_value = "39390")]
    port: u16,

    /// Where terminal commands run
    #[arg(long, env = "RELAY_BACKEND", value_enum, default_value_t = BackendKind::Docker)]
    backend: BackendKind,

    /// Seconds a client may stay silent before its session is dropped
    #[arg(
        long,
        env = "RELAY_PONG_WAIT_SECS",
        default_value = "60",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pong_wait_secs: u64,

    /// Timeout for each shell-detection probe (capped at 3000)
    #[arg(long, env = "RELAY_PROBE_TIMEOUT_MS", default_value = "3000")]
    probe_timeout_ms: u64,

    /// How long a shell must run before its output is shown and it is no
    /// longer retried with another candidate
    #[arg(long, env = "RELAY_START_GRACE_MS", default_value = "500")]
    start_grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = BridgeConfig {
        keepalive: KeepaliveConfig::new(Duration::from_secs(cli.pong_wait_secs)),
        resolver: ResolverConfig::default()
            .with_probe_timeout(Duration::from_millis(cli.probe_timeout_ms)),
        start_grace: Duration::from_millis(cli.start_grace_ms),
    };

    let executor = executor::connect(cli.backend)
        .await
        .with_context(|| format!("Failed to initialise {} backend", cli.backend))?;
    let state = AppState::new(executor, config);

    run_server(&cli.host, cli.port, state).await
}
