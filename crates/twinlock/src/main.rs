// Twinlock server binary entry point.
//
// Parses the node configuration, starts one server of a primary/standby pair
// and runs until ctrl-c.

use std::io::IsTerminal;

use anyhow::Context;
use clap::Parser;
use twinlock::{start_server, ServerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerArgs::parse().into_config();
    let server = start_server(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    server.shutdown().await
}
