//! Minimal admin client for a twinlock server pair.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;
use twinlock::{ClientConfig, LockClient, LockInfo, OwnerId, StaticResolver};

#[derive(Parser)]
#[command(name = "twinlockctl")]
#[command(about = "Admin client for a twinlock server pair", long_about = None)]
struct Args {
    /// Primary server address (host:port).
    #[arg(long, env = "TWINLOCK_PRIMARY", default_value = "127.0.0.1:7400")]
    primary: SocketAddr,
    /// Standby server address (host:port).
    #[arg(long, env = "TWINLOCK_STANDBY", default_value = "127.0.0.1:7401")]
    standby: SocketAddr,
    /// Client identity to announce. Defaults to one derived from the pid.
    #[arg(long, env = "TWINLOCK_CLIENT_IDENTITY")]
    identity: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the active server's lock table as JSON.
    State,
    /// Acquire a key, hold it, then release it.
    Hold {
        key: String,
        /// How long to keep the key once acquired (ms).
        #[arg(long, default_value_t = 5_000)]
        hold_ms: u64,
        /// How long to wait for the key (ms); omit to wait forever.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Serialize)]
struct LockRow {
    key: String,
    available: bool,
    owner: Option<String>,
}

impl From<LockInfo> for LockRow {
    fn from(info: LockInfo) -> Self {
        Self {
            key: info.key,
            available: info.available,
            owner: info.identity,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let identity = args
        .identity
        .unwrap_or_else(|| format!("twinlockctl-{}", std::process::id()));
    let resolver = StaticResolver::new(args.primary, args.standby);
    let client = LockClient::connect(ClientConfig::new(identity), &resolver).await?;

    match args.command {
        Command::State => {
            let rows: Vec<LockRow> = client
                .lock_infos()
                .await?
                .into_iter()
                .map(LockRow::from)
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Hold {
            key,
            hold_ms,
            timeout_ms,
        } => {
            let handle = client.handle(&key);
            let owner = OwnerId::new();
            let started = Instant::now();
            handle
                .enter(owner, timeout_ms.map(Duration::from_millis))
                .await?;
            println!("acquired {key} after {:?}", started.elapsed());
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            handle.exit(owner)?;
            println!("released {key}");
        }
    }
    client.close();
    Ok(())
}
