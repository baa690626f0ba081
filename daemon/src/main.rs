mod adapters;
mod daemon;
mod identity;

use std::path::PathBuf;

use clap::Parser;
use dm_types::RelayMode;

/// Newline-delimited JSON stdio driver for the direct-messaging engine.
#[derive(Parser, Debug)]
#[command(name = "dm-daemon")]
struct Cli {
    /// Directory for the identity file and sqlite cache.
    #[arg(long, default_value = "./dm-daemon-state")]
    state_dir: PathBuf,

    /// Discovery relay URLs (repeatable).
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// Blossom server URLs for attachment upload/download (repeatable).
    #[arg(long = "blossom-server")]
    blossom_servers: Vec<String>,

    /// Relay discovery mode: discovery | hybrid | strict-outbox.
    #[arg(long, default_value = "hybrid")]
    relay_mode: String,

    /// NIP-17 gift-wrap timestamp fuzz window, in days.
    #[arg(long, default_value_t = 2)]
    nip17_fuzz_days: u64,
}

fn parse_relay_mode(raw: &str) -> anyhow::Result<RelayMode> {
    match raw {
        "discovery" => Ok(RelayMode::Discovery),
        "hybrid" => Ok(RelayMode::Hybrid),
        "strict-outbox" => Ok(RelayMode::StrictOutbox),
        other => anyhow::bail!("unknown relay mode {other:?}, expected discovery|hybrid|strict-outbox"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let relay_mode = parse_relay_mode(&cli.relay_mode)?;

    daemon::run(daemon::Args {
        state_dir: cli.state_dir,
        relays: cli.relays,
        blossom_servers: cli.blossom_servers,
        relay_mode,
        nip17_fuzz_days: cli.nip17_fuzz_days,
    })
    .await
}
