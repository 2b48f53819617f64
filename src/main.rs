//! ordswap - operator CLI for the swap engine

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ordswap::commands::*;

#[derive(Parser, Debug)]
#[command(name = "ordswap", about = "Inscription and rune swap tooling: runestones, PSBT inspection, UTXO protection, broadcast")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Decode a runestone from an output script or a raw transaction
    DecodeRunestone(DecodeRunestoneOpts),
    /// Encode a single-edict transfer runestone
    EncodeRunestone(EncodeRunestoneOpts),
    /// Show inputs, signatures, outputs and fee of a PSBT
    InspectPsbt(InspectPsbtOpts),
    /// Classify UTXOs as pure or protected via the asset oracle
    Classify(ClassifyOpts),
    /// Broadcast a raw transaction through the configured relays
    Broadcast(BroadcastOpts),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::DecodeRunestone(o) => run_decode_runestone(o),
        Commands::EncodeRunestone(o) => run_encode_runestone(o),
        Commands::InspectPsbt(o) => run_inspect_psbt(o),
        Commands::Classify(o) => run_classify(o),
        Commands::Broadcast(o) => run_broadcast(o),
    }
}
