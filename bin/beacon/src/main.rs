//! # Beacon
//!
//! Beacon ingests CometBFT chain data into a relational store. `beacon` is a binary crate for a
//! command line application for running Beacon.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod args;

mod run;
use run::Run;

mod backfill;
use backfill::Backfill;

#[derive(Debug, Parser)]
#[clap(about, version)]
struct Cli {
    #[clap(subcommand)]
    command: Subcommands,
}

#[derive(Debug, Subcommand)]
enum Subcommands {
    /// Follow the chain tip, ingesting every new block until terminated.
    Run(Run),
    /// Ingest an explicit range of blocks once, then exit.
    Backfill(Backfill),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Subcommands::Run(cmd) => cmd.run().await,
        Subcommands::Backfill(cmd) => cmd.run().await,
    }
}
