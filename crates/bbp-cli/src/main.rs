mod cli;
mod commands;
mod config;
mod logging;
mod pairing;
mod ui;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    match cli.command {
        Command::Pair(args) => commands::pair::run(args).await,
        Command::Info(args) => commands::info::run(args).await,
        Command::Pubkey(args) => commands::pubkey::run(args).await,
        Command::Sign(args) => commands::sign::run(args).await,
    }
}
