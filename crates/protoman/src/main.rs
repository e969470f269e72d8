use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod ui;

#[tokio::main]
async fn main() -> Result<()> {
    // anyhow prints `Error: ...` with its causes and exits with status 1
    cli::Cli::parse().dispatch().await
}
