//! chatlake CLI: run the export lanes and drive the downstream pipeline.
//!
//! Lanes turn conversation tables into daily CSV exports; notifications
//! move each export through the columnar transform and catalog refresh.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
