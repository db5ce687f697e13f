use anyhow::Result;
use clap::Parser;

mod cli;

use spillway::{config, init_tracing, server};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    init_tracing();

    match args.command {
        None | Some(cli::Commands::Serve) => {
            let cfg = config::load_config()?;
            server::start_server(cfg).await?;
        }
        Some(cli::Commands::Config {
            action: cli::ConfigCommands::Validate,
        }) => {
            let cfg = config::load_config()?;
            println!(
                "configuration ok: {} (retention {}d, {} events/batch)",
                cfg.db_url, cfg.default_retention_days, cfg.max_events_per_post
            );
        }
    }

    Ok(())
}
