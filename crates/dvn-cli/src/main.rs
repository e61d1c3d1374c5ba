mod cli;
mod commands;
mod config;
mod state;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, LogFormat};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Config { action } => commands::config::handle(action, &cli.state_dir).await,
        Commands::Params => commands::params::handle(&cli.state_dir).await,
        Commands::Simulate(args) => commands::simulate::handle(args, &cli.state_dir).await,
    }
}
