use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "dvn", about = "Decentralized Verification Network: Proof-of-Agency engine")]
pub struct Cli {
    /// Directory holding dvn.toml
    #[arg(long, env = "DVN_STATE_DIR", default_value = ".dvn", global = true)]
    pub state_dir: PathBuf,

    /// Log output format (filter with RUST_LOG)
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show the protocol parameters in effect
    Params,
    /// Run one submission through an in-process network
    Simulate(SimulateArgs),
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a default dvn.toml
    Init,
    /// Show the current configuration
    Show,
}

#[derive(Debug, Clone, clap::Args)]
pub struct SimulateArgs {
    /// Verifiers voting to approve
    #[arg(long, default_value_t = 2)]
    pub approve: u32,
    /// Verifiers voting to reject
    #[arg(long, default_value_t = 1)]
    pub reject: u32,
    /// Seconds to advance the clock before retrying a finalization that was not ready
    #[arg(long, default_value_t = 0)]
    pub advance_secs: u32,
    /// Weight votes by stake × reputation instead of counting them
    #[arg(long)]
    pub weighted: bool,
    /// Finalize through the operator's emergency path instead of the studio
    #[arg(long)]
    pub emergency: bool,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            approve: 2,
            reject: 1,
            advance_secs: 0,
            weighted: false,
            emergency: false,
        }
    }
}
