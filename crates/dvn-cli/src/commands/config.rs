use std::path::Path;

use anyhow::{Context, Result, ensure};

use crate::cli::ConfigAction;
use crate::config::DvnConfig;

/// What `config init` found or wrote.
#[derive(Debug, PartialEq)]
enum InitOutcome {
    Created(DvnConfig),
    Existing(DvnConfig),
}

/// Handle config subcommands.
pub async fn handle(action: ConfigAction, state_dir: &Path) -> Result<()> {
    let path = DvnConfig::config_path(state_dir);
    match action {
        ConfigAction::Init => match init(state_dir)? {
            InitOutcome::Created(config) => {
                println!("Created default config at: {}", path.display());
                println!();
                print!("{}", render(&config));
            }
            InitOutcome::Existing(config) => {
                println!("Config already exists at: {}", path.display());
                println!("It loads and validates; use `dvn config show` to view it.");
                println!("Tally: {}", tally_summary(&config));
            }
        },

        ConfigAction::Show => {
            let config = DvnConfig::load(state_dir)?;
            if path.exists() {
                println!("Config: {}", path.display());
            } else {
                println!("Config: none at {} (built-in defaults)", path.display());
            }
            println!();
            print!("{}", render(&config));
        }
    }
    Ok(())
}

/// Write a default config unless one exists, then read it back through the
/// validating loader so a file that would not load is never reported as made.
fn init(state_dir: &Path) -> Result<InitOutcome> {
    if DvnConfig::config_path(state_dir).exists() {
        let existing = DvnConfig::load(state_dir).context("Existing config is invalid")?;
        return Ok(InitOutcome::Existing(existing));
    }

    let config = DvnConfig::default();
    config.save(state_dir)?;
    let written = DvnConfig::load(state_dir).context("Written config does not load")?;
    ensure!(
        written == config,
        "Written config does not match the defaults it was built from"
    );
    Ok(InitOutcome::Created(written))
}

fn tally_summary(config: &DvnConfig) -> String {
    let p = &config.protocol;
    format!(
        "{:?}, {}% of at least {} attestations, window {}s, emergency after {}s",
        p.tally_rule,
        p.consensus_threshold,
        p.min_attestations,
        p.attestation_timeout_secs,
        p.emergency_timeout().num_seconds()
    )
}

fn render(config: &DvnConfig) -> String {
    let mut out = String::new();
    out.push_str("Studio:\n");
    out.push_str(&format!("  name:              {}\n", config.studio.name));
    out.push_str(&format!(
        "  verification_fee:  {}\n",
        config.studio.verification_fee
    ));
    out.push_str(&format!(
        "  action_types:      {}\n",
        config.studio.supported_action_types.join(", ")
    ));
    out.push_str("Protocol:\n");
    out.push_str(&format!("  tally:             {}\n", tally_summary(config)));
    out.push_str(&format!(
        "  min_stake:         {}\n",
        config.protocol.min_stake
    ));
    out.push_str("Ledger:\n");
    out.push_str(&format!("  backend:           {}\n", config.ledger.backend));
    out
}
