use std::path::Path;

use anyhow::Result;

use crate::config::DvnConfig;

pub async fn handle(state_dir: &Path) -> Result<()> {
    let params = DvnConfig::load(state_dir)?.protocol;

    println!("Protocol parameters:");
    println!("  min_attestations:             {}", params.min_attestations);
    println!("  consensus_threshold:          {}%", params.consensus_threshold);
    println!(
        "  attestation_timeout:          {}s",
        params.attestation_timeout_secs
    );
    println!(
        "  emergency_timeout:            {}s (x{})",
        params.emergency_timeout().num_seconds(),
        params.emergency_timeout_multiplier
    );
    println!("  min_stake:                    {}", params.min_stake);
    println!("  initial_reputation:           {}", params.initial_reputation);
    println!("  max_reputation:               {}", params.max_reputation);
    println!("  tally_rule:                   {:?}", params.tally_rule);
    Ok(())
}
