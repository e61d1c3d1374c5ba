use std::path::Path;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use tracing::info;

use dvn_ledger::LedgerEntry;
use dvn_types::{
    AgentId, AgentKind, DvnError, ErrorKind, IdentityKey, PoaId, SubmissionStatus, TallyRule,
    Weight,
};

use crate::cli::SimulateArgs;
use crate::config::DvnConfig;
use crate::state::Network;

/// A rejected call observed during the run.
#[derive(Debug)]
pub struct StepError {
    pub step: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    fn new(step: &'static str, err: &DvnError) -> Self {
        Self {
            step,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct VoteLine {
    pub verifier: String,
    pub approved: bool,
    pub weight: Weight,
}

#[derive(Debug)]
pub struct SimulationReport {
    pub poa_id: PoaId,
    pub tally_rule: TallyRule,
    pub votes: Vec<VoteLine>,
    pub verdict: Option<SubmissionStatus>,
    pub errors: Vec<StepError>,
    pub trail: Vec<LedgerEntry>,
    pub intact: bool,
    pub merkle_root: Option<String>,
}

fn identity(label: &str) -> IdentityKey {
    IdentityKey::from_label(label)
}

/// Wire a network, push one submission through it and collect what happened.
pub async fn run(config: &DvnConfig, args: &SimulateArgs) -> Result<SimulationReport> {
    let mut config = config.clone();
    if args.weighted {
        config.protocol.tally_rule = TallyRule::StakeWeighted;
    }
    let net = Network::wire(&config).await?;
    let registry = net.engine.registry();
    let min_stake = config.protocol.min_stake;

    registry
        .register_agent(identity("W1"), AgentId::from_label("W1"), AgentKind::Worker, None)
        .await
        .context("Failed to register worker")?;

    // Approvers first, then rejecters. Verifier i stakes (i + 1) × min_stake.
    let ballots: Vec<(String, bool)> = (0..args.approve)
        .map(|_| true)
        .chain((0..args.reject).map(|_| false))
        .enumerate()
        .map(|(i, approved)| (format!("V{}", i + 1), approved))
        .collect();
    for (i, (label, _)) in ballots.iter().enumerate() {
        registry
            .register_agent(
                identity(label),
                AgentId::from_label(label),
                AgentKind::Verifier,
                None,
            )
            .await
            .with_context(|| format!("Failed to register verifier {label}"))?;
        registry
            .stake(identity(label), min_stake.saturating_mul(i as u128 + 1))
            .await
            .with_context(|| format!("Failed to stake for {label}"))?;
    }

    let action_type = config
        .studio
        .supported_action_types
        .first()
        .cloned()
        .unwrap_or_default();
    let poa_id = net
        .studio
        .submit_work(
            identity("W1"),
            &action_type,
            "sim://report-001",
            config.studio.verification_fee,
        )
        .await
        .context("Failed to submit work")?;

    let mut errors = Vec::new();
    for (label, approved) in &ballots {
        let justification = Some(format!("sim://{label}/justification"));
        if let Err(e) = net
            .engine
            .attestations()
            .submit_vote(identity(label), poa_id, *approved, justification)
            .await
        {
            errors.push(StepError::new("vote", &e));
        }
    }

    let mut votes = Vec::with_capacity(ballots.len());
    for (label, approved) in &ballots {
        votes.push(VoteLine {
            verifier: label.clone(),
            approved: *approved,
            weight: registry.get_weight(identity(label)).await,
        });
    }

    let mut verdict = finalize(&net, poa_id, args.emergency, &mut errors).await;
    if verdict.is_none() && args.advance_secs > 0 {
        net.clock
            .advance(TimeDelta::seconds(i64::from(args.advance_secs)));
        verdict = finalize(&net, poa_id, args.emergency, &mut errors).await;
    }

    info!(poa_id = %poa_id, verdict = ?verdict, errors = errors.len(), "Simulation finished");

    let trail = net.ledger.all_entries().await?;
    let intact = net.ledger.verify_integrity().await?;
    let merkle_root = match &net.merkle {
        Some(merkle) => merkle.root_hex().await,
        None => None,
    };

    Ok(SimulationReport {
        poa_id,
        tally_rule: config.protocol.tally_rule,
        votes,
        verdict,
        errors,
        trail,
        intact,
        merkle_root,
    })
}

async fn finalize(
    net: &Network,
    poa_id: PoaId,
    emergency: bool,
    errors: &mut Vec<StepError>,
) -> Option<SubmissionStatus> {
    let (step, result) = if emergency {
        (
            "emergency_finalize",
            net.studio.emergency_finalize(poa_id, &net.admin).await,
        )
    } else {
        ("finalize", net.studio.finalize(poa_id).await)
    };
    match result {
        Ok(status) => Some(status),
        Err(e) => {
            errors.push(StepError::new(step, &e));
            None
        }
    }
}

/// Shorten 0x-prefixed hex ids for the trail listing.
fn abbrev(value: &str) -> String {
    match value.strip_prefix("0x").and_then(|hex| hex.get(..8)) {
        Some(head) if value.len() > head.len() + 2 => format!("0x{head}.."),
        _ => value.to_string(),
    }
}

pub async fn handle(args: SimulateArgs, state_dir: &Path) -> Result<()> {
    let config = DvnConfig::load(state_dir)?;
    let report = run(&config, &args).await?;

    println!("Submission: {}", report.poa_id);
    println!("Tally rule: {:?}", report.tally_rule);
    println!();
    println!("Votes:");
    for vote in &report.votes {
        println!(
            "  {:<5} {:<8} weight={}",
            vote.verifier,
            if vote.approved { "approve" } else { "reject" },
            vote.weight
        );
    }

    if !report.errors.is_empty() {
        println!();
        println!("Errors:");
        for err in &report.errors {
            println!("  [{}] {:?}: {}", err.step, err.kind, err.message);
        }
    }

    println!();
    match report.verdict {
        Some(status) => println!("Verdict: {status}"),
        None => println!("Verdict: (not finalized; try --advance-secs)"),
    }

    println!();
    println!("Audit trail ({} entries):", report.trail.len());
    for (i, entry) in report.trail.iter().enumerate() {
        println!(
            "  {:>3}  {:<24} actor={:<12} subject={}",
            i,
            format!("{:?}", entry.kind),
            abbrev(&entry.actor),
            abbrev(&entry.subject)
        );
    }
    println!();
    println!(
        "Integrity: {}",
        if report.intact { "intact" } else { "BROKEN" }
    );
    if let Some(root) = &report.merkle_root {
        println!("Merkle root: {root}");
    }
    Ok(())
}
