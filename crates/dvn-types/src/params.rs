use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::agent::{Amount, Reputation};
use crate::error::{DvnError, Result};

/// Attestations required before a submission can be finalized ahead of the timeout.
pub const MIN_ATTESTATIONS: u64 = 3;
/// Percentage of the tally one side needs to win.
pub const CONSENSUS_THRESHOLD: u64 = 66;
/// Seconds an attestation window stays open before timeout finalization is allowed.
pub const ATTESTATION_TIMEOUT_SECS: i64 = 10 * 60;
/// 0.001 ETH in wei.
pub const MIN_STAKE: Amount = 1_000_000_000_000_000;
pub const INITIAL_REPUTATION: Reputation = 1_000;
pub const MAX_REPUTATION: Reputation = 10_000;
/// Upper bound on any window deadline, the emergency one included.
pub const MAX_TIMEOUT_SECS: i64 = 365 * 24 * 60 * 60;
/// Emergency finalization waits this many timeouts.
pub const EMERGENCY_TIMEOUT_MULTIPLIER: u32 = 2;

/// How attestations are aggregated into a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TallyRule {
    /// One verifier, one vote.
    #[default]
    VoteCount,
    /// Each vote counts with the verifier's `stake × reputation` weight.
    StakeWeighted,
}

/// Protocol parameters shared by every component. Read-only once wired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolParams {
    #[serde(default = "default_min_attestations")]
    pub min_attestations: u64,

    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: u64,

    #[serde(default = "default_attestation_timeout_secs")]
    pub attestation_timeout_secs: i64,

    #[serde(default = "default_min_stake", with = "amount_serde")]
    pub min_stake: Amount,

    #[serde(default = "default_initial_reputation")]
    pub initial_reputation: Reputation,

    #[serde(default = "default_max_reputation")]
    pub max_reputation: Reputation,

    #[serde(default = "default_emergency_multiplier")]
    pub emergency_timeout_multiplier: u32,

    #[serde(default)]
    pub tally_rule: TallyRule,
}

fn default_min_attestations() -> u64 {
    MIN_ATTESTATIONS
}

fn default_consensus_threshold() -> u64 {
    CONSENSUS_THRESHOLD
}

fn default_attestation_timeout_secs() -> i64 {
    ATTESTATION_TIMEOUT_SECS
}

fn default_min_stake() -> Amount {
    MIN_STAKE
}

fn default_initial_reputation() -> Reputation {
    INITIAL_REPUTATION
}

fn default_max_reputation() -> Reputation {
    MAX_REPUTATION
}

fn default_emergency_multiplier() -> u32 {
    EMERGENCY_TIMEOUT_MULTIPLIER
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            min_attestations: default_min_attestations(),
            consensus_threshold: default_consensus_threshold(),
            attestation_timeout_secs: default_attestation_timeout_secs(),
            min_stake: default_min_stake(),
            initial_reputation: default_initial_reputation(),
            max_reputation: default_max_reputation(),
            emergency_timeout_multiplier: default_emergency_multiplier(),
            tally_rule: TallyRule::default(),
        }
    }
}

impl ProtocolParams {
    /// Saturates at `TimeDelta::MAX` for values `validate` would reject.
    pub fn attestation_timeout(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.attestation_timeout_secs).unwrap_or(TimeDelta::MAX)
    }

    pub fn emergency_timeout(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.emergency_timeout_secs()).unwrap_or(TimeDelta::MAX)
    }

    fn emergency_timeout_secs(&self) -> i64 {
        self.attestation_timeout_secs
            .saturating_mul(i64::from(self.emergency_timeout_multiplier))
    }

    pub fn with_tally_rule(mut self, rule: TallyRule) -> Self {
        self.tally_rule = rule;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_attestations == 0 {
            return Err(DvnError::InvalidParams(
                "min_attestations must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.consensus_threshold) {
            return Err(DvnError::InvalidParams(format!(
                "consensus_threshold must be within 1..=100, got {}",
                self.consensus_threshold
            )));
        }
        if self.attestation_timeout_secs <= 0 {
            return Err(DvnError::InvalidParams(
                "attestation_timeout_secs must be positive".into(),
            ));
        }
        if self.attestation_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(DvnError::InvalidParams(format!(
                "attestation_timeout_secs must be at most {MAX_TIMEOUT_SECS}, got {}",
                self.attestation_timeout_secs
            )));
        }
        if self.emergency_timeout_multiplier == 0 {
            return Err(DvnError::InvalidParams(
                "emergency_timeout_multiplier must be at least 1".into(),
            ));
        }
        if self.emergency_timeout_secs() > MAX_TIMEOUT_SECS {
            return Err(DvnError::InvalidParams(format!(
                "emergency timeout ({}s x {}) exceeds {MAX_TIMEOUT_SECS}s",
                self.attestation_timeout_secs, self.emergency_timeout_multiplier
            )));
        }
        if self.initial_reputation > self.max_reputation {
            return Err(DvnError::InvalidParams(format!(
                "initial_reputation {} exceeds max_reputation {}",
                self.initial_reputation, self.max_reputation
            )));
        }
        Ok(())
    }
}

/// Serializes `u128` amounts as decimal strings so that formats without
/// 128-bit integers (TOML) can carry them. Accepts integers on input too.
pub mod amount_serde {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    use crate::agent::Amount;

    pub fn serialize<S: Serializer>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        struct AmountVisitor;

        impl Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or decimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(Amount::from(v))
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<Amount, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                Amount::try_from(v).map_err(|_| E::custom("amount must be non-negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.trim().parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}
