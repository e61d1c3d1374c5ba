use serde::{Deserialize, Serialize};

use dvn_types::{Amount, DvnError, Result, amount_serde};

pub const DEFAULT_STUDIO_NAME: &str = "kirana_ai_poc";

/// 0.0001 ETH in wei.
pub const DEFAULT_VERIFICATION_FEE: Amount = 100_000_000_000_000;

pub const DEFAULT_ACTION_TYPES: [&str; 3] = [
    "KiranaAI_StockReport",
    "KiranaAI_InventoryAudit",
    "KiranaAI_ReorderAlert",
];

/// Studio policy: which work it accepts and what it charges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudioConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_action_types")]
    pub supported_action_types: Vec<String>,

    #[serde(default = "default_fee", with = "amount_serde")]
    pub verification_fee: Amount,
}

fn default_name() -> String {
    DEFAULT_STUDIO_NAME.to_string()
}

fn default_action_types() -> Vec<String> {
    DEFAULT_ACTION_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_fee() -> Amount {
    DEFAULT_VERIFICATION_FEE
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            supported_action_types: default_action_types(),
            verification_fee: default_fee(),
        }
    }
}

impl StudioConfig {
    pub fn supports(&self, action_type: &str) -> bool {
        self.supported_action_types.iter().any(|a| a == action_type)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DvnError::InvalidParams("studio name must not be empty".into()));
        }
        if self.supported_action_types.is_empty() {
            return Err(DvnError::InvalidParams(
                "studio must support at least one action type".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StudioConfig::default();
        assert_eq!(config.name, "kirana_ai_poc");
        assert!(config.supports("KiranaAI_InventoryAudit"));
        assert!(!config.supports("KiranaAI_Unknown"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: StudioConfig = toml::from_str(r#"name = "pilot""#).unwrap();
        assert_eq!(config.name, "pilot");
        assert_eq!(config.verification_fee, DEFAULT_VERIFICATION_FEE);
        assert_eq!(config.supported_action_types.len(), 3);
    }

    #[test]
    fn test_empty_action_list_rejected() {
        let config = StudioConfig {
            supported_action_types: Vec::new(),
            ..StudioConfig::default()
        };
        assert!(matches!(config.validate(), Err(DvnError::InvalidParams(_))));
    }
}
