use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::DvnError;

macro_rules! fixed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The all-zero value, never a valid binding.
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }

            /// Deterministic id derived from a human-readable label (SHA-256 of the label).
            pub fn from_label(label: &str) -> Self {
                Self(Sha256::digest(label.as_bytes()).into())
            }

            pub fn random() -> Self {
                Self(rand::random())
            }

            /// First four bytes as hex, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{}..)", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = DvnError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s.strip_prefix("0x").unwrap_or(s);
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(digits, &mut bytes).map_err(|e| {
                    DvnError::InvalidIdentifier(format!("malformed hex id '{s}': {e}"))
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_id! {
    /// Globally unique, immutable agent identifier.
    AgentId
}

fixed_id! {
    /// The cryptographic identity an agent acts under (1:1 with its `AgentId`).
    IdentityKey
}

fixed_id! {
    /// Proof-of-Agency submission identifier.
    PoaId
}

impl From<&VerifyingKey> for IdentityKey {
    fn from(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}
