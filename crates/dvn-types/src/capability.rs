//! Typed capability tokens.
//!
//! A component that guards an operation stores the [`GrantId`] it issued at
//! wiring time and accepts only a [`Capability`] carrying that grant. Tokens
//! are not `Clone`; holding one is the proof of authority.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DvnError, Result};

/// Marker for the authority a capability confers.
pub trait Role {
    const NAME: &'static str;
}

/// Held by the consensus engine: reputation updates, slashing, window control, status write-back.
#[derive(Debug)]
pub enum ConsensusRole {}

/// Held by each registered studio: processing requests and submission counting.
#[derive(Debug)]
pub enum StudioRole {}

/// Held by the operator: studio allow-list, emergency finalization, governance adjustments.
#[derive(Debug)]
pub enum AdminRole {}

impl Role for ConsensusRole {
    const NAME: &'static str = "consensus";
}

impl Role for StudioRole {
    const NAME: &'static str = "studio";
}

impl Role for AdminRole {
    const NAME: &'static str = "admin";
}

/// Public identifier of an issued capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrantId(Uuid);

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Capability<R: Role> {
    grant: GrantId,
    _role: PhantomData<fn() -> R>,
}

pub type ConsensusCapability = Capability<ConsensusRole>;
pub type StudioCapability = Capability<StudioRole>;
pub type AdminCapability = Capability<AdminRole>;

impl<R: Role> Capability<R> {
    /// Mint a fresh token with an unguessable grant id.
    pub fn mint() -> Self {
        Self {
            grant: GrantId(Uuid::new_v4()),
            _role: PhantomData,
        }
    }

    pub fn grant(&self) -> GrantId {
        self.grant
    }

    pub fn role(&self) -> &'static str {
        R::NAME
    }

    /// Succeeds only if this token carries the grant that was bound.
    pub fn authorize(&self, bound: Option<GrantId>) -> Result<()> {
        match bound {
            Some(grant) if grant == self.grant => Ok(()),
            _ => Err(DvnError::Unauthorized { role: R::NAME }),
        }
    }

    /// Succeeds only if this token's grant is in the allow-list.
    pub fn authorize_in(&self, grants: &HashSet<GrantId>) -> Result<()> {
        if grants.contains(&self.grant) {
            Ok(())
        } else {
            Err(DvnError::Unauthorized { role: R::NAME })
        }
    }
}

impl<R: Role> fmt::Debug for Capability<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("role", &R::NAME)
            .field("grant", &self.grant)
            .finish()
    }
}
