//! Common types used throughout the router

use serde::{Deserialize, Serialize};
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;

/// Identity of an execution venue (a validator's pubkey)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VenueId(pub Pubkey);

impl VenueId {
    pub fn pubkey(&self) -> &Pubkey {
        &self.0
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Pubkey> for VenueId {
    fn from(pubkey: Pubkey) -> Self {
        Self(pubkey)
    }
}

impl FromStr for VenueId {
    type Err = solana_sdk::pubkey::ParsePubkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pubkey::from_str(s).map(Self)
    }
}

/// Point-in-time belief about who owns an account's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DelegationRecord {
    /// State lives on the base ledger
    Undelegated,
    /// State is delegated to a venue
    Delegated { venue: VenueId },
}

impl DelegationRecord {
    pub fn is_delegated(&self) -> bool {
        matches!(self, DelegationRecord::Delegated { .. })
    }

    pub fn venue(&self) -> Option<VenueId> {
        match self {
            DelegationRecord::Delegated { venue } => Some(*venue),
            DelegationRecord::Undelegated => None,
        }
    }
}

/// Account contents as reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub owner: Pubkey,
    pub lamports: u64,
    pub data: Vec<u8>,
}

/// One observation of an address: the slot it was taken at and the account,
/// if it exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub slot: u64,
    pub account: Option<AccountSnapshot>,
}

impl Observation {
    pub fn absent(slot: u64) -> Self {
        Self { slot, account: None }
    }

    pub fn present(slot: u64, account: AccountSnapshot) -> Self {
        Self {
            slot,
            account: Some(account),
        }
    }
}

/// Commitment level a caller waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }

    /// Whether a transaction observed at `self` meets the `target` level
    pub fn satisfies(&self, target: Commitment) -> bool {
        *self >= target
    }
}

impl Default for Commitment {
    fn default() -> Self {
        Commitment::Confirmed
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Commitment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "processed" => Ok(Commitment::Processed),
            "confirmed" => Ok(Commitment::Confirmed),
            "finalized" => Ok(Commitment::Finalized),
            other => Err(format!("unknown commitment level '{}'", other)),
        }
    }
}

impl From<Commitment> for CommitmentConfig {
    fn from(commitment: Commitment) -> Self {
        let commitment = match commitment {
            Commitment::Processed => CommitmentLevel::Processed,
            Commitment::Confirmed => CommitmentLevel::Confirmed,
            Commitment::Finalized => CommitmentLevel::Finalized,
        };
        CommitmentConfig { commitment }
    }
}

/// Settlement status of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStatus {
    /// Slot the transaction landed in
    pub slot: u64,
    /// Highest commitment level reached so far
    pub commitment: Commitment,
    /// Execution error, if the transaction failed on-chain
    pub err: Option<String>,
}

impl TransactionStatus {
    pub fn is_success(&self) -> bool {
        self.err.is_none()
    }
}
