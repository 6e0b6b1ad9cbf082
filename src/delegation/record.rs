//! Delegation record location and normalization
//!
//! Every delegatable account has a record account at a program-derived
//! address. While the account is delegated the record is owned by the
//! delegation program, holds a non-zero balance, and stores the venue
//! identity right after the 8-byte discriminator.

use crate::errors::{RouterError, RouterResult};
use crate::types::{DelegationRecord, Observation, VenueId};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

/// Public delegation program on mainnet and devnet
pub const DEFAULT_DELEGATION_PROGRAM_ID: &str = "DELeGGvXpWV2fqJUhqcF5ZSYMS4JTLjteaAMARRSaeSh";

/// PDA seed prefix of delegation records
pub const DELEGATION_RECORD_SEED: &[u8] = b"delegation";

const DISCRIMINATOR_LEN: usize = 8;
const VENUE_OFFSET: usize = DISCRIMINATOR_LEN;
const VENUE_END: usize = VENUE_OFFSET + 32;

/// Delegation program the router reads records from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationProgram {
    program_id: Pubkey,
}

impl DelegationProgram {
    pub fn new(program_id: Pubkey) -> Self {
        Self { program_id }
    }

    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    /// Address of the record that describes `account`'s delegation
    pub fn record_address(&self, account: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(&[DELEGATION_RECORD_SEED, account.as_ref()], &self.program_id).0
    }

    /// Normalize an observation of a record account.
    ///
    /// Delegated iff the record exists, is owned by this program and holds a
    /// non-zero balance. Anything else is `Undelegated`.
    pub fn normalize(
        &self,
        record_address: &Pubkey,
        observation: &Observation,
    ) -> RouterResult<DelegationRecord> {
        let Some(account) = observation.account.as_ref() else {
            return Ok(DelegationRecord::Undelegated);
        };
        if account.owner != self.program_id || account.lamports == 0 {
            return Ok(DelegationRecord::Undelegated);
        }

        let venue_bytes = account.data.get(VENUE_OFFSET..VENUE_END).ok_or_else(|| {
            RouterError::MalformedRecord {
                address: *record_address,
                reason: format!("expected at least {} bytes, got {}", VENUE_END, account.data.len()),
            }
        })?;
        let venue = Pubkey::try_from(venue_bytes).map_err(|_| RouterError::MalformedRecord {
            address: *record_address,
            reason: "venue field is not a pubkey".to_string(),
        })?;

        Ok(DelegationRecord::Delegated {
            venue: VenueId(venue),
        })
    }
}

impl Default for DelegationProgram {
    fn default() -> Self {
        // Constant is a valid base58 pubkey
        Self::new(Pubkey::from_str(DEFAULT_DELEGATION_PROGRAM_ID).unwrap_or_default())
    }
}

/// Encode record data the way the delegation program lays it out.
///
/// Only the fields the router reads are populated.
#[cfg(any(test, feature = "test_utils"))]
pub fn encode_record_data(venue: &VenueId) -> Vec<u8> {
    let mut data = vec![0u8; VENUE_END + 8];
    data[VENUE_OFFSET..VENUE_END].copy_from_slice(venue.pubkey().as_ref());
    data
}
