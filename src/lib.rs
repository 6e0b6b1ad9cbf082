//! Delegation Router - delegation-aware routing for Solana ephemeral rollups
//!
//! Accounts on the base ledger can be temporarily delegated to a fast
//! execution venue. This library answers which venue currently owns an
//! account (or everything a transaction writes), and waits for submitted
//! transactions to settle without leaking subscriptions.
//!
//! - [`delegation::DelegationStatusCache`]: per-account delegation status
//! - [`resolver::Resolver`]: account and transaction routing
//! - [`race`]: first-to-settle race over shared contenders
//! - [`confirmation::ConfirmationCoordinator`]: bounded, cancellable waits
//! - [`router::DelegationRouter`]: all of the above behind one handle

pub mod compat;
pub mod config;
pub mod confirmation;
pub mod delegation;
pub mod errors;
pub mod metrics;
pub mod race;
pub mod resolver;
pub mod router;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use config::RouterConfig;
pub use confirmation::{ConfirmOptions, ConfirmationCoordinator, ConfirmationOutcome, ConfirmationSettings};
pub use delegation::{DelegationProgram, DelegationStatusCache};
pub use errors::{RouterError, RouterResult};
pub use race::{race, Contender};
pub use resolver::{Resolver, VenueHandle, VenueRegistry};
pub use router::{DelegationRouter, SendOutcome};
pub use types::{Commitment, DelegationRecord, TransactionStatus, VenueId};

// Re-export commonly used types
pub use solana_sdk::{message::VersionedMessage, pubkey::Pubkey, signature::Signature};
