//! Delegation status tracking
//!
//! `record` knows where a delegation record lives and how to read it;
//! `cache` keeps the last observed status of every tracked account.

pub mod cache;
pub mod record;

pub use cache::{DelegationStatusCache, DEFAULT_REFRESH_TIMEOUT, DEFAULT_SUBSCRIPTION_TTL};
#[cfg(any(test, feature = "test_utils"))]
pub use record::encode_record_data;
pub use record::{DelegationProgram, DEFAULT_DELEGATION_PROGRAM_ID};
