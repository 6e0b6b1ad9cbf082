//! Transport collaborators
//!
//! The router never talks to the network directly. Account observations come
//! from an [`AccountSource`], transaction submission and status from a
//! [`TransactionTransport`]. Both subscription kinds share one shape: a
//! channel of updates paired with a cancellation token, released explicitly
//! via `unsubscribe()` or implicitly on drop.

pub mod rpc;

use crate::errors::RouterResult;
use crate::types::{Commitment, Observation, TransactionStatus};
use async_trait::async_trait;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use rpc::RpcTransport;

/// Source of account snapshots (fetch + live updates)
#[async_trait]
pub trait AccountSource: Send + Sync {
    /// One-shot fetch of the current state of `address`
    async fn fetch_account(&self, address: &Pubkey) -> RouterResult<Observation>;

    /// Live stream of updates for `address`
    async fn subscribe_account(&self, address: &Pubkey) -> RouterResult<AccountSubscription>;
}

/// Submission and settlement tracking against a single venue
#[async_trait]
pub trait TransactionTransport: Send + Sync {
    /// Human-readable endpoint, used in logs and errors
    fn endpoint(&self) -> &str;

    /// Submit a serialized transaction
    async fn send_raw(&self, bytes: &[u8]) -> RouterResult<Signature>;

    /// Current status of `signature`, `None` if the node has not seen it
    async fn get_transaction_status(
        &self,
        signature: &Signature,
        commitment: Commitment,
    ) -> RouterResult<Option<TransactionStatus>>;

    /// Push notification when `signature` reaches `commitment`.
    ///
    /// Returns `Ok(None)` when the transport has no push channel; callers
    /// fall back to polling.
    async fn subscribe_signature(
        &self,
        _signature: &Signature,
        _commitment: Commitment,
    ) -> RouterResult<Option<SignatureSubscription>> {
        Ok(None)
    }
}

/// Cancellable stream of updates
#[derive(Debug)]
pub struct Subscription<T> {
    updates: mpsc::UnboundedReceiver<T>,
    token: CancellationToken,
}

pub type AccountSubscription = Subscription<Observation>;
pub type SignatureSubscription = Subscription<TransactionStatus>;

impl<T> Subscription<T> {
    /// Create a subscription whose producer stops once `token` is cancelled
    pub fn new(updates: mpsc::UnboundedReceiver<T>, token: CancellationToken) -> Self {
        Self { updates, token }
    }

    /// Next update, `None` once the producer has stopped
    pub async fn next(&mut self) -> Option<T> {
        self.updates.recv().await
    }

    /// Token the producer watches; cancelled on unsubscribe or drop
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Release the underlying subscription
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
