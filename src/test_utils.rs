//! Test Utilities Module
//!
//! Scripted in-memory transport for deterministic tests of the cache,
//! resolver and confirmation paths. No network access; latency is simulated
//! with `tokio::time::sleep`, so tests should run with paused time.
//!
//! These utilities are only compiled when running tests or when the
//! `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use crate::delegation::{encode_record_data, DelegationProgram};
use crate::errors::{RouterError, RouterResult};
use crate::transport::{
    AccountSource, AccountSubscription, SignatureSubscription, Subscription, TransactionTransport,
};
use crate::types::{AccountSnapshot, Commitment, Observation, TransactionStatus, VenueId};
use async_trait::async_trait;
use parking_lot::Mutex;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Watchers<K, T> = Mutex<HashMap<K, Vec<(CancellationToken, mpsc::UnboundedSender<T>)>>>;

/// Mock transport implementing both account and transaction traits
pub struct MockTransport {
    endpoint: String,
    slot: AtomicU64,
    accounts: Mutex<HashMap<Pubkey, Observation>>,
    account_watchers: Watchers<Pubkey, Observation>,
    statuses: Mutex<HashMap<Signature, TransactionStatus>>,
    signature_watchers: Mutex<HashMap<Signature, Vec<(Commitment, CancellationToken, mpsc::UnboundedSender<TransactionStatus>)>>>,
    sent: Mutex<Vec<Vec<u8>>>,

    fetch_delay: Mutex<Duration>,
    fail_fetch: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_status: AtomicBool,
    push_signatures: AtomicBool,
    auto_confirm: Mutex<Option<Commitment>>,

    fetch_calls: AtomicUsize,
    account_subscribe_calls: AtomicUsize,
    status_calls: AtomicUsize,
    signature_subscribe_calls: AtomicUsize,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            slot: AtomicU64::new(1),
            accounts: Mutex::new(HashMap::new()),
            account_watchers: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            signature_watchers: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            fetch_delay: Mutex::new(Duration::ZERO),
            fail_fetch: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
            push_signatures: AtomicBool::new(false),
            auto_confirm: Mutex::new(None),
            fetch_calls: AtomicUsize::new(0),
            account_subscribe_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            signature_subscribe_calls: AtomicUsize::new(0),
        }
    }

    /// Observation of a funded, program-owned record pointing at `venue`
    pub fn delegated_observation(program: &DelegationProgram, venue: VenueId, slot: u64) -> Observation {
        Observation::present(
            slot,
            AccountSnapshot {
                owner: *program.program_id(),
                lamports: 1,
                data: encode_record_data(&venue),
            },
        )
    }

    // ---- scripting ----

    /// Slot reported for absent accounts
    pub fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub fn set_account(&self, address: &Pubkey, observation: Observation) {
        self.accounts.lock().insert(*address, observation);
    }

    /// Script `account` as delegated to `venue` (fetch only, no push)
    pub fn set_delegated(&self, program: &DelegationProgram, account: &Pubkey, venue: VenueId, slot: u64) {
        self.set_account(
            &program.record_address(account),
            Self::delegated_observation(program, venue, slot),
        );
    }

    /// Deliver `observation` to every live subscriber of `address`
    pub fn push_account(&self, address: &Pubkey, observation: Observation) {
        self.set_account(address, observation.clone());
        if let Some(watchers) = self.account_watchers.lock().get_mut(address) {
            watchers.retain(|(token, tx)| !token.is_cancelled() && tx.send(observation.clone()).is_ok());
        }
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    /// Enable push notifications for signatures
    pub fn enable_signature_push(&self, enabled: bool) {
        self.push_signatures.store(enabled, Ordering::SeqCst);
    }

    /// Every sent transaction lands immediately at `commitment`
    pub fn set_auto_confirm(&self, commitment: Option<Commitment>) {
        *self.auto_confirm.lock() = commitment;
    }

    /// Record a status; notifies signature subscribers whose level is met
    pub fn set_status(&self, signature: &Signature, status: TransactionStatus) {
        self.statuses.lock().insert(*signature, status.clone());
        if let Some(watchers) = self.signature_watchers.lock().get_mut(signature) {
            watchers.retain(|(target, token, tx)| {
                if token.is_cancelled() {
                    return false;
                }
                if status.commitment.satisfies(*target) {
                    let _ = tx.send(status.clone());
                    return false;
                }
                true
            });
        }
    }

    // ---- inspection ----

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn account_subscribe_calls(&self) -> usize {
        self.account_subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn signature_subscribe_calls(&self) -> usize {
        self.signature_subscribe_calls.load(Ordering::SeqCst)
    }

    /// Total network calls of any kind
    pub fn network_calls(&self) -> usize {
        self.fetch_calls()
            + self.account_subscribe_calls()
            + self.status_calls()
            + self.signature_subscribe_calls()
            + self.sent.lock().len()
    }

    /// Subscriptions on `address` that have not been released
    pub fn active_account_subscriptions(&self, address: &Pubkey) -> usize {
        self.account_watchers
            .lock()
            .get(address)
            .map(|watchers| watchers.iter().filter(|(token, _)| !token.is_cancelled()).count())
            .unwrap_or(0)
    }

    /// Signature subscriptions that have not been released
    pub fn active_signature_subscriptions(&self) -> usize {
        self.signature_watchers
            .lock()
            .values()
            .flatten()
            .filter(|(_, token, _)| !token.is_cancelled())
            .count()
    }

    pub fn sent_transactions(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    fn failure(&self, what: &str) -> RouterError {
        RouterError::transport(&self.endpoint, format!("mock {} failure", what))
    }
}

#[async_trait]
impl AccountSource for MockTransport {
    async fn fetch_account(&self, address: &Pubkey) -> RouterResult<Observation> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(self.failure("fetch"));
        }
        let observation = self.accounts.lock().get(address).cloned();
        Ok(observation.unwrap_or_else(|| Observation::absent(self.slot.load(Ordering::SeqCst))))
    }

    async fn subscribe_account(&self, address: &Pubkey) -> RouterResult<AccountSubscription> {
        self.account_subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(self.failure("subscribe"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        self.account_watchers
            .lock()
            .entry(*address)
            .or_default()
            .push((token.clone(), tx));
        Ok(Subscription::new(rx, token))
    }
}

#[async_trait]
impl TransactionTransport for MockTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_raw(&self, bytes: &[u8]) -> RouterResult<Signature> {
        let signature = {
            let mut sent = self.sent.lock();
            sent.push(bytes.to_vec());
            let mut raw = [0u8; 64];
            raw[..8].copy_from_slice(&(sent.len() as u64).to_le_bytes());
            raw[8] = self.endpoint.len() as u8;
            Signature::from(raw)
        };
        let auto_confirm = *self.auto_confirm.lock();
        if let Some(commitment) = auto_confirm {
            let slot = self.slot.load(Ordering::SeqCst);
            self.set_status(
                &signature,
                TransactionStatus {
                    slot,
                    commitment,
                    err: None,
                },
            );
        }
        Ok(signature)
    }

    async fn get_transaction_status(
        &self,
        signature: &Signature,
        _commitment: Commitment,
    ) -> RouterResult<Option<TransactionStatus>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(self.failure("status"));
        }
        Ok(self.statuses.lock().get(signature).cloned())
    }

    async fn subscribe_signature(
        &self,
        signature: &Signature,
        commitment: Commitment,
    ) -> RouterResult<Option<SignatureSubscription>> {
        if !self.push_signatures.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.signature_subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        self.signature_watchers
            .lock()
            .entry(*signature)
            .or_default()
            .push((commitment, token.clone(), tx));
        Ok(Some(Subscription::new(rx, token)))
    }
}
