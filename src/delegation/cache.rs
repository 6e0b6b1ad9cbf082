//! In-memory delegation status cache
//!
//! Lookups are served from memory once an address has been seen. A miss
//! starts a hybrid refresh against the record account:
//! - a live subscription, released after its first notification (or after
//!   `subscription_ttl` without one)
//! - a one-shot fetch, issued exactly once per miss
//!
//! Whichever lands first populates the cache and unblocks the caller; the
//! other still runs to completion in the background. Writes are gated on the
//! observation slot so a slow fetch cannot overwrite a newer push.
//!
//! Concurrent misses on one address share a single in-flight refresh. A
//! malformed record from the fetch fails the refresh at once; after any other
//! fetch failure the subscription gets `refresh_timeout` to deliver.

use super::record::DelegationProgram;
use crate::errors::{RouterError, RouterResult};
use crate::metrics::{metrics, Timer};
use crate::transport::AccountSource;
use crate::types::{DelegationRecord, Observation};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use solana_sdk::pubkey::Pubkey;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Default bound on how long a refresh subscription waits for its first push
pub const DEFAULT_SUBSCRIPTION_TTL: Duration = Duration::from_secs(60);

/// Default wait on the subscription once the fetch side has failed
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

type PendingRefresh = Shared<BoxFuture<'static, RouterResult<DelegationRecord>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshSide {
    Fetch,
    Subscription,
}

type SideResult = (RefreshSide, RouterResult<DelegationRecord>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheEntry {
    record: DelegationRecord,
    slot: u64,
}

struct CacheInner {
    source: Arc<dyn AccountSource>,
    program: DelegationProgram,
    entries: DashMap<Pubkey, CacheEntry>,
    in_flight: DashMap<Pubkey, PendingRefresh>,
    subscription_ttl: Duration,
    refresh_timeout: Duration,
    shutdown: CancellationToken,
}

impl CacheInner {
    /// Normalize `observation` and write it unless a newer slot is cached.
    ///
    /// Returns the record the cache holds afterwards.
    fn apply(
        &self,
        address: &Pubkey,
        record_address: &Pubkey,
        observation: &Observation,
    ) -> RouterResult<DelegationRecord> {
        let record = self.program.normalize(record_address, observation)?;
        let incoming = CacheEntry {
            record,
            slot: observation.slot,
        };

        let current = match self.entries.entry(*address) {
            Entry::Occupied(mut occupied) => {
                let cached = *occupied.get();
                if incoming.slot < cached.slot {
                    metrics().cache_updates_stale.inc();
                    debug!(
                        %address,
                        cached_slot = cached.slot,
                        incoming_slot = incoming.slot,
                        "Dropping stale delegation observation"
                    );
                    return Ok(cached.record);
                }
                occupied.insert(incoming);
                incoming
            }
            Entry::Vacant(vacant) => *vacant.insert(incoming),
        };

        metrics().cache_updates_applied.inc();
        debug!(%address, slot = current.slot, record = ?current.record, "Delegation status updated");
        Ok(current.record)
    }
}

/// Per-account delegation status cache
///
/// Owns the background refresh tasks it starts; dropping the cache cancels
/// them.
pub struct DelegationStatusCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for DelegationStatusCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationStatusCache")
            .field("program", &self.inner.program)
            .field("entries", &self.inner.entries.len())
            .field("in_flight", &self.inner.in_flight.len())
            .field("subscription_ttl", &self.inner.subscription_ttl)
            .field("refresh_timeout", &self.inner.refresh_timeout)
            .finish()
    }
}

impl DelegationStatusCache {
    pub fn new(source: Arc<dyn AccountSource>, program: DelegationProgram) -> Self {
        Self::with_timeouts(source, program, DEFAULT_SUBSCRIPTION_TTL, DEFAULT_REFRESH_TIMEOUT)
    }

    pub fn with_subscription_ttl(
        source: Arc<dyn AccountSource>,
        program: DelegationProgram,
        subscription_ttl: Duration,
    ) -> Self {
        Self::with_timeouts(source, program, subscription_ttl, DEFAULT_REFRESH_TIMEOUT)
    }

    pub fn with_timeouts(
        source: Arc<dyn AccountSource>,
        program: DelegationProgram,
        subscription_ttl: Duration,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                program,
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                subscription_ttl,
                refresh_timeout,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn program(&self) -> &DelegationProgram {
        &self.inner.program
    }

    /// Delegation status of `address`.
    ///
    /// A cached value is returned as-is, without network access, even if it
    /// may be outdated. On a miss the record account is refreshed and the
    /// cache is populated before this returns.
    #[instrument(skip_all, fields(%address))]
    pub async fn track(&self, address: &Pubkey) -> RouterResult<DelegationRecord> {
        if let Some(entry) = self.inner.entries.get(address) {
            metrics().cache_hits.inc();
            debug!(record = ?entry.record, "Delegation cache hit");
            return Ok(entry.record);
        }

        metrics().cache_misses.inc();
        self.refresh(address).await
    }

    /// Force a refresh of `address`, even if it is cached.
    ///
    /// Joins the refresh already in flight for `address`, if any. Fails if
    /// both sides fail or the fetch returns a malformed record; the cache is
    /// left untouched in that case.
    pub async fn refresh(&self, address: &Pubkey) -> RouterResult<DelegationRecord> {
        let pending = match self.inner.in_flight.entry(*address) {
            Entry::Occupied(occupied) => {
                metrics().refresh_coalesced.inc();
                debug!(%address, "Joining in-flight refresh");
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let pending = start_refresh(&self.inner, *address).boxed().shared();
                vacant.insert(pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Cached status without any network access
    pub fn peek(&self, address: &Pubkey) -> Option<DelegationRecord> {
        self.inner.entries.get(address).map(|entry| entry.record)
    }

    /// Forget `address`; the next `track` refreshes it
    pub fn invalidate(&self, address: &Pubkey) -> Option<DelegationRecord> {
        self.inner.entries.remove(address).map(|(_, entry)| entry.record)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl Drop for DelegationStatusCache {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Spawn both refresh sides and return the future that collects them.
///
/// The returned future holds only a weak reference to the cache, so an
/// abandoned refresh parked in `in_flight` does not keep the cache alive.
fn start_refresh(
    inner: &Arc<CacheInner>,
    address: Pubkey,
) -> impl std::future::Future<Output = RouterResult<DelegationRecord>> + Send + 'static {
    let record_address = inner.program.record_address(&address);
    // One result from each side
    let (tx, rx) = mpsc::channel(2);

    tokio::spawn(watch_first_notification(
        inner.clone(),
        address,
        record_address,
        tx.clone(),
    ));
    tokio::spawn(fetch_once(inner.clone(), address, record_address, tx));

    collect_refresh(rx, Arc::downgrade(inner), address, inner.refresh_timeout)
}

async fn collect_refresh(
    mut rx: mpsc::Receiver<SideResult>,
    inner: Weak<CacheInner>,
    address: Pubkey,
    refresh_timeout: Duration,
) -> RouterResult<DelegationRecord> {
    let timer = Timer::new();
    let result = first_success(&mut rx, &address, refresh_timeout).await;

    if let Some(inner) = inner.upgrade() {
        inner.in_flight.remove(&address);
    }

    match &result {
        Ok(_) => timer.observe_duration(&metrics().refresh_latency),
        Err(e) => {
            metrics().refresh_failures.inc();
            warn!(%address, error = %e, "Delegation refresh failed");
        }
    }
    result
}

async fn first_success(
    rx: &mut mpsc::Receiver<SideResult>,
    address: &Pubkey,
    refresh_timeout: Duration,
) -> RouterResult<DelegationRecord> {
    let mut first_error = None;
    let mut fetch_failed = false;

    loop {
        let next = if fetch_failed {
            match tokio::time::timeout(refresh_timeout, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!(%address, "No notification within refresh timeout");
                    break;
                }
            }
        } else {
            rx.recv().await
        };
        let Some((side, result)) = next else {
            break;
        };

        match result {
            Ok(record) => return Ok(record),
            Err(e @ RouterError::MalformedRecord { .. }) if side == RefreshSide::Fetch => {
                return Err(e);
            }
            Err(e) => {
                debug!(%address, ?side, error = %e, "Refresh side failed");
                fetch_failed |= side == RefreshSide::Fetch;
                first_error.get_or_insert(e);
            }
        }
    }

    Err(first_error.unwrap_or_else(|| RouterError::Internal("refresh tasks stopped".to_string())))
}

async fn watch_first_notification(
    inner: Arc<CacheInner>,
    address: Pubkey,
    record_address: Pubkey,
    tx: mpsc::Sender<SideResult>,
) {
    let mut subscription = match inner.source.subscribe_account(&record_address).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(%address, %record_address, error = %e, "Record subscription failed");
            let _ = tx.send((RefreshSide::Subscription, Err(e))).await;
            return;
        }
    };

    let ttl = inner.subscription_ttl;
    let next = tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        next = tokio::time::timeout(ttl, subscription.next()) => next,
    };
    subscription.unsubscribe();

    let result = match next {
        Ok(Some(observation)) => inner.apply(&address, &record_address, &observation),
        Ok(None) => Err(RouterError::transport(
            "account-subscription",
            "subscription closed before first notification",
        )),
        Err(_) => Err(RouterError::transport(
            "account-subscription",
            format!("timeout: no notification within {}ms", ttl.as_millis()),
        )),
    };
    if let Err(e) = &result {
        debug!(%address, error = %e, "Record subscription ended without an update");
    }
    let _ = tx.send((RefreshSide::Subscription, result)).await;
}

async fn fetch_once(
    inner: Arc<CacheInner>,
    address: Pubkey,
    record_address: Pubkey,
    tx: mpsc::Sender<SideResult>,
) {
    let fetched = tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        fetched = inner.source.fetch_account(&record_address) => fetched,
    };

    let result = fetched.and_then(|observation| inner.apply(&address, &record_address, &observation));
    let _ = tx.send((RefreshSide::Fetch, result)).await;
}
