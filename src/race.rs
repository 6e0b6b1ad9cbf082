//! Safe race over independently-started async operations
//!
//! A [`Contender`] is started once, on its own task, and settles exactly
//! once. Any number of [`race`] calls may wait on the same contender; each
//! registers a waiter keyed by its race id, and the driver task delivers the
//! outcome to whoever is still registered at settle time.
//!
//! When a race settles it deregisters every waiter it still holds on the
//! other contenders, so late outcomes find nobody to deliver to. The same
//! happens if the race future is dropped before settling. Losers are never
//! cancelled by the race itself; that is the caller's call via
//! [`Contender::cancel`] or the token passed to
//! [`Contender::with_cancellation`].

use crate::errors::{RouterError, RouterResult};
use crate::metrics::metrics;
use futures::future::select_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

static NEXT_CONTENDER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_RACE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a contender; clones of a [`Contender`] share it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContenderId(u64);

enum State<T> {
    Pending {
        waiters: HashMap<u64, oneshot::Sender<RouterResult<T>>>,
    },
    Settled(RouterResult<T>),
}

struct Shared<T> {
    id: ContenderId,
    label: String,
    state: Mutex<State<T>>,
    cancel: CancellationToken,
    delivered: AtomicUsize,
}

impl<T: Clone> Shared<T> {
    fn settle(&self, outcome: RouterResult<T>) {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Settled(_) => return,
                State::Pending { waiters } => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Settled(outcome.clone());
                    waiters
                }
            }
        };

        trace!(contender = %self.label, waiters = waiters.len(), ok = outcome.is_ok(), "Contender settled");
        for (_, tx) in waiters {
            if tx.send(outcome.clone()).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

enum Registration<T> {
    Settled(RouterResult<T>),
    Waiting(oneshot::Receiver<RouterResult<T>>),
}

/// Handle to an async operation entered into races
pub struct Contender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Contender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Contender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contender")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Contender<T> {
    /// Start `future` on its own task
    pub fn spawn<F>(label: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = RouterResult<T>> + Send + 'static,
    {
        Self::with_cancellation(label, CancellationToken::new(), future)
    }

    /// Start `future` on its own task; cancelling `token` drops the future
    /// and settles the contender with [`RouterError::Cancelled`]
    pub fn with_cancellation<F>(label: impl Into<String>, token: CancellationToken, future: F) -> Self
    where
        F: Future<Output = RouterResult<T>> + Send + 'static,
    {
        let label = label.into();
        let shared = Arc::new(Shared {
            id: ContenderId(NEXT_CONTENDER_ID.fetch_add(1, Ordering::Relaxed)),
            label,
            state: Mutex::new(State::Pending {
                waiters: HashMap::new(),
            }),
            cancel: token,
            delivered: AtomicUsize::new(0),
        });

        let driver = shared.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = driver.cancel.cancelled() => Err(RouterError::Cancelled),
                result = AssertUnwindSafe(future).catch_unwind() => result.unwrap_or_else(|_| {
                    Err(RouterError::Internal(format!("contender '{}' panicked", driver.label)))
                }),
            };
            driver.settle(outcome);
        });

        Self { shared }
    }
}

impl<T: Clone> Contender<T> {
    pub fn id(&self) -> ContenderId {
        self.shared.id
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Signal the cancellation hook
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Settled(_))
    }

    /// Outcome, if settled
    pub fn outcome(&self) -> Option<RouterResult<T>> {
        match &*self.shared.state.lock() {
            State::Settled(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Races currently waiting on this contender
    pub fn waiter_count(&self) -> usize {
        match &*self.shared.state.lock() {
            State::Pending { waiters } => waiters.len(),
            State::Settled(_) => 0,
        }
    }

    /// Outcomes actually handed to a waiting race
    pub fn delivered(&self) -> usize {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    fn register(&self, race_id: u64) -> Registration<T> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Settled(outcome) => Registration::Settled(outcome.clone()),
            State::Pending { waiters } => {
                let (tx, rx) = oneshot::channel();
                waiters.insert(race_id, tx);
                Registration::Waiting(rx)
            }
        }
    }

    fn deregister(&self, race_id: u64) -> bool {
        match &mut *self.shared.state.lock() {
            State::Pending { waiters } => waiters.remove(&race_id).is_some(),
            State::Settled(_) => false,
        }
    }
}

/// Waiters held by one race; released on drop
struct RaceGuard<T: Clone> {
    race_id: u64,
    registered: Vec<Contender<T>>,
}

impl<T: Clone> Drop for RaceGuard<T> {
    fn drop(&mut self) {
        let mut released = 0u64;
        for contender in &self.registered {
            if contender.deregister(self.race_id) {
                released += 1;
            }
        }
        if released > 0 {
            metrics().race_waiters_released.inc_by(released);
            debug!(race_id = self.race_id, released, "Released losing waiters");
        }
    }
}

/// Outcome of the first contender to settle, success or failure.
///
/// Duplicate entries (same identity) are observed once. An empty slice is an
/// [`RouterError::InvalidArgument`].
pub async fn race<T: Clone + Send + 'static>(contenders: &[Contender<T>]) -> RouterResult<T> {
    if contenders.is_empty() {
        return Err(RouterError::InvalidArgument(
            "race requires at least one contender".to_string(),
        ));
    }
    metrics().races_started.inc();

    let race_id = NEXT_RACE_ID.fetch_add(1, Ordering::Relaxed);
    let mut guard = RaceGuard {
        race_id,
        registered: Vec::with_capacity(contenders.len()),
    };
    let mut seen = HashSet::with_capacity(contenders.len());
    let mut receivers = Vec::with_capacity(contenders.len());

    for contender in contenders {
        if !seen.insert(contender.id()) {
            continue;
        }
        match contender.register(race_id) {
            Registration::Settled(outcome) => {
                metrics().races_settled.inc();
                return outcome;
            }
            Registration::Waiting(rx) => {
                guard.registered.push(contender.clone());
                receivers.push(rx);
            }
        }
    }

    let (received, index, _pending) = select_all(receivers).await;
    drop(guard);
    metrics().races_settled.inc();

    trace!(race_id, winner = index, "Race settled");
    received.unwrap_or_else(|_| {
        Err(RouterError::Internal(
            "contender dropped without settling".to_string(),
        ))
    })
}
