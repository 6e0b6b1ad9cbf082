//! Confirmation coordinator
//!
//! Waits for a submitted transaction to reach a commitment level by racing a
//! signature watcher (push where available, polling always) against a
//! deadline. Every wait runs inside an internal cancellation scope derived
//! from the caller's token; the scope is cancelled on every exit path, which
//! stops polling and releases any signature subscription.

use crate::errors::{RouterError, RouterResult};
use crate::metrics::{metrics, Timer};
use crate::race::{race, Contender};
use crate::transport::{SignatureSubscription, TransactionTransport};
use crate::types::{Commitment, TransactionStatus};
use solana_sdk::signature::Signature;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Deadlines per commitment level and the polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationSettings {
    pub processed_timeout: Duration,
    pub confirmed_timeout: Duration,
    pub finalized_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            processed_timeout: Duration::from_secs(15),
            confirmed_timeout: Duration::from_secs(30),
            finalized_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(400),
        }
    }
}

impl ConfirmationSettings {
    /// Default deadline for waiting on `commitment`
    pub fn timeout_for(&self, commitment: Commitment) -> Duration {
        match commitment {
            Commitment::Processed => self.processed_timeout,
            Commitment::Confirmed => self.confirmed_timeout,
            Commitment::Finalized => self.finalized_timeout,
        }
    }
}

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct ConfirmOptions {
    /// Overrides the commitment-level deadline
    pub deadline: Option<Duration>,
    /// External cancellation signal
    pub cancel: Option<CancellationToken>,
}

impl ConfirmOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// How a wait ended, short of an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Reached the requested commitment. The transaction itself may still
    /// have failed; see [`TransactionStatus::is_success`].
    Confirmed(TransactionStatus),
    TimedOut {
        signature: Signature,
        commitment: Commitment,
        waited: Duration,
    },
}

impl ConfirmationOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }

    /// Treat a timeout as fatal
    pub fn into_result(self) -> RouterResult<TransactionStatus> {
        match self {
            Self::Confirmed(status) => Ok(status),
            Self::TimedOut { waited, .. } => Err(RouterError::TimedOut {
                timeout_ms: waited.as_millis() as u64,
            }),
        }
    }
}

#[derive(Debug, Clone)]
enum Settled {
    Confirmed(TransactionStatus),
    DeadlineElapsed,
}

/// Coordinates bounded, cancellable confirmation waits
#[derive(Debug, Clone, Default)]
pub struct ConfirmationCoordinator {
    settings: ConfirmationSettings,
}

impl ConfirmationCoordinator {
    pub fn new(settings: ConfirmationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ConfirmationSettings {
        &self.settings
    }

    /// Wait until `signature` reaches `commitment` on `transport`.
    ///
    /// Returns `Err(Cancelled)` without touching the network if the external
    /// token is already cancelled at entry.
    #[instrument(skip_all, fields(%signature, %commitment, endpoint = transport.endpoint()))]
    pub async fn confirm(
        &self,
        transport: Arc<dyn TransactionTransport>,
        signature: &Signature,
        commitment: Commitment,
        options: ConfirmOptions,
    ) -> RouterResult<ConfirmationOutcome> {
        let external = options.cancel.unwrap_or_default();
        if external.is_cancelled() {
            metrics().confirmations_cancelled.inc();
            debug!("Cancelled before start");
            return Err(RouterError::Cancelled);
        }

        let scope = external.child_token();
        let _scope_guard = scope.clone().drop_guard();
        let deadline = options
            .deadline
            .unwrap_or_else(|| self.settings.timeout_for(commitment));
        let timer = Timer::new();

        let watcher = Contender::with_cancellation(
            "signature-watcher",
            scope.clone(),
            watch_signature(transport, *signature, commitment, self.settings.poll_interval),
        );
        let deadline_watcher = Contender::with_cancellation("deadline", scope.clone(), async move {
            tokio::time::sleep(deadline).await;
            Ok(Settled::DeadlineElapsed)
        });

        let contenders = [watcher, deadline_watcher];
        let settled = tokio::select! {
            biased;
            _ = external.cancelled() => Err(RouterError::Cancelled),
            settled = race(&contenders) => settled,
        };
        timer.observe_duration(&metrics().confirmation_latency);

        match settled {
            Ok(Settled::Confirmed(status)) => {
                metrics().confirmations_confirmed.inc();
                info!(slot = status.slot, success = status.is_success(), "Transaction confirmed");
                Ok(ConfirmationOutcome::Confirmed(status))
            }
            Ok(Settled::DeadlineElapsed) => {
                metrics().confirmations_timed_out.inc();
                warn!(waited_ms = deadline.as_millis() as u64, "Confirmation deadline elapsed");
                Ok(ConfirmationOutcome::TimedOut {
                    signature: *signature,
                    commitment,
                    waited: deadline,
                })
            }
            Err(RouterError::Cancelled) => {
                metrics().confirmations_cancelled.inc();
                info!("Confirmation cancelled");
                Err(RouterError::Cancelled)
            }
            Err(e) => {
                warn!(error = %e, "Confirmation failed");
                Err(e)
            }
        }
    }
}

async fn next_push(subscription: &mut Option<SignatureSubscription>) -> Option<TransactionStatus> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

/// Poll (and listen for pushes) until `signature` reaches `commitment`.
/// Transient transport errors are retried on the next tick.
async fn watch_signature(
    transport: Arc<dyn TransactionTransport>,
    signature: Signature,
    commitment: Commitment,
    poll_interval: Duration,
) -> RouterResult<Settled> {
    let mut push = match transport.subscribe_signature(&signature, commitment).await {
        Ok(push) => push,
        Err(e) => {
            warn!(%signature, error = %e, "Signature subscription failed, polling only");
            None
        }
    };

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            pushed = next_push(&mut push) => match pushed {
                Some(status) if status.commitment.satisfies(commitment) => {
                    debug!(%signature, slot = status.slot, "Confirmed via push");
                    return Ok(Settled::Confirmed(status));
                }
                Some(_) => {}
                None => {
                    debug!(%signature, "Signature subscription closed, polling only");
                    push = None;
                }
            },
            _ = ticker.tick() => {
                match transport.get_transaction_status(&signature, commitment).await {
                    Ok(Some(status)) if status.commitment.satisfies(commitment) => {
                        debug!(%signature, slot = status.slot, "Confirmed via poll");
                        return Ok(Settled::Confirmed(status));
                    }
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => {
                        debug!(%signature, error = %e, "Status poll failed, retrying");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;

    fn status(commitment: Commitment, slot: u64) -> TransactionStatus {
        TransactionStatus {
            slot,
            commitment,
            err: None,
        }
    }

    fn signature() -> Signature {
        Signature::from([7u8; 64])
    }

    fn coordinator() -> ConfirmationCoordinator {
        ConfirmationCoordinator::new(ConfirmationSettings {
            processed_timeout: Duration::from_secs(1),
            confirmed_timeout: Duration::from_secs(2),
            finalized_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        })
    }

    #[test]
    fn test_finalized_waits_longest() {
        let settings = ConfirmationSettings::default();
        assert!(settings.timeout_for(Commitment::Finalized) > settings.timeout_for(Commitment::Confirmed));
        assert!(settings.timeout_for(Commitment::Confirmed) > settings.timeout_for(Commitment::Processed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefired_cancel_skips_network() {
        let mock = Arc::new(MockTransport::new("base"));
        mock.enable_signature_push(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = coordinator()
            .confirm(
                mock.clone(),
                &signature(),
                Commitment::Confirmed,
                ConfirmOptions::default().with_cancel(cancel),
            )
            .await;

        assert_eq!(result, Err(RouterError::Cancelled));
        assert_eq!(mock.network_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_via_poll() {
        let mock = Arc::new(MockTransport::new("base"));
        let sig = signature();
        mock.set_status(&sig, status(Commitment::Processed, 10));

        let setter = {
            let mock = mock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(350)).await;
                mock.set_status(&sig, status(Commitment::Confirmed, 11));
            })
        };

        let outcome = coordinator()
            .confirm(mock.clone(), &sig, Commitment::Confirmed, ConfirmOptions::default())
            .await
            .unwrap();
        setter.await.unwrap();

        assert_eq!(outcome, ConfirmationOutcome::Confirmed(status(Commitment::Confirmed, 11)));
        assert!(mock.status_calls() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_via_push() {
        let mock = Arc::new(MockTransport::new("base"));
        mock.enable_signature_push(true);
        let sig = signature();
        let coordinator = ConfirmationCoordinator::new(ConfirmationSettings {
            poll_interval: Duration::from_secs(10),
            ..ConfirmationSettings::default()
        });

        let setter = {
            let mock = mock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                mock.set_status(&sig, status(Commitment::Finalized, 20));
            })
        };

        let outcome = coordinator
            .confirm(mock.clone(), &sig, Commitment::Confirmed, ConfirmOptions::default())
            .await
            .unwrap();
        setter.await.unwrap();

        assert_eq!(outcome, ConfirmationOutcome::Confirmed(status(Commitment::Finalized, 20)));
        // Only the immediate first tick polled
        assert_eq!(mock.status_calls(), 1);
        assert_eq!(mock.signature_subscribe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_timeout_outcome() {
        let mock = Arc::new(MockTransport::new("base"));
        mock.enable_signature_push(true);
        let sig = signature();

        let outcome = coordinator()
            .confirm(mock.clone(), &sig, Commitment::Confirmed, ConfirmOptions::default())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ConfirmationOutcome::TimedOut {
                signature: sig,
                commitment: Commitment::Confirmed,
                waited: Duration::from_secs(2),
            }
        );
        assert_eq!(outcome.into_result(), Err(RouterError::TimedOut { timeout_ms: 2_000 }));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mock.active_signature_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_deadline_overrides_commitment_bound() {
        let mock = Arc::new(MockTransport::new("base"));

        let outcome = coordinator()
            .confirm(
                mock.clone(),
                &signature(),
                Commitment::Finalized,
                ConfirmOptions::default().with_deadline(Duration::from_millis(250)),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ConfirmationOutcome::TimedOut { waited, .. } if waited == Duration::from_millis(250)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_wait_releases_watchers() {
        let mock = Arc::new(MockTransport::new("base"));
        mock.enable_signature_push(true);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                cancel.cancel();
            })
        };

        let result = coordinator()
            .confirm(
                mock.clone(),
                &signature(),
                Commitment::Confirmed,
                ConfirmOptions::default().with_cancel(cancel),
            )
            .await;
        canceller.await.unwrap();

        assert_eq!(result, Err(RouterError::Cancelled));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mock.active_signature_subscriptions(), 0);
        let polls = mock.status_calls();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mock.status_calls(), polls, "polling must stop after cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_errors_are_retried() {
        let mock = Arc::new(MockTransport::new("base"));
        let sig = signature();
        mock.fail_status(true);
        mock.set_status(&sig, status(Commitment::Confirmed, 5));

        let healer = {
            let mock = mock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                mock.fail_status(false);
            })
        };

        let outcome = coordinator()
            .confirm(mock.clone(), &sig, Commitment::Confirmed, ConfirmOptions::default())
            .await
            .unwrap();
        healer.await.unwrap();

        assert!(outcome.is_confirmed());
    }
}
