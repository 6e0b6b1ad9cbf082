//! Solana JSON-RPC / websocket transport
//!
//! Uses the nonblocking `RpcClient` for one-shot requests and a lazily
//! connected `PubsubClient` for account and signature subscriptions. Every
//! subscription runs on its own task that owns a clone of the pubsub client;
//! the task unsubscribes as soon as the consumer cancels or drops its
//! [`Subscription`].

use super::{AccountSource, AccountSubscription, SignatureSubscription, Subscription, TransactionTransport};
use crate::errors::{RouterError, RouterResult};
use crate::metrics::metrics;
use crate::types::{AccountSnapshot, Commitment, Observation, TransactionStatus};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use serde_json::json;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcSignatureSubscribeConfig};
use solana_client::rpc_request::RpcRequest;
use solana_client::rpc_response::RpcSignatureResult;
use solana_sdk::{account::Account, pubkey::Pubkey, signature::Signature};
use solana_transaction_status::TransactionConfirmationStatus;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Transport backed by a single RPC + websocket endpoint pair
pub struct RpcTransport {
    rpc_url: String,
    ws_url: String,
    commitment: Commitment,
    client: Arc<RpcClient>,
    pubsub: OnceCell<Arc<PubsubClient>>,
}

impl std::fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTransport")
            .field("rpc_url", &self.rpc_url)
            .field("ws_url", &self.ws_url)
            .field("commitment", &self.commitment)
            .finish_non_exhaustive()
    }
}

impl RpcTransport {
    pub fn new(rpc_url: impl Into<String>, ws_url: impl Into<String>, commitment: Commitment) -> Self {
        let rpc_url = rpc_url.into();
        Self {
            client: Arc::new(RpcClient::new_with_commitment(
                rpc_url.clone(),
                commitment.into(),
            )),
            rpc_url,
            ws_url: ws_url.into(),
            commitment,
            pubsub: OnceCell::new(),
        }
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    async fn pubsub(&self) -> RouterResult<Arc<PubsubClient>> {
        let client = self
            .pubsub
            .get_or_try_init(|| async {
                debug!(ws_url = %self.ws_url, "Connecting pubsub client");
                PubsubClient::new(&self.ws_url)
                    .await
                    .map(Arc::new)
                    .map_err(|e| RouterError::from_pubsub_error(e, &self.ws_url))
            })
            .await?;
        Ok(client.clone())
    }
}

fn snapshot_from_account(account: Account) -> AccountSnapshot {
    AccountSnapshot {
        owner: account.owner,
        lamports: account.lamports,
        data: account.data,
    }
}

fn commitment_from_status(status: Option<&TransactionConfirmationStatus>) -> Commitment {
    match status {
        Some(TransactionConfirmationStatus::Processed) => Commitment::Processed,
        Some(TransactionConfirmationStatus::Confirmed) => Commitment::Confirmed,
        // Nodes omit the status for rooted transactions
        Some(TransactionConfirmationStatus::Finalized) | None => Commitment::Finalized,
    }
}

#[async_trait]
impl AccountSource for RpcTransport {
    async fn fetch_account(&self, address: &Pubkey) -> RouterResult<Observation> {
        let response = self
            .client
            .get_account_with_commitment(address, self.commitment.into())
            .await
            .map_err(|e| RouterError::from_client_error(e, &self.rpc_url))?;

        Ok(Observation {
            slot: response.context.slot,
            account: response.value.map(snapshot_from_account),
        })
    }

    async fn subscribe_account(&self, address: &Pubkey) -> RouterResult<AccountSubscription> {
        let client = self.pubsub().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let endpoint = self.ws_url.clone();
        let address = *address;
        let config = RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(self.commitment.into()),
            data_slice: None,
            min_context_slot: None,
        };

        tokio::spawn(async move {
            // The notification stream borrows `client`, which lives in this task
            let (mut notifications, unsubscribe) =
                match client.account_subscribe(&address, Some(config)).await {
                    Ok(result) => {
                        let _ = ready_tx.send(Ok(()));
                        result
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(RouterError::from_pubsub_error(e, &endpoint)));
                        return;
                    }
                };
            metrics().active_subscriptions.inc();

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    next = notifications.next() => {
                        let Some(response) = next else { break };
                        let slot = response.context.slot;
                        let observation = match response.value.decode::<Account>() {
                            Some(account) => Observation::present(slot, snapshot_from_account(account)),
                            None => {
                                warn!(%address, slot, "Undecodable account notification");
                                continue;
                            }
                        };
                        if tx.send(observation).is_err() {
                            break;
                        }
                    }
                }
            }

            unsubscribe().await;
            metrics().active_subscriptions.dec();
            debug!(%address, "Account subscription released");
        });

        ready_rx
            .await
            .map_err(|_| RouterError::Internal("account subscription task exited".to_string()))??;
        Ok(Subscription::new(rx, token))
    }
}

#[async_trait]
impl TransactionTransport for RpcTransport {
    fn endpoint(&self) -> &str {
        &self.rpc_url
    }

    async fn send_raw(&self, bytes: &[u8]) -> RouterResult<Signature> {
        let encoded = BASE64.encode(bytes);
        let config = json!({
            "encoding": "base64",
            "preflightCommitment": self.commitment.as_str(),
        });
        let signature: String = self
            .client
            .send(RpcRequest::SendTransaction, json!([encoded, config]))
            .await
            .map_err(|e| RouterError::from_client_error(e, &self.rpc_url))?;

        Signature::from_str(&signature).map_err(|e| {
            RouterError::transport(&self.rpc_url, format!("invalid signature in response: {}", e))
        })
    }

    async fn get_transaction_status(
        &self,
        signature: &Signature,
        commitment: Commitment,
    ) -> RouterResult<Option<TransactionStatus>> {
        let response = self
            .client
            .get_signature_statuses(&[*signature])
            .await
            .map_err(|e| RouterError::from_client_error(e, &self.rpc_url))?;

        let status = response.value.into_iter().next().flatten().map(|status| {
            TransactionStatus {
                slot: status.slot,
                commitment: commitment_from_status(status.confirmation_status.as_ref()),
                err: status.err.map(|e| format!("{:?}", e)),
            }
        });
        debug!(%signature, target = %commitment, ?status, "Polled transaction status");
        Ok(status)
    }

    async fn subscribe_signature(
        &self,
        signature: &Signature,
        commitment: Commitment,
    ) -> RouterResult<Option<SignatureSubscription>> {
        let client = self.pubsub().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let endpoint = self.ws_url.clone();
        let signature = *signature;
        let config = RpcSignatureSubscribeConfig {
            commitment: Some(commitment.into()),
            enable_received_notification: Some(false),
        };

        tokio::spawn(async move {
            let (mut notifications, unsubscribe) =
                match client.signature_subscribe(&signature, Some(config)).await {
                    Ok(result) => {
                        let _ = ready_tx.send(Ok(()));
                        result
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(RouterError::from_pubsub_error(e, &endpoint)));
                        return;
                    }
                };
            metrics().active_subscriptions.inc();

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    next = notifications.next() => {
                        let Some(response) = next else { break };
                        let RpcSignatureResult::ProcessedSignature(processed) = response.value else {
                            continue;
                        };
                        let status = TransactionStatus {
                            slot: response.context.slot,
                            commitment,
                            err: processed.err.map(|e| format!("{:?}", e)),
                        };
                        // Signature subscriptions fire once
                        let _ = tx.send(status);
                        break;
                    }
                }
            }

            unsubscribe().await;
            metrics().active_subscriptions.dec();
            debug!(%signature, "Signature subscription released");
        });

        ready_rx
            .await
            .map_err(|_| RouterError::Internal("signature subscription task exited".to_string()))??;
        Ok(Some(Subscription::new(rx, token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commitment_from_status() {
        assert_eq!(
            commitment_from_status(Some(&TransactionConfirmationStatus::Processed)),
            Commitment::Processed
        );
        assert_eq!(
            commitment_from_status(Some(&TransactionConfirmationStatus::Confirmed)),
            Commitment::Confirmed
        );
        assert_eq!(commitment_from_status(None), Commitment::Finalized);
    }

    #[tokio::test]
    async fn test_transport_endpoints() {
        let transport = RpcTransport::new(
            "https://api.devnet.solana.com",
            "wss://api.devnet.solana.com",
            Commitment::Confirmed,
        );
        assert_eq!(transport.endpoint(), "https://api.devnet.solana.com");
        assert_eq!(transport.ws_url(), "wss://api.devnet.solana.com");
    }

    #[tokio::test]
    #[ignore] // Ignore by default as it requires network access
    async fn test_fetch_account_devnet() {
        let transport = RpcTransport::new(
            "https://api.devnet.solana.com",
            "wss://api.devnet.solana.com",
            Commitment::Confirmed,
        );
        let observation = transport.fetch_account(&Pubkey::new_unique()).await.unwrap();
        assert!(observation.account.is_none());
        assert!(observation.slot > 0);
    }
}
