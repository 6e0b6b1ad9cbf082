//! Delegation router facade
//!
//! Bundles the status cache, the resolver and the confirmation coordinator
//! behind one handle: decide where a transaction goes, send it there, and
//! wait for it to settle on that same venue.

use crate::config::RouterConfig;
use crate::confirmation::{ConfirmOptions, ConfirmationCoordinator, ConfirmationOutcome};
use crate::delegation::{DelegationProgram, DelegationStatusCache};
use crate::errors::{RouterError, RouterResult};
use crate::resolver::{Resolver, VenueHandle, VenueRegistry};
use crate::transport::RpcTransport;
use crate::types::{Commitment, DelegationRecord};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use tracing::{info, instrument};

/// Result of [`DelegationRouter::send_and_confirm`]
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub route: VenueHandle,
    pub signature: Signature,
    pub outcome: ConfirmationOutcome,
}

/// Routing and settlement for delegated accounts
#[derive(Debug, Clone)]
pub struct DelegationRouter {
    resolver: Resolver,
    coordinator: ConfirmationCoordinator,
}

impl DelegationRouter {
    pub fn new(resolver: Resolver, coordinator: ConfirmationCoordinator) -> Self {
        Self {
            resolver,
            coordinator,
        }
    }

    /// Wire RPC transports for the base ledger and every configured venue
    pub fn from_config(config: &RouterConfig) -> RouterResult<Self> {
        config
            .validate()
            .map_err(|e| RouterError::Configuration(e.to_string()))?;

        let commitment = config.delegation.commitment;
        let program_id = config
            .delegation
            .program_pubkey()
            .map_err(|e| RouterError::Configuration(e.to_string()))?;

        let base = Arc::new(RpcTransport::new(
            config.base.rpc_url.clone(),
            config.base.websocket_url(),
            commitment,
        ));

        let mut registry = VenueRegistry::new(base.clone());
        for venue in &config.venues {
            let id = venue
                .venue_id()
                .map_err(|e| RouterError::Configuration(e.to_string()))?;
            let transport = Arc::new(RpcTransport::new(
                venue.endpoint.rpc_url.clone(),
                venue.endpoint.websocket_url(),
                commitment,
            ));
            registry = registry.with_venue(id, transport);
        }

        let cache = DelegationStatusCache::with_timeouts(
            base,
            DelegationProgram::new(program_id),
            config.delegation.subscription_ttl(),
            config.delegation.refresh_timeout(),
        );

        info!(
            base = %config.base.rpc_url,
            venues = config.venues.len(),
            program = %program_id,
            "Delegation router configured"
        );

        Ok(Self::new(
            Resolver::new(Arc::new(cache), Arc::new(registry)),
            ConfirmationCoordinator::new(config.confirmation_settings()),
        ))
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn coordinator(&self) -> &ConfirmationCoordinator {
        &self.coordinator
    }

    pub async fn track(&self, address: &Pubkey) -> RouterResult<DelegationRecord> {
        self.resolver.cache().track(address).await
    }

    pub async fn resolve_account(&self, address: &Pubkey) -> RouterResult<VenueHandle> {
        self.resolver.resolve_account(address).await
    }

    pub async fn resolve_transaction(&self, tx: &VersionedTransaction) -> RouterResult<VenueHandle> {
        self.resolver.resolve_transaction(tx).await
    }

    pub async fn resolve_write_set<I>(&self, write_set: I) -> RouterResult<VenueHandle>
    where
        I: IntoIterator<Item = Pubkey>,
    {
        self.resolver.resolve_write_set(write_set).await
    }

    /// Wait for `signature` on the venue behind `route`
    pub async fn confirm(
        &self,
        route: &VenueHandle,
        signature: &Signature,
        commitment: Commitment,
        options: ConfirmOptions,
    ) -> RouterResult<ConfirmationOutcome> {
        self.coordinator
            .confirm(route.transport.clone(), signature, commitment, options)
            .await
    }

    /// Resolve, submit to the chosen venue and wait for `commitment` there
    #[instrument(skip_all, fields(%commitment))]
    pub async fn send_and_confirm(
        &self,
        tx: &VersionedTransaction,
        commitment: Commitment,
        options: ConfirmOptions,
    ) -> RouterResult<SendOutcome> {
        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(RouterError::Cancelled);
        }

        let route = self.resolver.resolve_transaction(tx).await?;
        let bytes = bincode::serialize(tx)
            .map_err(|e| RouterError::InvalidArgument(format!("transaction does not serialize: {}", e)))?;
        let signature = route.transport.send_raw(&bytes).await?;
        info!(%signature, %route, "Transaction submitted");

        let outcome = self.confirm(&route, &signature, commitment, options).await?;
        Ok(SendOutcome {
            route,
            signature,
            outcome,
        })
    }
}
