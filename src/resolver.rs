//! Delegation-aware routing
//!
//! Turns cached delegation status into a venue choice for a single account
//! or for everything a transaction would mutate. Read-only accounts never
//! influence the decision.

use crate::compat::{lookup_writable_count, static_write_set, write_set_with_loaded};
use crate::delegation::DelegationStatusCache;
use crate::errors::{RouterError, RouterResult};
use crate::metrics::metrics;
use crate::transport::TransactionTransport;
use crate::types::{DelegationRecord, VenueId};
use futures::future::try_join_all;
use solana_sdk::message::v0::LoadedAddresses;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Transport for each known venue, plus the base ledger.
///
/// Built once; read-only afterwards.
#[derive(Clone)]
pub struct VenueRegistry {
    base: Arc<dyn TransactionTransport>,
    venues: HashMap<VenueId, Arc<dyn TransactionTransport>>,
}

impl std::fmt::Debug for VenueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut venues: Vec<_> = self
            .venues
            .iter()
            .map(|(id, transport)| (id.to_string(), transport.endpoint().to_string()))
            .collect();
        venues.sort();
        f.debug_struct("VenueRegistry")
            .field("base", &self.base.endpoint())
            .field("venues", &venues)
            .finish()
    }
}

impl VenueRegistry {
    pub fn new(base: Arc<dyn TransactionTransport>) -> Self {
        Self {
            base,
            venues: HashMap::new(),
        }
    }

    /// Register `venue`, replacing any earlier transport for it
    pub fn with_venue(mut self, venue: VenueId, transport: Arc<dyn TransactionTransport>) -> Self {
        self.venues.insert(venue, transport);
        self
    }

    pub fn base(&self) -> VenueHandle {
        VenueHandle {
            venue: None,
            transport: self.base.clone(),
        }
    }

    pub fn venue(&self, venue: &VenueId) -> RouterResult<VenueHandle> {
        self.venues
            .get(venue)
            .map(|transport| VenueHandle {
                venue: Some(*venue),
                transport: transport.clone(),
            })
            .ok_or(RouterError::UnknownVenue(*venue))
    }

    pub fn contains(&self, venue: &VenueId) -> bool {
        self.venues.contains_key(venue)
    }

    pub fn venue_ids(&self) -> BTreeSet<VenueId> {
        self.venues.keys().copied().collect()
    }
}

/// Where to send work: the base ledger (`venue == None`) or a venue
#[derive(Clone)]
pub struct VenueHandle {
    pub venue: Option<VenueId>,
    pub transport: Arc<dyn TransactionTransport>,
}

impl VenueHandle {
    pub fn is_base(&self) -> bool {
        self.venue.is_none()
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }
}

impl std::fmt::Debug for VenueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueHandle")
            .field("venue", &self.venue)
            .field("endpoint", &self.transport.endpoint())
            .finish()
    }
}

impl std::fmt::Display for VenueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.venue {
            Some(venue) => write!(f, "venue {} ({})", venue, self.endpoint()),
            None => write!(f, "base ({})", self.endpoint()),
        }
    }
}

/// Routes accounts and transactions to a venue
#[derive(Debug, Clone)]
pub struct Resolver {
    cache: Arc<DelegationStatusCache>,
    registry: Arc<VenueRegistry>,
}

impl Resolver {
    pub fn new(cache: Arc<DelegationStatusCache>, registry: Arc<VenueRegistry>) -> Self {
        Self { cache, registry }
    }

    pub fn cache(&self) -> &Arc<DelegationStatusCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<VenueRegistry> {
        &self.registry
    }

    /// Venue that owns `address`
    #[instrument(skip_all, fields(%address))]
    pub async fn resolve_account(&self, address: &Pubkey) -> RouterResult<VenueHandle> {
        let handle = match self.cache.track(address).await? {
            DelegationRecord::Undelegated => self.registry.base(),
            DelegationRecord::Delegated { venue } => self.registry.venue(&venue).inspect_err(|_| {
                warn!(%venue, "Account delegated to an unregistered venue");
            })?,
        };
        debug!(route = %handle, "Account resolved");
        Ok(handle)
    }

    /// Venue for a transaction, from the static keys of its message.
    ///
    /// Fails with [`RouterError::InvalidArgument`] if the message writes
    /// through lookup tables; use
    /// [`Resolver::resolve_transaction_with_loaded`] for those.
    pub async fn resolve_transaction(&self, tx: &VersionedTransaction) -> RouterResult<VenueHandle> {
        let unloaded = lookup_writable_count(&tx.message);
        if unloaded > 0 {
            return Err(RouterError::InvalidArgument(format!(
                "{} writable accounts come from lookup tables; lookup tables must be loaded, \
                 use resolve_transaction_with_loaded",
                unloaded
            )));
        }
        self.resolve_write_set(static_write_set(&tx.message)).await
    }

    /// Venue for a v0 transaction whose lookup-table addresses are loaded.
    ///
    /// `loaded.writable` must cover every writable lookup index of the
    /// message.
    pub async fn resolve_transaction_with_loaded(
        &self,
        tx: &VersionedTransaction,
        loaded: &LoadedAddresses,
    ) -> RouterResult<VenueHandle> {
        let expected = lookup_writable_count(&tx.message);
        if loaded.writable.len() != expected {
            return Err(RouterError::InvalidArgument(format!(
                "message writes {} lookup-table accounts but {} were loaded",
                expected,
                loaded.writable.len()
            )));
        }
        self.resolve_write_set(write_set_with_loaded(&tx.message, loaded)).await
    }

    /// Venue for an explicit write-set.
    ///
    /// No delegated account routes to base, one distinct venue routes there,
    /// two or more is a [`RouterError::Conflict`] carrying all of them.
    pub async fn resolve_write_set<I>(&self, write_set: I) -> RouterResult<VenueHandle>
    where
        I: IntoIterator<Item = Pubkey>,
    {
        let accounts: BTreeSet<Pubkey> = write_set.into_iter().collect();
        let records = try_join_all(accounts.iter().map(|account| self.cache.track(account))).await?;

        let venues: BTreeSet<VenueId> = records.iter().filter_map(DelegationRecord::venue).collect();
        if venues.len() > 1 {
            metrics().route_conflicts.inc();
            warn!(accounts = accounts.len(), venues = ?venues, "Write-set spans multiple venues");
            return Err(RouterError::Conflict { venues });
        }

        let handle = match venues.first() {
            Some(venue) => {
                metrics().routes_venue.inc();
                self.registry.venue(venue)?
            }
            None => {
                metrics().routes_base.inc();
                self.registry.base()
            }
        };

        info!(accounts = accounts.len(), route = %handle, "Transaction routed");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::DelegationProgram;
    use crate::test_utils::MockTransport;
    use solana_sdk::hash::Hash;
    use solana_sdk::instruction::{AccountMeta, Instruction};
    use solana_sdk::message::{v0, AddressLookupTableAccount, Message, VersionedMessage};
    use solana_sdk::signature::Signature;

    struct Fixture {
        program: DelegationProgram,
        base: Arc<MockTransport>,
        v1: VenueId,
        v2: VenueId,
        resolver: Resolver,
    }

    fn fixture() -> Fixture {
        let program = DelegationProgram::default();
        let base = Arc::new(MockTransport::new("base"));
        let v1 = VenueId(Pubkey::new_unique());
        let v2 = VenueId(Pubkey::new_unique());
        let registry = VenueRegistry::new(base.clone())
            .with_venue(v1, Arc::new(MockTransport::new("v1")))
            .with_venue(v2, Arc::new(MockTransport::new("v2")));
        let cache = DelegationStatusCache::new(base.clone(), program);
        Fixture {
            program,
            base,
            v1,
            v2,
            resolver: Resolver::new(Arc::new(cache), Arc::new(registry)),
        }
    }

    fn transaction(payer: Pubkey, writable: &[Pubkey], readonly: &[Pubkey]) -> VersionedTransaction {
        let mut metas = vec![AccountMeta::new(payer, true)];
        metas.extend(writable.iter().map(|k| AccountMeta::new(*k, false)));
        metas.extend(readonly.iter().map(|k| AccountMeta::new_readonly(*k, false)));
        let ix = Instruction::new_with_bytes(Pubkey::new_unique(), &[0], metas);
        let message = Message::new_with_blockhash(&[ix], Some(&payer), &Hash::default());
        VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::Legacy(message),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_undelegated_account_routes_to_base() {
        let f = fixture();
        let handle = f.resolver.resolve_account(&Pubkey::new_unique()).await.unwrap();
        assert!(handle.is_base());
        assert_eq!(handle.endpoint(), "base");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delegated_account_routes_to_venue() {
        let f = fixture();
        let account = Pubkey::new_unique();
        f.base.set_delegated(&f.program, &account, f.v1, 10);

        let handle = f.resolver.resolve_account(&account).await.unwrap();
        assert_eq!(handle.venue, Some(f.v1));
        assert_eq!(handle.endpoint(), "v1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_venue_is_unknown() {
        let f = fixture();
        let account = Pubkey::new_unique();
        let stranger = VenueId(Pubkey::new_unique());
        f.base.set_delegated(&f.program, &account, stranger, 10);

        let result = f.resolver.resolve_account(&account).await;
        assert!(matches!(result, Err(RouterError::UnknownVenue(v)) if v == stranger));
        // The cache still holds the observation
        assert_eq!(
            f.resolver.cache().peek(&account),
            Some(DelegationRecord::Delegated { venue: stranger })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_venue_and_base_routes_to_venue() {
        let f = fixture();
        let (a, b, c) = (Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique());
        f.base.set_delegated(&f.program, &a, f.v1, 10);
        f.base.set_delegated(&f.program, &b, f.v1, 10);

        let handle = f.resolver.resolve_write_set([a, b, c]).await.unwrap();
        assert_eq!(handle.venue, Some(f.v1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_venues_conflict_with_both() {
        let f = fixture();
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        f.base.set_delegated(&f.program, &a, f.v1, 10);
        f.base.set_delegated(&f.program, &b, f.v2, 10);

        let result = f.resolver.resolve_write_set([a, b]).await;
        assert_eq!(
            result.unwrap_err(),
            RouterError::Conflict {
                venues: BTreeSet::from([f.v1, f.v2]),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_write_set_routes_to_base() {
        let f = fixture();
        let handle = f.resolver.resolve_write_set(Vec::<Pubkey>::new()).await.unwrap();
        assert!(handle.is_base());
        assert_eq!(f.base.fetch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readonly_accounts_are_ignored() {
        let f = fixture();
        let payer = Pubkey::new_unique();
        let writable = Pubkey::new_unique();
        let readonly = Pubkey::new_unique();
        f.base.set_delegated(&f.program, &writable, f.v1, 10);
        f.base.set_delegated(&f.program, &readonly, f.v2, 10);

        let tx = transaction(payer, &[writable], &[readonly]);
        let handle = f.resolver.resolve_transaction(&tx).await.unwrap();

        assert_eq!(handle.venue, Some(f.v1));
        assert_eq!(f.resolver.cache().peek(&readonly), None);
    }

    fn lookup_transaction(payer: Pubkey, looked_up: Pubkey) -> VersionedTransaction {
        let ix = Instruction::new_with_bytes(
            Pubkey::new_unique(),
            &[0],
            vec![AccountMeta::new(payer, true), AccountMeta::new(looked_up, false)],
        );
        let table = AddressLookupTableAccount {
            key: Pubkey::new_unique(),
            addresses: vec![looked_up],
        };
        let message = v0::Message::try_compile(&payer, &[ix], &[table], Hash::default()).unwrap();
        VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::V0(message),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unloaded_lookup_writes_are_rejected() {
        let f = fixture();
        let payer = Pubkey::new_unique();
        let looked_up = Pubkey::new_unique();
        f.base.set_delegated(&f.program, &looked_up, f.v1, 10);
        let tx = lookup_transaction(payer, looked_up);

        let result = f.resolver.resolve_transaction(&tx).await;

        assert!(matches!(result, Err(RouterError::InvalidArgument(_))));
        assert_eq!(f.base.fetch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loaded_writable_addresses_join_the_write_set() {
        let f = fixture();
        let payer = Pubkey::new_unique();
        let looked_up = Pubkey::new_unique();
        f.base.set_delegated(&f.program, &looked_up, f.v2, 10);
        let tx = lookup_transaction(payer, looked_up);
        let loaded = LoadedAddresses {
            writable: vec![looked_up],
            readonly: vec![],
        };

        let handle = f.resolver.resolve_transaction_with_loaded(&tx, &loaded).await.unwrap();
        assert_eq!(handle.venue, Some(f.v2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partially_loaded_lookups_are_rejected() {
        let f = fixture();
        let tx = lookup_transaction(Pubkey::new_unique(), Pubkey::new_unique());

        let result = f
            .resolver
            .resolve_transaction_with_loaded(&tx, &LoadedAddresses::default())
            .await;
        assert!(matches!(result, Err(RouterError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_failure_propagates() {
        let f = fixture();
        f.base.fail_fetch(true);
        f.base.fail_subscribe(true);

        let result = f.resolver.resolve_write_set([Pubkey::new_unique()]).await;
        assert!(matches!(result, Err(RouterError::Transport { .. })));
    }
}
