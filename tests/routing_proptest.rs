use delegation_router::test_utils::MockTransport;
use delegation_router::{
    DelegationProgram, DelegationStatusCache, Resolver, RouterError, VenueId, VenueRegistry,
};
use proptest::prelude::*;
use solana_sdk::pubkey::Pubkey;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Venue chosen for a write-set, or the conflicting venues
fn route(
    venues: &[VenueId],
    assignment: &[Option<usize>],
    accounts: &[Pubkey],
    order: &[usize],
) -> Result<Option<VenueId>, BTreeSet<VenueId>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    runtime.block_on(async {
        let program = DelegationProgram::default();
        let base = Arc::new(MockTransport::new("base"));
        let mut registry = VenueRegistry::new(base.clone());
        for venue in venues {
            registry = registry.with_venue(*venue, Arc::new(MockTransport::new("venue")));
        }
        for (account, slot) in accounts.iter().zip(assignment) {
            if let Some(index) = slot {
                base.set_delegated(&program, account, venues[*index], 1);
            }
        }

        let resolver = Resolver::new(
            Arc::new(DelegationStatusCache::new(base, program)),
            Arc::new(registry),
        );
        let write_set: Vec<Pubkey> = order.iter().map(|i| accounts[*i]).collect();

        match resolver.resolve_write_set(write_set).await {
            Ok(handle) => Ok(handle.venue),
            Err(RouterError::Conflict { venues }) => Err(venues),
            Err(e) => panic!("unexpected routing error: {}", e),
        }
    })
}

fn write_set_strategy() -> impl Strategy<Value = (Vec<Option<usize>>, Vec<usize>)> {
    prop::collection::vec(prop::option::of(0usize..3), 1..8).prop_flat_map(|assignment| {
        let order: Vec<usize> = (0..assignment.len()).collect();
        (Just(assignment), Just(order).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn routing_ignores_write_set_order((assignment, shuffled) in write_set_strategy()) {
        let venues: Vec<VenueId> = (0..3).map(|_| VenueId(Pubkey::new_unique())).collect();
        let accounts: Vec<Pubkey> = assignment.iter().map(|_| Pubkey::new_unique()).collect();
        let in_order: Vec<usize> = (0..accounts.len()).collect();

        let expected_venues: BTreeSet<VenueId> =
            assignment.iter().flatten().map(|i| venues[*i]).collect();

        let first = route(&venues, &assignment, &accounts, &in_order);
        let second = route(&venues, &assignment, &accounts, &shuffled);

        prop_assert_eq!(&first, &second);
        match expected_venues.len() {
            0 => prop_assert_eq!(first, Ok(None)),
            1 => prop_assert_eq!(first, Ok(expected_venues.iter().next().copied())),
            _ => prop_assert_eq!(first, Err(expected_venues)),
        }
    }
}
