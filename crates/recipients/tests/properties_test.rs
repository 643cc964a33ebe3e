use proptest::prelude::*;
use recipients::{Aci, InMemoryStorage, Pni, RecipientAddress, RecipientResolver};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Addresses drawn from a small pool so that requests overlap often.
fn arb_address() -> impl Strategy<Value = RecipientAddress> {
    (
        prop::option::of(1u128..4),
        prop::option::of(1u128..4),
        prop::option::of(0u8..3),
        prop::option::of(0u8..2),
    )
        .prop_filter_map("empty address", |(aci, pni, number, username)| {
            RecipientAddress::new(
                aci.map(|i| Aci::new(Uuid::from_u128(i)).unwrap()),
                pni.map(|i| Pni::new(Uuid::from_u128(0x100 + i)).unwrap()),
                number.map(|i| format!("+4915550{}", i)),
                username.map(|i| format!("user.{:02}", i)),
            )
            .ok()
        })
}

fn resolver() -> RecipientResolver {
    RecipientResolver::new(Arc::new(InMemoryStorage::new())).unwrap()
}

fn assert_no_shared_identifiers(resolver: &RecipientResolver) -> Result<(), TestCaseError> {
    let mut acis = HashSet::new();
    let mut pnis = HashSet::new();
    let mut numbers = HashSet::new();
    let mut usernames = HashSet::new();
    for recipient in resolver.all() {
        let address = &recipient.address;
        if let Some(aci) = address.aci() {
            prop_assert!(acis.insert(aci), "duplicate ACI {}", aci);
        }
        if let Some(pni) = address.pni() {
            prop_assert!(pnis.insert(pni), "duplicate PNI {}", pni);
        }
        if let Some(number) = address.number() {
            prop_assert!(numbers.insert(number.to_string()), "duplicate number {}", number);
        }
        if let Some(username) = address.username() {
            prop_assert!(
                usernames.insert(username.to_string()),
                "duplicate username {}",
                username
            );
        }
    }
    Ok(())
}

proptest! {
    /// Any sequence of trusted resolves keeps every identifier on at most one recipient.
    #[test]
    fn prop_identifiers_stay_unique(requests in prop::collection::vec(arb_address(), 1..24)) {
        let resolver = resolver();
        for request in &requests {
            let resolution = resolver.resolve_recipient_trusted(request).unwrap();

            let resolved = resolver.get(resolution.recipient_id).unwrap();
            prop_assert!(
                resolved.address.has_identifiers_of(request),
                "{} is missing from {}",
                request,
                resolved.address
            );
            for absorbed in &resolution.merged {
                prop_assert_eq!(resolver.actual_recipient_id(*absorbed), resolution.recipient_id);
            }
            assert_no_shared_identifiers(&resolver)?;
        }
    }

    /// Resolving the same request twice in a row returns the same id and changes nothing.
    #[test]
    fn prop_resolve_is_idempotent(
        history in prop::collection::vec(arb_address(), 0..12),
        request in arb_address(),
    ) {
        let resolver = resolver();
        for earlier in &history {
            resolver.resolve_recipient_trusted(earlier).unwrap();
        }

        let first = resolver.resolve_recipient_trusted(&request).unwrap();
        let snapshot = resolver.all();
        let second = resolver.resolve_recipient_trusted(&request).unwrap();

        prop_assert_eq!(first.recipient_id, second.recipient_id);
        prop_assert!(second.merged.is_empty());
        prop_assert_eq!(snapshot, resolver.all());
    }

    /// An untrusted lookup never changes an existing recipient.
    #[test]
    fn prop_untrusted_lookup_never_rewrites(
        history in prop::collection::vec(arb_address(), 1..12),
        request in arb_address(),
    ) {
        let resolver = resolver();
        for earlier in &history {
            resolver.resolve_recipient_trusted(earlier).unwrap();
        }
        let before = resolver.all();

        let id = resolver.resolve_recipient(&request).unwrap();

        let after = resolver.all();
        for recipient in &before {
            prop_assert!(after.contains(recipient));
        }
        prop_assert!(after.len() <= before.len() + 1);
        prop_assert!(resolver.get(id).unwrap().address.matches(&request));
    }
}
