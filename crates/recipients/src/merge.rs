//! Trusted recipient resolution.
//!
//! A trusted request asserts that all of its identifiers belong to one peer.
//! Existing recipients that share an identifier with it are either absorbed
//! into the resolved recipient (they share the ACI or PNI, or would be left
//! with nothing once the request's identifiers are taken away) or lose just
//! the identifiers they share with the request. An ACI is never taken away
//! from a recipient and two different ACIs never end up on one recipient.

use crate::{
    IdentifierKind, RecipientAddress, RecipientAddressStore, RecipientId, RecipientWithAddress,
    Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub recipient_id: RecipientId,
    /// Recipients absorbed into `recipient_id`; their dependent state must be merged.
    pub merged: Vec<RecipientId>,
    /// Recipients that kept their id but gave up identifiers to `recipient_id`.
    pub stripped: Vec<RecipientId>,
    pub created: bool,
    /// False when the store already held exactly this information.
    pub changed: bool,
}

enum Disposition {
    Absorb,
    Strip(RecipientAddress),
}

/// Resolves `address` to a single recipient and reshapes the address table so
/// every identifier in `address` belongs to it.
///
/// Must run under the account's recipient lock; the caller is responsible for
/// committing the store and merging dependent state for `merged`.
pub fn resolve_recipient_trusted_locked<S>(
    store: &mut S,
    address: &RecipientAddress,
) -> Result<MergeOutcome>
where
    S: RecipientAddressStore + ?Sized,
{
    let candidates = store.find_all_by_address(address)?;

    if candidates.is_empty() {
        tracing::debug!("Got new recipient, no identifier of {} is known", address);
        let recipient_id = store.add_new_recipient(address)?;
        return Ok(MergeOutcome {
            recipient_id,
            merged: Vec::new(),
            stripped: Vec::new(),
            created: true,
            changed: true,
        });
    }

    if let [existing] = candidates.as_slice() {
        if existing.address.has_identifiers_of(address) {
            return Ok(MergeOutcome {
                recipient_id: existing.id,
                merged: Vec::new(),
                stripped: Vec::new(),
                created: false,
                changed: false,
            });
        }
    }

    let target = select_target(&candidates, address);
    let resulting_aci = address
        .aci()
        .or_else(|| target.and_then(|t| t.address.aci()));

    let mut to_merge = Vec::new();
    let mut to_strip = Vec::new();
    for other in &candidates {
        if target.is_some_and(|t| t.id == other.id) {
            continue;
        }
        match disposition(other, address, resulting_aci) {
            Disposition::Absorb => to_merge.push(other),
            Disposition::Strip(stripped) => to_strip.push((other.id, stripped)),
        }
    }

    if !to_merge.is_empty() || !to_strip.is_empty() {
        tracing::debug!(
            "Got separate recipients for high trust identifiers {}, need to merge ({}) and strip ({})",
            address,
            join_ids(to_merge.iter().map(|r| r.id)),
            join_ids(to_strip.iter().map(|(id, _)| *id)),
        );
    }

    for (id, stripped) in &to_strip {
        store.update_recipient_address(*id, stripped)?;
    }

    let mut final_address = target.map(|t| t.address.clone());
    for other in &to_merge {
        final_address = Some(match final_address {
            // the surviving recipient keeps its own values where both are set
            Some(current) => other.address.with_identifiers_from(&current),
            None => other.address.clone(),
        });
        store.remove_recipient_address(other.id)?;
    }
    let final_address = match final_address {
        Some(current) => current.with_identifiers_from(address),
        None => address.clone(),
    };

    let merged: Vec<RecipientId> = to_merge.iter().map(|r| r.id).collect();
    let stripped: Vec<RecipientId> = to_strip.iter().map(|(id, _)| *id).collect();
    match target {
        Some(target) => {
            let address_changed = target.address != final_address;
            let changed = address_changed || !merged.is_empty() || !stripped.is_empty();
            if address_changed {
                tracing::debug!(
                    "Updating recipient {} with high trust address {}",
                    target.id,
                    final_address
                );
                store.update_recipient_address(target.id, &final_address)?;
            }
            Ok(MergeOutcome {
                recipient_id: target.id,
                merged,
                stripped,
                created: false,
                changed,
            })
        }
        None => {
            tracing::debug!(
                "No existing recipient can take over {}, adding new recipient",
                address
            );
            let recipient_id = store.add_new_recipient(&final_address)?;
            Ok(MergeOutcome {
                recipient_id,
                merged,
                stripped,
                created: true,
                changed: true,
            })
        }
    }
}

/// Picks the recipient that survives the resolution, if any may.
///
/// The owner of the request's ACI always wins. Otherwise the strongest overlap
/// wins among recipients that may be absorbed; ties go to the lowest id.
fn select_target<'a>(
    candidates: &'a [RecipientWithAddress],
    address: &RecipientAddress,
) -> Option<&'a RecipientWithAddress> {
    if let Some(aci) = address.aci() {
        if let Some(owner) = candidates.iter().find(|c| c.address.aci() == Some(aci)) {
            return Some(owner);
        }
    }

    candidates
        .iter()
        .filter(|c| !c.address.has_conflicting_aci(address.aci()))
        .filter_map(|c| {
            let rank = c.address.rank(address)?;
            let eligible =
                rank >= IdentifierKind::Pni || !c.address.has_additional_identifiers_than(address);
            eligible.then_some((rank, c))
        })
        .max_by(|(rank_a, a), (rank_b, b)| rank_a.cmp(rank_b).then(b.id.cmp(&a.id)))
        .map(|(_, c)| c)
}

fn disposition(
    other: &RecipientWithAddress,
    address: &RecipientAddress,
    resulting_aci: Option<crate::Aci>,
) -> Disposition {
    let stripped = other.address.without_identifiers_from(address);

    if other.address.has_conflicting_aci(resulting_aci) {
        // A recipient anchored to another account only gives up the weaker
        // identifiers that now belong to the request.
        return match stripped {
            Some(stripped) => Disposition::Strip(stripped),
            None => Disposition::Absorb,
        };
    }

    let shares_service_id = other
        .address
        .rank(address)
        .is_some_and(|rank| rank >= IdentifierKind::Pni);
    if shares_service_id {
        return Disposition::Absorb;
    }

    match stripped {
        Some(stripped) => Disposition::Strip(stripped),
        None => Disposition::Absorb,
    }
}

fn join_ids(ids: impl Iterator<Item = RecipientId>) -> String {
    ids.map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
}
