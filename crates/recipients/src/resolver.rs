use crate::cascade::{self, CascadeFailure, RecipientMerger};
use crate::merge::{self, MergeOutcome};
use crate::{
    Aci, Pni, RecipientAddress, RecipientAddressStore, RecipientId, RecipientRedirects,
    RecipientStore, RecipientWithAddress, Result, StorageAdapter,
};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecipientEvent {
    Created {
        recipient_id: RecipientId,
    },
    AddressChanged {
        recipient_id: RecipientId,
    },
    Merged {
        surviving: RecipientId,
        absorbed: RecipientId,
    },
    CascadeFailed(CascadeFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub recipient_id: RecipientId,
    pub merged: Vec<RecipientId>,
    pub cascade_failures: Vec<CascadeFailure>,
}

impl Resolution {
    /// The resolved id, or the first collaborator that failed to follow a merge.
    pub fn into_result(self) -> Result<RecipientId> {
        match self.cascade_failures.into_iter().next() {
            Some(failure) => Err(failure.into()),
            None => Ok(self.recipient_id),
        }
    }
}

/// Recipient resolution for one local account.
///
/// All resolutions of an account are serialized on one lock, which also
/// covers the merge of every registered collaborator, so no reader of the
/// address table sees a merge that the collaborators haven't been told about
/// yet. Separate accounts use separate resolvers.
pub struct RecipientResolver {
    store: Mutex<RecipientStore>,
    mergers: RwLock<Vec<Arc<dyn RecipientMerger>>>,
    events: Option<Sender<RecipientEvent>>,
}

impl RecipientResolver {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        Ok(Self {
            store: Mutex::new(RecipientStore::open(storage)?),
            mergers: RwLock::new(Vec::new()),
            events: None,
        })
    }

    pub fn with_events(mut self, events: Sender<RecipientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn register_merger(&self, merger: Arc<dyn RecipientMerger>) {
        self.mergers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(merger);
    }

    fn lock_store(&self) -> MutexGuard<'_, RecipientStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mergers(&self) -> Vec<Arc<dyn RecipientMerger>> {
        self.mergers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves identifiers that were verified together (decrypted envelope,
    /// directory response, storage record) to one recipient.
    pub fn resolve_recipient_trusted(&self, address: &RecipientAddress) -> Result<Resolution> {
        let mut events = Vec::new();
        let resolution = {
            let mut store = self.lock_store();
            self.resolve_trusted_locked(&mut store, address, false, &mut events)?
        };
        self.emit(events);
        Ok(resolution)
    }

    /// Resolves several trusted addresses while holding the lock once.
    ///
    /// Stops at the first storage error; addresses before it stay resolved.
    pub fn resolve_recipients_trusted(
        &self,
        addresses: &[RecipientAddress],
    ) -> Result<Vec<Resolution>> {
        let mut events = Vec::new();
        let result = {
            let mut store = self.lock_store();
            addresses
                .iter()
                .map(|address| self.resolve_trusted_locked(&mut store, address, false, &mut events))
                .collect::<Result<Vec<_>>>()
        };
        self.emit(events);
        result
    }

    /// Entry point for directory lookups, which prove ACI, PNI and number belong together.
    pub fn resolve_service_identifiers(
        &self,
        aci: Option<Aci>,
        pni: Option<Pni>,
        number: Option<&str>,
    ) -> Result<Resolution> {
        let address = RecipientAddress::new(aci, pni, number.map(str::to_string), None)?;
        self.resolve_recipient_trusted(&address)
    }

    /// Entry point for username lookups, which prove the username belongs to the ACI.
    pub fn resolve_aci_with_username(&self, aci: Aci, username: &str) -> Result<Resolution> {
        let address = RecipientAddress::from_aci(aci).with_username(username)?;
        self.resolve_recipient_trusted(&address)
    }

    /// Resolves the local account's own address and remembers the result as self.
    pub fn resolve_self_recipient_trusted(
        &self,
        address: &RecipientAddress,
    ) -> Result<Resolution> {
        let mut events = Vec::new();
        let resolution = {
            let mut store = self.lock_store();
            self.resolve_trusted_locked(&mut store, address, true, &mut events)?
        };
        self.emit(events);
        Ok(resolution)
    }

    /// Looks up identifiers that were not verified together, e.g. typed by a user.
    ///
    /// Returns the existing recipient sharing the strongest identifier and never
    /// merges or strips anything. If nothing matches, a recipient is created
    /// holding only the strongest identifier, since the association between the
    /// given identifiers is unproven.
    pub fn resolve_recipient(&self, address: &RecipientAddress) -> Result<RecipientId> {
        let created = {
            let mut store = self.lock_store();
            if let Some(existing) = store.find_best_match(address) {
                return Ok(existing.id);
            }

            let strongest = strongest_identifier(address);
            tracing::debug!("Got new recipient {} from untrusted lookup", strongest);
            let mut tx = store.transaction();
            let id = tx.add_new_recipient(&strongest)?;
            tx.commit()?;
            id
        };
        self.emit(vec![RecipientEvent::Created {
            recipient_id: created,
        }]);
        Ok(created)
    }

    pub fn self_recipient_id(&self) -> Option<RecipientId> {
        self.lock_store().self_recipient_id()
    }

    pub fn actual_recipient_id(&self, id: RecipientId) -> RecipientId {
        self.lock_store().actual_recipient_id(id)
    }

    /// Redirects for stores that key their state by recipient id.
    pub fn redirects(&self) -> RecipientRedirects {
        self.lock_store().redirects()
    }

    pub fn get(&self, id: RecipientId) -> Option<RecipientWithAddress> {
        self.lock_store().get(id)
    }

    pub fn all(&self) -> Vec<RecipientWithAddress> {
        self.lock_store().all()
    }

    fn resolve_trusted_locked(
        &self,
        store: &mut RecipientStore,
        address: &RecipientAddress,
        mark_self: bool,
        events: &mut Vec<RecipientEvent>,
    ) -> Result<Resolution> {
        let previous_self = store.self_recipient_id();

        let mut tx = store.transaction();
        let outcome = merge::resolve_recipient_trusted_locked(&mut tx, address)?;
        for absorbed in &outcome.merged {
            tx.record_merged(*absorbed, outcome.recipient_id);
        }
        if mark_self && previous_self != Some(outcome.recipient_id) {
            tx.set_self_recipient(outcome.recipient_id);
        }
        tx.commit()?;

        record_events(&outcome, events);

        let mergers = self.mergers();
        let mut cascade_failures = Vec::new();
        for absorbed in &outcome.merged {
            tracing::debug!(
                "Merging recipient {} into {}",
                absorbed,
                outcome.recipient_id
            );
            let failures = cascade::merge_all(&mergers, outcome.recipient_id, *absorbed);
            events.push(RecipientEvent::Merged {
                surviving: outcome.recipient_id,
                absorbed: *absorbed,
            });
            events.extend(failures.iter().cloned().map(RecipientEvent::CascadeFailed));
            cascade_failures.extend(failures);
        }

        Ok(Resolution {
            recipient_id: outcome.recipient_id,
            merged: outcome.merged,
            cascade_failures,
        })
    }

    fn emit(&self, events: Vec<RecipientEvent>) {
        let Some(tx) = &self.events else {
            return;
        };
        for event in events {
            // receiver gone means nobody is listening any more
            let _ = tx.send(event);
        }
    }
}

fn record_events(outcome: &MergeOutcome, events: &mut Vec<RecipientEvent>) {
    if outcome.created {
        events.push(RecipientEvent::Created {
            recipient_id: outcome.recipient_id,
        });
    } else if outcome.changed {
        events.push(RecipientEvent::AddressChanged {
            recipient_id: outcome.recipient_id,
        });
    }
    events.extend(
        outcome
            .stripped
            .iter()
            .map(|id| RecipientEvent::AddressChanged { recipient_id: *id }),
    );
}

fn strongest_identifier(address: &RecipientAddress) -> RecipientAddress {
    if let Some(aci) = address.aci() {
        RecipientAddress::from_aci(aci)
    } else if let Some(pni) = address.pni() {
        RecipientAddress::from_pni(pni)
    } else {
        // no service id, so a number or a username is all there is
        address.clone()
    }
}
