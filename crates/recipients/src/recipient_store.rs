use crate::{
    Error, IdentifierKind, RecipientAddress, RecipientId, Result, StorageAdapter, WriteOp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

const RECIPIENT_PREFIX: &str = "v1/recipient/";
const MERGED_PREFIX: &str = "v1/recipient-merged/";
const LAST_ID_KEY: &str = "v1/recipient-last-id";
const SELF_KEY: &str = "v1/recipient-self";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipientWithAddress {
    pub id: RecipientId,
    pub address: RecipientAddress,
}

/// The address table the merge engine works against.
pub trait RecipientAddressStore {
    /// Every stored recipient whose address matches `address`, ordered by id.
    fn find_all_by_address(&self, address: &RecipientAddress) -> Result<Vec<RecipientWithAddress>>;

    fn add_new_recipient(&mut self, address: &RecipientAddress) -> Result<RecipientId>;

    /// Replaces the stored address of `id` wholesale.
    fn update_recipient_address(&mut self, id: RecipientId, address: &RecipientAddress)
        -> Result<()>;

    fn remove_recipient_address(&mut self, id: RecipientId) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct StoredRecipient {
    id: RecipientId,
    address: RecipientAddress,
}

#[derive(Serialize, Deserialize)]
struct StoredMerge {
    absorbed: RecipientId,
    surviving: RecipientId,
}

/// Shared view of the merge redirects of one account.
///
/// Handed to stores that key state by [`RecipientId`] so that an id obtained
/// before a merge keeps addressing the surviving recipient.
#[derive(Debug, Clone, Default)]
pub struct RecipientRedirects {
    merged: Arc<RwLock<HashMap<RecipientId, RecipientId>>>,
}

impl RecipientRedirects {
    /// Follows merge redirects until reaching an id that was never absorbed.
    pub fn actual_recipient_id(&self, id: RecipientId) -> RecipientId {
        let merged = self.merged.read().unwrap_or_else(PoisonError::into_inner);
        let mut current = id;
        // a redirect chain can't be longer than the table itself
        for _ in 0..=merged.len() {
            match merged.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }

    fn insert(&self, absorbed: RecipientId, surviving: RecipientId) {
        self.merged
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(absorbed, surviving);
    }
}

type IdentifierKey = (IdentifierKind, String);

fn identifier_keys(address: &RecipientAddress) -> Vec<IdentifierKey> {
    let mut keys = Vec::with_capacity(4);
    if let Some(aci) = address.aci() {
        keys.push((IdentifierKind::Aci, aci.to_string()));
    }
    if let Some(pni) = address.pni() {
        keys.push((IdentifierKind::Pni, pni.to_string()));
    }
    if let Some(number) = address.number() {
        keys.push((IdentifierKind::Number, number.to_string()));
    }
    if let Some(username) = address.username() {
        keys.push((IdentifierKind::Username, username.to_string()));
    }
    keys
}

/// Owners of every identifier in `recipients`.
fn identifier_owners(
    recipients: &BTreeMap<RecipientId, RecipientAddress>,
) -> HashMap<IdentifierKey, BTreeSet<RecipientId>> {
    let mut owners: HashMap<IdentifierKey, BTreeSet<RecipientId>> = HashMap::new();
    for (id, address) in recipients {
        for key in identifier_keys(address) {
            owners.entry(key).or_default().insert(*id);
        }
    }
    owners
}

/// Persistent `RecipientId -> RecipientAddress` table with a redirect entry for
/// every id that was absorbed by a merge.
pub struct RecipientStore {
    storage: Arc<dyn StorageAdapter>,
    recipients: BTreeMap<RecipientId, RecipientAddress>,
    redirects: RecipientRedirects,
    last_id: u64,
    self_id: Option<RecipientId>,
}

impl RecipientStore {
    pub fn open(storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        let mut recipients = BTreeMap::new();
        for key in storage.list(RECIPIENT_PREFIX)? {
            let Some(raw) = storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<StoredRecipient>(&raw) {
                Ok(stored) => {
                    recipients.insert(stored.id, stored.address);
                }
                Err(e) => tracing::warn!("Skipping unreadable recipient row {}: {}", key, e),
            }
        }

        let mut merged = HashMap::new();
        for key in storage.list(MERGED_PREFIX)? {
            let Some(raw) = storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<StoredMerge>(&raw) {
                Ok(stored) => {
                    merged.insert(stored.absorbed, stored.surviving);
                }
                Err(e) => tracing::warn!("Skipping unreadable merge row {}: {}", key, e),
            }
        }

        let stored_last_id = match storage.get(LAST_ID_KEY)? {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::Serialization(format!("recipient id counter: {}", e)))?,
            None => 0,
        };
        let highest_seen = recipients
            .keys()
            .chain(merged.keys())
            .chain(merged.values())
            .map(|id| id.get())
            .max()
            .unwrap_or(0);

        let self_id = match storage.get(SELF_KEY)? {
            Some(raw) => Some(raw.trim().parse::<RecipientId>()?),
            None => None,
        };

        let store = Self {
            storage,
            recipients,
            redirects: RecipientRedirects {
                merged: Arc::new(RwLock::new(merged)),
            },
            last_id: stored_last_id.max(highest_seen),
            self_id,
        };
        store.report_shared_identifiers();
        Ok(store)
    }

    fn report_shared_identifiers(&self) {
        for ((kind, _), owners) in identifier_owners(&self.recipients) {
            if owners.len() > 1 {
                tracing::warn!(
                    "Recipients {} share the same {}; the next trusted resolve of it will reconcile them",
                    owners
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                    kind
                );
            }
        }
    }

    pub fn transaction(&mut self) -> RecipientTransaction<'_> {
        let last_id = self.last_id;
        RecipientTransaction {
            store: self,
            changes: BTreeMap::new(),
            merged: Vec::new(),
            self_id: None,
            last_id,
        }
    }

    /// Follows merge redirects until reaching an id that was never absorbed.
    pub fn actual_recipient_id(&self, id: RecipientId) -> RecipientId {
        self.redirects.actual_recipient_id(id)
    }

    /// Handle on this store's redirects that stays current as merges commit.
    pub fn redirects(&self) -> RecipientRedirects {
        self.redirects.clone()
    }

    pub fn get(&self, id: RecipientId) -> Option<RecipientWithAddress> {
        let id = self.actual_recipient_id(id);
        self.recipients.get(&id).map(|address| RecipientWithAddress {
            id,
            address: address.clone(),
        })
    }

    pub fn all(&self) -> Vec<RecipientWithAddress> {
        self.recipients
            .iter()
            .map(|(id, address)| RecipientWithAddress {
                id: *id,
                address: address.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn find_by_aci(&self, aci: crate::Aci) -> Option<RecipientWithAddress> {
        self.find(|address| address.aci() == Some(aci))
    }

    pub fn find_by_pni(&self, pni: crate::Pni) -> Option<RecipientWithAddress> {
        self.find(|address| address.pni() == Some(pni))
    }

    pub fn find_by_number(&self, number: &str) -> Option<RecipientWithAddress> {
        self.find(|address| address.number() == Some(number))
    }

    pub fn find_by_username(&self, username: &str) -> Option<RecipientWithAddress> {
        self.find(|address| address.username() == Some(username))
    }

    fn find(&self, predicate: impl Fn(&RecipientAddress) -> bool) -> Option<RecipientWithAddress> {
        self.recipients
            .iter()
            .find(|(_, address)| predicate(address))
            .map(|(id, address)| RecipientWithAddress {
                id: *id,
                address: address.clone(),
            })
    }

    /// The stored recipient sharing the strongest identifier with `address`.
    pub fn find_best_match(&self, address: &RecipientAddress) -> Option<RecipientWithAddress> {
        self.recipients
            .iter()
            .filter_map(|(id, stored)| stored.rank(address).map(|kind| (kind, *id, stored)))
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, id, stored)| RecipientWithAddress {
                id,
                address: stored.clone(),
            })
    }

    pub fn self_recipient_id(&self) -> Option<RecipientId> {
        self.self_id.map(|id| self.actual_recipient_id(id))
    }

    fn recipient_key(id: RecipientId) -> String {
        format!("{}{}", RECIPIENT_PREFIX, id)
    }

    fn merged_key(id: RecipientId) -> String {
        format!("{}{}", MERGED_PREFIX, id)
    }
}

/// Buffered view over a [`RecipientStore`].
///
/// Reads see the transaction's own writes. Nothing reaches storage or the
/// store's cache until [`commit`](Self::commit); dropping the transaction
/// discards every change.
pub struct RecipientTransaction<'a> {
    store: &'a mut RecipientStore,
    changes: BTreeMap<RecipientId, Option<RecipientAddress>>,
    merged: Vec<(RecipientId, RecipientId)>,
    self_id: Option<RecipientId>,
    last_id: u64,
}

impl RecipientTransaction<'_> {
    fn current(&self, id: RecipientId) -> Option<&RecipientAddress> {
        match self.changes.get(&id) {
            Some(change) => change.as_ref(),
            None => self.store.recipients.get(&id),
        }
    }

    fn ids(&self) -> BTreeSet<RecipientId> {
        self.store
            .recipients
            .keys()
            .chain(self.changes.keys())
            .copied()
            .collect()
    }

    /// Redirects `absorbed` to `surviving` once committed.
    pub fn record_merged(&mut self, absorbed: RecipientId, surviving: RecipientId) {
        self.merged.push((absorbed, surviving));
    }

    pub fn set_self_recipient(&mut self, id: RecipientId) {
        self.self_id = Some(id);
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty() || !self.merged.is_empty() || self.self_id.is_some()
    }

    pub fn actual_recipient_id(&self, id: RecipientId) -> RecipientId {
        let mut current = self.store.actual_recipient_id(id);
        for (absorbed, surviving) in &self.merged {
            if *absorbed == current {
                current = *surviving;
            }
        }
        current
    }

    /// Rejects identifiers this transaction hands to a second recipient.
    ///
    /// Rows that already shared an identifier before the transaction are left
    /// for a later resolve to reconcile.
    fn check_unique(&self, final_state: &BTreeMap<RecipientId, RecipientAddress>) -> Result<()> {
        let before = identifier_owners(&self.store.recipients);
        for ((kind, value), owners) in identifier_owners(final_state) {
            if owners.len() < 2 || !owners.iter().any(|id| self.changes.contains_key(id)) {
                continue;
            }
            let already_shared = before
                .get(&(kind, value))
                .is_some_and(|previous| previous.is_superset(&owners));
            if !already_shared {
                let mut ids = owners.iter();
                return Err(Error::Storage(format!(
                    "{} of recipient {} is already owned by recipient {}",
                    kind,
                    ids.next_back().map(|id| id.to_string()).unwrap_or_default(),
                    ids.next().map(|id| id.to_string()).unwrap_or_default(),
                )));
            }
        }
        Ok(())
    }

    /// Storage ops in crash-safe order: rows only losing identifiers first,
    /// then removals and redirects, then rows gaining identifiers.
    fn ops(&self) -> Result<Vec<WriteOp>> {
        let mut strips = Vec::new();
        let mut removals = Vec::new();
        let mut gains = Vec::new();
        for (id, change) in &self.changes {
            let key = RecipientStore::recipient_key(*id);
            match change {
                Some(address) => {
                    let op = WriteOp::Put(
                        key,
                        serde_json::to_string(&StoredRecipient {
                            id: *id,
                            address: address.clone(),
                        })?,
                    );
                    let only_loses = self
                        .store
                        .recipients
                        .get(id)
                        .is_some_and(|previous| previous.has_identifiers_of(address));
                    if only_loses {
                        strips.push(op);
                    } else {
                        gains.push(op);
                    }
                }
                None => removals.push(WriteOp::Del(key)),
            }
        }
        for (absorbed, surviving) in &self.merged {
            removals.push(WriteOp::Put(
                RecipientStore::merged_key(*absorbed),
                serde_json::to_string(&StoredMerge {
                    absorbed: *absorbed,
                    surviving: *surviving,
                })?,
            ));
        }

        let mut ops = strips;
        ops.append(&mut removals);
        ops.append(&mut gains);
        if self.last_id != self.store.last_id {
            ops.push(WriteOp::Put(LAST_ID_KEY.to_string(), self.last_id.to_string()));
        }
        if let Some(self_id) = self.self_id {
            ops.push(WriteOp::Put(SELF_KEY.to_string(), self_id.to_string()));
        }
        Ok(ops)
    }

    pub fn commit(self) -> Result<()> {
        if !self.has_changes() {
            return Ok(());
        }

        let mut final_state = self.store.recipients.clone();
        for (id, change) in &self.changes {
            match change {
                Some(address) => {
                    final_state.insert(*id, address.clone());
                }
                None => {
                    final_state.remove(id);
                }
            }
        }
        self.check_unique(&final_state)?;

        let ops = self.ops()?;
        self.store.storage.write_batch(ops)?;

        self.store.recipients = final_state;
        for (absorbed, surviving) in self.merged {
            self.store.redirects.insert(absorbed, surviving);
        }
        self.store.last_id = self.last_id;
        if let Some(self_id) = self.self_id {
            self.store.self_id = Some(self_id);
        }
        Ok(())
    }
}

impl RecipientAddressStore for RecipientTransaction<'_> {
    fn find_all_by_address(&self, address: &RecipientAddress) -> Result<Vec<RecipientWithAddress>> {
        Ok(self
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.current(id)
                    .filter(|stored| stored.matches(address))
                    .map(|stored| RecipientWithAddress {
                        id,
                        address: stored.clone(),
                    })
            })
            .collect())
    }

    fn add_new_recipient(&mut self, address: &RecipientAddress) -> Result<RecipientId> {
        self.last_id += 1;
        let id = RecipientId::new(self.last_id);
        self.changes.insert(id, Some(address.clone()));
        Ok(id)
    }

    fn update_recipient_address(
        &mut self,
        id: RecipientId,
        address: &RecipientAddress,
    ) -> Result<()> {
        if self.current(id).is_none() {
            return Err(Error::UnknownRecipient(id));
        }
        self.changes.insert(id, Some(address.clone()));
        Ok(())
    }

    fn remove_recipient_address(&mut self, id: RecipientId) -> Result<()> {
        if self.current(id).is_none() {
            return Err(Error::UnknownRecipient(id));
        }
        self.changes.insert(id, None);
        Ok(())
    }
}
