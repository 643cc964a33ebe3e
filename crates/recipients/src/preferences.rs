use crate::storage::{load_json, store_json};
use crate::{RecipientId, RecipientMerger, RecipientRedirects, Result, StorageAdapter, WriteOp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PREFIX: &str = "v1/preferences/";
const SYNC_PREFIX: &str = "v1/storage-sync/";

/// Local per-recipient settings. Unset fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_timer_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl RecipientPreferences {
    fn or(self, other: RecipientPreferences) -> RecipientPreferences {
        RecipientPreferences {
            muted_until: self.muted_until.or(other.muted_until),
            expiration_timer_secs: self.expiration_timer_secs.or(other.expiration_timer_secs),
            blocked: self.blocked.or(other.blocked),
            archived: self.archived.or(other.archived),
        }
    }
}

/// Per-recipient settings plus the set of recipients whose storage-service
/// record has to be uploaded again.
#[derive(Clone)]
pub struct PreferencesStore {
    storage: Arc<dyn StorageAdapter>,
    redirects: RecipientRedirects,
}

impl PreferencesStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            redirects: RecipientRedirects::default(),
        }
    }

    pub fn with_redirects(mut self, redirects: RecipientRedirects) -> Self {
        self.redirects = redirects;
        self
    }

    fn actual(&self, recipient: RecipientId) -> RecipientId {
        self.redirects.actual_recipient_id(recipient)
    }

    fn key(recipient: RecipientId) -> String {
        format!("{}{}", PREFIX, recipient)
    }

    fn sync_key(recipient: RecipientId) -> String {
        format!("{}{}", SYNC_PREFIX, recipient)
    }

    pub fn get(&self, recipient: RecipientId) -> Result<RecipientPreferences> {
        self.load(self.actual(recipient))
    }

    fn load(&self, recipient: RecipientId) -> Result<RecipientPreferences> {
        Ok(load_json(self.storage.as_ref(), &Self::key(recipient))?.unwrap_or_default())
    }

    /// Saves `preferences` and marks the recipient for storage sync if anything changed.
    pub fn update(&self, recipient: RecipientId, preferences: RecipientPreferences) -> Result<()> {
        let recipient = self.actual(recipient);
        if self.load(recipient)? == preferences {
            return Ok(());
        }
        self.storage.write_batch(vec![
            WriteOp::Put(Self::key(recipient), serde_json::to_string(&preferences)?),
            WriteOp::Put(Self::sync_key(recipient), "true".to_string()),
        ])
    }

    pub fn mark_needs_storage_sync(&self, recipient: RecipientId) -> Result<()> {
        store_json(self.storage.as_ref(), &Self::sync_key(self.actual(recipient)), &true)
    }

    pub fn clear_storage_sync(&self, recipient: RecipientId) -> Result<()> {
        self.storage.del(&Self::sync_key(self.actual(recipient)))
    }

    pub fn needs_storage_sync(&self) -> Result<Vec<RecipientId>> {
        let mut ids: Vec<RecipientId> = self
            .storage
            .list(SYNC_PREFIX)?
            .iter()
            .filter_map(|key| key.strip_prefix(SYNC_PREFIX)?.parse().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl RecipientMerger for PreferencesStore {
    fn name(&self) -> &'static str {
        "preferences"
    }

    fn merge_recipients(&self, surviving: RecipientId, absorbed: RecipientId) -> Result<()> {
        let mut ops = Vec::new();
        if let Some(theirs) =
            load_json::<RecipientPreferences>(self.storage.as_ref(), &Self::key(absorbed))?
        {
            let merged = self.load(surviving)?.or(theirs);
            ops.push(WriteOp::Put(Self::key(surviving), serde_json::to_string(&merged)?));
            ops.push(WriteOp::Del(Self::key(absorbed)));
        }
        // the surviving record now describes both contacts
        ops.push(WriteOp::Put(Self::sync_key(surviving), "true".to_string()));
        ops.push(WriteOp::Del(Self::sync_key(absorbed)));
        self.storage.write_batch(ops)
    }
}
