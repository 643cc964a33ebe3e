use crate::storage::{load_json, store_json};
use crate::{RecipientId, RecipientMerger, RecipientRedirects, Result, StorageAdapter, WriteOp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const PREFIX: &str = "v1/identity/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    Untrusted,
    TrustedUnverified,
    TrustedVerified,
}

impl TrustLevel {
    pub fn is_trusted(self) -> bool {
        self != TrustLevel::Untrusted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityInfo {
    #[serde(with = "hex::serde")]
    pub identity_key: Vec<u8>,
    pub trust_level: TrustLevel,
    pub added_at: u64,
}

/// Remote identity keys and the trust the user placed in them.
#[derive(Clone)]
pub struct IdentityStore {
    storage: Arc<dyn StorageAdapter>,
    redirects: RecipientRedirects,
}

impl IdentityStore {
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

    fn raw_key(recipient: RecipientId) -> String {
        format!("{}{}", PREFIX, recipient)
    }

    fn key(&self, recipient: RecipientId) -> String {
        Self::raw_key(self.redirects.actual_recipient_id(recipient))
    }

    pub fn get_identity(&self, recipient: RecipientId) -> Result<Option<IdentityInfo>> {
        load_json(self.storage.as_ref(), &self.key(recipient))
    }

    /// Saves the key seen for `recipient`. Returns true if it replaced a different key,
    /// in which case the trust level is reset.
    pub fn save_identity(&self, recipient: RecipientId, identity_key: &[u8]) -> Result<bool> {
        let existing = self.get_identity(recipient)?;
        if let Some(existing) = &existing {
            if existing.identity_key == identity_key {
                return Ok(false);
            }
        }

        let changed = existing.is_some();
        if changed {
            tracing::info!("Identity key of recipient {} changed", recipient);
        }
        let info = IdentityInfo {
            identity_key: identity_key.to_vec(),
            trust_level: if changed {
                TrustLevel::Untrusted
            } else {
                TrustLevel::TrustedUnverified
            },
            added_at: now_millis(),
        };
        store_json(self.storage.as_ref(), &self.key(recipient), &info)?;
        Ok(changed)
    }

    /// Returns false if no identity is stored or the stored key differs.
    pub fn set_trust_level(
        &self,
        recipient: RecipientId,
        identity_key: &[u8],
        trust_level: TrustLevel,
    ) -> Result<bool> {
        let Some(mut info) = self.get_identity(recipient)? else {
            return Ok(false);
        };
        if info.identity_key != identity_key {
            return Ok(false);
        }
        info.trust_level = trust_level;
        store_json(self.storage.as_ref(), &self.key(recipient), &info)?;
        Ok(true)
    }

    pub fn is_trusted_identity(&self, recipient: RecipientId, identity_key: &[u8]) -> Result<bool> {
        Ok(match self.get_identity(recipient)? {
            Some(info) => info.identity_key == identity_key && info.trust_level.is_trusted(),
            // first contact is trusted on first use
            None => true,
        })
    }

    pub fn delete_identity(&self, recipient: RecipientId) -> Result<()> {
        self.storage.del(&self.key(recipient))
    }
}

impl RecipientMerger for IdentityStore {
    fn name(&self) -> &'static str {
        "identities"
    }

    fn merge_recipients(&self, surviving: RecipientId, absorbed: RecipientId) -> Result<()> {
        let Some(raw) = self.storage.get(&Self::raw_key(absorbed))? else {
            return Ok(());
        };
        let mut ops = vec![WriteOp::Del(Self::raw_key(absorbed))];
        if self.storage.get(&Self::raw_key(surviving))?.is_none() {
            ops.push(WriteOp::Put(Self::raw_key(surviving), raw));
        }
        self.storage.write_batch(ops)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
