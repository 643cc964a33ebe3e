use crate::storage::{load_json, store_json};
use crate::{RecipientId, RecipientMerger, RecipientRedirects, Result, StorageAdapter, WriteOp};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

const PREFIX: &str = "v1/profile/";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub capabilities: BTreeSet<String>,
    /// Millis of the last successful fetch. `None` means the profile must be refetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
}

impl Profile {
    fn or(self, other: Profile) -> Profile {
        Profile {
            given_name: self.given_name.or(other.given_name),
            family_name: self.family_name.or(other.family_name),
            about: self.about.or(other.about),
            capabilities: if self.capabilities.is_empty() {
                other.capabilities
            } else {
                self.capabilities
            },
            last_update: self.last_update.or(other.last_update),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<Profile>,
}

/// Profile keys and cached profiles of remote recipients.
#[derive(Clone)]
pub struct ProfileStore {
    storage: Arc<dyn StorageAdapter>,
    redirects: RecipientRedirects,
}

impl ProfileStore {
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

    fn load(&self, key: &str) -> Result<Option<ProfileEntry>> {
        load_json(self.storage.as_ref(), key)
    }

    pub fn profile_key(&self, recipient: RecipientId) -> Result<Option<Vec<u8>>> {
        let Some(key) = self.load(&self.key(recipient))?.and_then(|entry| entry.profile_key) else {
            return Ok(None);
        };
        Ok(Some(base64::engine::general_purpose::STANDARD.decode(key)?))
    }

    /// A different key makes the cached profile stale.
    pub fn store_profile_key(&self, recipient: RecipientId, profile_key: &[u8]) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(profile_key);
        let key = self.key(recipient);
        let mut entry = self.load(&key)?.unwrap_or_default();
        if entry.profile_key.as_deref() == Some(encoded.as_str()) {
            return Ok(());
        }
        entry.profile_key = Some(encoded);
        if let Some(profile) = entry.profile.as_mut() {
            profile.last_update = None;
        }
        store_json(self.storage.as_ref(), &key, &entry)
    }

    pub fn profile(&self, recipient: RecipientId) -> Result<Option<Profile>> {
        Ok(self.load(&self.key(recipient))?.and_then(|entry| entry.profile))
    }

    pub fn store_profile(&self, recipient: RecipientId, profile: Profile) -> Result<()> {
        let key = self.key(recipient);
        let mut entry = self.load(&key)?.unwrap_or_default();
        entry.profile = Some(profile);
        store_json(self.storage.as_ref(), &key, &entry)
    }
}

impl RecipientMerger for ProfileStore {
    fn name(&self) -> &'static str {
        "profiles"
    }

    fn merge_recipients(&self, surviving: RecipientId, absorbed: RecipientId) -> Result<()> {
        let (surviving_key, absorbed_key) = (Self::raw_key(surviving), Self::raw_key(absorbed));
        let Some(absorbed_entry) = self.load(&absorbed_key)? else {
            return Ok(());
        };
        let merged = match self.load(&surviving_key)? {
            Some(entry) => ProfileEntry {
                profile_key: entry.profile_key.or(absorbed_entry.profile_key),
                profile: match (entry.profile, absorbed_entry.profile) {
                    (Some(mine), Some(theirs)) => Some(mine.or(theirs)),
                    (mine, theirs) => mine.or(theirs),
                },
            },
            None => absorbed_entry,
        };
        self.storage.write_batch(vec![
            WriteOp::Put(surviving_key, serde_json::to_string(&merged)?),
            WriteOp::Del(absorbed_key),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    fn store() -> ProfileStore {
        ProfileStore::new(Arc::new(InMemoryStorage::new()))
    }

    #[test]
    fn new_profile_key_invalidates_cached_profile() {
        let profiles = store();
        let id = RecipientId::new(3);
        profiles.store_profile_key(id, &[1; 32]).unwrap();
        profiles
            .store_profile(
                id,
                Profile {
                    given_name: Some("Ada".to_string()),
                    last_update: Some(1_000),
                    ..Default::default()
                },
            )
            .unwrap();

        profiles.store_profile_key(id, &[1; 32]).unwrap();
        assert_eq!(profiles.profile(id).unwrap().unwrap().last_update, Some(1_000));

        profiles.store_profile_key(id, &[2; 32]).unwrap();
        let profile = profiles.profile(id).unwrap().unwrap();
        assert_eq!(profile.last_update, None);
        assert_eq!(profile.given_name.as_deref(), Some("Ada"));
        assert_eq!(profiles.profile_key(id).unwrap(), Some(vec![2; 32]));
    }

    #[test]
    fn merge_fills_gaps_from_absorbed() {
        let profiles = store();
        let (surviving, absorbed) = (RecipientId::new(1), RecipientId::new(2));
        profiles
            .store_profile(
                surviving,
                Profile {
                    given_name: Some("Ada".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        profiles.store_profile_key(absorbed, &[9; 32]).unwrap();
        profiles
            .store_profile(
                absorbed,
                Profile {
                    given_name: Some("A.".to_string()),
                    family_name: Some("Lovelace".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        profiles.merge_recipients(surviving, absorbed).unwrap();

        let profile = profiles.profile(surviving).unwrap().unwrap();
        assert_eq!(profile.given_name.as_deref(), Some("Ada"));
        assert_eq!(profile.family_name.as_deref(), Some("Lovelace"));
        assert_eq!(profiles.profile_key(surviving).unwrap(), Some(vec![9; 32]));
        assert!(profiles.profile(absorbed).unwrap().is_none());
        assert!(profiles.profile_key(absorbed).unwrap().is_none());
    }
}
