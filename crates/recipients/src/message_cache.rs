use crate::{RecipientId, RecipientMerger, RecipientRedirects, Result, StorageAdapter, WriteOp};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// An envelope that arrived but could not be processed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMessage {
    pub id: String,
    pub recipient: RecipientId,
    /// Raw envelope, base64.
    pub envelope: String,
    pub received_at: u64,
}

impl CachedMessage {
    pub fn envelope_bytes(&self) -> Result<Vec<u8>> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.envelope)?)
    }
}

#[derive(Clone)]
pub struct MessageCache {
    storage: Arc<dyn StorageAdapter>,
    prefix: String,
    redirects: RecipientRedirects,
}

impl MessageCache {
    pub fn new(storage: Arc<dyn StorageAdapter>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
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

    fn recipient_prefix(&self, recipient: RecipientId) -> String {
        format!("{}{}/", self.prefix, recipient)
    }

    fn key(&self, recipient: RecipientId, id: &str) -> String {
        format!("{}{}", self.recipient_prefix(recipient), id)
    }

    pub fn add(&self, recipient: RecipientId, envelope: &[u8]) -> Result<String> {
        let recipient = self.actual(recipient);
        let received_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let entry = CachedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            recipient,
            envelope: base64::engine::general_purpose::STANDARD.encode(envelope),
            received_at,
        };
        self.storage
            .put(&self.key(recipient, &entry.id), serde_json::to_string(&entry)?)?;
        Ok(entry.id)
    }

    pub fn get_for_recipient(&self, recipient: RecipientId) -> Result<Vec<CachedMessage>> {
        self.entries_under(self.actual(recipient))
    }

    fn entries_under(&self, recipient: RecipientId) -> Result<Vec<CachedMessage>> {
        let keys = self.storage.list(&self.recipient_prefix(recipient))?;
        let mut out = Vec::new();
        for key in keys {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<CachedMessage>(&raw) else {
                tracing::warn!("Skipping unreadable cached message {}", key);
                continue;
            };
            out.push(entry);
        }
        out.sort_by_key(|entry| entry.received_at);
        Ok(out)
    }

    pub fn remove(&self, recipient: RecipientId, id: &str) -> Result<()> {
        self.storage.del(&self.key(self.actual(recipient), id))
    }

    pub fn remove_for_recipient(&self, recipient: RecipientId) -> Result<()> {
        let ops = self
            .storage
            .list(&self.recipient_prefix(self.actual(recipient)))?
            .into_iter()
            .map(WriteOp::Del)
            .collect();
        self.storage.write_batch(ops)
    }
}

impl RecipientMerger for MessageCache {
    fn name(&self) -> &'static str {
        "message-cache"
    }

    fn merge_recipients(&self, surviving: RecipientId, absorbed: RecipientId) -> Result<()> {
        let mut ops = Vec::new();
        for mut entry in self.entries_under(absorbed)? {
            ops.push(WriteOp::Del(self.key(absorbed, &entry.id)));
            entry.recipient = surviving;
            ops.push(WriteOp::Put(
                self.key(surviving, &entry.id),
                serde_json::to_string(&entry)?,
            ));
        }
        self.storage.write_batch(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    fn put_entry(storage: &dyn StorageAdapter, recipient: u64, id: &str, received_at: u64) {
        let entry = CachedMessage {
            id: id.to_string(),
            recipient: RecipientId::new(recipient),
            envelope: base64::engine::general_purpose::STANDARD.encode(id),
            received_at,
        };
        storage
            .put(
                &format!("v1/test-cache/{}/{}", recipient, id),
                serde_json::to_string(&entry).unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn get_for_recipient_returns_entries_in_receipt_order() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let cache = MessageCache::new(storage.clone(), "v1/test-cache/");
        put_entry(storage.as_ref(), 1, "late", 200);
        put_entry(storage.as_ref(), 1, "early", 100);
        put_entry(storage.as_ref(), 11, "other", 50);

        let entries = cache.get_for_recipient(RecipientId::new(1)).unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(entries[0].envelope_bytes().unwrap(), b"early");
    }

    #[test]
    fn merge_relocates_absorbed_entries() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let cache = MessageCache::new(storage.clone(), "v1/test-cache/");
        put_entry(storage.as_ref(), 1, "a", 100);
        put_entry(storage.as_ref(), 2, "b", 150);

        cache
            .merge_recipients(RecipientId::new(1), RecipientId::new(2))
            .unwrap();

        let entries = cache.get_for_recipient(RecipientId::new(1)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].recipient, RecipientId::new(1));
        assert!(cache.get_for_recipient(RecipientId::new(2)).unwrap().is_empty());

        cache.remove(RecipientId::new(1), "a").unwrap();
        assert_eq!(cache.get_for_recipient(RecipientId::new(1)).unwrap().len(), 1);
        cache.remove_for_recipient(RecipientId::new(1)).unwrap();
        assert!(cache.get_for_recipient(RecipientId::new(1)).unwrap().is_empty());
    }
}
