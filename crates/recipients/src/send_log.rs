use crate::storage::{load_json, store_json};
use crate::{RecipientId, RecipientMerger, RecipientRedirects, Result, StorageAdapter, WriteOp};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PREFIX: &str = "v1/send-log/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLogEntry {
    pub id: String,
    pub recipient: RecipientId,
    pub device_id: u32,
    pub timestamp: u64,
    /// Base64 of the sent content, kept for resends after a retry receipt.
    pub content: String,
    pub urgent: bool,
}

impl SendLogEntry {
    pub fn content_bytes(&self) -> Result<Vec<u8>> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.content)?)
    }
}

/// Content of recently sent messages, so a recipient that failed to decrypt can be
/// sent the same message again.
#[derive(Clone)]
pub struct MessageSendLog {
    storage: Arc<dyn StorageAdapter>,
    redirects: RecipientRedirects,
}

impl MessageSendLog {
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

    fn recipient_prefix(recipient: RecipientId) -> String {
        format!("{}{}/", PREFIX, recipient)
    }

    fn key(recipient: RecipientId, id: &str) -> String {
        format!("{}{}", Self::recipient_prefix(recipient), id)
    }

    pub fn insert(
        &self,
        recipient: RecipientId,
        device_id: u32,
        timestamp: u64,
        content: &[u8],
        urgent: bool,
    ) -> Result<String> {
        let recipient = self.redirects.actual_recipient_id(recipient);
        let entry = SendLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            recipient,
            device_id,
            timestamp,
            content: base64::engine::general_purpose::STANDARD.encode(content),
            urgent,
        };
        store_json(self.storage.as_ref(), &Self::key(recipient, &entry.id), &entry)?;
        Ok(entry.id)
    }

    pub fn entries_for_recipient(&self, recipient: RecipientId) -> Result<Vec<SendLogEntry>> {
        self.entries_under(self.redirects.actual_recipient_id(recipient))
    }

    fn entries_under(&self, recipient: RecipientId) -> Result<Vec<SendLogEntry>> {
        let mut out = Vec::new();
        for key in self.storage.list(&Self::recipient_prefix(recipient))? {
            let Some(entry) = load_json::<SendLogEntry>(self.storage.as_ref(), &key)? else {
                continue;
            };
            out.push(entry);
        }
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.device_id.cmp(&b.device_id)));
        Ok(out)
    }

    pub fn get(
        &self,
        recipient: RecipientId,
        device_id: u32,
        timestamp: u64,
    ) -> Result<Option<SendLogEntry>> {
        Ok(self
            .entries_for_recipient(recipient)?
            .into_iter()
            .find(|entry| entry.timestamp == timestamp && entry.device_id == device_id))
    }

    pub fn delete_for_recipient(&self, recipient: RecipientId) -> Result<()> {
        let recipient = self.redirects.actual_recipient_id(recipient);
        let ops = self
            .storage
            .list(&Self::recipient_prefix(recipient))?
            .into_iter()
            .map(WriteOp::Del)
            .collect();
        self.storage.write_batch(ops)
    }

    /// Returns the number of entries removed.
    pub fn delete_older_than(&self, timestamp: u64) -> Result<usize> {
        let mut ops = Vec::new();
        for key in self.storage.list(PREFIX)? {
            let Some(entry) = load_json::<SendLogEntry>(self.storage.as_ref(), &key)? else {
                continue;
            };
            if entry.timestamp < timestamp {
                ops.push(WriteOp::Del(key));
            }
        }
        let removed = ops.len();
        self.storage.write_batch(ops)?;
        Ok(removed)
    }
}

impl RecipientMerger for MessageSendLog {
    fn name(&self) -> &'static str {
        "send-log"
    }

    fn merge_recipients(&self, surviving: RecipientId, absorbed: RecipientId) -> Result<()> {
        let mut ops = Vec::new();
        for mut entry in self.entries_under(absorbed)? {
            ops.push(WriteOp::Del(Self::key(absorbed, &entry.id)));
            entry.recipient = surviving;
            ops.push(WriteOp::Put(
                Self::key(surviving, &entry.id),
                serde_json::to_string(&entry)?,
            ));
        }
        self.storage.write_batch(ops)
    }
}
