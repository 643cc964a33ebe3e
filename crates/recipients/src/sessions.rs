use crate::storage::{load_json, store_json};
use crate::{RecipientId, RecipientMerger, RecipientRedirects, Result, StorageAdapter, WriteOp};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PREFIX: &str = "v1/session/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    /// Serialized session state from the protocol library, base64.
    record: String,
    live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub record: Vec<u8>,
    pub live: bool,
}

impl TryFrom<StoredSession> for SessionRecord {
    type Error = crate::Error;

    fn try_from(stored: StoredSession) -> Result<Self> {
        Ok(Self {
            record: base64::engine::general_purpose::STANDARD.decode(stored.record)?,
            live: stored.live,
        })
    }
}

/// Opaque protocol sessions per recipient device.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn StorageAdapter>,
    redirects: RecipientRedirects,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            redirects: RecipientRedirects::default(),
        }
    }

    /// Routes ids absorbed by a merge to the surviving recipient.
    pub fn with_redirects(mut self, redirects: RecipientRedirects) -> Self {
        self.redirects = redirects;
        self
    }

    fn actual(&self, recipient: RecipientId) -> RecipientId {
        self.redirects.actual_recipient_id(recipient)
    }

    fn recipient_prefix(recipient: RecipientId) -> String {
        format!("{}{}/", PREFIX, recipient)
    }

    fn key(recipient: RecipientId, device_id: u32) -> String {
        format!("{}{}", Self::recipient_prefix(recipient), device_id)
    }

    fn device_of(key: &str) -> Option<u32> {
        key.rsplit('/').next()?.parse().ok()
    }

    pub fn store_session(
        &self,
        recipient: RecipientId,
        device_id: u32,
        record: &[u8],
    ) -> Result<()> {
        let stored = StoredSession {
            record: base64::engine::general_purpose::STANDARD.encode(record),
            live: true,
        };
        let key = Self::key(self.actual(recipient), device_id);
        store_json(self.storage.as_ref(), &key, &stored)
    }

    pub fn load_session(
        &self,
        recipient: RecipientId,
        device_id: u32,
    ) -> Result<Option<SessionRecord>> {
        let key = Self::key(self.actual(recipient), device_id);
        load_json::<StoredSession>(self.storage.as_ref(), &key)?
            .map(SessionRecord::try_from)
            .transpose()
    }

    pub fn contains_session(&self, recipient: RecipientId, device_id: u32) -> Result<bool> {
        Ok(self
            .load_session(recipient, device_id)?
            .is_some_and(|session| session.live))
    }

    /// Device ids other than the primary device that have a session.
    pub fn sub_device_sessions(&self, recipient: RecipientId) -> Result<Vec<u32>> {
        let mut devices: Vec<u32> = self
            .storage
            .list(&Self::recipient_prefix(self.actual(recipient)))?
            .iter()
            .filter_map(|key| Self::device_of(key))
            .filter(|device| *device != 1)
            .collect();
        devices.sort_unstable();
        Ok(devices)
    }

    /// Keeps the records but marks them as no longer usable for sending.
    pub fn archive_sessions(&self, recipient: RecipientId) -> Result<()> {
        let prefix = Self::recipient_prefix(self.actual(recipient));
        for key in self.storage.list(&prefix)? {
            let Some(mut stored) = load_json::<StoredSession>(self.storage.as_ref(), &key)? else {
                continue;
            };
            if stored.live {
                stored.live = false;
                store_json(self.storage.as_ref(), &key, &stored)?;
            }
        }
        Ok(())
    }

    pub fn delete_session(&self, recipient: RecipientId, device_id: u32) -> Result<()> {
        self.storage.del(&Self::key(self.actual(recipient), device_id))
    }

    pub fn delete_all_sessions(&self, recipient: RecipientId) -> Result<()> {
        let ops = self
            .storage
            .list(&Self::recipient_prefix(self.actual(recipient)))?
            .into_iter()
            .map(WriteOp::Del)
            .collect();
        self.storage.write_batch(ops)
    }
}

impl RecipientMerger for SessionStore {
    fn name(&self) -> &'static str {
        "sessions"
    }

    fn merge_recipients(&self, surviving: RecipientId, absorbed: RecipientId) -> Result<()> {
        let mut ops = Vec::new();
        for key in self.storage.list(&Self::recipient_prefix(absorbed))? {
            ops.push(WriteOp::Del(key.clone()));
            let Some(device_id) = Self::device_of(&key) else {
                continue;
            };
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };

            let target = Self::key(surviving, device_id);
            let keep_surviving = load_json::<StoredSession>(self.storage.as_ref(), &target)?
                .is_some_and(|existing| existing.live);
            if keep_surviving {
                tracing::debug!(
                    "Discarding session {}.{} in favour of live session {}.{}",
                    absorbed,
                    device_id,
                    surviving,
                    device_id
                );
                continue;
            }
            ops.push(WriteOp::Put(target, raw));
        }
        self.storage.write_batch(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryStorage::new()))
    }

    #[test]
    fn live_surviving_session_wins() {
        let sessions = store();
        let (surviving, absorbed) = (RecipientId::new(1), RecipientId::new(2));
        sessions.store_session(surviving, 1, b"mine").unwrap();
        sessions.store_session(absorbed, 1, b"theirs").unwrap();
        sessions.store_session(absorbed, 3, b"tablet").unwrap();

        sessions.merge_recipients(surviving, absorbed).unwrap();

        assert_eq!(sessions.load_session(surviving, 1).unwrap().unwrap().record, b"mine");
        assert_eq!(sessions.load_session(surviving, 3).unwrap().unwrap().record, b"tablet");
        assert!(sessions.load_session(absorbed, 1).unwrap().is_none());
        assert!(sessions.load_session(absorbed, 3).unwrap().is_none());
    }

    #[test]
    fn archived_surviving_session_is_replaced() {
        let sessions = store();
        let (surviving, absorbed) = (RecipientId::new(1), RecipientId::new(2));
        sessions.store_session(surviving, 1, b"stale").unwrap();
        sessions.archive_sessions(surviving).unwrap();
        sessions.store_session(absorbed, 1, b"fresh").unwrap();

        sessions.merge_recipients(surviving, absorbed).unwrap();

        let session = sessions.load_session(surviving, 1).unwrap().unwrap();
        assert_eq!(session.record, b"fresh");
        assert!(session.live);
    }

    #[test]
    fn recipient_prefixes_do_not_overlap() {
        let sessions = store();
        sessions.store_session(RecipientId::new(1), 2, b"a").unwrap();
        sessions.store_session(RecipientId::new(12), 3, b"b").unwrap();

        assert_eq!(sessions.sub_device_sessions(RecipientId::new(1)).unwrap(), vec![2]);

        sessions.delete_all_sessions(RecipientId::new(1)).unwrap();
        assert!(sessions.contains_session(RecipientId::new(12), 3).unwrap());
    }
}
