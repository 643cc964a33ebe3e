//! Recipient identities for an end-to-end encrypted messaging client.
//!
//! Peers are known by several identifiers (ACI, PNI, phone number, username)
//! that arrive separately and are only later proven to belong together. Each
//! peer gets a local [`RecipientId`]; when trusted evidence shows that two ids
//! are the same peer, [`RecipientResolver`] merges them and every registered
//! [`RecipientMerger`] moves its state onto the surviving id.

mod address;
mod cascade;
mod error;
mod file_storage;
pub mod identities;
pub mod merge;
pub mod message_cache;
pub mod preferences;
pub mod profiles;
mod recipient_id;
mod recipient_store;
mod resolver;
pub mod send_log;
pub mod sessions;
mod storage;

pub use address::{Aci, IdentifierKind, Pni, RecipientAddress};
pub use cascade::{merge_all, CascadeFailure, RecipientMerger};
pub use error::{Error, Result};
pub use file_storage::FileStorageAdapter;
pub use identities::{IdentityInfo, IdentityStore, TrustLevel};
pub use merge::{resolve_recipient_trusted_locked, MergeOutcome};
pub use message_cache::{CachedMessage, MessageCache};
pub use preferences::{PreferencesStore, RecipientPreferences};
pub use profiles::{Profile, ProfileStore};
pub use recipient_id::RecipientId;
pub use recipient_store::{
    RecipientAddressStore, RecipientRedirects, RecipientStore, RecipientTransaction,
    RecipientWithAddress,
};
pub use resolver::{RecipientEvent, RecipientResolver, Resolution};
pub use send_log::{MessageSendLog, SendLogEntry};
pub use sessions::{SessionRecord, SessionStore};
pub use storage::{InMemoryStorage, StorageAdapter, WriteOp};

/// Key prefix of the pending-message cache when it shares storage with the other stores.
pub const MESSAGE_CACHE_PREFIX: &str = "v1/message-cache/";
