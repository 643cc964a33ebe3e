use anyhow::{Context, Result};
use recipients::{
    FileStorageAdapter, IdentityStore, MessageCache, MessageSendLog, PreferencesStore,
    ProfileStore, RecipientResolver, SessionStore, StorageAdapter, MESSAGE_CACHE_PREFIX,
};
use std::path::Path;
use std::sync::Arc;

/// File-backed account state (one JSON file per key, readable by agents)
pub struct Storage {
    pub resolver: RecipientResolver,
}

impl Storage {
    /// Open the account store and register every recipient-keyed store for merges
    pub fn open(data_dir: &Path) -> Result<Self> {
        let base_dir = data_dir.join("account");
        let adapter: Arc<dyn StorageAdapter> = Arc::new(
            FileStorageAdapter::new(base_dir).context("Failed to open account storage")?,
        );

        let resolver =
            RecipientResolver::new(adapter.clone()).context("Failed to load recipients")?;
        let redirects = resolver.redirects();
        resolver.register_merger(Arc::new(
            SessionStore::new(adapter.clone()).with_redirects(redirects.clone()),
        ));
        resolver.register_merger(Arc::new(
            IdentityStore::new(adapter.clone()).with_redirects(redirects.clone()),
        ));
        resolver.register_merger(Arc::new(
            ProfileStore::new(adapter.clone()).with_redirects(redirects.clone()),
        ));
        resolver.register_merger(Arc::new(
            MessageSendLog::new(adapter.clone()).with_redirects(redirects.clone()),
        ));
        resolver.register_merger(Arc::new(
            MessageCache::new(adapter.clone(), MESSAGE_CACHE_PREFIX)
                .with_redirects(redirects.clone()),
        ));
        resolver.register_merger(Arc::new(
            PreferencesStore::new(adapter).with_redirects(redirects),
        ));

        Ok(Self { resolver })
    }
}
