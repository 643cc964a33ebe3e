use recipients::{
    Aci, Error, IdentityStore, InMemoryStorage, MessageCache, MessageSendLog, PreferencesStore,
    ProfileStore, RecipientAddress, RecipientEvent, RecipientId, RecipientMerger,
    RecipientPreferences, RecipientResolver, Result, SessionStore, StorageAdapter,
    MESSAGE_CACHE_PREFIX,
};
use std::sync::Arc;

struct Account {
    storage: Arc<dyn StorageAdapter>,
    resolver: RecipientResolver,
    sessions: Arc<SessionStore>,
    identities: Arc<IdentityStore>,
    profiles: Arc<ProfileStore>,
    send_log: Arc<MessageSendLog>,
    message_cache: Arc<MessageCache>,
    preferences: Arc<PreferencesStore>,
}

impl Account {
    fn new() -> Self {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let resolver = RecipientResolver::new(storage.clone()).unwrap();
        let redirects = resolver.redirects();
        let account = Self {
            sessions: Arc::new(
                SessionStore::new(storage.clone()).with_redirects(redirects.clone()),
            ),
            identities: Arc::new(
                IdentityStore::new(storage.clone()).with_redirects(redirects.clone()),
            ),
            profiles: Arc::new(
                ProfileStore::new(storage.clone()).with_redirects(redirects.clone()),
            ),
            send_log: Arc::new(
                MessageSendLog::new(storage.clone()).with_redirects(redirects.clone()),
            ),
            message_cache: Arc::new(
                MessageCache::new(storage.clone(), MESSAGE_CACHE_PREFIX)
                    .with_redirects(redirects.clone()),
            ),
            preferences: Arc::new(
                PreferencesStore::new(storage.clone()).with_redirects(redirects),
            ),
            resolver,
            storage,
        };
        account.resolver.register_merger(account.sessions.clone());
        account.resolver.register_merger(account.identities.clone());
        account.resolver.register_merger(account.profiles.clone());
        account.resolver.register_merger(account.send_log.clone());
        account.resolver.register_merger(account.message_cache.clone());
        account.resolver.register_merger(account.preferences.clone());
        account
    }

    /// Raw keys stored under `prefix`, bypassing every redirect.
    fn keys(&self, prefix: &str) -> Vec<String> {
        self.storage.list(prefix).unwrap()
    }

    fn merge_two(&self, number: &str) -> (RecipientId, RecipientId) {
        let aci = Aci::random();
        let by_number = self
            .resolver
            .resolve_recipient_trusted(&RecipientAddress::from_number(number).unwrap())
            .unwrap()
            .recipient_id;
        let by_aci = self
            .resolver
            .resolve_recipient_trusted(&RecipientAddress::from_aci(aci))
            .unwrap()
            .recipient_id;
        let resolution = self
            .resolver
            .resolve_recipient_trusted(
                &RecipientAddress::from_aci(aci).with_number(number).unwrap(),
            )
            .unwrap();
        assert_eq!(resolution.merged, vec![by_number]);
        (by_aci, by_number)
    }
}

#[test]
fn merge_moves_state_of_every_store_to_the_surviving_recipient() {
    let account = Account::new();
    let aci = Aci::random();

    let by_number = account
        .resolver
        .resolve_recipient_trusted(&RecipientAddress::from_number("+4915550001").unwrap())
        .unwrap()
        .recipient_id;
    let by_aci = account
        .resolver
        .resolve_recipient_trusted(&RecipientAddress::from_aci(aci))
        .unwrap()
        .recipient_id;
    assert_ne!(by_number, by_aci);

    account.sessions.store_session(by_number, 1, b"number session").unwrap();
    account.sessions.store_session(by_aci, 2, b"aci session").unwrap();
    account.identities.save_identity(by_number, &[5; 33]).unwrap();
    account.profiles.store_profile_key(by_number, &[6; 32]).unwrap();
    account.send_log.insert(by_number, 1, 10, b"sent", true).unwrap();
    account.message_cache.add(by_number, b"pending").unwrap();
    account
        .preferences
        .update(
            by_number,
            RecipientPreferences {
                blocked: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

    let resolution = account
        .resolver
        .resolve_recipient_trusted(
            &RecipientAddress::from_aci(aci)
                .with_number("+4915550001")
                .unwrap(),
        )
        .unwrap();

    assert_eq!(resolution.recipient_id, by_aci);
    assert_eq!(resolution.merged, vec![by_number]);
    assert!(resolution.cascade_failures.is_empty());
    assert_eq!(account.resolver.actual_recipient_id(by_number), by_aci);

    let surviving = by_aci;
    assert_eq!(
        account.sessions.load_session(surviving, 1).unwrap().unwrap().record,
        b"number session"
    );
    assert!(account.sessions.contains_session(surviving, 2).unwrap());
    assert!(account.keys(&format!("v1/session/{}/", by_number)).is_empty());

    assert_eq!(
        account.identities.get_identity(surviving).unwrap().unwrap().identity_key,
        vec![5; 33]
    );
    assert!(account.keys(&format!("v1/identity/{}", by_number)).is_empty());

    assert_eq!(account.profiles.profile_key(surviving).unwrap(), Some(vec![6; 32]));
    assert!(account.keys(&format!("v1/profile/{}", by_number)).is_empty());

    assert!(account.send_log.get(surviving, 1, 10).unwrap().is_some());
    assert!(account.keys(&format!("v1/send-log/{}/", by_number)).is_empty());

    let cached = account.message_cache.get_for_recipient(surviving).unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].envelope_bytes().unwrap(), b"pending");
    assert!(account
        .keys(&format!("{}{}/", MESSAGE_CACHE_PREFIX, by_number))
        .is_empty());
    assert_eq!(account.message_cache.get_for_recipient(by_number).unwrap(), cached);

    assert_eq!(account.preferences.get(surviving).unwrap().blocked, Some(true));
    assert_eq!(account.preferences.needs_storage_sync().unwrap(), vec![surviving]);
}

#[test]
fn stolen_number_leaves_dependent_state_alone() {
    let account = Account::new();
    let (old_owner, new_owner) = (Aci::random(), Aci::random());

    let old = account
        .resolver
        .resolve_recipient_trusted(
            &RecipientAddress::from_aci(old_owner)
                .with_number("+4915550002")
                .unwrap(),
        )
        .unwrap()
        .recipient_id;
    account.sessions.store_session(old, 1, b"old owner").unwrap();

    let resolution = account
        .resolver
        .resolve_recipient_trusted(
            &RecipientAddress::from_aci(new_owner)
                .with_number("+4915550002")
                .unwrap(),
        )
        .unwrap();

    assert_ne!(resolution.recipient_id, old);
    assert!(resolution.merged.is_empty());
    assert_eq!(
        account.resolver.get(old).unwrap().address,
        RecipientAddress::from_aci(old_owner)
    );
    assert!(account.sessions.contains_session(old, 1).unwrap());
    assert!(account
        .sessions
        .load_session(resolution.recipient_id, 1)
        .unwrap()
        .is_none());
}

#[test]
fn writes_through_an_absorbed_id_land_on_the_surviving_recipient() {
    let account = Account::new();
    let (surviving, stale) = account.merge_two("+4915550004");

    account.sessions.store_session(stale, 1, b"late").unwrap();
    account.identities.save_identity(stale, &[7; 33]).unwrap();
    account.profiles.store_profile_key(stale, &[8; 32]).unwrap();
    account.send_log.insert(stale, 1, 20, b"late send", false).unwrap();
    account.message_cache.add(stale, b"late envelope").unwrap();
    account
        .preferences
        .update(
            stale,
            RecipientPreferences {
                muted_until: Some(99),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(
        account.sessions.load_session(surviving, 1).unwrap().unwrap().record,
        b"late"
    );
    assert_eq!(
        account.identities.get_identity(surviving).unwrap().unwrap().identity_key,
        vec![7; 33]
    );
    assert_eq!(account.profiles.profile_key(surviving).unwrap(), Some(vec![8; 32]));
    assert!(account.send_log.get(surviving, 1, 20).unwrap().is_some());
    assert_eq!(account.message_cache.get_for_recipient(surviving).unwrap().len(), 1);
    assert_eq!(account.preferences.get(surviving).unwrap().muted_until, Some(99));
    assert_eq!(account.preferences.needs_storage_sync().unwrap(), vec![surviving]);

    for prefix in [
        format!("v1/session/{}/", stale),
        format!("v1/identity/{}", stale),
        format!("v1/profile/{}", stale),
        format!("v1/send-log/{}/", stale),
        format!("{}{}/", MESSAGE_CACHE_PREFIX, stale),
        format!("v1/preferences/{}", stale),
        format!("v1/storage-sync/{}", stale),
    ] {
        assert!(account.keys(&prefix).is_empty(), "{} still holds state", prefix);
    }

    account.sessions.delete_all_sessions(stale).unwrap();
    assert!(!account.sessions.contains_session(surviving, 1).unwrap());
}

struct Broken;

impl RecipientMerger for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn merge_recipients(&self, _: RecipientId, _: RecipientId) -> Result<()> {
        Err(Error::Storage("read-only".to_string()))
    }
}

#[test]
fn failing_collaborator_is_reported_but_merge_stands() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
    let resolver = RecipientResolver::new(storage.clone()).unwrap().with_events(tx);
    let sessions = Arc::new(SessionStore::new(storage));
    resolver.register_merger(Arc::new(Broken));
    resolver.register_merger(sessions.clone());
    let aci = Aci::random();

    let by_number = resolver
        .resolve_recipient_trusted(&RecipientAddress::from_number("+4915550003").unwrap())
        .unwrap()
        .recipient_id;
    let by_aci = resolver
        .resolve_recipient_trusted(&RecipientAddress::from_aci(aci))
        .unwrap()
        .recipient_id;
    sessions.store_session(by_number, 1, b"moved anyway").unwrap();

    let resolution = resolver
        .resolve_recipient_trusted(
            &RecipientAddress::from_aci(aci)
                .with_number("+4915550003")
                .unwrap(),
        )
        .unwrap();

    assert_eq!(resolution.cascade_failures.len(), 1);
    assert_eq!(resolution.cascade_failures[0].store, "broken");
    assert!(resolver.get(by_number).is_some_and(|r| r.id == by_aci));
    assert!(sessions.contains_session(by_aci, 1).unwrap());

    let failed = rx
        .try_iter()
        .filter(|event| matches!(event, RecipientEvent::CascadeFailed(_)))
        .count();
    assert_eq!(failed, 1);

    assert!(matches!(
        resolution.into_result(),
        Err(Error::Cascade { store: "broken", .. })
    ));
}
