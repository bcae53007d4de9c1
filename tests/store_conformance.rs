//! Shared behavioral suite every store backend must pass.
//!
//! The same scenarios run against the in-memory, JSON-file, and SQLite
//! backends; the Raft-backed façade is exercised end-to-end in
//! `raft_store_tests.rs` because it needs a running consensus node.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use gastrolog::error::Error;
use gastrolog::model::{truncate_micros, Filter, Id, RefreshToken, Role, User, Vault};
use gastrolog::settings::ServerSettings;
use gastrolog::store::{FileStore, MemoryStore, SqliteStore, Store};

#[derive(Clone, Copy)]
enum Backend {
    Memory,
    File,
    Sqlite,
}

struct TestStore {
    store: Arc<dyn Store>,
    // Keeps the backing directory alive for the store's lifetime.
    _dir: Option<tempfile::TempDir>,
}

async fn open(backend: Backend) -> TestStore {
    match backend {
        Backend::Memory => TestStore {
            store: Arc::new(MemoryStore::new()),
            _dir: None,
        },
        Backend::File => {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = FileStore::open(dir.path().join("config.json"))
                .await
                .expect("open file store");
            TestStore {
                store: Arc::new(store),
                _dir: Some(dir),
            }
        }
        Backend::Sqlite => {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = SqliteStore::open(dir.path()).expect("open sqlite store");
            TestStore {
                store: Arc::new(store),
                _dir: Some(dir),
            }
        }
    }
}

fn filter(name: &str) -> Filter {
    Filter {
        id: Id::new(),
        name: name.to_string(),
        expression: "*".to_string(),
    }
}

fn user(name: &str) -> User {
    let now = truncate_micros(Utc::now());
    User {
        id: Id::new(),
        username: name.to_string(),
        password_hash: "$argon2id$stub".to_string(),
        role: Role::User,
        preferences: BTreeMap::new(),
        token_invalidated_at: None,
        created_at: now,
        updated_at: now,
    }
}

// ── The suite ─────────────────────────────────────────────────────────────

async fn load_empty(t: TestStore) {
    assert!(t.store.load().await.unwrap().is_none());
}

async fn put_is_upsert(t: TestStore) {
    let mut f = filter("all");
    t.store.put_filter(f.clone()).await.unwrap();

    f.expression = "+".to_string();
    t.store.put_filter(f.clone()).await.unwrap();

    let listed = t.store.list_filters().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].expression, "+");
}

async fn delete_is_idempotent(t: TestStore) {
    let f = filter("all");
    t.store.put_filter(f.clone()).await.unwrap();
    t.store.delete_filter(f.id).await.unwrap();
    t.store.delete_filter(f.id).await.unwrap();
    assert!(t.store.get_filter(f.id).await.unwrap().is_none());
    // Deleting an ID that never existed is also fine.
    t.store.delete_filter(Id::new()).await.unwrap();
}

async fn get_missing_is_none(t: TestStore) {
    assert!(t.store.get_filter(Id::new()).await.unwrap().is_none());
    assert!(t.store.get_vault(Id::new()).await.unwrap().is_none());
    assert!(t.store.get_user(Id::new()).await.unwrap().is_none());
}

async fn list_is_id_ordered(t: TestStore) {
    let mut ids = Vec::new();
    for i in 0..8 {
        let f = filter(&format!("f{i}"));
        ids.push(f.id);
        t.store.put_filter(f).await.unwrap();
    }
    ids.sort();

    let listed: Vec<Id> = t
        .store
        .list_filters()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(listed, ids);
}

async fn reads_are_isolated(t: TestStore) {
    let f = filter("all");
    t.store.put_filter(f.clone()).await.unwrap();

    let mut copy = t.store.get_filter(f.id).await.unwrap().unwrap();
    copy.expression = "mutated".to_string();

    assert_eq!(t.store.get_filter(f.id).await.unwrap().unwrap(), f);
}

async fn usernames_are_unique(t: TestStore) {
    let ada = user("ada");
    let grace = user("grace");
    t.store.create_user(ada.clone()).await.unwrap();
    t.store.create_user(grace.clone()).await.unwrap();

    // Duplicate username on create.
    let err = t.store.create_user(user("ada")).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Duplicate ID on create.
    let mut dup = user("lovelace");
    dup.id = ada.id;
    let err = t.store.create_user(dup).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Rename onto a taken name.
    let now = truncate_micros(Utc::now());
    let err = t
        .store
        .update_username(grace.id, "ada".to_string(), now)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Rename to a fresh name is fine.
    t.store
        .update_username(grace.id, "hopper".to_string(), now)
        .await
        .unwrap();
    assert!(t
        .store
        .get_user_by_username("hopper")
        .await
        .unwrap()
        .is_some());
}

async fn missing_user_updates_fail(t: TestStore) {
    let now = truncate_micros(Utc::now());
    let ghost = Id::new();

    assert!(matches!(
        t.store.delete_user(ghost).await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        t.store
            .update_user_password(ghost, "h".to_string(), now)
            .await
            .unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        t.store
            .update_user_role(ghost, Role::Admin, now)
            .await
            .unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        t.store.invalidate_user_tokens(ghost, now).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

async fn user_field_updates_apply(t: TestStore) {
    let ada = user("ada");
    t.store.create_user(ada.clone()).await.unwrap();

    let later = truncate_micros(Utc::now() + chrono::TimeDelta::seconds(1));
    t.store
        .update_user_password(ada.id, "$argon2id$new".to_string(), later)
        .await
        .unwrap();
    t.store
        .update_user_role(ada.id, Role::Admin, later)
        .await
        .unwrap();
    t.store
        .put_user_preferences(
            ada.id,
            BTreeMap::from([("theme".to_string(), "dark".to_string())]),
            later,
        )
        .await
        .unwrap();
    t.store.invalidate_user_tokens(ada.id, later).await.unwrap();

    let stored = t.store.get_user(ada.id).await.unwrap().unwrap();
    assert_eq!(stored.password_hash, "$argon2id$new");
    assert_eq!(stored.role, Role::Admin);
    assert_eq!(stored.preferences.get("theme").map(String::as_str), Some("dark"));
    assert_eq!(stored.token_invalidated_at, Some(later));
    assert_eq!(stored.updated_at, later);
    assert_eq!(stored.created_at, ada.created_at);
}

async fn refresh_tokens_by_hash(t: TestStore) {
    let ada = user("ada");
    t.store.create_user(ada.clone()).await.unwrap();

    let now = truncate_micros(Utc::now());
    let token = RefreshToken {
        id: Id::new(),
        user_id: ada.id,
        token_hash: "aabbcc".to_string(),
        expires_at: now + chrono::TimeDelta::days(7),
        created_at: now,
    };
    t.store.put_refresh_token(token.clone()).await.unwrap();

    assert_eq!(
        t.store
            .get_refresh_token_by_hash("aabbcc")
            .await
            .unwrap()
            .map(|t| truncate(t)),
        Some(truncate(token.clone()))
    );
    assert!(t
        .store
        .get_refresh_token_by_hash("unknown")
        .await
        .unwrap()
        .is_none());

    t.store.delete_user_refresh_tokens(ada.id).await.unwrap();
    assert!(t.store.list_refresh_tokens().await.unwrap().is_empty());
}

fn truncate(mut t: RefreshToken) -> RefreshToken {
    t.expires_at = truncate_micros(t.expires_at);
    t.created_at = truncate_micros(t.created_at);
    t
}

async fn settings_flip_load(t: TestStore) {
    assert!(t.store.load_server_settings().await.unwrap().is_none());

    let mut settings = ServerSettings::default();
    settings.setup_wizard_dismissed = true;
    t.store.save_server_settings(settings.clone()).await.unwrap();

    let config = t.store.load().await.unwrap().expect("config");
    assert_eq!(config.server_settings, Some(settings));
    assert!(config.filters.is_empty());
}

async fn vault_roundtrip(t: TestStore) {
    use gastrolog::model::{RetentionAction, RetentionRule};

    let vault = Vault {
        id: Id::new(),
        name: "hot".to_string(),
        kind: "disk".to_string(),
        filter: Some(Id::new()),
        policy: Some(Id::new()),
        retention_rules: vec![
            RetentionRule {
                retention_policy_id: Id::new(),
                action: RetentionAction::Expire,
                destination: None,
            },
            RetentionRule {
                retention_policy_id: Id::new(),
                action: RetentionAction::Migrate,
                destination: Some(Id::new()),
            },
        ],
        enabled: true,
        params: BTreeMap::from([("dir".to_string(), "/var/lib/gastrolog".to_string())]),
        node_id: "node-1".to_string(),
    };
    t.store.put_vault(vault.clone()).await.unwrap();
    assert_eq!(t.store.get_vault(vault.id).await.unwrap(), Some(vault));
}

macro_rules! conformance {
    ($name:ident, $backend:expr) => {
        mod $name {
            use super::*;

            #[tokio::test]
            async fn load_empty() {
                super::load_empty(open($backend).await).await;
            }

            #[tokio::test]
            async fn put_is_upsert() {
                super::put_is_upsert(open($backend).await).await;
            }

            #[tokio::test]
            async fn delete_is_idempotent() {
                super::delete_is_idempotent(open($backend).await).await;
            }

            #[tokio::test]
            async fn get_missing_is_none() {
                super::get_missing_is_none(open($backend).await).await;
            }

            #[tokio::test]
            async fn list_is_id_ordered() {
                super::list_is_id_ordered(open($backend).await).await;
            }

            #[tokio::test]
            async fn reads_are_isolated() {
                super::reads_are_isolated(open($backend).await).await;
            }

            #[tokio::test]
            async fn usernames_are_unique() {
                super::usernames_are_unique(open($backend).await).await;
            }

            #[tokio::test]
            async fn missing_user_updates_fail() {
                super::missing_user_updates_fail(open($backend).await).await;
            }

            #[tokio::test]
            async fn user_field_updates_apply() {
                super::user_field_updates_apply(open($backend).await).await;
            }

            #[tokio::test]
            async fn refresh_tokens_by_hash() {
                super::refresh_tokens_by_hash(open($backend).await).await;
            }

            #[tokio::test]
            async fn settings_flip_load() {
                super::settings_flip_load(open($backend).await).await;
            }

            #[tokio::test]
            async fn vault_roundtrip() {
                super::vault_roundtrip(open($backend).await).await;
            }
        }
    };
}

conformance!(memory, Backend::Memory);
conformance!(file, Backend::File);
conformance!(sqlite, Backend::Sqlite);
