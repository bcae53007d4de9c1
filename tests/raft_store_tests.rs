//! End-to-end tests for the Raft-backed store on a single-node cluster.
//!
//! A one-member cluster elects itself leader without any network traffic,
//! which lets the whole write path — encode, commit, FSM apply, response —
//! run for real.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gastrolog::bootstrap::{bootstrap, BootstrapMode};
use gastrolog::error::Error;
use gastrolog::fsm::Fsm;
use gastrolog::model::{truncate_micros, Filter, Id, Role, RotationPolicy, User, Vault};
use gastrolog::raft::{start_raft_node, RaftHandle};
use gastrolog::store::{RaftStore, Store};

async fn leader_store() -> (Arc<RaftHandle>, RaftStore) {
    let fsm = Arc::new(Fsm::new());
    // The address is never dialled: a single voter wins the election alone.
    let handle = start_raft_node(fsm, 1, vec![(1, "127.0.0.1:59999".to_string())])
        .await
        .expect("start raft");

    handle
        .raft
        .wait(Some(Duration::from_secs(10)))
        .state(openraft::ServerState::Leader, "single node becomes leader")
        .await
        .expect("leader election");

    let store = RaftStore::new(handle.clone());
    (handle, store)
}

fn user(name: &str, role: Role) -> User {
    let now = truncate_micros(Utc::now());
    User {
        id: Id::new(),
        username: name.to_string(),
        password_hash: "$argon2id$stub".to_string(),
        role,
        preferences: BTreeMap::new(),
        token_invalidated_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn writes_commit_through_the_log_and_reads_see_them() {
    let (handle, store) = leader_store().await;

    let filter = Filter {
        id: Id::new(),
        name: "all".to_string(),
        expression: "*".to_string(),
    };
    store.put_filter(filter.clone()).await.unwrap();
    assert_eq!(store.get_filter(filter.id).await.unwrap(), Some(filter));

    handle.shutdown().await;
}

#[tokio::test]
async fn command_errors_come_back_through_the_commit_future() {
    let (handle, store) = leader_store().await;

    store.create_user(user("ada", Role::Admin)).await.unwrap();
    let err = store.create_user(user("ada", Role::User)).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    handle.shutdown().await;
}

#[tokio::test]
async fn cascade_is_replicated_inside_the_delete_entry() {
    let (handle, store) = leader_store().await;

    let policy = RotationPolicy {
        id: Id::new(),
        name: "default".to_string(),
        max_bytes: None,
        max_age: Some("5m".to_string()),
        max_records: None,
        cron: None,
    };
    store.put_rotation_policy(policy.clone()).await.unwrap();

    let vault = Vault {
        id: Id::new(),
        name: "default".to_string(),
        kind: "memory".to_string(),
        filter: None,
        policy: Some(policy.id),
        retention_rules: Vec::new(),
        enabled: true,
        params: BTreeMap::new(),
        node_id: String::new(),
    };
    store.put_vault(vault.clone()).await.unwrap();

    store.delete_rotation_policy(policy.id).await.unwrap();

    // The cascade ran inside the same applied entry, so the very next read
    // already sees the cleared reference.
    assert_eq!(store.get_vault(vault.id).await.unwrap().unwrap().policy, None);

    handle.shutdown().await;
}

#[tokio::test]
async fn bootstrap_through_raft_seeds_the_fsm() {
    let (handle, store) = leader_store().await;

    assert!(store.load().await.unwrap().is_none());
    assert!(bootstrap(&store, BootstrapMode::Full).await.unwrap());

    let config = store.load().await.unwrap().expect("config");
    assert_eq!(config.filters.len(), 1);
    assert_eq!(config.ingesters[0].name, "chatterbox");
    assert!(config.server_settings.is_some());

    // Reads come straight from the FSM's store.
    assert_eq!(handle.fsm.store().list_filters().await.unwrap().len(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn per_field_user_updates_replicate() {
    let (handle, store) = leader_store().await;

    let ada = user("ada", Role::User);
    store.create_user(ada.clone()).await.unwrap();

    let later = truncate_micros(Utc::now() + chrono::TimeDelta::seconds(2));
    store
        .update_user_role(ada.id, Role::Admin, later)
        .await
        .unwrap();
    store.invalidate_user_tokens(ada.id, later).await.unwrap();

    let stored = store.get_user(ada.id).await.unwrap().unwrap();
    assert_eq!(stored.role, Role::Admin);
    assert_eq!(stored.token_invalidated_at, Some(later));
    assert_eq!(stored.updated_at, later);

    handle.shutdown().await;
}
