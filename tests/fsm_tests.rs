//! FSM behavior: cascades, snapshot round-trips, and restore semantics.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use gastrolog::command::Command;
use gastrolog::fsm::{Fsm, Notification};
use gastrolog::model::{
    truncate_micros, Filter, Id, RetentionAction, RetentionPolicy, RetentionRule, Role,
    RotationPolicy, User, Vault,
};
use gastrolog::settings::SERVER_SETTINGS_KEY;
use gastrolog::snapshot::Snapshot;
use gastrolog::store::Store;

fn vault(policy: Option<Id>, rules: Vec<RetentionRule>) -> Vault {
    Vault {
        id: Id::new(),
        name: format!("vault-{}", Id::new()),
        kind: "memory".to_string(),
        filter: None,
        policy,
        retention_rules: rules,
        enabled: true,
        params: BTreeMap::new(),
        node_id: String::new(),
    }
}

fn rotation(name: &str) -> RotationPolicy {
    RotationPolicy {
        id: Id::new(),
        name: name.to_string(),
        max_bytes: None,
        max_age: Some("5m".to_string()),
        max_records: None,
        cron: None,
    }
}

#[tokio::test]
async fn rotation_delete_cascade_preserves_unrelated_references() {
    let fsm = Fsm::new();

    let p = rotation("p");
    let q = rotation("q");
    let v1 = vault(Some(p.id), Vec::new());
    let v2 = vault(Some(p.id), Vec::new());
    let v3 = vault(Some(q.id), Vec::new());

    fsm.apply(Command::PutRotationPolicy(p.clone())).await.unwrap();
    fsm.apply(Command::PutRotationPolicy(q.clone())).await.unwrap();
    for v in [&v1, &v2, &v3] {
        fsm.apply(Command::PutVault(v.clone())).await.unwrap();
    }

    fsm.apply(Command::DeleteRotationPolicy(p.id)).await.unwrap();

    let store = fsm.store();
    assert!(store.get_rotation_policy(p.id).await.unwrap().is_none());

    let vaults = store.list_vaults().await.unwrap();
    assert_eq!(vaults.len(), 3);
    for v in &vaults {
        if v.id == v3.id {
            assert_eq!(v.policy, Some(q.id));
        } else {
            assert_eq!(v.policy, None);
        }
    }
}

#[tokio::test]
async fn retention_delete_cascade_removes_only_matching_rules() {
    let fsm = Fsm::new();

    let doomed = RetentionPolicy {
        id: Id::new(),
        name: "doomed".to_string(),
        max_age: None,
        max_bytes: None,
        max_chunks: Some(10),
    };
    let kept_id = Id::new();

    let v = vault(
        None,
        vec![
            RetentionRule {
                retention_policy_id: doomed.id,
                action: RetentionAction::Expire,
                destination: None,
            },
            RetentionRule {
                retention_policy_id: kept_id,
                action: RetentionAction::Migrate,
                destination: Some(Id::new()),
            },
        ],
    );

    fsm.apply(Command::PutRetentionPolicy(doomed.clone())).await.unwrap();
    fsm.apply(Command::PutVault(v.clone())).await.unwrap();
    fsm.apply(Command::DeleteRetentionPolicy(doomed.id)).await.unwrap();

    let rules = fsm
        .store()
        .get_vault(v.id)
        .await
        .unwrap()
        .unwrap()
        .retention_rules;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].retention_policy_id, kept_id);
}

#[tokio::test]
async fn deleting_a_user_sweeps_their_refresh_tokens() {
    let fsm = Fsm::new();
    let now = truncate_micros(Utc::now());

    let ada = User {
        id: Id::new(),
        username: "ada".to_string(),
        password_hash: "h".to_string(),
        role: Role::Admin,
        preferences: BTreeMap::new(),
        token_invalidated_at: None,
        created_at: now,
        updated_at: now,
    };
    fsm.apply(Command::CreateUser(ada.clone())).await.unwrap();
    fsm.apply(Command::CreateRefreshToken(gastrolog::model::RefreshToken {
        id: Id::new(),
        user_id: ada.id,
        token_hash: "abc".to_string(),
        expires_at: now,
        created_at: now,
    }))
    .await
    .unwrap();

    fsm.apply(Command::DeleteUser(ada.id)).await.unwrap();

    let store = fsm.store();
    assert!(store.get_user(ada.id).await.unwrap().is_none());
    assert!(store.list_refresh_tokens().await.unwrap().is_empty());
}

#[tokio::test]
async fn command_errors_propagate_and_leave_state_intact() {
    let fsm = Fsm::new();
    // Updating a user that does not exist fails with the typed error.
    let err = fsm
        .apply(Command::UpdateUsername {
            user_id: Id::new(),
            username: "ghost".to_string(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, gastrolog::Error::NotFound(_)));
    assert!(fsm.store().load().await.unwrap().is_none());
}

#[tokio::test]
async fn notifications_arrive_in_apply_order() {
    let fsm = Fsm::new();
    let seen: Arc<Mutex<Vec<Notification>>> = Arc::default();
    let sink = seen.clone();
    fsm.set_on_apply(move |n| sink.lock().unwrap().push(n.clone()));

    let f = Filter {
        id: Id::new(),
        name: "all".to_string(),
        expression: "*".to_string(),
    };
    fsm.apply(Command::PutFilter(f.clone())).await.unwrap();
    fsm.apply(Command::DeleteFilter(f.id)).await.unwrap();
    fsm.apply(Command::PutSetting {
        key: SERVER_SETTINGS_KEY.to_string(),
        value: "{}".to_string(),
    })
    .await
    .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.as_slice(),
        [
            Notification::Filter(f.id),
            Notification::Filter(f.id),
            Notification::Setting(SERVER_SETTINGS_KEY.to_string()),
        ]
    );
}

#[tokio::test]
async fn snapshot_restore_yields_load_equivalent_state() {
    let fsm = Fsm::new();
    let p = rotation("default");
    let v = vault(Some(p.id), Vec::new());
    let now = truncate_micros(Utc::now());

    fsm.apply(Command::PutRotationPolicy(p)).await.unwrap();
    fsm.apply(Command::PutVault(v)).await.unwrap();
    fsm.apply(Command::CreateUser(User {
        id: Id::new(),
        username: "ada".to_string(),
        password_hash: "h".to_string(),
        role: Role::Admin,
        preferences: BTreeMap::from([("theme".to_string(), "dark".to_string())]),
        token_invalidated_at: Some(now),
        created_at: now,
        updated_at: now,
    }))
    .await
    .unwrap();
    fsm.apply(Command::PutSetting {
        key: SERVER_SETTINGS_KEY.to_string(),
        value: r#"{"setup_wizard_dismissed": true}"#.to_string(),
    })
    .await
    .unwrap();

    let bytes = fsm.snapshot().await.unwrap();

    let replica = Fsm::new();
    replica.restore(&bytes).await.unwrap();

    assert_eq!(
        replica.store().load().await.unwrap(),
        fsm.store().load().await.unwrap()
    );
    assert_eq!(
        replica.store().list_users().await.unwrap(),
        fsm.store().list_users().await.unwrap()
    );
}

#[tokio::test]
async fn snapshot_of_fresh_fsm_restores_fresh() {
    let fsm = Fsm::new();
    let bytes = fsm.snapshot().await.unwrap();

    let replica = Fsm::new();
    replica.restore(&bytes).await.unwrap();
    assert!(replica.store().load().await.unwrap().is_none());
}

#[tokio::test]
async fn legacy_snapshot_settings_migrate_on_restore() {
    // A snapshot written by an old node carries the flat settings shape.
    let snap = Snapshot {
        settings: BTreeMap::from([(
            SERVER_SETTINGS_KEY.to_string(),
            r#"{"lookup": {"geoip_db_path": "/var/geo.mmdb"},
                "auth": {"min_password_length": 12}}"#
                .to_string(),
        )]),
        ..Default::default()
    };

    let fsm = Fsm::new();
    fsm.restore(&snap.encode()).await.unwrap();

    let settings = fsm
        .store()
        .load_server_settings()
        .await
        .unwrap()
        .expect("settings");
    assert_eq!(settings.lookup.maxmind.geoip_db_path, "/var/geo.mmdb");
    assert_eq!(settings.auth.password_policy.min_length, 12);
}

#[tokio::test]
async fn restore_replaces_prior_state_wholesale() {
    let fsm = Fsm::new();
    fsm.apply(Command::PutFilter(Filter {
        id: Id::new(),
        name: "stale".to_string(),
        expression: "*".to_string(),
    }))
    .await
    .unwrap();

    let incoming = Filter {
        id: Id::new(),
        name: "fresh".to_string(),
        expression: "+".to_string(),
    };
    let snap = Snapshot {
        filters: vec![incoming.clone()],
        ..Default::default()
    };
    fsm.restore(&snap.encode()).await.unwrap();

    let filters = fsm.store().list_filters().await.unwrap();
    assert_eq!(filters, vec![incoming]);
}
