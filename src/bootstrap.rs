//! First-boot seeding.
//!
//! When `Store::load` reports a completely fresh store, exactly one of two
//! bootstrap modes runs:
//!
//! - **Full** seeds a working single-node pipeline: a catch-all filter, a
//!   5-minute rotation policy, a 10-chunk retention policy, an in-memory
//!   vault wired to all three, a demo ingester, and server settings with a
//!   freshly generated JWT secret.
//! - **Minimal** seeds only the server settings, leaving entity tables
//!   empty for the setup wizard.
//!
//! The JWT secret is 32 random bytes, stored base64 in the settings blob.
//! It is not encrypted at rest; operators rely on file permissions and/or
//! disk encryption.

use base64::Engine as _;
use rand::RngCore;
use tracing::info;

use crate::error::Result;
use crate::model::{
    Filter, Id, Ingester, RetentionAction, RetentionPolicy, RetentionRule, RotationPolicy, Vault,
    FILTER_MATCH_ALL,
};
use crate::settings::ServerSettings;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapMode {
    #[default]
    Full,
    Minimal,
}

/// Seed a fresh store. Returns `false` (untouched) when the store has
/// already been written.
pub async fn bootstrap(store: &dyn Store, mode: BootstrapMode) -> Result<bool> {
    if store.load().await?.is_some() {
        return Ok(false);
    }

    match mode {
        BootstrapMode::Full => bootstrap_full(store).await?,
        BootstrapMode::Minimal => bootstrap_minimal(store).await?,
    }
    info!(?mode, "bootstrapped fresh configuration store");
    Ok(true)
}

fn default_settings() -> ServerSettings {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);

    let mut settings = ServerSettings::default();
    settings.auth.jwt_secret = base64::engine::general_purpose::STANDARD.encode(secret);
    settings
}

async fn bootstrap_minimal(store: &dyn Store) -> Result<()> {
    store.save_server_settings(default_settings()).await
}

async fn bootstrap_full(store: &dyn Store) -> Result<()> {
    let filter = Filter {
        id: Id::new(),
        name: "all".to_string(),
        expression: FILTER_MATCH_ALL.to_string(),
    };
    store.put_filter(filter.clone()).await?;

    let rotation = RotationPolicy {
        id: Id::new(),
        name: "default".to_string(),
        max_bytes: None,
        max_age: Some("5m".to_string()),
        max_records: None,
        cron: None,
    };
    store.put_rotation_policy(rotation.clone()).await?;

    let retention = RetentionPolicy {
        id: Id::new(),
        name: "default".to_string(),
        max_age: None,
        max_bytes: None,
        max_chunks: Some(10),
    };
    store.put_retention_policy(retention.clone()).await?;

    store
        .put_vault(Vault {
            id: Id::new(),
            name: "default".to_string(),
            kind: "memory".to_string(),
            filter: Some(filter.id),
            policy: Some(rotation.id),
            retention_rules: vec![RetentionRule {
                retention_policy_id: retention.id,
                action: RetentionAction::Expire,
                destination: None,
            }],
            enabled: true,
            params: Default::default(),
            node_id: String::new(),
        })
        .await?;

    store
        .put_ingester(Ingester {
            id: Id::new(),
            name: "chatterbox".to_string(),
            kind: "chatterbox".to_string(),
            enabled: true,
            params: Default::default(),
            node_id: String::new(),
        })
        .await?;

    store.save_server_settings(default_settings()).await
}
