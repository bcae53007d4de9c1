//! The deterministic state machine the Raft log folds into.
//!
//! The FSM owns exactly one in-memory store. `apply` is driven strictly
//! single-threaded by the Raft apply loop; reads may run concurrently
//! because the store synchronises internally. Everything `apply` does —
//! including the referential cascades for policy deletes and the refresh
//! token sweep on user deletes — happens inside the one log entry, so
//! replay is deterministic and observers never see a dangling reference.
//!
//! After a successful entity mutation the registered `on_apply` callback
//! fires synchronously, after the store write and before `apply` returns:
//! subscribers observe FSM state that already includes the change. Fan-out
//! to many subscribers belongs behind that single callback (a channel),
//! never inside `apply`.

use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::command::Command;
use crate::error::Result;
use crate::model::Id;
use crate::settings::{ServerSettings, SERVER_SETTINGS_KEY};
use crate::snapshot::Snapshot;
use crate::store::{MemoryStore, Store};

/// What changed, emitted to the `on_apply` subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Filter(Id),
    RotationPolicy(Id),
    RetentionPolicy(Id),
    Vault(Id),
    Ingester(Id),
    Certificate(Id),
    User(Id),
    RefreshToken(Id),
    NodeConfig(Id),
    ClusterTls,
    Setting(String),
}

type NotifyFn = Box<dyn Fn(&Notification) + Send + Sync>;

/// The replicated state machine.
pub struct Fsm {
    // Swapped wholesale on snapshot restore; individual mutations go
    // through the store's own lock.
    store: ArcSwap<MemoryStore>,
    on_apply: RwLock<Option<NotifyFn>>,
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

impl Fsm {
    pub fn new() -> Self {
        Fsm {
            store: ArcSwap::from_pointee(MemoryStore::new()),
            on_apply: RwLock::new(None),
        }
    }

    /// The in-memory store backing this FSM. Reads served from here are
    /// non-blocking and never touch Raft.
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.load_full()
    }

    /// Register the single change subscriber. Replaces any previous one.
    pub fn set_on_apply<F>(&self, f: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        *self.on_apply.write().unwrap() = Some(Box::new(f));
    }

    fn notify(&self, notification: &Notification) {
        if let Some(f) = self.on_apply.read().unwrap().as_ref() {
            f(notification);
        }
    }

    /// Decode and apply one committed log payload.
    pub async fn apply_bytes(&self, bytes: &[u8]) -> Result<()> {
        let command = Command::decode(bytes)?;
        self.apply(command).await
    }

    /// Apply one committed command.
    pub async fn apply(&self, command: Command) -> Result<()> {
        let store = self.store();
        let notification = match command {
            Command::PutFilter(f) => {
                let id = f.id;
                store.put_filter(f).await?;
                Some(Notification::Filter(id))
            }
            Command::DeleteFilter(id) => {
                store.delete_filter(id).await?;
                Some(Notification::Filter(id))
            }
            Command::PutRotationPolicy(p) => {
                let id = p.id;
                store.put_rotation_policy(p).await?;
                Some(Notification::RotationPolicy(id))
            }
            Command::DeleteRotationPolicy(id) => {
                store.delete_rotation_policy(id).await?;
                self.cascade_rotation_policy(&store, id).await?;
                Some(Notification::RotationPolicy(id))
            }
            Command::PutRetentionPolicy(p) => {
                let id = p.id;
                store.put_retention_policy(p).await?;
                Some(Notification::RetentionPolicy(id))
            }
            Command::DeleteRetentionPolicy(id) => {
                store.delete_retention_policy(id).await?;
                self.cascade_retention_policy(&store, id).await?;
                Some(Notification::RetentionPolicy(id))
            }
            Command::PutVault(v) => {
                let id = v.id;
                store.put_vault(v).await?;
                Some(Notification::Vault(id))
            }
            Command::DeleteVault(id) => {
                // Migrate-rule destinations referencing this vault are left
                // as-is; routing treats them as dangling.
                store.delete_vault(id).await?;
                Some(Notification::Vault(id))
            }
            Command::PutIngester(i) => {
                let id = i.id;
                store.put_ingester(i).await?;
                Some(Notification::Ingester(id))
            }
            Command::DeleteIngester(id) => {
                store.delete_ingester(id).await?;
                Some(Notification::Ingester(id))
            }
            Command::PutSetting { key, value } => {
                if key == SERVER_SETTINGS_KEY {
                    let settings = ServerSettings::from_json(&value)?;
                    store.save_server_settings(settings).await?;
                    Some(Notification::Setting(key))
                } else {
                    // Backward-compat catch: a newer node may replicate
                    // settings keys this release does not know.
                    debug!(key, "ignoring unrecognised settings key");
                    None
                }
            }
            Command::DeleteSetting { key } => {
                debug!(key, "delete of settings key is a no-op");
                None
            }
            Command::PutCertificate(c) => {
                let id = c.id;
                store.put_certificate(c).await?;
                Some(Notification::Certificate(id))
            }
            Command::DeleteCertificate(id) => {
                store.delete_certificate(id).await?;
                Some(Notification::Certificate(id))
            }
            Command::CreateUser(u) => {
                let id = u.id;
                store.create_user(u).await?;
                Some(Notification::User(id))
            }
            Command::UpdatePassword {
                user_id,
                password_hash,
                updated_at,
            } => {
                store
                    .update_user_password(user_id, password_hash, updated_at)
                    .await?;
                Some(Notification::User(user_id))
            }
            Command::UpdateUserRole {
                user_id,
                role,
                updated_at,
            } => {
                store.update_user_role(user_id, role, updated_at).await?;
                Some(Notification::User(user_id))
            }
            Command::UpdateUsername {
                user_id,
                username,
                updated_at,
            } => {
                store.update_username(user_id, username, updated_at).await?;
                Some(Notification::User(user_id))
            }
            Command::DeleteUser(id) => {
                store.delete_user(id).await?;
                // Lifecycle rule: a user's refresh tokens die with them.
                store.delete_user_refresh_tokens(id).await?;
                Some(Notification::User(id))
            }
            Command::InvalidateTokens { user_id, at } => {
                store.invalidate_user_tokens(user_id, at).await?;
                Some(Notification::User(user_id))
            }
            Command::PutUserPreferences {
                user_id,
                preferences,
                updated_at,
            } => {
                store
                    .put_user_preferences(user_id, preferences, updated_at)
                    .await?;
                Some(Notification::User(user_id))
            }
            Command::CreateRefreshToken(t) => {
                let id = t.id;
                store.put_refresh_token(t).await?;
                Some(Notification::RefreshToken(id))
            }
            Command::DeleteRefreshToken(id) => {
                store.delete_refresh_token(id).await?;
                Some(Notification::RefreshToken(id))
            }
            Command::DeleteUserRefreshTokens(user_id) => {
                store.delete_user_refresh_tokens(user_id).await?;
                Some(Notification::User(user_id))
            }
            Command::PutNodeConfig(n) => {
                let id = n.id;
                store.put_node_config(n).await?;
                Some(Notification::NodeConfig(id))
            }
            Command::DeleteNodeConfig(id) => {
                store.delete_node_config(id).await?;
                Some(Notification::NodeConfig(id))
            }
            Command::PutClusterTls(t) => {
                store.put_cluster_tls(t).await?;
                Some(Notification::ClusterTls)
            }
        };

        if let Some(n) = notification {
            self.notify(&n);
        }
        Ok(())
    }

    /// Invariant: no vault may keep referencing a deleted rotation policy.
    async fn cascade_rotation_policy(&self, store: &MemoryStore, id: Id) -> Result<()> {
        for mut vault in store.list_vaults().await? {
            if vault.policy == Some(id) {
                vault.policy = None;
                store.put_vault(vault).await?;
            }
        }
        Ok(())
    }

    /// Invariant: rules for a deleted retention policy vanish everywhere.
    async fn cascade_retention_policy(&self, store: &MemoryStore, id: Id) -> Result<()> {
        for mut vault in store.list_vaults().await? {
            let before = vault.retention_rules.len();
            vault
                .retention_rules
                .retain(|r| r.retention_policy_id != id);
            if vault.retention_rules.len() != before {
                store.put_vault(vault).await?;
            }
        }
        Ok(())
    }

    /// Capture the full state for log compaction.
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        let store = self.store();
        Ok(Snapshot::capture(store.as_ref()).await?.encode())
    }

    /// Replace the FSM state with a decoded snapshot.
    ///
    /// Raft guarantees restore never races apply or snapshot, so building
    /// the new store off to the side and swapping the pointer is safe; a
    /// failed restore leaves the old state untouched (the node must then
    /// shut down rather than serve state older than the snapshot).
    pub async fn restore(&self, bytes: &[u8]) -> Result<()> {
        let snapshot = Snapshot::decode(bytes)?;
        let fresh = snapshot.restore().await.map_err(|e| {
            warn!(error = %e, "snapshot restore failed");
            e
        })?;
        self.store.store(Arc::new(fresh));
        Ok(())
    }
}
