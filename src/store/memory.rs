//! In-memory reference backend.
//!
//! All tables live in `BTreeMap`s keyed by [`Id`] under a single
//! reader-writer lock. UUIDv7 keys make BTreeMap iteration order equal
//! creation order, which is the `list_*` contract. Every boundary value is
//! an owned clone, so callers can never reach store state through a
//! returned reference.
//!
//! This is also the state the Raft FSM folds the log into; it must stay
//! cheap to construct and cheap to read.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{
    Certificate, ClusterTls, Config, Entity, Filter, Id, Ingester, NodeConfig, RefreshToken,
    RetentionPolicy, Role, RotationPolicy, User, Vault,
};
use crate::settings::ServerSettings;
use crate::store::Store;

#[derive(Debug, Default, Clone)]
struct State {
    filters: BTreeMap<Id, Filter>,
    rotation_policies: BTreeMap<Id, RotationPolicy>,
    retention_policies: BTreeMap<Id, RetentionPolicy>,
    vaults: BTreeMap<Id, Vault>,
    ingesters: BTreeMap<Id, Ingester>,
    certificates: BTreeMap<Id, Certificate>,
    node_configs: BTreeMap<Id, NodeConfig>,
    users: BTreeMap<Id, User>,
    refresh_tokens: BTreeMap<Id, RefreshToken>,
    cluster_tls: Option<ClusterTls>,
    server_settings: Option<ServerSettings>,
}

impl State {
    fn is_fresh(&self) -> bool {
        self.filters.is_empty()
            && self.rotation_policies.is_empty()
            && self.retention_policies.is_empty()
            && self.vaults.is_empty()
            && self.ingesters.is_empty()
            && self.certificates.is_empty()
            && self.node_configs.is_empty()
            && self.users.is_empty()
            && self.refresh_tokens.is_empty()
            && self.cluster_tls.is_none()
            && self.server_settings.is_none()
    }
}

/// The in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn get<T: Entity>(table: &BTreeMap<Id, T>, id: Id) -> Option<T> {
    table.get(&id).cloned()
}

fn list<T: Entity>(table: &BTreeMap<Id, T>) -> Vec<T> {
    table.values().cloned().collect()
}

impl MemoryStore {
    fn with_user<F>(&self, id: Id, f: F) -> Result<()>
    where
        F: FnOnce(&mut User),
    {
        let mut state = self.inner.write().unwrap();
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        f(user);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ── Filters ───────────────────────────────────────────────────────────

    async fn get_filter(&self, id: Id) -> Result<Option<Filter>> {
        Ok(get(&self.inner.read().unwrap().filters, id))
    }

    async fn list_filters(&self) -> Result<Vec<Filter>> {
        Ok(list(&self.inner.read().unwrap().filters))
    }

    async fn put_filter(&self, filter: Filter) -> Result<()> {
        self.inner.write().unwrap().filters.insert(filter.id, filter);
        Ok(())
    }

    async fn delete_filter(&self, id: Id) -> Result<()> {
        self.inner.write().unwrap().filters.remove(&id);
        Ok(())
    }

    // ── Rotation policies ─────────────────────────────────────────────────

    async fn get_rotation_policy(&self, id: Id) -> Result<Option<RotationPolicy>> {
        Ok(get(&self.inner.read().unwrap().rotation_policies, id))
    }

    async fn list_rotation_policies(&self) -> Result<Vec<RotationPolicy>> {
        Ok(list(&self.inner.read().unwrap().rotation_policies))
    }

    async fn put_rotation_policy(&self, policy: RotationPolicy) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .rotation_policies
            .insert(policy.id, policy);
        Ok(())
    }

    async fn delete_rotation_policy(&self, id: Id) -> Result<()> {
        self.inner.write().unwrap().rotation_policies.remove(&id);
        Ok(())
    }

    // ── Retention policies ────────────────────────────────────────────────

    async fn get_retention_policy(&self, id: Id) -> Result<Option<RetentionPolicy>> {
        Ok(get(&self.inner.read().unwrap().retention_policies, id))
    }

    async fn list_retention_policies(&self) -> Result<Vec<RetentionPolicy>> {
        Ok(list(&self.inner.read().unwrap().retention_policies))
    }

    async fn put_retention_policy(&self, policy: RetentionPolicy) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .retention_policies
            .insert(policy.id, policy);
        Ok(())
    }

    async fn delete_retention_policy(&self, id: Id) -> Result<()> {
        self.inner.write().unwrap().retention_policies.remove(&id);
        Ok(())
    }

    // ── Vaults ────────────────────────────────────────────────────────────

    async fn get_vault(&self, id: Id) -> Result<Option<Vault>> {
        Ok(get(&self.inner.read().unwrap().vaults, id))
    }

    async fn list_vaults(&self) -> Result<Vec<Vault>> {
        Ok(list(&self.inner.read().unwrap().vaults))
    }

    async fn put_vault(&self, vault: Vault) -> Result<()> {
        self.inner.write().unwrap().vaults.insert(vault.id, vault);
        Ok(())
    }

    async fn delete_vault(&self, id: Id) -> Result<()> {
        self.inner.write().unwrap().vaults.remove(&id);
        Ok(())
    }

    // ── Ingesters ─────────────────────────────────────────────────────────

    async fn get_ingester(&self, id: Id) -> Result<Option<Ingester>> {
        Ok(get(&self.inner.read().unwrap().ingesters, id))
    }

    async fn list_ingesters(&self) -> Result<Vec<Ingester>> {
        Ok(list(&self.inner.read().unwrap().ingesters))
    }

    async fn put_ingester(&self, ingester: Ingester) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .ingesters
            .insert(ingester.id, ingester);
        Ok(())
    }

    async fn delete_ingester(&self, id: Id) -> Result<()> {
        self.inner.write().unwrap().ingesters.remove(&id);
        Ok(())
    }

    // ── Certificates ──────────────────────────────────────────────────────

    async fn get_certificate(&self, id: Id) -> Result<Option<Certificate>> {
        Ok(get(&self.inner.read().unwrap().certificates, id))
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        Ok(list(&self.inner.read().unwrap().certificates))
    }

    async fn put_certificate(&self, certificate: Certificate) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .certificates
            .insert(certificate.id, certificate);
        Ok(())
    }

    async fn delete_certificate(&self, id: Id) -> Result<()> {
        self.inner.write().unwrap().certificates.remove(&id);
        Ok(())
    }

    // ── Node configs ──────────────────────────────────────────────────────

    async fn get_node_config(&self, id: Id) -> Result<Option<NodeConfig>> {
        Ok(get(&self.inner.read().unwrap().node_configs, id))
    }

    async fn list_node_configs(&self) -> Result<Vec<NodeConfig>> {
        Ok(list(&self.inner.read().unwrap().node_configs))
    }

    async fn put_node_config(&self, node: NodeConfig) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .node_configs
            .insert(node.id, node);
        Ok(())
    }

    async fn delete_node_config(&self, id: Id) -> Result<()> {
        self.inner.write().unwrap().node_configs.remove(&id);
        Ok(())
    }

    // ── Cluster TLS ───────────────────────────────────────────────────────

    async fn get_cluster_tls(&self) -> Result<Option<ClusterTls>> {
        Ok(self.inner.read().unwrap().cluster_tls.clone())
    }

    async fn put_cluster_tls(&self, tls: ClusterTls) -> Result<()> {
        self.inner.write().unwrap().cluster_tls = Some(tls);
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────────

    async fn create_user(&self, user: User) -> Result<()> {
        let mut state = self.inner.write().unwrap();
        if state.users.contains_key(&user.id) {
            return Err(Error::Conflict(format!("user {} already exists", user.id)));
        }
        if state.users.values().any(|u| u.username == user.username) {
            return Err(Error::Conflict(format!(
                "username {:?} already taken",
                user.username
            )));
        }
        state.users.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, id: Id) -> Result<Option<User>> {
        Ok(get(&self.inner.read().unwrap().users, id))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(list(&self.inner.read().unwrap().users))
    }

    async fn count_users(&self) -> Result<u64> {
        Ok(self.inner.read().unwrap().users.len() as u64)
    }

    async fn update_user_password(
        &self,
        id: Id,
        password_hash: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_user(id, |u| {
            u.password_hash = password_hash;
            u.updated_at = updated_at;
        })
    }

    async fn update_user_role(
        &self,
        id: Id,
        role: Role,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_user(id, |u| {
            u.role = role;
            u.updated_at = updated_at;
        })
    }

    async fn update_username(
        &self,
        id: Id,
        username: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.inner.write().unwrap();
        let taken = state
            .users
            .values()
            .any(|u| u.id != id && u.username == username);
        match state.users.get_mut(&id) {
            None => Err(Error::NotFound(format!("user {id}"))),
            Some(_) if taken => Err(Error::Conflict(format!(
                "username {username:?} already taken"
            ))),
            Some(user) => {
                user.username = username;
                user.updated_at = updated_at;
                Ok(())
            }
        }
    }

    async fn invalidate_user_tokens(&self, id: Id, at: DateTime<Utc>) -> Result<()> {
        self.with_user(id, |u| {
            u.token_invalidated_at = Some(at);
            u.updated_at = at;
        })
    }

    async fn put_user_preferences(
        &self,
        id: Id,
        preferences: BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_user(id, |u| {
            u.preferences = preferences;
            u.updated_at = updated_at;
        })
    }

    async fn delete_user(&self, id: Id) -> Result<()> {
        let mut state = self.inner.write().unwrap();
        state
            .users
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        Ok(())
    }

    // ── Refresh tokens ────────────────────────────────────────────────────

    async fn put_refresh_token(&self, token: RefreshToken) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .refresh_tokens
            .insert(token.id, token);
        Ok(())
    }

    async fn get_refresh_token(&self, id: Id) -> Result<Option<RefreshToken>> {
        Ok(get(&self.inner.read().unwrap().refresh_tokens, id))
    }

    async fn get_refresh_token_by_hash(&self, hash: &str) -> Result<Option<RefreshToken>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == hash)
            .cloned())
    }

    async fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>> {
        Ok(list(&self.inner.read().unwrap().refresh_tokens))
    }

    async fn delete_refresh_token(&self, id: Id) -> Result<()> {
        self.inner.write().unwrap().refresh_tokens.remove(&id);
        Ok(())
    }

    async fn delete_user_refresh_tokens(&self, user_id: Id) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .refresh_tokens
            .retain(|_, t| t.user_id != user_id);
        Ok(())
    }

    // ── Server settings ───────────────────────────────────────────────────

    async fn load_server_settings(&self) -> Result<Option<ServerSettings>> {
        Ok(self.inner.read().unwrap().server_settings.clone())
    }

    async fn save_server_settings(&self, settings: ServerSettings) -> Result<()> {
        self.inner.write().unwrap().server_settings = Some(settings);
        Ok(())
    }

    // ── Aggregate ─────────────────────────────────────────────────────────

    async fn load(&self) -> Result<Option<Config>> {
        let state = self.inner.read().unwrap();
        if state.is_fresh() {
            return Ok(None);
        }
        Ok(Some(Config {
            filters: list(&state.filters),
            rotation_policies: list(&state.rotation_policies),
            retention_policies: list(&state.retention_policies),
            vaults: list(&state.vaults),
            ingesters: list(&state.ingesters),
            certificates: list(&state.certificates),
            node_configs: list(&state.node_configs),
            cluster_tls: state.cluster_tls.clone(),
            server_settings: state.server_settings.clone(),
        }))
    }
}
