//! The uniform CRUD contract every configuration backend implements.
//!
//! Backends are interchangeable: in-memory (the reference implementation
//! and the FSM's state), single-file JSON, embedded SQLite, and the
//! Raft-backed façade. The contract every implementation must meet (and the
//! shared conformance suite in `tests/store_conformance.rs` verifies):
//!
//! - `put_*` is an upsert: insert on a new ID, full replace on an existing
//!   one.
//! - `delete_*` of a missing ID is a no-op success — except users, where
//!   deletes and per-field updates of a missing user fail `NotFound`.
//! - `get_*` of a missing ID returns `Ok(None)`.
//! - `list_*` returns entities ordered by ID ascending (creation order).
//! - Every value crossing the boundary is a deep copy; mutating a returned
//!   value never reaches store state.
//! - `create_user` fails `Conflict` on a duplicate ID or username;
//!   `update_username` fails `Conflict` when the name is taken.
//! - `load` returns `Ok(None)` only while the store has never been written.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Certificate, ClusterTls, Config, Filter, Id, Ingester, NodeConfig, RefreshToken,
    RetentionPolicy, Role, RotationPolicy, User, Vault,
};
use crate::settings::ServerSettings;

pub mod file;
pub mod memory;
pub mod raft;
pub mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use raft::{Forwarder, GrpcForwarder, RaftStore};
pub use sqlite::SqliteStore;

/// Uniform configuration store.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Filters ───────────────────────────────────────────────────────────

    async fn get_filter(&self, id: Id) -> Result<Option<Filter>>;
    async fn list_filters(&self) -> Result<Vec<Filter>>;
    async fn put_filter(&self, filter: Filter) -> Result<()>;
    async fn delete_filter(&self, id: Id) -> Result<()>;

    // ── Rotation policies ─────────────────────────────────────────────────

    async fn get_rotation_policy(&self, id: Id) -> Result<Option<RotationPolicy>>;
    async fn list_rotation_policies(&self) -> Result<Vec<RotationPolicy>>;
    async fn put_rotation_policy(&self, policy: RotationPolicy) -> Result<()>;
    async fn delete_rotation_policy(&self, id: Id) -> Result<()>;

    // ── Retention policies ────────────────────────────────────────────────

    async fn get_retention_policy(&self, id: Id) -> Result<Option<RetentionPolicy>>;
    async fn list_retention_policies(&self) -> Result<Vec<RetentionPolicy>>;
    async fn put_retention_policy(&self, policy: RetentionPolicy) -> Result<()>;
    async fn delete_retention_policy(&self, id: Id) -> Result<()>;

    // ── Vaults ────────────────────────────────────────────────────────────

    async fn get_vault(&self, id: Id) -> Result<Option<Vault>>;
    async fn list_vaults(&self) -> Result<Vec<Vault>>;
    async fn put_vault(&self, vault: Vault) -> Result<()>;
    async fn delete_vault(&self, id: Id) -> Result<()>;

    // ── Ingesters ─────────────────────────────────────────────────────────

    async fn get_ingester(&self, id: Id) -> Result<Option<Ingester>>;
    async fn list_ingesters(&self) -> Result<Vec<Ingester>>;
    async fn put_ingester(&self, ingester: Ingester) -> Result<()>;
    async fn delete_ingester(&self, id: Id) -> Result<()>;

    // ── Certificates ──────────────────────────────────────────────────────

    async fn get_certificate(&self, id: Id) -> Result<Option<Certificate>>;
    async fn list_certificates(&self) -> Result<Vec<Certificate>>;
    async fn put_certificate(&self, certificate: Certificate) -> Result<()>;
    async fn delete_certificate(&self, id: Id) -> Result<()>;

    // ── Node configs ──────────────────────────────────────────────────────

    async fn get_node_config(&self, id: Id) -> Result<Option<NodeConfig>>;
    async fn list_node_configs(&self) -> Result<Vec<NodeConfig>>;
    async fn put_node_config(&self, node: NodeConfig) -> Result<()>;
    async fn delete_node_config(&self, id: Id) -> Result<()>;

    // ── Cluster TLS (singleton) ───────────────────────────────────────────

    async fn get_cluster_tls(&self) -> Result<Option<ClusterTls>>;
    async fn put_cluster_tls(&self, tls: ClusterTls) -> Result<()>;

    // ── Users ─────────────────────────────────────────────────────────────

    async fn create_user(&self, user: User) -> Result<()>;
    async fn get_user(&self, id: Id) -> Result<Option<User>>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn count_users(&self) -> Result<u64>;
    async fn update_user_password(
        &self,
        id: Id,
        password_hash: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn update_user_role(&self, id: Id, role: Role, updated_at: DateTime<Utc>)
        -> Result<()>;
    async fn update_username(
        &self,
        id: Id,
        username: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn invalidate_user_tokens(&self, id: Id, at: DateTime<Utc>) -> Result<()>;
    async fn put_user_preferences(
        &self,
        id: Id,
        preferences: BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn delete_user(&self, id: Id) -> Result<()>;

    // ── Refresh tokens ────────────────────────────────────────────────────

    async fn put_refresh_token(&self, token: RefreshToken) -> Result<()>;
    async fn get_refresh_token(&self, id: Id) -> Result<Option<RefreshToken>>;
    async fn get_refresh_token_by_hash(&self, hash: &str) -> Result<Option<RefreshToken>>;
    async fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>>;
    async fn delete_refresh_token(&self, id: Id) -> Result<()>;
    async fn delete_user_refresh_tokens(&self, user_id: Id) -> Result<()>;

    // ── Server settings (singleton) ───────────────────────────────────────

    async fn load_server_settings(&self) -> Result<Option<ServerSettings>>;
    async fn save_server_settings(&self, settings: ServerSettings) -> Result<()>;

    // ── Aggregate ─────────────────────────────────────────────────────────

    /// The full configuration, or `None` while the store is entirely fresh
    /// (no entity ever written, server settings never saved).
    async fn load(&self) -> Result<Option<Config>>;
}
