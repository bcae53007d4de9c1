//! Single-file JSON backend.
//!
//! On-disk format is a versioned envelope:
//!
//! ```json
//! { "version": 2, "config": { ... } }
//! ```
//!
//! Loading rules:
//! - no `version` field → hard error telling the operator to delete the
//!   file and re-bootstrap (the file predates versioning and cannot be
//!   trusted);
//! - `version` newer than this binary → hard error;
//! - `version` older → linear migration chain vN → vN+1, writing a
//!   `<path>.vN.bak` sidecar before each step, then the migrated file is
//!   rewritten at the current version.
//!
//! Users and refresh tokens live in a `<path>.users.json` sidecar created
//! with mode 0600 so credential hashes never share the config file's
//! (usually world-readable) permissions.
//!
//! Every write rewrites the whole file: serialize → temp file →
//! round-trip parse of the temp file → rename. A crash at any point leaves
//! either the old file or the new file, never a torn one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{
    Certificate, ClusterTls, Config, Filter, Id, Ingester, NodeConfig, RefreshToken,
    RetentionPolicy, Role, RotationPolicy, User, Vault,
};
use crate::settings::{self, ServerSettings};
use crate::store::{MemoryStore, Store};

/// Format version this binary writes.
pub const CURRENT_VERSION: u64 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u64,
    config: Config,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    refresh_tokens: Vec<RefreshToken>,
}

/// JSON-file-backed store. State is cached in a [`MemoryStore`]; every
/// mutation rewrites the file(s) atomically before returning.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    users_path: PathBuf,
    mem: MemoryStore,
    // One writer at a time: mutation + file rewrite is a critical section.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Open (and migrate, if needed) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<FileStore> {
        let path = path.into();
        let users_path = users_sidecar_path(&path);
        let store = FileStore {
            mem: MemoryStore::new(),
            write_lock: tokio::sync::Mutex::new(()),
            path,
            users_path,
        };

        if store.path.exists() {
            let config = load_config_file(&store.path)?;
            store.hydrate_config(config).await?;
        }
        if store.users_path.exists() {
            let users = load_users_file(&store.users_path)?;
            store.hydrate_users(users).await?;
        }
        // Rewrite at the current version so migrations apply exactly once.
        if store.path.exists() {
            store.persist().await?;
        }

        Ok(store)
    }

    async fn hydrate_config(&self, config: Config) -> Result<()> {
        for f in config.filters {
            self.mem.put_filter(f).await?;
        }
        for p in config.rotation_policies {
            self.mem.put_rotation_policy(p).await?;
        }
        for p in config.retention_policies {
            self.mem.put_retention_policy(p).await?;
        }
        for v in config.vaults {
            self.mem.put_vault(v).await?;
        }
        for i in config.ingesters {
            self.mem.put_ingester(i).await?;
        }
        for c in config.certificates {
            self.mem.put_certificate(c).await?;
        }
        for n in config.node_configs {
            self.mem.put_node_config(n).await?;
        }
        if let Some(tls) = config.cluster_tls {
            self.mem.put_cluster_tls(tls).await?;
        }
        if let Some(s) = config.server_settings {
            self.mem.save_server_settings(s).await?;
        }
        Ok(())
    }

    async fn hydrate_users(&self, users: UsersFile) -> Result<()> {
        for u in users.users {
            self.mem.create_user(u).await?;
        }
        for t in users.refresh_tokens {
            self.mem.put_refresh_token(t).await?;
        }
        Ok(())
    }

    /// Rewrite both files from the cached state.
    async fn persist(&self) -> Result<()> {
        let config = self.mem.load().await?.unwrap_or_default();
        let users = UsersFile {
            users: self.mem.list_users().await?,
            refresh_tokens: self.mem.list_refresh_tokens().await?,
        };

        write_config_file(&self.path, &config)?;
        write_users_file(&self.users_path, &users)?;
        Ok(())
    }
}

fn users_sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".users.json");
    PathBuf::from(os)
}

// ── File I/O ──────────────────────────────────────────────────────────────

fn load_config_file(path: &Path) -> Result<Config> {
    let raw = fs::read(path)?;
    let mut value: Value = serde_json::from_slice(&raw)
        .map_err(|e| Error::internal(anyhow::anyhow!("unparseable config file {path:?}: {e}")))?;

    let version = match value.get("version").and_then(Value::as_u64) {
        Some(v) => v,
        None => {
            return Err(Error::internal(anyhow::anyhow!(
                "config file {path:?} has no version field; it predates this release — \
                 delete it and re-bootstrap"
            )))
        }
    };
    if version > CURRENT_VERSION {
        return Err(Error::internal(anyhow::anyhow!(
            "config file {path:?} is version {version}, newer than this binary's \
             {CURRENT_VERSION}; refusing to load"
        )));
    }

    let mut current = version;
    while current < CURRENT_VERSION {
        write_backup(path, current, &value)?;
        migrate_step(current, &mut value)?;
        current += 1;
        info!(from = current - 1, to = current, "migrated config file");
    }

    let config_value = value
        .get("config")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(config_value)
        .map_err(|e| Error::internal(anyhow::anyhow!("unparseable config in {path:?}: {e}")))
}

/// One step of the linear migration chain.
fn migrate_step(from: u64, value: &mut Value) -> Result<()> {
    match from {
        // v1 stored server settings with the legacy flat lookup/auth fields.
        1 => {
            if let Some(ss) = value
                .get_mut("config")
                .and_then(|c| c.get_mut("server_settings"))
            {
                settings::migrate_legacy_shape(ss);
            }
            if let Some(v) = value.get_mut("version") {
                *v = Value::from(2u64);
            }
            Ok(())
        }
        other => Err(Error::internal(anyhow::anyhow!(
            "no migration from config file version {other}"
        ))),
    }
}

fn write_backup(path: &Path, version: u64, value: &Value) -> Result<()> {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".v{version}.bak"));
    let backup = PathBuf::from(os);
    let bytes = serde_json::to_vec_pretty(value).map_err(Error::internal)?;
    fs::write(&backup, bytes)?;
    debug!(backup = %backup.display(), "wrote pre-migration backup");
    Ok(())
}

fn load_users_file(path: &Path) -> Result<UsersFile> {
    let raw = fs::read(path)?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::internal(anyhow::anyhow!("unparseable users file {path:?}: {e}")))
}

/// Temp file + round-trip parse + rename.
fn write_atomically(path: &Path, bytes: &[u8], mode_0600: bool) -> Result<()> {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    let tmp = PathBuf::from(os);

    fs::write(&tmp, bytes)?;
    #[cfg(unix)]
    if mode_0600 {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = mode_0600;

    // Round-trip validation: the temp file must parse back before it may
    // replace the live file.
    let reread = fs::read(&tmp)?;
    serde_json::from_slice::<Value>(&reread)
        .map_err(|e| Error::internal(anyhow::anyhow!("round-trip validation failed: {e}")))?;

    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_config_file(path: &Path, config: &Config) -> Result<()> {
    let envelope = Envelope {
        version: CURRENT_VERSION,
        config: config.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&envelope).map_err(Error::internal)?;
    write_atomically(path, &bytes, false)
}

fn write_users_file(path: &Path, users: &UsersFile) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(users).map_err(Error::internal)?;
    write_atomically(path, &bytes, true)
}

// ── Store implementation ──────────────────────────────────────────────────

macro_rules! write_through {
    ($self:ident, $op:expr) => {{
        let _guard = $self.write_lock.lock().await;
        $op?;
        $self.persist().await
    }};
}

#[async_trait]
impl Store for FileStore {
    async fn get_filter(&self, id: Id) -> Result<Option<Filter>> {
        self.mem.get_filter(id).await
    }

    async fn list_filters(&self) -> Result<Vec<Filter>> {
        self.mem.list_filters().await
    }

    async fn put_filter(&self, filter: Filter) -> Result<()> {
        write_through!(self, self.mem.put_filter(filter).await)
    }

    async fn delete_filter(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_filter(id).await)
    }

    async fn get_rotation_policy(&self, id: Id) -> Result<Option<RotationPolicy>> {
        self.mem.get_rotation_policy(id).await
    }

    async fn list_rotation_policies(&self) -> Result<Vec<RotationPolicy>> {
        self.mem.list_rotation_policies().await
    }

    async fn put_rotation_policy(&self, policy: RotationPolicy) -> Result<()> {
        write_through!(self, self.mem.put_rotation_policy(policy).await)
    }

    async fn delete_rotation_policy(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_rotation_policy(id).await)
    }

    async fn get_retention_policy(&self, id: Id) -> Result<Option<RetentionPolicy>> {
        self.mem.get_retention_policy(id).await
    }

    async fn list_retention_policies(&self) -> Result<Vec<RetentionPolicy>> {
        self.mem.list_retention_policies().await
    }

    async fn put_retention_policy(&self, policy: RetentionPolicy) -> Result<()> {
        write_through!(self, self.mem.put_retention_policy(policy).await)
    }

    async fn delete_retention_policy(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_retention_policy(id).await)
    }

    async fn get_vault(&self, id: Id) -> Result<Option<Vault>> {
        self.mem.get_vault(id).await
    }

    async fn list_vaults(&self) -> Result<Vec<Vault>> {
        self.mem.list_vaults().await
    }

    async fn put_vault(&self, vault: Vault) -> Result<()> {
        write_through!(self, self.mem.put_vault(vault).await)
    }

    async fn delete_vault(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_vault(id).await)
    }

    async fn get_ingester(&self, id: Id) -> Result<Option<Ingester>> {
        self.mem.get_ingester(id).await
    }

    async fn list_ingesters(&self) -> Result<Vec<Ingester>> {
        self.mem.list_ingesters().await
    }

    async fn put_ingester(&self, ingester: Ingester) -> Result<()> {
        write_through!(self, self.mem.put_ingester(ingester).await)
    }

    async fn delete_ingester(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_ingester(id).await)
    }

    async fn get_certificate(&self, id: Id) -> Result<Option<Certificate>> {
        self.mem.get_certificate(id).await
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        self.mem.list_certificates().await
    }

    async fn put_certificate(&self, certificate: Certificate) -> Result<()> {
        write_through!(self, self.mem.put_certificate(certificate).await)
    }

    async fn delete_certificate(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_certificate(id).await)
    }

    async fn get_node_config(&self, id: Id) -> Result<Option<NodeConfig>> {
        self.mem.get_node_config(id).await
    }

    async fn list_node_configs(&self) -> Result<Vec<NodeConfig>> {
        self.mem.list_node_configs().await
    }

    async fn put_node_config(&self, node: NodeConfig) -> Result<()> {
        write_through!(self, self.mem.put_node_config(node).await)
    }

    async fn delete_node_config(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_node_config(id).await)
    }

    async fn get_cluster_tls(&self) -> Result<Option<ClusterTls>> {
        self.mem.get_cluster_tls().await
    }

    async fn put_cluster_tls(&self, tls: ClusterTls) -> Result<()> {
        write_through!(self, self.mem.put_cluster_tls(tls).await)
    }

    async fn create_user(&self, user: User) -> Result<()> {
        write_through!(self, self.mem.create_user(user).await)
    }

    async fn get_user(&self, id: Id) -> Result<Option<User>> {
        self.mem.get_user(id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.mem.get_user_by_username(username).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.mem.list_users().await
    }

    async fn count_users(&self) -> Result<u64> {
        self.mem.count_users().await
    }

    async fn update_user_password(
        &self,
        id: Id,
        password_hash: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        write_through!(
            self,
            self.mem.update_user_password(id, password_hash, updated_at).await
        )
    }

    async fn update_user_role(
        &self,
        id: Id,
        role: Role,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        write_through!(self, self.mem.update_user_role(id, role, updated_at).await)
    }

    async fn update_username(
        &self,
        id: Id,
        username: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        write_through!(self, self.mem.update_username(id, username, updated_at).await)
    }

    async fn invalidate_user_tokens(&self, id: Id, at: DateTime<Utc>) -> Result<()> {
        write_through!(self, self.mem.invalidate_user_tokens(id, at).await)
    }

    async fn put_user_preferences(
        &self,
        id: Id,
        preferences: BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        write_through!(
            self,
            self.mem.put_user_preferences(id, preferences, updated_at).await
        )
    }

    async fn delete_user(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_user(id).await)
    }

    async fn put_refresh_token(&self, token: RefreshToken) -> Result<()> {
        write_through!(self, self.mem.put_refresh_token(token).await)
    }

    async fn get_refresh_token(&self, id: Id) -> Result<Option<RefreshToken>> {
        self.mem.get_refresh_token(id).await
    }

    async fn get_refresh_token_by_hash(&self, hash: &str) -> Result<Option<RefreshToken>> {
        self.mem.get_refresh_token_by_hash(hash).await
    }

    async fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>> {
        self.mem.list_refresh_tokens().await
    }

    async fn delete_refresh_token(&self, id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_refresh_token(id).await)
    }

    async fn delete_user_refresh_tokens(&self, user_id: Id) -> Result<()> {
        write_through!(self, self.mem.delete_user_refresh_tokens(user_id).await)
    }

    async fn load_server_settings(&self) -> Result<Option<ServerSettings>> {
        self.mem.load_server_settings().await
    }

    async fn save_server_settings(&self, settings: ServerSettings) -> Result<()> {
        write_through!(self, self.mem.save_server_settings(settings).await)
    }

    async fn load(&self) -> Result<Option<Config>> {
        self.mem.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_missing_file_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("config.json")).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let filter = Filter {
            id: Id::new(),
            name: "all".to_string(),
            expression: "*".to_string(),
        };
        {
            let store = FileStore::open(&path).await.unwrap();
            store.put_filter(filter.clone()).await.unwrap();
        }
        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.get_filter(filter.id).await.unwrap(), Some(filter));
    }

    #[tokio::test]
    async fn unversioned_file_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"config": {}}"#).unwrap();

        let err = FileStore::open(&path).await.unwrap_err();
        assert!(err.to_string().contains("re-bootstrap"));
    }

    #[tokio::test]
    async fn newer_version_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version": 99, "config": {}}"#).unwrap();

        let err = FileStore::open(&path).await.unwrap_err();
        assert!(err.to_string().contains("newer"));
    }

    #[tokio::test]
    async fn v1_migrates_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "version": 1,
                "config": {
                    "server_settings": {
                        "lookup": {"geoip_db_path": "/geo.mmdb"},
                        "auth": {"min_password_length": 14}
                    }
                }
            }"#,
        )
        .unwrap();

        let store = FileStore::open(&path).await.unwrap();
        let settings = store.load_server_settings().await.unwrap().expect("settings");
        assert_eq!(settings.lookup.maxmind.geoip_db_path, "/geo.mmdb");
        assert_eq!(settings.auth.password_policy.min_length, 14);

        // Pre-migration backup sits next to the file.
        assert!(dir.path().join("config.json.v1.bak").exists());

        // The rewritten file is at the current version.
        let reread: Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(reread["version"].as_u64(), Some(CURRENT_VERSION));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn users_sidecar_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = FileStore::open(&path).await.unwrap();

        let now = Utc::now();
        store
            .create_user(User {
                id: Id::new(),
                username: "ada".to_string(),
                password_hash: "h".to_string(),
                role: Role::Admin,
                preferences: BTreeMap::new(),
                token_invalidated_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let sidecar = dir.path().join("config.json.users.json");
        let mode = fs::metadata(&sidecar).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
