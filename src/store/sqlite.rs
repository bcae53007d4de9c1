//! Embedded SQL backend.
//!
//! Opens `<dir>/config.db` with WAL journaling, foreign keys on, and STRICT
//! tables. Mutations serialise through a single connection — the config
//! store is never on the ingest hot path, so one writer is plenty and it
//! sidesteps SQLite's multi-writer contention entirely.
//!
//! Schema migrations are embedded as ordered `NNN_name.sql` files. Each
//! pending migration runs in its own transaction, is recorded in
//! `schema_migrations`, and is followed by a `PRAGMA foreign_key_check`
//! before commit so a bad migration can never land half-applied.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::command::{from_us, to_us};
use crate::error::{Error, Result};
use crate::model::{
    Certificate, ClusterTls, Config, Filter, Id, Ingester, NodeConfig, RefreshToken,
    RetentionPolicy, RetentionRule, Role, RotationPolicy, User, Vault,
};
use crate::settings::{ServerSettings, SERVER_SETTINGS_KEY};
use crate::store::Store;

/// Ordered migration chain. Append only; never edit an applied entry.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "init", include_str!("migrations/001_init.sql")),
    (2, "users", include_str!("migrations/002_users.sql")),
    (3, "cluster", include_str!("migrations/003_cluster.sql")),
];

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

fn sql_err(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(ref f, ref msg) = e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Conflict(
                msg.clone().unwrap_or_else(|| "constraint violation".to_string()),
            );
        }
    }
    Error::internal(e)
}

fn json_map(raw: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(raw)
        .map_err(|e| Error::internal(anyhow::anyhow!("malformed params column: {e}")))
}

fn map_json(map: &BTreeMap<String, String>) -> Result<String> {
    serde_json::to_string(map).map_err(Error::internal)
}

impl SqliteStore {
    /// Open (creating and migrating as needed) the database in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<SqliteStore> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join("config.db");

        let conn = Connection::open(&path).map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sql_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(sql_err)?;
        conn.pragma_update(None, "busy_timeout", 5_000).map_err(sql_err)?;

        let store = SqliteStore {
            conn: Mutex::new(conn),
            path,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Path of the database file (`<dir>/config.db`).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 version INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 applied_at TEXT NOT NULL
             ) STRICT;",
        )
        .map_err(sql_err)?;

        let applied: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(sql_err)?;

        for (version, name, sql) in MIGRATIONS {
            if *version <= applied {
                continue;
            }
            let tx = conn.transaction().map_err(sql_err)?;
            tx.execute_batch(sql).map_err(sql_err)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at)
                 VALUES (?1, ?2, datetime('now'))",
                params![version, name],
            )
            .map_err(sql_err)?;

            // A migration that leaves a dangling reference must not land.
            let violations: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM pragma_foreign_key_check",
                    [],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            if violations > 0 {
                return Err(Error::internal(anyhow::anyhow!(
                    "migration {version}_{name} violates {violations} foreign key(s)"
                )));
            }
            tx.commit().map_err(sql_err)?;
            info!(version, name, "applied schema migration");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    // ── Filters ───────────────────────────────────────────────────────────

    async fn get_filter(&self, id: Id) -> Result<Option<Filter>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, expression FROM filters WHERE id = ?1",
                params![id.to_string()],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)),
            )
            .optional()
            .map_err(sql_err)?;
        row.map(|(id, name, expression)| {
            Ok(Filter {
                id: id.parse()?,
                name,
                expression,
            })
        })
        .transpose()
    }

    async fn list_filters(&self) -> Result<Vec<Filter>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, name, expression FROM filters ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter()
            .map(|(id, name, expression)| {
                Ok(Filter {
                    id: id.parse()?,
                    name,
                    expression,
                })
            })
            .collect()
    }

    async fn put_filter(&self, filter: Filter) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO filters (id, name, expression) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                                           expression = excluded.expression",
            params![filter.id.to_string(), filter.name, filter.expression],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_filter(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM filters WHERE id = ?1", params![id.to_string()])
            .map_err(sql_err)?;
        Ok(())
    }

    // ── Rotation policies ─────────────────────────────────────────────────

    async fn get_rotation_policy(&self, id: Id) -> Result<Option<RotationPolicy>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, max_bytes, max_age, max_records, cron
                 FROM rotation_policies WHERE id = ?1",
                params![id.to_string()],
                rotation_policy_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_rotation_policy).transpose()
    }

    async fn list_rotation_policies(&self) -> Result<Vec<RotationPolicy>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, max_bytes, max_age, max_records, cron
                 FROM rotation_policies ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], rotation_policy_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(raw_rotation_policy).collect()
    }

    async fn put_rotation_policy(&self, policy: RotationPolicy) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rotation_policies (id, name, max_bytes, max_age, max_records, cron)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                                           max_bytes = excluded.max_bytes,
                                           max_age = excluded.max_age,
                                           max_records = excluded.max_records,
                                           cron = excluded.cron",
            params![
                policy.id.to_string(),
                policy.name,
                policy.max_bytes,
                policy.max_age,
                policy.max_records,
                policy.cron
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_rotation_policy(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM rotation_policies WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ── Retention policies ────────────────────────────────────────────────

    async fn get_retention_policy(&self, id: Id) -> Result<Option<RetentionPolicy>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, max_age, max_bytes, max_chunks
                 FROM retention_policies WHERE id = ?1",
                params![id.to_string()],
                retention_policy_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_retention_policy).transpose()
    }

    async fn list_retention_policies(&self) -> Result<Vec<RetentionPolicy>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, max_age, max_bytes, max_chunks
                 FROM retention_policies ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], retention_policy_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(raw_retention_policy).collect()
    }

    async fn put_retention_policy(&self, policy: RetentionPolicy) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO retention_policies (id, name, max_age, max_bytes, max_chunks)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                                           max_age = excluded.max_age,
                                           max_bytes = excluded.max_bytes,
                                           max_chunks = excluded.max_chunks",
            params![
                policy.id.to_string(),
                policy.name,
                policy.max_age,
                policy.max_bytes,
                policy.max_chunks
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_retention_policy(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM retention_policies WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ── Vaults ────────────────────────────────────────────────────────────

    async fn get_vault(&self, id: Id) -> Result<Option<Vault>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, type, filter_id, policy_id, enabled, params, node_id
                 FROM vaults WHERE id = ?1",
                params![id.to_string()],
                vault_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(|raw| raw_vault(&conn, raw)).transpose()
    }

    async fn list_vaults(&self) -> Result<Vec<Vault>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, type, filter_id, policy_id, enabled, params, node_id
                 FROM vaults ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], vault_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(|raw| raw_vault(&conn, raw)).collect()
    }

    async fn put_vault(&self, vault: Vault) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(sql_err)?;
        // Replace wholesale: the rules rows cascade with the vault row.
        tx.execute("DELETE FROM vaults WHERE id = ?1", params![vault.id.to_string()])
            .map_err(sql_err)?;
        tx.execute(
            "INSERT INTO vaults (id, name, type, filter_id, policy_id, enabled, params, node_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                vault.id.to_string(),
                vault.name,
                vault.kind,
                vault.filter.map(|f| f.to_string()),
                vault.policy.map(|p| p.to_string()),
                vault.enabled as i64,
                map_json(&vault.params)?,
                vault.node_id
            ],
        )
        .map_err(sql_err)?;
        for (position, rule) in vault.retention_rules.iter().enumerate() {
            tx.execute(
                "INSERT INTO store_retention_rules
                     (vault_id, position, retention_policy_id, action, destination)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    vault.id.to_string(),
                    position as i64,
                    rule.retention_policy_id.to_string(),
                    rule.action.as_str(),
                    rule.destination.map(|d| d.to_string())
                ],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    async fn delete_vault(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM vaults WHERE id = ?1", params![id.to_string()])
            .map_err(sql_err)?;
        Ok(())
    }

    // ── Ingesters ─────────────────────────────────────────────────────────

    async fn get_ingester(&self, id: Id) -> Result<Option<Ingester>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, type, enabled, params, node_id
                 FROM ingesters WHERE id = ?1",
                params![id.to_string()],
                ingester_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_ingester).transpose()
    }

    async fn list_ingesters(&self) -> Result<Vec<Ingester>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, type, enabled, params, node_id
                 FROM ingesters ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], ingester_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(raw_ingester).collect()
    }

    async fn put_ingester(&self, ingester: Ingester) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ingesters (id, name, type, enabled, params, node_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                                           type = excluded.type,
                                           enabled = excluded.enabled,
                                           params = excluded.params,
                                           node_id = excluded.node_id",
            params![
                ingester.id.to_string(),
                ingester.name,
                ingester.kind,
                ingester.enabled as i64,
                map_json(&ingester.params)?,
                ingester.node_id
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_ingester(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM ingesters WHERE id = ?1", params![id.to_string()])
            .map_err(sql_err)?;
        Ok(())
    }

    // ── Certificates ──────────────────────────────────────────────────────

    async fn get_certificate(&self, id: Id) -> Result<Option<Certificate>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, cert_pem, key_pem, cert_file, key_file
                 FROM tls_certificates WHERE id = ?1",
                params![id.to_string()],
                certificate_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_certificate).transpose()
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, cert_pem, key_pem, cert_file, key_file
                 FROM tls_certificates ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], certificate_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(raw_certificate).collect()
    }

    async fn put_certificate(&self, certificate: Certificate) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tls_certificates (id, name, cert_pem, key_pem, cert_file, key_file)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                                           cert_pem = excluded.cert_pem,
                                           key_pem = excluded.key_pem,
                                           cert_file = excluded.cert_file,
                                           key_file = excluded.key_file",
            params![
                certificate.id.to_string(),
                certificate.name,
                certificate.cert_pem,
                certificate.key_pem,
                certificate.cert_file,
                certificate.key_file
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_certificate(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM tls_certificates WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ── Node configs ──────────────────────────────────────────────────────

    async fn get_node_config(&self, id: Id) -> Result<Option<NodeConfig>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name FROM node_configs WHERE id = ?1",
                params![id.to_string()],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(sql_err)?;
        row.map(|(id, name)| Ok(NodeConfig { id: id.parse()?, name }))
            .transpose()
    }

    async fn list_node_configs(&self) -> Result<Vec<NodeConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, name FROM node_configs ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter()
            .map(|(id, name)| Ok(NodeConfig { id: id.parse()?, name }))
            .collect()
    }

    async fn put_node_config(&self, node: NodeConfig) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO node_configs (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![node.id.to_string(), node.name],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_node_config(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM node_configs WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ── Cluster TLS ───────────────────────────────────────────────────────

    async fn get_cluster_tls(&self) -> Result<Option<ClusterTls>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT ca_cert_pem, ca_key_pem, cluster_cert_pem, cluster_key_pem, join_token
             FROM cluster_tls WHERE id = 1",
            [],
            |r| {
                Ok(ClusterTls {
                    ca_cert_pem: r.get(0)?,
                    ca_key_pem: r.get(1)?,
                    cluster_cert_pem: r.get(2)?,
                    cluster_key_pem: r.get(3)?,
                    join_token: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(sql_err)
    }

    async fn put_cluster_tls(&self, tls: ClusterTls) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cluster_tls
                 (id, ca_cert_pem, ca_key_pem, cluster_cert_pem, cluster_key_pem, join_token)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET ca_cert_pem = excluded.ca_cert_pem,
                                           ca_key_pem = excluded.ca_key_pem,
                                           cluster_cert_pem = excluded.cluster_cert_pem,
                                           cluster_key_pem = excluded.cluster_key_pem,
                                           join_token = excluded.join_token",
            params![
                tls.ca_cert_pem,
                tls.ca_key_pem,
                tls.cluster_cert_pem,
                tls.cluster_key_pem,
                tls.join_token
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────────

    async fn create_user(&self, user: User) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let id_taken: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                params![user.id.to_string()],
                |r| r.get(0),
            )
            .map_err(sql_err)?;
        if id_taken {
            return Err(Error::Conflict(format!("user {} already exists", user.id)));
        }
        let name_taken: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                params![user.username],
                |r| r.get(0),
            )
            .map_err(sql_err)?;
        if name_taken {
            return Err(Error::Conflict(format!(
                "username {:?} already taken",
                user.username
            )));
        }

        conn.execute(
            "INSERT INTO users
                 (id, username, password_hash, role, preferences,
                  token_invalidated_at_us, created_at_us, updated_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.id.to_string(),
                user.username,
                user.password_hash,
                user.role.as_str(),
                map_json(&user.preferences)?,
                user.token_invalidated_at.map(to_us),
                to_us(user.created_at),
                to_us(user.updated_at)
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_user(&self, id: Id) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, username, password_hash, role, preferences,
                        token_invalidated_at_us, created_at_us, updated_at_us
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                user_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_user).transpose()
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, username, password_hash, role, preferences,
                        token_invalidated_at_us, created_at_us, updated_at_us
                 FROM users WHERE username = ?1",
                params![username],
                user_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_user).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, username, password_hash, role, preferences,
                        token_invalidated_at_us, created_at_us, updated_at_us
                 FROM users ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], user_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(raw_user).collect()
    }

    async fn count_users(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .map_err(sql_err)?;
        Ok(count as u64)
    }

    async fn update_user_password(
        &self,
        id: Id,
        password_hash: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE users SET password_hash = ?2, updated_at_us = ?3 WHERE id = ?1",
                params![id.to_string(), password_hash, to_us(updated_at)],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn update_user_role(
        &self,
        id: Id,
        role: Role,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE users SET role = ?2, updated_at_us = ?3 WHERE id = ?1",
                params![id.to_string(), role.as_str(), to_us(updated_at)],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn update_username(
        &self,
        id: Id,
        username: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let taken: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 AND id <> ?2)",
                params![username, id.to_string()],
                |r| r.get(0),
            )
            .map_err(sql_err)?;
        if taken {
            return Err(Error::Conflict(format!("username {username:?} already taken")));
        }
        let changed = conn
            .execute(
                "UPDATE users SET username = ?2, updated_at_us = ?3 WHERE id = ?1",
                params![id.to_string(), username, to_us(updated_at)],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn invalidate_user_tokens(&self, id: Id, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE users SET token_invalidated_at_us = ?2, updated_at_us = ?2
                 WHERE id = ?1",
                params![id.to_string(), to_us(at)],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn put_user_preferences(
        &self,
        id: Id,
        preferences: BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE users SET preferences = ?2, updated_at_us = ?3 WHERE id = ?1",
                params![id.to_string(), map_json(&preferences)?, to_us(updated_at)],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn delete_user(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // refresh_tokens rows cascade via the FK.
        let changed = conn
            .execute("DELETE FROM users WHERE id = ?1", params![id.to_string()])
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    // ── Refresh tokens ────────────────────────────────────────────────────

    async fn put_refresh_token(&self, token: RefreshToken) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at_us, created_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id,
                                           token_hash = excluded.token_hash,
                                           expires_at_us = excluded.expires_at_us,
                                           created_at_us = excluded.created_at_us",
            params![
                token.id.to_string(),
                token.user_id.to_string(),
                token.token_hash,
                to_us(token.expires_at),
                to_us(token.created_at)
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_refresh_token(&self, id: Id) -> Result<Option<RefreshToken>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, user_id, token_hash, expires_at_us, created_at_us
                 FROM refresh_tokens WHERE id = ?1",
                params![id.to_string()],
                refresh_token_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_refresh_token).transpose()
    }

    async fn get_refresh_token_by_hash(&self, hash: &str) -> Result<Option<RefreshToken>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, user_id, token_hash, expires_at_us, created_at_us
                 FROM refresh_tokens WHERE token_hash = ?1",
                params![hash],
                refresh_token_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(raw_refresh_token).transpose()
    }

    async fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, token_hash, expires_at_us, created_at_us
                 FROM refresh_tokens ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], refresh_token_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(raw_refresh_token).collect()
    }

    async fn delete_refresh_token(&self, id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM refresh_tokens WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_user_refresh_tokens(&self, user_id: Id) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM refresh_tokens WHERE user_id = ?1",
            params![user_id.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ── Server settings ───────────────────────────────────────────────────

    async fn load_server_settings(&self) -> Result<Option<ServerSettings>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SERVER_SETTINGS_KEY],
                |r| r.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(|raw| ServerSettings::from_json(&raw)).transpose()
    }

    async fn save_server_settings(&self, settings: ServerSettings) -> Result<()> {
        let value = settings.to_json()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SERVER_SETTINGS_KEY, value],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ── Aggregate ─────────────────────────────────────────────────────────

    async fn load(&self) -> Result<Option<Config>> {
        let fresh = {
            let conn = self.conn.lock().unwrap();
            let populated: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM filters)
                         OR EXISTS(SELECT 1 FROM rotation_policies)
                         OR EXISTS(SELECT 1 FROM retention_policies)
                         OR EXISTS(SELECT 1 FROM vaults)
                         OR EXISTS(SELECT 1 FROM ingesters)
                         OR EXISTS(SELECT 1 FROM tls_certificates)
                         OR EXISTS(SELECT 1 FROM node_configs)
                         OR EXISTS(SELECT 1 FROM users)
                         OR EXISTS(SELECT 1 FROM refresh_tokens)
                         OR EXISTS(SELECT 1 FROM cluster_tls)
                         OR EXISTS(SELECT 1 FROM settings WHERE key = ?1)",
                    params![SERVER_SETTINGS_KEY],
                    |r| r.get(0),
                )
                .map_err(sql_err)?;
            !populated
        };
        if fresh {
            return Ok(None);
        }

        Ok(Some(Config {
            filters: self.list_filters().await?,
            rotation_policies: self.list_rotation_policies().await?,
            retention_policies: self.list_retention_policies().await?,
            vaults: self.list_vaults().await?,
            ingesters: self.list_ingesters().await?,
            certificates: self.list_certificates().await?,
            node_configs: self.list_node_configs().await?,
            cluster_tls: self.get_cluster_tls().await?,
            server_settings: self.load_server_settings().await?,
        }))
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────

type RotationPolicyRow = (String, String, Option<String>, Option<String>, Option<i64>, Option<String>);

fn rotation_policy_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RotationPolicyRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

fn raw_rotation_policy(raw: RotationPolicyRow) -> Result<RotationPolicy> {
    let (id, name, max_bytes, max_age, max_records, cron) = raw;
    Ok(RotationPolicy {
        id: id.parse()?,
        name,
        max_bytes,
        max_age,
        max_records,
        cron,
    })
}

type RetentionPolicyRow = (String, String, Option<String>, Option<String>, Option<i64>);

fn retention_policy_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RetentionPolicyRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn raw_retention_policy(raw: RetentionPolicyRow) -> Result<RetentionPolicy> {
    let (id, name, max_age, max_bytes, max_chunks) = raw;
    Ok(RetentionPolicy {
        id: id.parse()?,
        name,
        max_age,
        max_bytes,
        max_chunks,
    })
}

type VaultRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    String,
    String,
);

fn vault_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<VaultRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn raw_vault(conn: &Connection, raw: VaultRow) -> Result<Vault> {
    let (id, name, kind, filter_id, policy_id, enabled, params, node_id) = raw;

    let mut stmt = conn
        .prepare(
            "SELECT retention_policy_id, action, destination
             FROM store_retention_rules WHERE vault_id = ?1 ORDER BY position",
        )
        .map_err(sql_err)?;
    let rule_rows = stmt
        .query_map(params![id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })
        .map_err(sql_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_err)?;

    let retention_rules = rule_rows
        .into_iter()
        .map(|(policy_id, action, destination)| {
            Ok(RetentionRule {
                retention_policy_id: policy_id.parse()?,
                action: action.parse()?,
                destination: destination.as_deref().map(str::parse).transpose()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Vault {
        id: id.parse()?,
        name,
        kind,
        filter: filter_id.as_deref().map(str::parse).transpose()?,
        policy: policy_id.as_deref().map(str::parse).transpose()?,
        retention_rules,
        enabled: enabled != 0,
        params: json_map(&params)?,
        node_id,
    })
}

type IngesterRow = (String, String, String, i64, String, String);

fn ingester_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<IngesterRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

fn raw_ingester(raw: IngesterRow) -> Result<Ingester> {
    let (id, name, kind, enabled, params, node_id) = raw;
    Ok(Ingester {
        id: id.parse()?,
        name,
        kind,
        enabled: enabled != 0,
        params: json_map(&params)?,
        node_id,
    })
}

type CertificateRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn certificate_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CertificateRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

fn raw_certificate(raw: CertificateRow) -> Result<Certificate> {
    let (id, name, cert_pem, key_pem, cert_file, key_file) = raw;
    Ok(Certificate {
        id: id.parse()?,
        name,
        cert_pem,
        key_pem,
        cert_file,
        key_file,
    })
}

type UserRow = (String, String, String, String, String, Option<i64>, i64, i64);

fn user_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn raw_user(raw: UserRow) -> Result<User> {
    let (id, username, password_hash, role, preferences, invalidated, created, updated) = raw;
    Ok(User {
        id: id.parse()?,
        username,
        password_hash,
        role: role.parse()?,
        preferences: json_map(&preferences)?,
        token_invalidated_at: invalidated.map(from_us).transpose()?,
        created_at: from_us(created)?,
        updated_at: from_us(updated)?,
    })
}

type RefreshTokenRow = (String, String, String, i64, i64);

fn refresh_token_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RefreshTokenRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn raw_refresh_token(raw: RefreshTokenRow) -> Result<RefreshToken> {
    let (id, user_id, token_hash, expires, created) = raw;
    Ok(RefreshToken {
        id: id.parse()?,
        user_id: user_id.parse()?,
        token_hash,
        expires_at: from_us(expires)?,
        created_at: from_us(created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn migrations_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _ = SqliteStore::open(dir.path()).unwrap();
        }
        // Reopen: the ledger prevents re-running CREATE TABLE.
        let store = SqliteStore::open(dir.path()).unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(dir.path().join("config.db").exists());
    }

    #[tokio::test]
    async fn vault_rules_cascade_with_vault_row() {
        let (_dir, store) = open_temp();
        let vault = Vault {
            id: Id::new(),
            name: "cold".to_string(),
            kind: "disk".to_string(),
            filter: None,
            policy: None,
            retention_rules: vec![RetentionRule {
                retention_policy_id: Id::new(),
                action: crate::model::RetentionAction::Expire,
                destination: None,
            }],
            enabled: true,
            params: BTreeMap::new(),
            node_id: String::new(),
        };
        store.put_vault(vault.clone()).await.unwrap();
        store.delete_vault(vault.id).await.unwrap();

        let conn = store.conn.lock().unwrap();
        let rules: i64 = conn
            .query_row("SELECT COUNT(*) FROM store_retention_rules", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rules, 0);
    }

    #[tokio::test]
    async fn deleting_user_drops_their_tokens() {
        let (_dir, store) = open_temp();
        let now = crate::model::truncate_micros(Utc::now());
        let user = User {
            id: Id::new(),
            username: "ada".to_string(),
            password_hash: "h".to_string(),
            role: Role::Admin,
            preferences: BTreeMap::new(),
            token_invalidated_at: None,
            created_at: now,
            updated_at: now,
        };
        store.create_user(user.clone()).await.unwrap();
        store
            .put_refresh_token(RefreshToken {
                id: Id::new(),
                user_id: user.id,
                token_hash: "abc".to_string(),
                expires_at: now,
                created_at: now,
            })
            .await
            .unwrap();

        store.delete_user(user.id).await.unwrap();
        assert!(store.list_refresh_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_survive_reopen_with_legacy_migration() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            // Simulate an old row written before the nested settings shape.
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)",
                params![
                    SERVER_SETTINGS_KEY,
                    r#"{"auth": {"min_password_length": 10}}"#
                ],
            )
            .unwrap();
        }
        let store = SqliteStore::open(dir.path()).unwrap();
        let settings = store.load_server_settings().await.unwrap().unwrap();
        assert_eq!(settings.auth.password_policy.min_length, 10);
    }
}
