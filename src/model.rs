//! Typed configuration entities.
//!
//! Every entity carries a stable [`Id`] (UUIDv7 — time-ordered, so sorting
//! by ID is sorting by creation time) and a mutable human-readable `Name`.
//! The store persists these records opaquely; semantic validation of
//! expressions, type strings, and cross-references lives in the consumers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::units;

// ── Identifiers ───────────────────────────────────────────────────────────

/// Time-ordered 128-bit entity identifier (UUIDv7).
///
/// Lexicographic byte comparison yields creation order, which is what makes
/// `BTreeMap<Id, _>` enumeration equal ID-ascending equal oldest-first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(Uuid);

impl Id {
    /// Mint a fresh time-ordered identifier.
    pub fn new() -> Self {
        Id(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Id)
            .map_err(|_| Error::InvalidArgument(format!("malformed identifier: {s:?}")))
    }
}

/// Anything with a primary key. Lets the in-memory store keep one generic
/// table implementation for all entity kinds.
pub trait Entity: Clone {
    fn entity_id(&self) -> Id;
}

// ── Timestamps ────────────────────────────────────────────────────────────

/// Truncate a timestamp to microsecond precision.
///
/// The wire formats carry microseconds; comparisons at any boundary must
/// truncate first so an in-memory value never fails equality against its
/// own round-trip.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_micros(ts.timestamp_micros())
        .single()
        .unwrap_or(ts)
}

// ── Filters ───────────────────────────────────────────────────────────────

/// Sentinel expression matching every record.
pub const FILTER_MATCH_ALL: &str = "*";
/// Sentinel expression matching records no other filter matched.
pub const FILTER_RESIDUAL: &str = "+";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: Id,
    pub name: String,
    pub expression: String,
}

impl Entity for Filter {
    fn entity_id(&self) -> Id {
        self.id
    }
}

// ── Rotation / retention policies ─────────────────────────────────────────

/// Rotation fires when any configured threshold is crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub id: Id,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

impl RotationPolicy {
    pub fn max_bytes_value(&self) -> Result<Option<u64>, Error> {
        self.max_bytes.as_deref().map(units::parse_bytes).transpose()
    }

    pub fn max_age_value(&self) -> Result<Option<std::time::Duration>, Error> {
        self.max_age.as_deref().map(units::parse_duration).transpose()
    }

    /// Reject malformed threshold strings. The store persists the record
    /// either way; callers validate before scheduling rotation.
    pub fn validate(&self) -> Result<(), Error> {
        self.max_bytes_value()?;
        self.max_age_value()?;
        if let Some(cron) = &self.cron {
            units::validate_cron(cron)?;
        }
        Ok(())
    }
}

impl Entity for RotationPolicy {
    fn entity_id(&self) -> Id {
        self.id
    }
}

/// Retention fires when any configured threshold is crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: Id,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunks: Option<i64>,
}

impl RetentionPolicy {
    pub fn max_bytes_value(&self) -> Result<Option<u64>, Error> {
        self.max_bytes.as_deref().map(units::parse_bytes).transpose()
    }

    pub fn max_age_value(&self) -> Result<Option<std::time::Duration>, Error> {
        self.max_age.as_deref().map(units::parse_duration).transpose()
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.max_bytes_value()?;
        self.max_age_value()?;
        Ok(())
    }
}

impl Entity for RetentionPolicy {
    fn entity_id(&self) -> Id {
        self.id
    }
}

// ── Vaults ────────────────────────────────────────────────────────────────

/// What to do with chunks a retention policy has selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionAction {
    /// Drop the chunks.
    Expire,
    /// Move the chunks to `destination`.
    Migrate,
}

impl RetentionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionAction::Expire => "expire",
            RetentionAction::Migrate => "migrate",
        }
    }
}

impl FromStr for RetentionAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expire" => Ok(RetentionAction::Expire),
            "migrate" => Ok(RetentionAction::Migrate),
            other => Err(Error::InvalidArgument(format!(
                "unknown retention action: {other:?}"
            ))),
        }
    }
}

/// Retention behavior composed into a vault. `destination` must name a
/// vault when the action is `migrate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub retention_policy_id: Id,
    pub action: RetentionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Id>,
}

/// A storage backend instance in the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    pub id: Id,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Id>,
    #[serde(default)]
    pub retention_rules: Vec<RetentionRule>,
    pub enabled: bool,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub node_id: String,
}

impl Entity for Vault {
    fn entity_id(&self) -> Id {
        self.id
    }
}

// ── Ingesters ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingester {
    pub id: Id,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub node_id: String,
}

impl Entity for Ingester {
    fn entity_id(&self) -> Id {
        self.id
    }
}

// ── Certificates ──────────────────────────────────────────────────────────

/// TLS material, either inline PEM or filesystem paths. File paths take
/// precedence when both are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Id,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
}

impl Entity for Certificate {
    fn entity_id(&self) -> Id {
        self.id
    }
}

// ── Users & refresh tokens ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(Error::InvalidArgument(format!("unknown role: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub username: String,
    /// PHC-encoded Argon2id hash; never the password itself.
    pub password_hash: String,
    pub role: Role,
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
    /// Bearer tokens issued before this instant are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_invalidated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for User {
    fn entity_id(&self) -> Id {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: Id,
    pub user_id: Id,
    /// SHA-256 hex of the opaque token handed to the client.
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Entity for RefreshToken {
    fn entity_id(&self) -> Id {
        self.id
    }
}

// ── Cluster records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: Id,
    pub name: String,
}

impl Entity for NodeConfig {
    fn entity_id(&self) -> Id {
        self.id
    }
}

/// Singleton TLS material for intra-cluster transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTls {
    #[serde(default)]
    pub ca_cert_pem: String,
    #[serde(default)]
    pub ca_key_pem: String,
    #[serde(default)]
    pub cluster_cert_pem: String,
    #[serde(default)]
    pub cluster_key_pem: String,
    #[serde(default)]
    pub join_token: String,
}

// ── Aggregate config ──────────────────────────────────────────────────────

/// Everything a consumer needs at startup. `Store::load` returns `None`
/// instead when the store has never been written (fresh first boot).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub rotation_policies: Vec<RotationPolicy>,
    #[serde(default)]
    pub retention_policies: Vec<RetentionPolicy>,
    #[serde(default)]
    pub vaults: Vec<Vault>,
    #[serde(default)]
    pub ingesters: Vec<Ingester>,
    #[serde(default)]
    pub certificates: Vec<Certificate>,
    #[serde(default)]
    pub node_configs: Vec<NodeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_tls: Option<ClusterTls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_settings: Option<crate::settings::ServerSettings>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_by_creation_order() {
        let earlier = Id::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = Id::new();
        assert!(earlier < later);
    }

    #[test]
    fn id_parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<Id>().is_err());
        let id = Id::new();
        assert_eq!(id.to_string().parse::<Id>().unwrap(), id);
    }

    #[test]
    fn role_parse() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn retention_action_roundtrip() {
        for action in [RetentionAction::Expire, RetentionAction::Migrate] {
            assert_eq!(action.as_str().parse::<RetentionAction>().unwrap(), action);
        }
    }

    #[test]
    fn rotation_policy_validates_threshold_strings() {
        let mut policy = RotationPolicy {
            id: Id::new(),
            name: "default".to_string(),
            max_bytes: Some("64MB".to_string()),
            max_age: Some("5m".to_string()),
            max_records: None,
            cron: Some("0 3 * * *".to_string()),
        };
        policy.validate().unwrap();
        assert_eq!(policy.max_bytes_value().unwrap(), Some(64_000_000));

        policy.cron = Some("whenever".to_string());
        assert!(matches!(
            policy.validate().unwrap_err(),
            Error::InvalidArgument(_)
        ));

        policy.cron = None;
        policy.max_age = Some("soonish".to_string());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn truncate_micros_drops_nanos() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_micros(ts);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_456_000);
        // Idempotent.
        assert_eq!(truncate_micros(truncated), truncated);
    }
}
