//! Replicated command codec.
//!
//! Every mutation crosses the Raft boundary as exactly one [`Command`],
//! encoded as a tagged, length-delimited protobuf (`proto/gastrolog.proto`).
//! proto3 field semantics give the forward-compatibility contract for free:
//! unknown fields inside a known variant are skipped by the decoder, while
//! an unknown *variant* arrives as an unset `oneof` — meaning the log entry
//! was written by a newer peer, which is a fatal decode error for this node.
//!
//! This module also owns the conversions between the domain entities and
//! their wire records, shared by the snapshot codec and the RPC surface.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

use crate::error::{Error, Result};
use crate::model::{
    Certificate, ClusterTls, Filter, Id, Ingester, NodeConfig, RefreshToken, RetentionPolicy,
    RetentionRule, Role, RotationPolicy, User, Vault,
};
use crate::rpc::proto;

// ── Command sum type ──────────────────────────────────────────────────────

/// A single replicated mutation. The FSM's `apply` is one match on this.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PutFilter(Filter),
    DeleteFilter(Id),
    PutRotationPolicy(RotationPolicy),
    DeleteRotationPolicy(Id),
    PutRetentionPolicy(RetentionPolicy),
    DeleteRetentionPolicy(Id),
    PutVault(Vault),
    DeleteVault(Id),
    PutIngester(Ingester),
    DeleteIngester(Id),
    PutSetting { key: String, value: String },
    DeleteSetting { key: String },
    PutCertificate(Certificate),
    DeleteCertificate(Id),
    CreateUser(User),
    UpdatePassword { user_id: Id, password_hash: String, updated_at: DateTime<Utc> },
    UpdateUserRole { user_id: Id, role: Role, updated_at: DateTime<Utc> },
    UpdateUsername { user_id: Id, username: String, updated_at: DateTime<Utc> },
    DeleteUser(Id),
    InvalidateTokens { user_id: Id, at: DateTime<Utc> },
    PutUserPreferences {
        user_id: Id,
        preferences: BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    },
    CreateRefreshToken(RefreshToken),
    DeleteRefreshToken(Id),
    DeleteUserRefreshTokens(Id),
    PutNodeConfig(NodeConfig),
    DeleteNodeConfig(Id),
    PutClusterTls(ClusterTls),
}

impl Command {
    /// Encode for the Raft log.
    pub fn encode(&self) -> Vec<u8> {
        proto::Command::from(self.clone()).encode_to_vec()
    }

    /// Decode a Raft log payload.
    ///
    /// An unset `op` means a newer peer wrote the entry; that is fatal for
    /// this replica and surfaces through the commit future as `Internal`.
    pub fn decode(bytes: &[u8]) -> Result<Command> {
        let wire = proto::Command::decode(bytes)
            .map_err(|e| Error::internal(anyhow::anyhow!("undecodable command: {e}")))?;
        let op = wire.op.ok_or_else(|| {
            Error::internal(anyhow::anyhow!(
                "unknown command variant: log entry written by a newer peer"
            ))
        })?;
        Command::try_from(op)
    }
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

pub(crate) fn to_us(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_us(us: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(us)
        .single()
        .ok_or_else(|| Error::InvalidArgument(format!("timestamp out of range: {us}")))
}

fn parse_id(s: &str) -> Result<Id> {
    s.parse()
}

fn map_to_btree(m: std::collections::HashMap<String, String>) -> BTreeMap<String, String> {
    m.into_iter().collect()
}

fn btree_to_map(m: BTreeMap<String, String>) -> std::collections::HashMap<String, String> {
    m.into_iter().collect()
}

// ── Entity conversions: domain → wire ─────────────────────────────────────

impl From<Filter> for proto::Filter {
    fn from(f: Filter) -> Self {
        proto::Filter {
            id: f.id.to_string(),
            name: f.name,
            expression: f.expression,
        }
    }
}

impl From<RotationPolicy> for proto::RotationPolicy {
    fn from(p: RotationPolicy) -> Self {
        proto::RotationPolicy {
            id: p.id.to_string(),
            name: p.name,
            max_bytes: p.max_bytes,
            max_age: p.max_age,
            max_records: p.max_records,
            cron: p.cron,
        }
    }
}

impl From<RetentionPolicy> for proto::RetentionPolicy {
    fn from(p: RetentionPolicy) -> Self {
        proto::RetentionPolicy {
            id: p.id.to_string(),
            name: p.name,
            max_age: p.max_age,
            max_bytes: p.max_bytes,
            max_chunks: p.max_chunks,
        }
    }
}

impl From<RetentionRule> for proto::RetentionRule {
    fn from(r: RetentionRule) -> Self {
        proto::RetentionRule {
            retention_policy_id: r.retention_policy_id.to_string(),
            action: r.action.as_str().to_string(),
            destination: r.destination.map(|d| d.to_string()),
        }
    }
}

impl From<Vault> for proto::Vault {
    fn from(v: Vault) -> Self {
        proto::Vault {
            id: v.id.to_string(),
            name: v.name,
            r#type: v.kind,
            filter_id: v.filter.map(|f| f.to_string()),
            policy_id: v.policy.map(|p| p.to_string()),
            retention_rules: v.retention_rules.into_iter().map(Into::into).collect(),
            enabled: v.enabled,
            params: btree_to_map(v.params),
            node_id: v.node_id,
        }
    }
}

impl From<Ingester> for proto::Ingester {
    fn from(i: Ingester) -> Self {
        proto::Ingester {
            id: i.id.to_string(),
            name: i.name,
            r#type: i.kind,
            enabled: i.enabled,
            params: btree_to_map(i.params),
            node_id: i.node_id,
        }
    }
}

impl From<Certificate> for proto::Certificate {
    fn from(c: Certificate) -> Self {
        proto::Certificate {
            id: c.id.to_string(),
            name: c.name,
            cert_pem: c.cert_pem,
            key_pem: c.key_pem,
            cert_file: c.cert_file,
            key_file: c.key_file,
        }
    }
}

impl From<User> for proto::User {
    fn from(u: User) -> Self {
        proto::User {
            id: u.id.to_string(),
            username: u.username,
            password_hash: u.password_hash,
            role: u.role.as_str().to_string(),
            preferences: btree_to_map(u.preferences),
            token_invalidated_at_us: u.token_invalidated_at.map(to_us),
            created_at_us: to_us(u.created_at),
            updated_at_us: to_us(u.updated_at),
        }
    }
}

impl From<RefreshToken> for proto::RefreshToken {
    fn from(t: RefreshToken) -> Self {
        proto::RefreshToken {
            id: t.id.to_string(),
            user_id: t.user_id.to_string(),
            token_hash: t.token_hash,
            expires_at_us: to_us(t.expires_at),
            created_at_us: to_us(t.created_at),
        }
    }
}

impl From<NodeConfig> for proto::NodeConfig {
    fn from(n: NodeConfig) -> Self {
        proto::NodeConfig {
            id: n.id.to_string(),
            name: n.name,
        }
    }
}

impl From<ClusterTls> for proto::ClusterTls {
    fn from(t: ClusterTls) -> Self {
        proto::ClusterTls {
            ca_cert_pem: t.ca_cert_pem,
            ca_key_pem: t.ca_key_pem,
            cluster_cert_pem: t.cluster_cert_pem,
            cluster_key_pem: t.cluster_key_pem,
            join_token: t.join_token,
        }
    }
}

// ── Entity conversions: wire → domain ─────────────────────────────────────

impl TryFrom<proto::Filter> for Filter {
    type Error = Error;

    fn try_from(f: proto::Filter) -> Result<Self> {
        Ok(Filter {
            id: parse_id(&f.id)?,
            name: f.name,
            expression: f.expression,
        })
    }
}

impl TryFrom<proto::RotationPolicy> for RotationPolicy {
    type Error = Error;

    fn try_from(p: proto::RotationPolicy) -> Result<Self> {
        Ok(RotationPolicy {
            id: parse_id(&p.id)?,
            name: p.name,
            max_bytes: p.max_bytes,
            max_age: p.max_age,
            max_records: p.max_records,
            cron: p.cron,
        })
    }
}

impl TryFrom<proto::RetentionPolicy> for RetentionPolicy {
    type Error = Error;

    fn try_from(p: proto::RetentionPolicy) -> Result<Self> {
        Ok(RetentionPolicy {
            id: parse_id(&p.id)?,
            name: p.name,
            max_age: p.max_age,
            max_bytes: p.max_bytes,
            max_chunks: p.max_chunks,
        })
    }
}

impl TryFrom<proto::RetentionRule> for RetentionRule {
    type Error = Error;

    fn try_from(r: proto::RetentionRule) -> Result<Self> {
        Ok(RetentionRule {
            retention_policy_id: parse_id(&r.retention_policy_id)?,
            action: r.action.parse()?,
            destination: r.destination.as_deref().map(parse_id).transpose()?,
        })
    }
}

impl TryFrom<proto::Vault> for Vault {
    type Error = Error;

    fn try_from(v: proto::Vault) -> Result<Self> {
        Ok(Vault {
            id: parse_id(&v.id)?,
            name: v.name,
            kind: v.r#type,
            filter: v.filter_id.as_deref().map(parse_id).transpose()?,
            policy: v.policy_id.as_deref().map(parse_id).transpose()?,
            retention_rules: v
                .retention_rules
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_>>()?,
            enabled: v.enabled,
            params: map_to_btree(v.params),
            node_id: v.node_id,
        })
    }
}

impl TryFrom<proto::Ingester> for Ingester {
    type Error = Error;

    fn try_from(i: proto::Ingester) -> Result<Self> {
        Ok(Ingester {
            id: parse_id(&i.id)?,
            name: i.name,
            kind: i.r#type,
            enabled: i.enabled,
            params: map_to_btree(i.params),
            node_id: i.node_id,
        })
    }
}

impl TryFrom<proto::Certificate> for Certificate {
    type Error = Error;

    fn try_from(c: proto::Certificate) -> Result<Self> {
        Ok(Certificate {
            id: parse_id(&c.id)?,
            name: c.name,
            cert_pem: c.cert_pem,
            key_pem: c.key_pem,
            cert_file: c.cert_file,
            key_file: c.key_file,
        })
    }
}

impl TryFrom<proto::User> for User {
    type Error = Error;

    fn try_from(u: proto::User) -> Result<Self> {
        Ok(User {
            id: parse_id(&u.id)?,
            username: u.username,
            password_hash: u.password_hash,
            role: u.role.parse()?,
            preferences: map_to_btree(u.preferences),
            token_invalidated_at: u.token_invalidated_at_us.map(from_us).transpose()?,
            created_at: from_us(u.created_at_us)?,
            updated_at: from_us(u.updated_at_us)?,
        })
    }
}

impl TryFrom<proto::RefreshToken> for RefreshToken {
    type Error = Error;

    fn try_from(t: proto::RefreshToken) -> Result<Self> {
        Ok(RefreshToken {
            id: parse_id(&t.id)?,
            user_id: parse_id(&t.user_id)?,
            token_hash: t.token_hash,
            expires_at: from_us(t.expires_at_us)?,
            created_at: from_us(t.created_at_us)?,
        })
    }
}

impl TryFrom<proto::NodeConfig> for NodeConfig {
    type Error = Error;

    fn try_from(n: proto::NodeConfig) -> Result<Self> {
        Ok(NodeConfig {
            id: parse_id(&n.id)?,
            name: n.name,
        })
    }
}

impl From<proto::ClusterTls> for ClusterTls {
    fn from(t: proto::ClusterTls) -> Self {
        ClusterTls {
            ca_cert_pem: t.ca_cert_pem,
            ca_key_pem: t.ca_key_pem,
            cluster_cert_pem: t.cluster_cert_pem,
            cluster_key_pem: t.cluster_key_pem,
            join_token: t.join_token,
        }
    }
}

// ── Command conversions ───────────────────────────────────────────────────

impl From<Command> for proto::Command {
    fn from(cmd: Command) -> Self {
        use proto::command::Op;

        let op = match cmd {
            Command::PutFilter(f) => Op::PutFilter(proto::PutFilter {
                filter: Some(f.into()),
            }),
            Command::DeleteFilter(id) => Op::DeleteFilter(proto::DeleteFilter {
                id: id.to_string(),
            }),
            Command::PutRotationPolicy(p) => Op::PutRotationPolicy(proto::PutRotationPolicy {
                policy: Some(p.into()),
            }),
            Command::DeleteRotationPolicy(id) => {
                Op::DeleteRotationPolicy(proto::DeleteRotationPolicy {
                    id: id.to_string(),
                })
            }
            Command::PutRetentionPolicy(p) => Op::PutRetentionPolicy(proto::PutRetentionPolicy {
                policy: Some(p.into()),
            }),
            Command::DeleteRetentionPolicy(id) => {
                Op::DeleteRetentionPolicy(proto::DeleteRetentionPolicy {
                    id: id.to_string(),
                })
            }
            Command::PutVault(v) => Op::PutVault(proto::PutVault {
                vault: Some(v.into()),
            }),
            Command::DeleteVault(id) => Op::DeleteVault(proto::DeleteVault {
                id: id.to_string(),
            }),
            Command::PutIngester(i) => Op::PutIngester(proto::PutIngester {
                ingester: Some(i.into()),
            }),
            Command::DeleteIngester(id) => Op::DeleteIngester(proto::DeleteIngester {
                id: id.to_string(),
            }),
            Command::PutSetting { key, value } => {
                Op::PutSetting(proto::PutSetting { key, value })
            }
            Command::DeleteSetting { key } => Op::DeleteSetting(proto::DeleteSetting { key }),
            Command::PutCertificate(c) => Op::PutCertificate(proto::PutCertificate {
                certificate: Some(c.into()),
            }),
            Command::DeleteCertificate(id) => Op::DeleteCertificate(proto::DeleteCertificate {
                id: id.to_string(),
            }),
            Command::CreateUser(u) => Op::CreateUser(proto::CreateUser {
                user: Some(u.into()),
            }),
            Command::UpdatePassword {
                user_id,
                password_hash,
                updated_at,
            } => Op::UpdatePassword(proto::UpdatePassword {
                user_id: user_id.to_string(),
                password_hash,
                updated_at_us: to_us(updated_at),
            }),
            Command::UpdateUserRole {
                user_id,
                role,
                updated_at,
            } => Op::UpdateUserRole(proto::UpdateUserRole {
                user_id: user_id.to_string(),
                role: role.as_str().to_string(),
                updated_at_us: to_us(updated_at),
            }),
            Command::UpdateUsername {
                user_id,
                username,
                updated_at,
            } => Op::UpdateUsername(proto::UpdateUsername {
                user_id: user_id.to_string(),
                username,
                updated_at_us: to_us(updated_at),
            }),
            Command::DeleteUser(id) => Op::DeleteUser(proto::DeleteUser {
                user_id: id.to_string(),
            }),
            Command::InvalidateTokens { user_id, at } => {
                Op::InvalidateTokens(proto::InvalidateTokens {
                    user_id: user_id.to_string(),
                    at_us: to_us(at),
                })
            }
            Command::PutUserPreferences {
                user_id,
                preferences,
                updated_at,
            } => Op::PutUserPreferences(proto::PutUserPreferences {
                user_id: user_id.to_string(),
                preferences: btree_to_map(preferences),
                updated_at_us: to_us(updated_at),
            }),
            Command::CreateRefreshToken(t) => Op::CreateRefreshToken(proto::CreateRefreshToken {
                token: Some(t.into()),
            }),
            Command::DeleteRefreshToken(id) => {
                Op::DeleteRefreshToken(proto::DeleteRefreshToken {
                    id: id.to_string(),
                })
            }
            Command::DeleteUserRefreshTokens(id) => {
                Op::DeleteUserRefreshTokens(proto::DeleteUserRefreshTokens {
                    user_id: id.to_string(),
                })
            }
            Command::PutNodeConfig(n) => Op::PutNodeConfig(proto::PutNodeConfig {
                node: Some(n.into()),
            }),
            Command::DeleteNodeConfig(id) => Op::DeleteNodeConfig(proto::DeleteNodeConfig {
                id: id.to_string(),
            }),
            Command::PutClusterTls(t) => Op::PutClusterTls(proto::PutClusterTls {
                tls: Some(t.into()),
            }),
        };

        proto::Command { op: Some(op) }
    }
}

fn required<T>(field: Option<T>, what: &str) -> Result<T> {
    field.ok_or_else(|| Error::InvalidArgument(format!("command missing {what}")))
}

impl TryFrom<proto::command::Op> for Command {
    type Error = Error;

    fn try_from(op: proto::command::Op) -> Result<Self> {
        use proto::command::Op;

        Ok(match op {
            Op::PutFilter(c) => Command::PutFilter(required(c.filter, "filter")?.try_into()?),
            Op::DeleteFilter(c) => Command::DeleteFilter(parse_id(&c.id)?),
            Op::PutRotationPolicy(c) => {
                Command::PutRotationPolicy(required(c.policy, "rotation policy")?.try_into()?)
            }
            Op::DeleteRotationPolicy(c) => Command::DeleteRotationPolicy(parse_id(&c.id)?),
            Op::PutRetentionPolicy(c) => {
                Command::PutRetentionPolicy(required(c.policy, "retention policy")?.try_into()?)
            }
            Op::DeleteRetentionPolicy(c) => Command::DeleteRetentionPolicy(parse_id(&c.id)?),
            Op::PutVault(c) => Command::PutVault(required(c.vault, "vault")?.try_into()?),
            Op::DeleteVault(c) => Command::DeleteVault(parse_id(&c.id)?),
            Op::PutIngester(c) => {
                Command::PutIngester(required(c.ingester, "ingester")?.try_into()?)
            }
            Op::DeleteIngester(c) => Command::DeleteIngester(parse_id(&c.id)?),
            Op::PutSetting(c) => Command::PutSetting {
                key: c.key,
                value: c.value,
            },
            Op::DeleteSetting(c) => Command::DeleteSetting { key: c.key },
            Op::PutCertificate(c) => {
                Command::PutCertificate(required(c.certificate, "certificate")?.try_into()?)
            }
            Op::DeleteCertificate(c) => Command::DeleteCertificate(parse_id(&c.id)?),
            Op::CreateUser(c) => Command::CreateUser(required(c.user, "user")?.try_into()?),
            Op::UpdatePassword(c) => Command::UpdatePassword {
                user_id: parse_id(&c.user_id)?,
                password_hash: c.password_hash,
                updated_at: from_us(c.updated_at_us)?,
            },
            Op::UpdateUserRole(c) => Command::UpdateUserRole {
                user_id: parse_id(&c.user_id)?,
                role: c.role.parse()?,
                updated_at: from_us(c.updated_at_us)?,
            },
            Op::UpdateUsername(c) => Command::UpdateUsername {
                user_id: parse_id(&c.user_id)?,
                username: c.username,
                updated_at: from_us(c.updated_at_us)?,
            },
            Op::DeleteUser(c) => Command::DeleteUser(parse_id(&c.user_id)?),
            Op::InvalidateTokens(c) => Command::InvalidateTokens {
                user_id: parse_id(&c.user_id)?,
                at: from_us(c.at_us)?,
            },
            Op::PutUserPreferences(c) => Command::PutUserPreferences {
                user_id: parse_id(&c.user_id)?,
                preferences: map_to_btree(c.preferences),
                updated_at: from_us(c.updated_at_us)?,
            },
            Op::CreateRefreshToken(c) => {
                Command::CreateRefreshToken(required(c.token, "refresh token")?.try_into()?)
            }
            Op::DeleteRefreshToken(c) => Command::DeleteRefreshToken(parse_id(&c.id)?),
            Op::DeleteUserRefreshTokens(c) => {
                Command::DeleteUserRefreshTokens(parse_id(&c.user_id)?)
            }
            Op::PutNodeConfig(c) => {
                Command::PutNodeConfig(required(c.node, "node config")?.try_into()?)
            }
            Op::DeleteNodeConfig(c) => Command::DeleteNodeConfig(parse_id(&c.id)?),
            Op::PutClusterTls(c) => {
                Command::PutClusterTls(required(c.tls, "cluster tls")?.into())
            }
        })
    }
}
