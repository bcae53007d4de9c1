//! FSM snapshot format.
//!
//! A snapshot is the union of every entity table plus the settings string
//! map, encoded with the same protobuf schema as commands. The settings map
//! is the only carrier for `ServerSettings` (JSON under the `"server"` key)
//! so snapshots written before the typed settings existed still restore.
//!
//! Restore populates a *fresh* in-memory store in canonical order: filters,
//! rotation policies, retention policies, vaults, ingesters, certificates,
//! users, refresh tokens, node configs, cluster TLS, server settings. The
//! settings blob is only saved when present and non-empty — restoring a
//! snapshot of a fresh store must leave `load()` returning `None`.

use std::collections::BTreeMap;

use prost::Message;

use crate::error::{Error, Result};
use crate::model::{
    Certificate, ClusterTls, Filter, Ingester, NodeConfig, RefreshToken, RetentionPolicy,
    RotationPolicy, User, Vault,
};
use crate::rpc::proto;
use crate::settings::{ServerSettings, SERVER_SETTINGS_KEY};
use crate::store::{MemoryStore, Store};

/// Decoded snapshot contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub filters: Vec<Filter>,
    pub rotation_policies: Vec<RotationPolicy>,
    pub retention_policies: Vec<RetentionPolicy>,
    pub vaults: Vec<Vault>,
    pub ingesters: Vec<Ingester>,
    pub certificates: Vec<Certificate>,
    pub users: Vec<User>,
    pub refresh_tokens: Vec<RefreshToken>,
    pub node_configs: Vec<NodeConfig>,
    pub cluster_tls: Option<ClusterTls>,
    pub settings: BTreeMap<String, String>,
}

impl Snapshot {
    /// Capture the full state of a store.
    pub async fn capture(store: &dyn Store) -> Result<Snapshot> {
        let mut settings = BTreeMap::new();
        if let Some(server) = store.load_server_settings().await? {
            settings.insert(SERVER_SETTINGS_KEY.to_string(), server.to_json()?);
        }

        Ok(Snapshot {
            filters: store.list_filters().await?,
            rotation_policies: store.list_rotation_policies().await?,
            retention_policies: store.list_retention_policies().await?,
            vaults: store.list_vaults().await?,
            ingesters: store.list_ingesters().await?,
            certificates: store.list_certificates().await?,
            users: store.list_users().await?,
            refresh_tokens: store.list_refresh_tokens().await?,
            node_configs: store.list_node_configs().await?,
            cluster_tls: store.get_cluster_tls().await?,
            settings,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        proto::Snapshot::from(self.clone()).encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Snapshot> {
        let wire = proto::Snapshot::decode(bytes)
            .map_err(|e| Error::internal(anyhow::anyhow!("undecodable snapshot: {e}")))?;
        Snapshot::try_from(wire)
    }

    /// Build a fresh in-memory store from this snapshot.
    pub async fn restore(self) -> Result<MemoryStore> {
        let store = MemoryStore::new();

        for f in self.filters {
            store.put_filter(f).await?;
        }
        for p in self.rotation_policies {
            store.put_rotation_policy(p).await?;
        }
        for p in self.retention_policies {
            store.put_retention_policy(p).await?;
        }
        for v in self.vaults {
            store.put_vault(v).await?;
        }
        for i in self.ingesters {
            store.put_ingester(i).await?;
        }
        for c in self.certificates {
            store.put_certificate(c).await?;
        }
        for u in self.users {
            store.create_user(u).await?;
        }
        for t in self.refresh_tokens {
            store.put_refresh_token(t).await?;
        }
        for n in self.node_configs {
            store.put_node_config(n).await?;
        }
        if let Some(tls) = self.cluster_tls {
            store.put_cluster_tls(tls).await?;
        }
        // An absent or empty blob means "never written", not "cleared":
        // saving defaults here would flip a fresh store's Load to non-nil.
        if let Some(raw) = self.settings.get(SERVER_SETTINGS_KEY) {
            if !raw.is_empty() {
                store.save_server_settings(ServerSettings::from_json(raw)?).await?;
            }
        }

        Ok(store)
    }
}

impl From<Snapshot> for proto::Snapshot {
    fn from(s: Snapshot) -> Self {
        proto::Snapshot {
            filters: s.filters.into_iter().map(Into::into).collect(),
            rotation_policies: s.rotation_policies.into_iter().map(Into::into).collect(),
            retention_policies: s.retention_policies.into_iter().map(Into::into).collect(),
            vaults: s.vaults.into_iter().map(Into::into).collect(),
            ingesters: s.ingesters.into_iter().map(Into::into).collect(),
            certificates: s.certificates.into_iter().map(Into::into).collect(),
            users: s.users.into_iter().map(Into::into).collect(),
            refresh_tokens: s.refresh_tokens.into_iter().map(Into::into).collect(),
            node_configs: s.node_configs.into_iter().map(Into::into).collect(),
            cluster_tls: s.cluster_tls.map(Into::into),
            settings: s.settings.into_iter().collect(),
        }
    }
}

impl TryFrom<proto::Snapshot> for Snapshot {
    type Error = Error;

    fn try_from(s: proto::Snapshot) -> Result<Self> {
        fn convert<W, D>(items: Vec<W>) -> Result<Vec<D>>
        where
            D: TryFrom<W, Error = Error>,
        {
            items.into_iter().map(D::try_from).collect()
        }

        Ok(Snapshot {
            filters: convert(s.filters)?,
            rotation_policies: convert(s.rotation_policies)?,
            retention_policies: convert(s.retention_policies)?,
            vaults: convert(s.vaults)?,
            ingesters: convert(s.ingesters)?,
            certificates: convert(s.certificates)?,
            users: convert(s.users)?,
            refresh_tokens: convert(s.refresh_tokens)?,
            node_configs: convert(s.node_configs)?,
            cluster_tls: s.cluster_tls.map(Into::into),
            settings: s.settings.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Id;

    #[tokio::test]
    async fn capture_restore_roundtrip() {
        let store = MemoryStore::new();
        store
            .put_filter(Filter {
                id: Id::new(),
                name: "all".to_string(),
                expression: "*".to_string(),
            })
            .await
            .unwrap();
        let mut settings = ServerSettings::default();
        settings.auth.jwt_secret = "c2VjcmV0".to_string();
        store.save_server_settings(settings).await.unwrap();

        let snap = Snapshot::capture(&store).await.unwrap();
        let decoded = Snapshot::decode(&snap.encode()).unwrap();
        let restored = decoded.restore().await.unwrap();

        assert_eq!(
            restored.load().await.unwrap(),
            store.load().await.unwrap()
        );
    }

    #[tokio::test]
    async fn empty_snapshot_restores_fresh() {
        let snap = Snapshot::default();
        let restored = snap.restore().await.unwrap();
        assert!(restored.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_server_blob_counts_as_no_settings() {
        let snap = Snapshot {
            settings: BTreeMap::from([(SERVER_SETTINGS_KEY.to_string(), String::new())]),
            ..Default::default()
        };
        let restored = snap.restore().await.unwrap();
        assert!(restored.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn legacy_flat_settings_restore_nested() {
        let snap = Snapshot {
            settings: BTreeMap::from([(
                SERVER_SETTINGS_KEY.to_string(),
                r#"{"lookup": {"geoip_db_path": "/geo.mmdb"},
                    "auth": {"min_password_length": 12}}"#
                    .to_string(),
            )]),
            ..Default::default()
        };
        let restored = snap.restore().await.unwrap();
        let settings = restored.load_server_settings().await.unwrap().unwrap();
        assert_eq!(settings.lookup.maxmind.geoip_db_path, "/geo.mmdb");
        assert_eq!(settings.auth.password_policy.min_length, 12);
    }
}
