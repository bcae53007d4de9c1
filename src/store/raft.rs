//! Raft-backed store façade.
//!
//! Implements [`Store`] by marshalling every mutation into a
//! [`Command`] and pushing it through the Raft log:
//!
//! - on the leader, `apply_raw` commits locally and returns once the FSM
//!   has applied the entry (or reports the command's typed error);
//! - on a follower, the write is handed verbatim to the pluggable
//!   [`Forwarder`], which ships it to the current leader; a forwarding
//!   failure surfaces unchanged;
//! - leadership errors never escape: with no forwarder registered the
//!   caller sees `Internal`.
//!
//! Reads never touch Raft — they are served straight from the FSM's
//! in-memory store, which makes them non-blocking and (on followers)
//! eventually consistent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openraft::error::{ClientWriteError, RaftError};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::model::{
    Certificate, ClusterTls, Config, Filter, Id, Ingester, NodeConfig, RefreshToken,
    RetentionPolicy, Role, RotationPolicy, User, Vault,
};
use crate::raft::RaftHandle;
use crate::rpc::proto::cluster_service_client::ClusterServiceClient;
use crate::rpc::proto::ApplyRequest;
use crate::settings::{ServerSettings, SERVER_SETTINGS_KEY};
use crate::store::{MemoryStore, Store};

/// Default wait for one replicated write. Supersedes any longer caller
/// deadline.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ships a raw command payload to the current Raft leader.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, command: Vec<u8>) -> Result<()>;
}

/// Store façade over a running Raft node.
pub struct RaftStore {
    handle: Arc<RaftHandle>,
    forwarder: Option<Arc<dyn Forwarder>>,
    apply_timeout: Duration,
}

impl RaftStore {
    pub fn new(handle: Arc<RaftHandle>) -> Self {
        RaftStore {
            handle,
            forwarder: None,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    fn fsm_store(&self) -> Arc<MemoryStore> {
        self.handle.fsm.store()
    }

    /// Commit one encoded command, forwarding to the leader if needed.
    pub async fn apply_raw(&self, command: Vec<u8>) -> Result<()> {
        let write = tokio::time::timeout(
            self.apply_timeout,
            self.handle.raft.client_write(command.clone()),
        )
        .await
        .map_err(|_| {
            Error::internal(anyhow::anyhow!(
                "raft apply timed out after {:?}",
                self.apply_timeout
            ))
        })?;

        match write {
            Ok(resp) => match resp.data.error {
                None => Ok(()),
                Some(wire) => Err(wire.into()),
            },
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(_))) => {
                match &self.forwarder {
                    Some(f) => f.forward(command).await,
                    None => Err(Error::internal(anyhow::anyhow!(
                        "not the raft leader and no forwarder is registered"
                    ))),
                }
            }
            Err(RaftError::APIError(other)) => {
                Err(Error::internal(anyhow::anyhow!("raft write rejected: {other}")))
            }
            Err(RaftError::Fatal(fatal)) => {
                Err(Error::Unavailable(format!("raft unavailable: {fatal}")))
            }
        }
    }

    async fn apply(&self, command: Command) -> Result<()> {
        self.apply_raw(command.encode()).await
    }
}

#[async_trait]
impl Store for RaftStore {
    async fn get_filter(&self, id: Id) -> Result<Option<Filter>> {
        self.fsm_store().get_filter(id).await
    }

    async fn list_filters(&self) -> Result<Vec<Filter>> {
        self.fsm_store().list_filters().await
    }

    async fn put_filter(&self, filter: Filter) -> Result<()> {
        self.apply(Command::PutFilter(filter)).await
    }

    async fn delete_filter(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteFilter(id)).await
    }

    async fn get_rotation_policy(&self, id: Id) -> Result<Option<RotationPolicy>> {
        self.fsm_store().get_rotation_policy(id).await
    }

    async fn list_rotation_policies(&self) -> Result<Vec<RotationPolicy>> {
        self.fsm_store().list_rotation_policies().await
    }

    async fn put_rotation_policy(&self, policy: RotationPolicy) -> Result<()> {
        self.apply(Command::PutRotationPolicy(policy)).await
    }

    async fn delete_rotation_policy(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteRotationPolicy(id)).await
    }

    async fn get_retention_policy(&self, id: Id) -> Result<Option<RetentionPolicy>> {
        self.fsm_store().get_retention_policy(id).await
    }

    async fn list_retention_policies(&self) -> Result<Vec<RetentionPolicy>> {
        self.fsm_store().list_retention_policies().await
    }

    async fn put_retention_policy(&self, policy: RetentionPolicy) -> Result<()> {
        self.apply(Command::PutRetentionPolicy(policy)).await
    }

    async fn delete_retention_policy(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteRetentionPolicy(id)).await
    }

    async fn get_vault(&self, id: Id) -> Result<Option<Vault>> {
        self.fsm_store().get_vault(id).await
    }

    async fn list_vaults(&self) -> Result<Vec<Vault>> {
        self.fsm_store().list_vaults().await
    }

    async fn put_vault(&self, vault: Vault) -> Result<()> {
        self.apply(Command::PutVault(vault)).await
    }

    async fn delete_vault(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteVault(id)).await
    }

    async fn get_ingester(&self, id: Id) -> Result<Option<Ingester>> {
        self.fsm_store().get_ingester(id).await
    }

    async fn list_ingesters(&self) -> Result<Vec<Ingester>> {
        self.fsm_store().list_ingesters().await
    }

    async fn put_ingester(&self, ingester: Ingester) -> Result<()> {
        self.apply(Command::PutIngester(ingester)).await
    }

    async fn delete_ingester(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteIngester(id)).await
    }

    async fn get_certificate(&self, id: Id) -> Result<Option<Certificate>> {
        self.fsm_store().get_certificate(id).await
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        self.fsm_store().list_certificates().await
    }

    async fn put_certificate(&self, certificate: Certificate) -> Result<()> {
        self.apply(Command::PutCertificate(certificate)).await
    }

    async fn delete_certificate(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteCertificate(id)).await
    }

    async fn get_node_config(&self, id: Id) -> Result<Option<NodeConfig>> {
        self.fsm_store().get_node_config(id).await
    }

    async fn list_node_configs(&self) -> Result<Vec<NodeConfig>> {
        self.fsm_store().list_node_configs().await
    }

    async fn put_node_config(&self, node: NodeConfig) -> Result<()> {
        self.apply(Command::PutNodeConfig(node)).await
    }

    async fn delete_node_config(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteNodeConfig(id)).await
    }

    async fn get_cluster_tls(&self) -> Result<Option<ClusterTls>> {
        self.fsm_store().get_cluster_tls().await
    }

    async fn put_cluster_tls(&self, tls: ClusterTls) -> Result<()> {
        self.apply(Command::PutClusterTls(tls)).await
    }

    async fn create_user(&self, user: User) -> Result<()> {
        self.apply(Command::CreateUser(user)).await
    }

    async fn get_user(&self, id: Id) -> Result<Option<User>> {
        self.fsm_store().get_user(id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.fsm_store().get_user_by_username(username).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.fsm_store().list_users().await
    }

    async fn count_users(&self) -> Result<u64> {
        self.fsm_store().count_users().await
    }

    async fn update_user_password(
        &self,
        id: Id,
        password_hash: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply(Command::UpdatePassword {
            user_id: id,
            password_hash,
            updated_at,
        })
        .await
    }

    async fn update_user_role(
        &self,
        id: Id,
        role: Role,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply(Command::UpdateUserRole {
            user_id: id,
            role,
            updated_at,
        })
        .await
    }

    async fn update_username(
        &self,
        id: Id,
        username: String,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply(Command::UpdateUsername {
            user_id: id,
            username,
            updated_at,
        })
        .await
    }

    async fn invalidate_user_tokens(&self, id: Id, at: DateTime<Utc>) -> Result<()> {
        self.apply(Command::InvalidateTokens { user_id: id, at }).await
    }

    async fn put_user_preferences(
        &self,
        id: Id,
        preferences: BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply(Command::PutUserPreferences {
            user_id: id,
            preferences,
            updated_at,
        })
        .await
    }

    async fn delete_user(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteUser(id)).await
    }

    async fn put_refresh_token(&self, token: RefreshToken) -> Result<()> {
        self.apply(Command::CreateRefreshToken(token)).await
    }

    async fn get_refresh_token(&self, id: Id) -> Result<Option<RefreshToken>> {
        self.fsm_store().get_refresh_token(id).await
    }

    async fn get_refresh_token_by_hash(&self, hash: &str) -> Result<Option<RefreshToken>> {
        self.fsm_store().get_refresh_token_by_hash(hash).await
    }

    async fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>> {
        self.fsm_store().list_refresh_tokens().await
    }

    async fn delete_refresh_token(&self, id: Id) -> Result<()> {
        self.apply(Command::DeleteRefreshToken(id)).await
    }

    async fn delete_user_refresh_tokens(&self, user_id: Id) -> Result<()> {
        self.apply(Command::DeleteUserRefreshTokens(user_id)).await
    }

    async fn load_server_settings(&self) -> Result<Option<ServerSettings>> {
        self.fsm_store().load_server_settings().await
    }

    async fn save_server_settings(&self, settings: ServerSettings) -> Result<()> {
        self.apply(Command::PutSetting {
            key: SERVER_SETTINGS_KEY.to_string(),
            value: settings.to_json()?,
        })
        .await
    }

    async fn load(&self) -> Result<Option<Config>> {
        self.fsm_store().load().await
    }
}

// ── gRPC forwarder ────────────────────────────────────────────────────────

/// Forwards command payloads to the current leader over `ClusterService`.
pub struct GrpcForwarder {
    handle: Arc<RaftHandle>,
}

impl GrpcForwarder {
    pub fn new(handle: Arc<RaftHandle>) -> Self {
        GrpcForwarder { handle }
    }
}

#[async_trait]
impl Forwarder for GrpcForwarder {
    async fn forward(&self, command: Vec<u8>) -> Result<()> {
        let addr = self
            .handle
            .current_leader_addr()
            .ok_or_else(|| Error::Unavailable("no known raft leader".to_string()))?;
        let uri = if addr.starts_with("http") {
            addr
        } else {
            format!("http://{addr}")
        };

        let mut client = ClusterServiceClient::connect(uri)
            .await
            .map_err(|e| Error::Unavailable(format!("leader unreachable: {e}")))?;
        client
            .apply(ApplyRequest { command })
            .await
            .map(|_| ())
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Fsm;
    use crate::raft::start_raft_node;
    use std::sync::Mutex;

    struct MockForwarder {
        calls: Mutex<Vec<Vec<u8>>>,
        result: Mutex<Option<Result<()>>>,
    }

    impl MockForwarder {
        fn failing(message: &str) -> Arc<Self> {
            Arc::new(MockForwarder {
                calls: Mutex::new(Vec::new()),
                result: Mutex::new(Some(Err(Error::Unavailable(message.to_string())))),
            })
        }
    }

    #[async_trait]
    impl Forwarder for MockForwarder {
        async fn forward(&self, command: Vec<u8>) -> Result<()> {
            self.calls.lock().unwrap().push(command);
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Ok(()))
        }
    }

    #[tokio::test]
    async fn non_leader_forwards_exact_bytes_and_surfaces_result() {
        // A node started without peers never initialises, so every write is
        // rejected with ForwardToLeader.
        let fsm = Arc::new(Fsm::new());
        let handle = start_raft_node(fsm, 1, Vec::new()).await.unwrap();

        let forwarder = MockForwarder::failing("leader unreachable");
        let store = RaftStore::new(handle.clone()).with_forwarder(forwarder.clone());

        let payload = vec![0x01, 0x02, 0x03];
        let err = store.apply_raw(payload.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(ref m) if m == "leader unreachable"));

        let calls = forwarder.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), [payload]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn non_leader_without_forwarder_is_internal() {
        let fsm = Arc::new(Fsm::new());
        let handle = start_raft_node(fsm, 1, Vec::new()).await.unwrap();

        let store = RaftStore::new(handle.clone());
        let err = store.apply_raw(vec![0x00]).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        handle.shutdown().await;
    }
}
