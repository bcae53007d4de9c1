//! gRPC services.
//!
//! Three services share one listener:
//!
//! | Service         | Role                                             | Policy |
//! |-----------------|--------------------------------------------------|--------|
//! | `ClusterService`| Raft transport + leader-forwarded `Apply`        | Public (cluster TLS) |
//! | `ConfigService` | Read the aggregate configuration                 | AdminOnly |
//! | `AuthService`   | Password login, refresh-token exchange           | Public |
//!
//! The auth interceptor ([`crate::auth::AuthLayer`]) sits in front of all
//! of them; handlers that need the caller's identity read the verified
//! [`Claims`](crate::auth::Claims) from the request extensions.

use std::sync::Arc;

use chrono::Utc;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::auth::{hash_refresh_token, mint_refresh_token, verify_password, TokenService};
use crate::command::to_us;
use crate::error::Error;
use crate::model::{Config, Id, RefreshToken};
use crate::raft::RaftHandle;
use crate::store::Store;

/// Generated protobuf types and service stubs for `proto/gastrolog.proto`.
pub mod proto {
    tonic::include_proto!("gastrolog");
}

use proto::auth_service_server::AuthService;
use proto::cluster_service_server::ClusterService;
use proto::config_service_server::ConfigService;

// ── Cluster service ───────────────────────────────────────────────────────

/// Raft transport plus the forwarding target for follower writes.
pub struct ClusterRpc {
    handle: Option<Arc<RaftHandle>>,
}

impl ClusterRpc {
    pub fn new(handle: Option<Arc<RaftHandle>>) -> Self {
        ClusterRpc { handle }
    }

    fn raft(&self) -> Result<&Arc<RaftHandle>, Status> {
        self.handle
            .as_ref()
            .ok_or_else(|| Status::unavailable("clustering is not enabled on this node"))
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterRpc {
    async fn append_entries(
        &self,
        req: Request<proto::RaftMessage>,
    ) -> Result<Response<proto::RaftMessage>, Status> {
        let raft = self.raft()?;
        let rpc: openraft::raft::AppendEntriesRequest<crate::raft::TypeConfig> =
            serde_json::from_slice(&req.into_inner().payload)
                .map_err(|e| Status::invalid_argument(format!("bad AppendEntries payload: {e}")))?;

        let resp = raft
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft AppendEntries error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {e}")))?;
        Ok(Response::new(proto::RaftMessage { payload }))
    }

    async fn vote(
        &self,
        req: Request<proto::RaftMessage>,
    ) -> Result<Response<proto::RaftMessage>, Status> {
        let raft = self.raft()?;
        let rpc: openraft::raft::VoteRequest<crate::raft::NodeId> =
            serde_json::from_slice(&req.into_inner().payload)
                .map_err(|e| Status::invalid_argument(format!("bad Vote payload: {e}")))?;

        let resp = raft
            .raft
            .vote(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft Vote error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {e}")))?;
        Ok(Response::new(proto::RaftMessage { payload }))
    }

    async fn install_snapshot(
        &self,
        req: Request<proto::RaftMessage>,
    ) -> Result<Response<proto::RaftMessage>, Status> {
        let raft = self.raft()?;
        let rpc: openraft::raft::InstallSnapshotRequest<crate::raft::TypeConfig> =
            serde_json::from_slice(&req.into_inner().payload).map_err(|e| {
                Status::invalid_argument(format!("bad InstallSnapshot payload: {e}"))
            })?;

        let resp = raft
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft InstallSnapshot error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("encode response: {e}")))?;
        Ok(Response::new(proto::RaftMessage { payload }))
    }

    /// Commit a pre-encoded command on this node.
    ///
    /// This is the follower-forwarding target. It deliberately does not
    /// forward again: if leadership moved while the payload was in flight,
    /// the caller gets `Unavailable` and retries against the new leader.
    async fn apply(
        &self,
        req: Request<proto::ApplyRequest>,
    ) -> Result<Response<proto::ApplyResponse>, Status> {
        use openraft::error::{ClientWriteError, RaftError};

        let raft = self.raft()?;
        let command = req.into_inner().command;

        match raft.raft.client_write(command).await {
            Ok(resp) => match resp.data.error {
                None => Ok(Response::new(proto::ApplyResponse {})),
                Some(wire) => Err(Error::from(wire).into()),
            },
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(_))) => Err(
                Status::unavailable("not the raft leader; retry against the current leader"),
            ),
            Err(e) => Err(Status::internal(format!("raft apply error: {e}"))),
        }
    }
}

// ── Config service ────────────────────────────────────────────────────────

pub struct ConfigRpc {
    store: Arc<dyn Store>,
}

impl ConfigRpc {
    pub fn new(store: Arc<dyn Store>) -> Self {
        ConfigRpc { store }
    }
}

fn config_to_proto(config: Config) -> Result<proto::Config, Error> {
    let server_settings_json = config
        .server_settings
        .map(|s| s.to_json())
        .transpose()?;
    Ok(proto::Config {
        filters: config.filters.into_iter().map(Into::into).collect(),
        rotation_policies: config.rotation_policies.into_iter().map(Into::into).collect(),
        retention_policies: config
            .retention_policies
            .into_iter()
            .map(Into::into)
            .collect(),
        vaults: config.vaults.into_iter().map(Into::into).collect(),
        ingesters: config.ingesters.into_iter().map(Into::into).collect(),
        certificates: config.certificates.into_iter().map(Into::into).collect(),
        node_configs: config.node_configs.into_iter().map(Into::into).collect(),
        cluster_tls: config.cluster_tls.map(Into::into),
        server_settings_json,
    })
}

#[tonic::async_trait]
impl ConfigService for ConfigRpc {
    async fn get_config(
        &self,
        _req: Request<proto::GetConfigRequest>,
    ) -> Result<Response<proto::GetConfigResponse>, Status> {
        let config = self.store.load().await.map_err(Status::from)?;
        let config = config.map(config_to_proto).transpose().map_err(Status::from)?;
        Ok(Response::new(proto::GetConfigResponse { config }))
    }
}

// ── Auth service ──────────────────────────────────────────────────────────

pub struct AuthRpc {
    store: Arc<dyn Store>,
}

impl AuthRpc {
    pub fn new(store: Arc<dyn Store>) -> Self {
        AuthRpc { store }
    }

    async fn token_service(&self) -> Result<(TokenService, std::time::Duration), Status> {
        let settings = self
            .store
            .load_server_settings()
            .await
            .map_err(Status::from)?
            .ok_or_else(|| Status::internal("server settings missing; bootstrap has not run"))?;
        let refresh_lifetime = settings.refresh_token_duration().map_err(Status::from)?;
        let tokens = TokenService::from_settings(&settings).map_err(Status::from)?;
        Ok((tokens, refresh_lifetime))
    }
}

#[tonic::async_trait]
impl AuthService for AuthRpc {
    async fn login(
        &self,
        req: Request<proto::LoginRequest>,
    ) -> Result<Response<proto::LoginResponse>, Status> {
        let req = req.into_inner();

        // One generic failure for unknown user and wrong password: login
        // must not leak which usernames exist.
        let denied = || Status::unauthenticated("invalid credentials");

        let user = self
            .store
            .get_user_by_username(&req.username)
            .await
            .map_err(Status::from)?
            .ok_or_else(denied)?;
        if !verify_password(&req.password, &user.password_hash).map_err(|e| {
            debug!(error = %e, "stored password hash rejected");
            denied()
        })? {
            return Err(denied());
        }

        let (tokens, refresh_lifetime) = self.token_service().await?;
        let (token, expires_at) = tokens.issue(&user).map_err(Status::from)?;

        let now = Utc::now();
        let refresh_expires_at = now
            + chrono::TimeDelta::from_std(refresh_lifetime)
                .map_err(|e| Status::internal(format!("refresh lifetime: {e}")))?;
        let (refresh_token, token_hash) = mint_refresh_token();
        self.store
            .put_refresh_token(RefreshToken {
                id: Id::new(),
                user_id: user.id,
                token_hash,
                expires_at: refresh_expires_at,
                created_at: now,
            })
            .await
            .map_err(Status::from)?;

        Ok(Response::new(proto::LoginResponse {
            token,
            expires_at_us: to_us(expires_at),
            refresh_token,
            refresh_expires_at_us: to_us(refresh_expires_at),
        }))
    }

    async fn refresh(
        &self,
        req: Request<proto::RefreshRequest>,
    ) -> Result<Response<proto::LoginResponse>, Status> {
        let req = req.into_inner();
        let denied = || Status::unauthenticated("invalid refresh token");

        let hash = hash_refresh_token(&req.refresh_token);
        let stored = self
            .store
            .get_refresh_token_by_hash(&hash)
            .await
            .map_err(Status::from)?
            .ok_or_else(denied)?;

        let now = Utc::now();
        if stored.expires_at <= now {
            self.store
                .delete_refresh_token(stored.id)
                .await
                .map_err(Status::from)?;
            return Err(denied());
        }

        let user = self
            .store
            .get_user(stored.user_id)
            .await
            .map_err(Status::from)?
            .ok_or_else(denied)?;

        let (tokens, _) = self.token_service().await?;
        let (token, expires_at) = tokens.issue(&user).map_err(Status::from)?;

        Ok(Response::new(proto::LoginResponse {
            token,
            expires_at_us: to_us(expires_at),
            refresh_token: req.refresh_token,
            refresh_expires_at_us: to_us(stored.expires_at),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use crate::bootstrap::{bootstrap, BootstrapMode};
    use crate::model::{Role, User};
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    async fn store_with_admin() -> Arc<dyn Store> {
        let store = Arc::new(MemoryStore::new());
        bootstrap(store.as_ref(), BootstrapMode::Minimal).await.unwrap();
        let now = Utc::now();
        store
            .create_user(User {
                id: Id::new(),
                username: "ada".to_string(),
                password_hash: hash_password("correcthorse").unwrap(),
                role: Role::Admin,
                preferences: BTreeMap::new(),
                token_invalidated_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn login_issues_verifiable_tokens() {
        let store = store_with_admin().await;
        let rpc = AuthRpc::new(store.clone());

        let resp = rpc
            .login(Request::new(proto::LoginRequest {
                username: "ada".to_string(),
                password: "correcthorse".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        let settings = store.load_server_settings().await.unwrap().unwrap();
        let tokens = TokenService::from_settings(&settings).unwrap();
        let claims = tokens.verify(&resp.token).unwrap();
        assert_eq!(claims.sub, "ada");
        assert_eq!(claims.role, "admin");

        // The refresh token is stored hashed, never verbatim.
        let stored = store
            .get_refresh_token_by_hash(&hash_refresh_token(&resp.refresh_token))
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_identical() {
        let store = store_with_admin().await;
        let rpc = AuthRpc::new(store);

        let wrong = rpc
            .login(Request::new(proto::LoginRequest {
                username: "ada".to_string(),
                password: "nope".to_string(),
            }))
            .await
            .unwrap_err();
        let unknown = rpc
            .login(Request::new(proto::LoginRequest {
                username: "ghost".to_string(),
                password: "nope".to_string(),
            }))
            .await
            .unwrap_err();

        assert_eq!(wrong.code(), tonic::Code::Unauthenticated);
        assert_eq!(unknown.code(), tonic::Code::Unauthenticated);
        assert_eq!(wrong.message(), unknown.message());
    }

    #[tokio::test]
    async fn refresh_exchanges_for_a_new_bearer() {
        let store = store_with_admin().await;
        let rpc = AuthRpc::new(store.clone());

        let login = rpc
            .login(Request::new(proto::LoginRequest {
                username: "ada".to_string(),
                password: "correcthorse".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        let refreshed = rpc
            .refresh(Request::new(proto::RefreshRequest {
                refresh_token: login.refresh_token.clone(),
            }))
            .await
            .unwrap()
            .into_inner();

        let settings = store.load_server_settings().await.unwrap().unwrap();
        let tokens = TokenService::from_settings(&settings).unwrap();
        assert!(tokens.verify(&refreshed.token).is_ok());
    }

    #[tokio::test]
    async fn bogus_refresh_token_is_rejected() {
        let store = store_with_admin().await;
        let rpc = AuthRpc::new(store);
        let err = rpc
            .refresh(Request::new(proto::RefreshRequest {
                refresh_token: "bogus".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn cluster_rpcs_unavailable_without_raft() {
        let rpc = ClusterRpc::new(None);
        let err = rpc
            .apply(Request::new(proto::ApplyRequest { command: vec![] }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);

        let err = rpc
            .append_entries(Request::new(proto::RaftMessage { payload: vec![] }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn get_config_reports_fresh_store_as_absent() {
        let rpc = ConfigRpc::new(Arc::new(MemoryStore::new()));
        let resp = rpc
            .get_config(Request::new(proto::GetConfigRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.config.is_none());
    }
}
