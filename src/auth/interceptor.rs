//! The method-level authentication gate.
//!
//! Every RPC passes through [`AuthLayer`] before dispatch. The gate
//! consults the per-method policy table (the companion of
//! `proto/gastrolog.proto` — adding a method there requires declaring its
//! policy here) and the [`UserDirectory`] collaborator, then either
//! rejects the call or attaches the verified [`Claims`] to the request
//! extensions for downstream handlers.
//!
//! The gate fails closed:
//! - zero users (first boot) rejects every non-public method, so nothing
//!   is reachable until bootstrap has provisioned an account;
//! - a failing user-count lookup is `Internal`, never a pass;
//! - a token issued before the user's `token_invalidated_at` is dead, which
//!   is what makes password changes revoke outstanding sessions;
//! - a method missing from the policy table is treated as admin-only.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tonic::body::BoxBody;
use tower::{Layer, Service};
use tracing::warn;

use crate::auth::token::{Claims, TokenService};
use crate::error::{Error, Result};
use crate::model::{truncate_micros, Id, Role};
use crate::store::Store;

// ── Method policies ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodPolicy {
    /// No token required.
    Public,
    /// Any valid token.
    Authenticated,
    /// Valid token with the admin role.
    AdminOnly,
}

/// Policy for a full gRPC method path (`/gastrolog.Service/Method`).
///
/// Cluster transport is public at this layer: it is reachable only over
/// the cluster's own TLS, which is enforced outside the user-auth gate.
pub fn method_policy(path: &str) -> MethodPolicy {
    match path {
        "/gastrolog.ClusterService/AppendEntries"
        | "/gastrolog.ClusterService/Vote"
        | "/gastrolog.ClusterService/InstallSnapshot"
        | "/gastrolog.ClusterService/Apply" => MethodPolicy::Public,
        "/gastrolog.AuthService/Login" | "/gastrolog.AuthService/Refresh" => MethodPolicy::Public,
        "/gastrolog.ConfigService/GetConfig" => MethodPolicy::AdminOnly,
        other => {
            // Undeclared methods get the most restrictive policy.
            warn!(method = other, "no declared policy for method; treating as admin-only");
            MethodPolicy::AdminOnly
        }
    }
}

// ── UserDirectory collaborator ────────────────────────────────────────────

/// What the gate needs to know about users: how many exist (first-boot
/// detection) and when a given user's tokens were last invalidated.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_count(&self) -> Result<u64>;

    /// `NotFound` when the user no longer exists.
    async fn token_invalidated_at(&self, user_id: Id) -> Result<Option<DateTime<Utc>>>;
}

/// [`UserDirectory`] over any [`Store`].
pub struct StoreDirectory(pub Arc<dyn Store>);

#[async_trait]
impl UserDirectory for StoreDirectory {
    async fn user_count(&self) -> Result<u64> {
        self.0.count_users().await
    }

    async fn token_invalidated_at(&self, user_id: Id) -> Result<Option<DateTime<Utc>>> {
        match self.0.get_user(user_id).await? {
            Some(user) => Ok(user.token_invalidated_at),
            None => Err(Error::NotFound(format!("user {user_id}"))),
        }
    }
}

// ── The gate ──────────────────────────────────────────────────────────────

pub struct AuthGate {
    tokens: TokenService,
    users: Arc<dyn UserDirectory>,
}

impl AuthGate {
    pub fn new(tokens: TokenService, users: Arc<dyn UserDirectory>) -> Self {
        AuthGate { tokens, users }
    }

    /// Run the decision table for one call.
    ///
    /// `Ok(Some(claims))` means authenticated: attach the claims and
    /// dispatch. `Ok(None)` means the method is public.
    pub async fn check(&self, method_path: &str, bearer: Option<&str>) -> Result<Option<Claims>> {
        let policy = method_policy(method_path);
        if policy == MethodPolicy::Public {
            return Ok(None);
        }

        let count = self
            .users
            .user_count()
            .await
            .map_err(|e| Error::internal(anyhow::anyhow!("user count unavailable: {e}")))?;
        if count == 0 {
            // First boot: nothing is authenticated until bootstrap has
            // provisioned an account.
            return Err(Error::Unauthenticated(
                "no users provisioned; complete first-boot setup".to_string(),
            ));
        }

        let token = bearer
            .ok_or_else(|| Error::Unauthenticated("missing bearer token".to_string()))?;
        let claims = self.tokens.verify(token)?;

        let user_id = claims
            .user_id()
            .map_err(|_| Error::Unauthenticated("malformed token subject".to_string()))?;
        let invalidated = match self.users.token_invalidated_at(user_id).await {
            Ok(at) => at,
            Err(Error::NotFound(_)) => {
                return Err(Error::Unauthenticated("user no longer exists".to_string()))
            }
            Err(e) => {
                return Err(Error::internal(anyhow::anyhow!(
                    "token invalidation lookup failed: {e}"
                )))
            }
        };
        if let Some(at) = invalidated {
            if claims.issued_at() < truncate_micros(at) {
                return Err(Error::Unauthenticated("token has been revoked".to_string()));
            }
        }

        if policy == MethodPolicy::AdminOnly {
            let role = claims
                .role()
                .map_err(|_| Error::Unauthenticated("malformed token role".to_string()))?;
            if role != Role::Admin {
                return Err(Error::PermissionDenied(
                    "administrator role required".to_string(),
                ));
            }
        }

        Ok(Some(claims))
    }
}

/// Pull the token out of an `authorization: Bearer <token>` header.
pub fn bearer_from_headers(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// ── Tower layer ───────────────────────────────────────────────────────────

/// Wraps the tonic router; rejected calls answer with a trailers-only gRPC
/// error before reaching any service.
#[derive(Clone)]
pub struct AuthLayer {
    gate: Arc<AuthGate>,
}

impl AuthLayer {
    pub fn new(gate: Arc<AuthGate>) -> Self {
        AuthLayer { gate }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            gate: self.gate.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    gate: Arc<AuthGate>,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for AuthMiddleware<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<BoxBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        let gate = self.gate.clone();
        // Swap in the clone so the original (ready) service drives the call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let path = req.uri().path().to_string();
            let bearer = bearer_from_headers(req.headers()).map(str::to_string);

            match gate.check(&path, bearer.as_deref()).await {
                Ok(Some(claims)) => {
                    req.extensions_mut().insert(claims);
                }
                Ok(None) => {}
                Err(e) => return Ok(deny(e.into())),
            }
            inner.call(req).await
        })
    }
}

/// Trailers-only gRPC error response.
fn deny(status: tonic::Status) -> http::Response<BoxBody> {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .header("grpc-status", (status.code() as i32).to_string())
        .header(
            "grpc-message",
            status
                .message()
                .replace(|c: char| c.is_control(), " "),
        )
        .body(tonic::body::empty_body())
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct MockDirectory {
        count: Result<u64>,
        invalidated: Mutex<Option<DateTime<Utc>>>,
    }

    impl MockDirectory {
        fn with_users(count: u64) -> Arc<Self> {
            Arc::new(MockDirectory {
                count: Ok(count),
                invalidated: Mutex::new(None),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(MockDirectory {
                count: Err(Error::internal(anyhow::anyhow!("backend down"))),
                invalidated: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl UserDirectory for MockDirectory {
        async fn user_count(&self) -> Result<u64> {
            match &self.count {
                Ok(n) => Ok(*n),
                Err(_) => Err(Error::internal(anyhow::anyhow!("backend down"))),
            }
        }

        async fn token_invalidated_at(&self, _user_id: Id) -> Result<Option<DateTime<Utc>>> {
            Ok(*self.invalidated.lock().unwrap())
        }
    }

    fn service() -> TokenService {
        TokenService::new(b"0123456789abcdef0123456789abcdef")
    }

    fn token_for(role: Role, tokens: &TokenService) -> String {
        let now = Utc::now();
        let user = User {
            id: Id::new(),
            username: "ada".to_string(),
            password_hash: String::new(),
            role,
            preferences: BTreeMap::new(),
            token_invalidated_at: None,
            created_at: now,
            updated_at: now,
        };
        tokens.issue(&user).unwrap().0
    }

    const ADMIN_METHOD: &str = "/gastrolog.ConfigService/GetConfig";
    const PUBLIC_METHOD: &str = "/gastrolog.AuthService/Login";

    #[tokio::test]
    async fn public_methods_pass_without_token() {
        let gate = AuthGate::new(service(), MockDirectory::with_users(0));
        assert!(gate.check(PUBLIC_METHOD, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_boot_fails_closed_even_with_a_token() {
        let tokens = service();
        let bearer = token_for(Role::Admin, &tokens);
        let gate = AuthGate::new(tokens, MockDirectory::with_users(0));
        let err = gate.check(ADMIN_METHOD, Some(&bearer)).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let gate = AuthGate::new(service(), MockDirectory::with_users(1));
        let err = gate.check(ADMIN_METHOD, None).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn garbage_token_is_unauthenticated() {
        let gate = AuthGate::new(service(), MockDirectory::with_users(1));
        let err = gate.check(ADMIN_METHOD, Some("garbage")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn admin_token_passes_admin_method() {
        let tokens = service();
        let bearer = token_for(Role::Admin, &tokens);
        let gate = AuthGate::new(tokens, MockDirectory::with_users(1));
        let claims = gate
            .check(ADMIN_METHOD, Some(&bearer))
            .await
            .unwrap()
            .expect("claims");
        assert_eq!(claims.role().unwrap(), Role::Admin);
    }

    #[tokio::test]
    async fn user_role_gets_permission_denied_on_admin_method() {
        let tokens = service();
        let bearer = token_for(Role::User, &tokens);
        let gate = AuthGate::new(tokens, MockDirectory::with_users(1));
        let err = gate.check(ADMIN_METHOD, Some(&bearer)).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn failing_user_count_is_internal() {
        let tokens = service();
        let bearer = token_for(Role::Admin, &tokens);
        let gate = AuthGate::new(tokens, MockDirectory::failing());
        let err = gate.check(ADMIN_METHOD, Some(&bearer)).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn tokens_issued_before_invalidation_die() {
        let tokens = service();
        let bearer = token_for(Role::Admin, &tokens);

        let dir = MockDirectory::with_users(1);
        *dir.invalidated.lock().unwrap() = Some(Utc::now() + chrono::TimeDelta::seconds(5));

        let gate = AuthGate::new(tokens, dir);
        let err = gate.check(ADMIN_METHOD, Some(&bearer)).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(ref m) if m.contains("revoked")));
    }

    #[tokio::test]
    async fn undeclared_methods_are_admin_only() {
        assert_eq!(
            method_policy("/gastrolog.ConfigService/DropEverything"),
            MethodPolicy::AdminOnly
        );
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = http::HeaderMap::new();
        assert!(bearer_from_headers(&headers).is_none());

        headers.insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_static("Bearer abc.def.ghi"),
        );
        assert_eq!(bearer_from_headers(&headers), Some("abc.def.ghi"));

        headers.insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_static("Basic dXNlcjpwdw=="),
        );
        assert!(bearer_from_headers(&headers).is_none());
    }
}
