//! Bearer and refresh tokens.
//!
//! Bearer tokens are HS256-signed JWTs carrying the user ID, username,
//! and role. Verification rejects bad signatures, foreign algorithm
//! families, expiry, and structural garbage; the issued-before-invalidation
//! check lives in the interceptor because it needs the user record.
//!
//! Refresh tokens are opaque random strings; only their SHA-256 hex hash
//! is ever persisted.

use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{Id, Role, User};
use crate::settings::ServerSettings;

/// Token lifetime when none is configured: 7 days.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(7 * 24 * 3600);

/// Claims carried by every bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub uid: String,
    /// Username.
    pub sub: String,
    pub role: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> Result<Id> {
        self.uid.parse()
    }

    pub fn role(&self) -> Result<Role> {
        self.role.parse()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.iat, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Issues and verifies bearer tokens with a symmetric secret.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl TokenService {
    pub fn new(secret: &[u8]) -> Self {
        TokenService {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Build from the stored server settings (secret + token duration).
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let secret = settings.jwt_secret_bytes()?;
        Ok(TokenService::new(&secret).with_lifetime(settings.token_duration()?))
    }

    /// Issue a token for `user`, returning it with its expiry instant.
    pub fn issue(&self, user: &User) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now
            + chrono::TimeDelta::from_std(self.lifetime)
                .map_err(|e| Error::internal(anyhow::anyhow!("token lifetime: {e}")))?;

        let claims = Claims {
            uid: user.id.to_string(),
            sub: user.username.clone(),
            role: user.role.as_str().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::internal(anyhow::anyhow!("token signing failed: {e}")))?;
        Ok((token, expires_at))
    }

    /// Verify signature, algorithm, expiry, and structure.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthenticated(format!("invalid token: {e}")))
    }
}

/// Mint an opaque refresh token: `(token, sha256_hex_hash)`.
///
/// The token goes to the client; only the hash is stored.
pub fn mint_refresh_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_refresh_token(&token);
    (token, hash)
}

pub fn hash_refresh_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}
