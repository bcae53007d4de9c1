//! Server settings: the typed singleton blob stored under the `"server"`
//! settings key.
//!
//! The settings travel as JSON inside a generic string map (snapshots, the
//! `PutSetting` command, the SQL `settings` table) so old nodes can carry
//! newer blobs opaquely. Parsing always runs the legacy-shape migration
//! first: early releases stored `lookup.geoip_db_path` and
//! `auth.min_password_length` as flat fields, which now live under
//! `lookup.maxmind` and `auth.password_policy`.
//!
//! The JWT secret is stored base64-encoded and is not encrypted at rest;
//! operators are expected to rely on filesystem permissions and/or disk
//! encryption.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::units;

/// Settings-map key the server blob lives under.
pub const SERVER_SETTINGS_KEY: &str = "server";

/// Default bearer-token lifetime written by bootstrap.
pub const DEFAULT_TOKEN_DURATION: &str = "15m";
/// Default refresh-token lifetime written by bootstrap (7 days).
pub const DEFAULT_REFRESH_TOKEN_DURATION: &str = "168h";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub auth: AuthSettings,
    pub query: QuerySettings,
    pub scheduler: SchedulerSettings,
    pub tls: TlsSettings,
    pub lookup: LookupSettings,
    pub setup_wizard_dismissed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Base64-encoded HMAC secret for bearer tokens.
    pub jwt_secret: String,
    pub token_duration: String,
    pub refresh_token_duration: String,
    pub password_policy: PasswordPolicy,
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            jwt_secret: String::new(),
            token_duration: DEFAULT_TOKEN_DURATION.to_string(),
            refresh_token_duration: DEFAULT_REFRESH_TOKEN_DURATION.to_string(),
            password_policy: PasswordPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    pub min_length: u32,
    pub require_number: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        PasswordPolicy {
            min_length: 8,
            require_number: false,
            require_special: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub max_results: u64,
    pub timeout: String,
}

impl Default for QuerySettings {
    fn default() -> Self {
        QuerySettings {
            max_results: 10_000,
            timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_interval: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            tick_interval: "1m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    /// Certificate entity to serve, when enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<crate::model::Id>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupSettings {
    pub maxmind: MaxMindSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxMindSettings {
    pub geoip_db_path: String,
    pub asn_db_path: String,
}

impl ServerSettings {
    /// Parse a settings blob, migrating legacy flat fields first.
    pub fn from_json(raw: &str) -> Result<ServerSettings> {
        let mut value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::InvalidArgument(format!("malformed server settings: {e}")))?;
        migrate_legacy_shape(&mut value);
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidArgument(format!("malformed server settings: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::internal)
    }

    /// Decoded HMAC secret.
    pub fn jwt_secret_bytes(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.auth.jwt_secret)
            .map_err(|e| Error::InvalidArgument(format!("malformed jwt secret: {e}")))
    }

    pub fn token_duration(&self) -> Result<std::time::Duration> {
        units::parse_duration(&self.auth.token_duration)
    }

    pub fn refresh_token_duration(&self) -> Result<std::time::Duration> {
        units::parse_duration(&self.auth.refresh_token_duration)
    }
}

/// Rewrite pre-nesting settings JSON in place.
///
/// Handled shapes:
///   `{"lookup": {"geoip_db_path": ..., "asn_db_path": ...}}`
///     → `{"lookup": {"maxmind": {...}}}`
///   `{"auth": {"min_password_length": N, "password_require_number": b,
///              "password_require_special": b}}`
///     → `{"auth": {"password_policy": {...}}}`
///
/// Nested fields win when both shapes are present.
pub fn migrate_legacy_shape(value: &mut Value) {
    if let Some(lookup) = value.get_mut("lookup").and_then(Value::as_object_mut) {
        let mut maxmind = lookup
            .get("maxmind")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (legacy, field) in [("geoip_db_path", "geoip_db_path"), ("asn_db_path", "asn_db_path")]
        {
            if let Some(v) = lookup.remove(legacy) {
                maxmind.entry(field.to_string()).or_insert(v);
            }
        }
        if !maxmind.is_empty() {
            lookup.insert("maxmind".to_string(), Value::Object(maxmind));
        }
    }

    if let Some(auth) = value.get_mut("auth").and_then(Value::as_object_mut) {
        let mut policy = auth
            .get("password_policy")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (legacy, field) in [
            ("min_password_length", "min_length"),
            ("password_require_number", "require_number"),
            ("password_require_special", "require_special"),
        ] {
            if let Some(v) = auth.remove(legacy) {
                policy.entry(field.to_string()).or_insert(v);
            }
        }
        if !policy.is_empty() {
            auth.insert("password_policy".to_string(), Value::Object(policy));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn defaults_carry_bootstrap_durations() {
        let s = ServerSettings::default();
        assert_eq!(s.auth.token_duration, "15m");
        assert_eq!(s.auth.refresh_token_duration, "168h");
        assert_eq!(s.auth.password_policy.min_length, 8);
        assert!(!s.setup_wizard_dismissed);
    }

    #[test]
    fn json_roundtrip() {
        let mut s = ServerSettings::default();
        s.auth.jwt_secret = "c2VjcmV0".to_string();
        s.setup_wizard_dismissed = true;
        let raw = s.to_json().unwrap();
        assert_eq!(ServerSettings::from_json(&raw).unwrap(), s);
    }

    #[test]
    fn legacy_flat_fields_migrate_to_nested() {
        let raw = r#"{
            "lookup": {"geoip_db_path": "/var/lib/geoip.mmdb"},
            "auth": {"min_password_length": 12}
        }"#;
        let s = ServerSettings::from_json(raw).unwrap();
        assert_eq!(s.lookup.maxmind.geoip_db_path, "/var/lib/geoip.mmdb");
        assert_eq!(s.auth.password_policy.min_length, 12);
    }

    #[test]
    fn nested_fields_win_over_legacy() {
        let raw = r#"{
            "lookup": {
                "geoip_db_path": "/old.mmdb",
                "maxmind": {"geoip_db_path": "/new.mmdb"}
            }
        }"#;
        let s = ServerSettings::from_json(raw).unwrap();
        assert_eq!(s.lookup.maxmind.geoip_db_path, "/new.mmdb");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"auth": {"token_duration": "30m"}, "experimental": true}"#;
        let s = ServerSettings::from_json(raw).unwrap();
        assert_eq!(s.auth.token_duration, "30m");
    }

    #[test]
    fn secret_decodes() {
        let mut s = ServerSettings::default();
        s.auth.jwt_secret =
            base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert_eq!(s.jwt_secret_bytes().unwrap(), vec![7u8; 32]);

        s.auth.jwt_secret = "!!!".to_string();
        assert!(s.jwt_secret_bytes().is_err());
    }

    #[test]
    fn duration_accessors_parse() {
        let s = ServerSettings::default();
        assert_eq!(
            s.token_duration().unwrap(),
            std::time::Duration::from_secs(15 * 60)
        );
        assert_eq!(
            s.refresh_token_duration().unwrap(),
            std::time::Duration::from_secs(168 * 3600)
        );
    }
}
