//! Authentication: password hashing, bearer tokens, and the RPC gate.
//!
//! Every configuration mutation is mediated by this subsystem. The pieces:
//!
//! - [`password`] — Argon2id hashing in PHC string form;
//! - [`token`] — HMAC-signed bearer tokens plus opaque refresh tokens;
//! - [`interceptor`] — the per-method policy gate in front of every RPC,
//!   which fails closed on first boot and on any doubt.

pub mod interceptor;
pub mod password;
pub mod token;

pub use interceptor::{
    bearer_from_headers, method_policy, AuthGate, AuthLayer, MethodPolicy, StoreDirectory,
    UserDirectory,
};
pub use password::{hash_password, verify_password};
pub use token::{hash_refresh_token, mint_refresh_token, Claims, TokenService};
