//! Argon2id password hashing.
//!
//! Hashes are stored in PHC string form
//! (`$argon2id$v=19$m=...,t=...,p=...$<salt>$<hash>`) with a fresh random
//! salt per password, so two hashes of the same password never match.
//! Verification re-derives with the parameters embedded in the stored
//! string and compares in constant time inside the argon2 verifier.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};

use crate::error::{Error, Result};

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::internal(anyhow::anyhow!("password hashing failed: {e}")))
}

/// Check a password against a stored PHC string.
///
/// A malformed stored hash is `InvalidArgument`; a well-formed hash that
/// simply does not match is `Ok(false)`.
pub fn verify_password(password: &str, phc: &str) -> Result<bool> {
    let parsed = PasswordHash::new(phc)
        .map_err(|e| Error::InvalidArgument(format!("invalid password hash: {e}")))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(Error::InvalidArgument(format!("invalid password hash: {e}"))),
    }
}
