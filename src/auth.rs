//! Bearer credential validation and issuing. Secrets are stored as
//! SHA-256 hashes only; a principal has at most one active credential.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::error::{GridqError, Result};
use crate::store::Store;

/// Identity resolved from a valid credential.
#[derive(Debug, Clone)]
pub struct AuthPrincipal {
    pub principal: String,
    pub is_admin: bool,
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Resolve a presented secret to its principal. Unknown, deactivated and
/// expired credentials are indistinguishable to the caller.
pub fn validate_secret(store: &Store, secret: &str) -> Result<AuthPrincipal> {
    let record = store
        .lookup_credential(&hash_secret(secret))?
        .ok_or_else(|| GridqError::Unauthenticated("invalid or expired credential".to_string()))?;
    if !record.is_active || record.expires_at < Utc::now() {
        return Err(GridqError::Unauthenticated(
            "invalid or expired credential".to_string(),
        ));
    }
    Ok(AuthPrincipal {
        principal: record.principal,
        is_admin: record.is_admin,
    })
}

/// Issue a credential for `principal`, deactivating any prior active
/// credentials for the same principal. Validity is clamped to
/// `max_validity_days`. Returns the effective expiry.
pub fn issue_credential(
    store: &Store,
    principal: &str,
    secret: &str,
    is_admin: bool,
    validity_days: Option<i64>,
    max_validity_days: i64,
) -> Result<DateTime<Utc>> {
    if principal.is_empty() {
        return Err(GridqError::Validation("principal must be non-empty".to_string()));
    }
    if secret.is_empty() {
        return Err(GridqError::Validation("secret must be non-empty".to_string()));
    }
    let days = validity_days
        .unwrap_or(max_validity_days)
        .clamp(1, max_validity_days);
    let expires_at = Utc::now() + Duration::days(days);
    store.insert_credential(principal, &hash_secret(secret), is_admin, expires_at)?;
    tracing::info!(principal, is_admin, %expires_at, "credential issued");
    Ok(expires_at)
}

/// Deactivate the credential matching `secret`. Returns false when no
/// such credential exists.
pub fn revoke_credential(store: &Store, secret: &str) -> Result<bool> {
    store.deactivate_credential(&hash_secret(secret))
}
