// Pinseal — HSM error taxonomy
//
// Every backend failure is normalized into one of these variants before it
// leaves the facade. Codes are stable so helper processes and scripts can
// branch on them.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HsmError {
    #[error("HSM hardware not available: {0}")]
    NotAvailable(String),

    #[error("HSM not initialized")]
    NotInitialized,

    #[error("Invalid identity or parameter: {0}")]
    InvalidIdentity(String),

    #[error("Failed to seal secret: {0}")]
    SealFailed(String),

    #[error("Failed to unseal secret: {0}")]
    UnsealFailed(String),

    #[error("No secret stored for identity '{0}'")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Platform state changed (PCR mismatch)")]
    PcrMismatch,

    #[error("Memory allocation failed: {0}")]
    Memory(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HsmError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> u8 {
        match self {
            HsmError::NotAvailable(_) => 1,
            HsmError::NotInitialized => 2,
            HsmError::InvalidIdentity(_) => 3,
            HsmError::SealFailed(_) => 4,
            HsmError::UnsealFailed(_) => 5,
            HsmError::NotFound(_) => 6,
            HsmError::AuthFailed(_) => 7,
            HsmError::PcrMismatch => 8,
            HsmError::Memory(_) => 9,
            HsmError::Io(_) => 10,
            HsmError::Permission(_) => 11,
            HsmError::Timeout(_) => 12,
            HsmError::Cancelled => 13,
            HsmError::Internal(_) => 99,
        }
    }

    /// Operator-facing explanation, one per variant, never collapsed.
    pub fn diagnostic(&self) -> String {
        match self {
            HsmError::NotAvailable(detail) => format!(
                "no usable hardware security module ({}); check TPM/Secure Enclave access or enable the keychain fallback",
                detail
            ),
            HsmError::NotInitialized => {
                "HSM is not initialized; run `pinseal init` first".to_string()
            }
            HsmError::InvalidIdentity(detail) => format!(
                "invalid input: {} (identities are 1-64 bytes, secrets 1-256 bytes)",
                detail
            ),
            HsmError::SealFailed(detail) => {
                format!("could not protect the secret with the HSM: {}", detail)
            }
            HsmError::UnsealFailed(detail) => format!(
                "the HSM refused to release the secret: {}; re-store it if the problem persists",
                detail
            ),
            HsmError::NotFound(identity) => format!(
                "no PIN is stored for '{}'; store one with `pinseal pin store {}`",
                identity, identity
            ),
            HsmError::AuthFailed(detail) => format!(
                "HSM authorization failed ({}); the key may require a different user or biometric enrollment",
                detail
            ),
            HsmError::PcrMismatch => "boot configuration changed; re-store the secret after verifying system integrity".to_string(),
            HsmError::Memory(detail) => format!("the HSM ran out of resources: {}", detail),
            HsmError::Io(e) => format!("storage I/O failure: {}", e),
            HsmError::Permission(detail) => format!(
                "permission denied: {}; check device and store directory permissions",
                detail
            ),
            HsmError::Timeout(detail) => {
                format!("the HSM did not respond in time ({}); retry the operation", detail)
            }
            HsmError::Cancelled => "the request was cancelled at the authentication prompt".to_string(),
            HsmError::Internal(detail) => format!("internal error: {}", detail),
        }
    }
}

impl From<io::Error> for HsmError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied {
            HsmError::Permission(e.to_string())
        } else {
            HsmError::Io(e)
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
