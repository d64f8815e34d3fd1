// Pinseal — HSM data model
//
// Identities, sealed blob envelopes, seal policy, and status snapshots.
// Shape validation happens here so the facade can reject bad input before
// any backend or filesystem work.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HsmError;

/// Maximum identity length in bytes.
pub const MAX_IDENTITY_LEN: usize = 64;

/// Maximum secret length in bytes.
pub const MAX_SECRET_LEN: usize = 256;

/// Default PCR binding: PCR 7 (Secure Boot state).
pub const DEFAULT_PCR_MASK: u32 = 1 << 7;

/// Number of PCRs addressable by a mask.
pub const PCR_COUNT: u32 = 24;

// ─── Identity ────────────────────────────────────────────────────────────────

/// A validated identity key: UTF-8, 1-64 bytes, no control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    pub fn parse(raw: &str) -> Result<Self, HsmError> {
        if raw.is_empty() {
            return Err(HsmError::InvalidIdentity(
                "identity must not be empty".to_string(),
            ));
        }
        if raw.len() > MAX_IDENTITY_LEN {
            return Err(HsmError::InvalidIdentity(format!(
                "identity is {} bytes, maximum is {}",
                raw.len(),
                MAX_IDENTITY_LEN
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(HsmError::InvalidIdentity(
                "identity must not contain control characters".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reject secrets outside 1..=256 bytes.
pub fn validate_secret(secret: &[u8]) -> Result<(), HsmError> {
    if secret.is_empty() {
        return Err(HsmError::InvalidIdentity(
            "secret must not be empty".to_string(),
        ));
    }
    if secret.len() > MAX_SECRET_LEN {
        return Err(HsmError::InvalidIdentity(format!(
            "secret is {} bytes, maximum is {}",
            secret.len(),
            MAX_SECRET_LEN
        )));
    }
    Ok(())
}

// ─── Method ──────────────────────────────────────────────────────────────────

/// Which protection method backs the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HsmMethod {
    None,
    Tpm,
    SecureEnclave,
    Keychain,
}

impl HsmMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HsmMethod::None => "none",
            HsmMethod::Tpm => "tpm",
            HsmMethod::SecureEnclave => "secure-enclave",
            HsmMethod::Keychain => "keychain",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            HsmMethod::None => "None",
            HsmMethod::Tpm => "TPM 2.0",
            HsmMethod::SecureEnclave => "Secure Enclave",
            HsmMethod::Keychain => "Keychain (software fallback)",
        }
    }
}

impl fmt::Display for HsmMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── PCR mask ────────────────────────────────────────────────────────────────

/// Bitmask of PCR indices (bit 0 = PCR 0) in the SHA-256 bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PcrMask(u32);

impl PcrMask {
    pub fn new(mask: u32) -> Result<Self, HsmError> {
        if mask == 0 {
            return Err(HsmError::InvalidIdentity(
                "PCR mask must select at least one PCR".to_string(),
            ));
        }
        if mask >> PCR_COUNT != 0 {
            return Err(HsmError::InvalidIdentity(format!(
                "PCR mask 0x{:08x} selects PCRs above {}",
                mask,
                PCR_COUNT - 1
            )));
        }
        Ok(Self(mask))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Selected PCR indices in ascending order.
    pub fn indices(&self) -> Vec<u8> {
        (0..PCR_COUNT as u8)
            .filter(|i| self.0 & (1 << i) != 0)
            .collect()
    }
}

impl Default for PcrMask {
    fn default() -> Self {
        Self(DEFAULT_PCR_MASK)
    }
}

impl TryFrom<u32> for PcrMask {
    type Error = HsmError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PcrMask> for u32 {
    fn from(mask: PcrMask) -> u32 {
        mask.0
    }
}

impl fmt::Display for PcrMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06x}", self.0)
    }
}

// ─── Seal policy ─────────────────────────────────────────────────────────────

/// Persisted backend options. Changes apply to future seals only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealPolicy {
    #[serde(default)]
    pub pcr_mask: PcrMask,
    #[serde(default)]
    pub require_biometric: bool,
}

impl Default for SealPolicy {
    fn default() -> Self {
        Self {
            pcr_mask: PcrMask::default(),
            require_biometric: false,
        }
    }
}

// ─── Sealed blob ─────────────────────────────────────────────────────────────

/// Backend-specific data recorded next to the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum BackendMetadata {
    Tpm { pcr_mask: PcrMask },
    SecureEnclave { require_biometric: bool },
    Keychain,
}

impl BackendMetadata {
    pub fn method(&self) -> HsmMethod {
        match self {
            BackendMetadata::Tpm { .. } => HsmMethod::Tpm,
            BackendMetadata::SecureEnclave { .. } => HsmMethod::SecureEnclave,
            BackendMetadata::Keychain => HsmMethod::Keychain,
        }
    }
}

/// Output of a backend seal: opaque ciphertext plus its metadata.
#[derive(Debug, Clone)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub metadata: BackendMetadata,
}

/// The persisted envelope for one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSecret {
    pub version: u32,
    pub identity: String,
    /// Hex-encoded backend ciphertext.
    pub blob: String,
    pub metadata: BackendMetadata,
    pub created_at: DateTime<Utc>,
}

impl SealedSecret {
    pub const VERSION: u32 = 1;

    pub fn new(identity: &Identity, payload: SealedPayload) -> Self {
        Self {
            version: Self::VERSION,
            identity: identity.as_str().to_string(),
            blob: hex::encode(&payload.ciphertext),
            metadata: payload.metadata,
            created_at: Utc::now(),
        }
    }

    pub fn ciphertext(&self) -> Result<Vec<u8>, HsmError> {
        hex::decode(&self.blob)
            .map_err(|e| HsmError::UnsealFailed(format!("corrupt sealed blob: {}", e)))
    }

    pub fn method(&self) -> HsmMethod {
        self.metadata.method()
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TpmStatus {
    pub has_primary_key: bool,
    pub manufacturer: Option<String>,
    pub pcr_mask: PcrMask,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnclaveStatus {
    pub biometric_available: bool,
    pub key_exists: bool,
    pub require_biometric: bool,
}

/// Snapshot built fresh on every query.
#[derive(Debug, Clone, Serialize)]
pub struct HsmStatus {
    pub method: HsmMethod,
    pub available: bool,
    pub initialized: bool,
    pub description: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpm: Option<TpmStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure_enclave: Option<EnclaveStatus>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
