// Pinseal — Keychain fallback backend
//
// Software sealing for hosts with neither a TPM nor a Secure Enclave. A
// random master secret lives in the platform keyring; an AES-256-GCM key is
// derived from it with Argon2id once per facade and bound to each blob with
// the identity as associated data.
//
// Flow:
//   1. `initialize()` loads or creates the master secret and derives the blob key
//   2. `seal()` encrypts with a fresh 96-bit nonce: nonce || ciphertext || tag
//   3. `unseal()` authenticates identity + ciphertext before releasing plaintext

use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::backend::SealBackend;
use super::types::{
    BackendMetadata, HsmMethod, HsmStatus, Identity, SealPolicy, SealedPayload, SealedSecret,
};
use super::HsmError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Service name used to identify Pinseal entries in the platform keyring.
pub const KEYRING_SERVICE: &str = "pinseal-hsm";

/// Username for the keyring entry (identifies the master secret).
pub const KEYRING_USER: &str = "master-secret";

/// Length of the randomly generated master secret in bytes (256-bit entropy).
const MASTER_SECRET_LEN: usize = 32;

/// Length of the derived blob key in bytes (AES-256).
const DERIVED_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

// ─── KDF parameters ──────────────────────────────────────────────────────────

/// Argon2id cost parameters. Defaults: m=65536 (64 MiB), t=3, p=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 65536,
            t_cost: 3,
            p_cost: 4,
        }
    }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over master secret storage, enabling the platform keyring in
/// production and an in-memory mock in tests.
pub trait MasterKeyProvider: Send + Sync {
    /// Retrieve the master secret, generating and storing one on first use.
    /// Not atomic: `Hsm::initialize` serializes first use across processes.
    fn get_or_create_master_secret(&self) -> Result<Zeroizing<Vec<u8>>, HsmError>;

    /// Check if a master secret already exists.
    fn has_master_secret(&self) -> Result<bool, HsmError>;

    /// Delete the master secret.
    /// WARNING: every blob sealed by this backend becomes unrecoverable.
    fn delete_master_secret(&self) -> Result<(), HsmError>;

    /// `(service, user)` pair, used to build the derivation salt.
    fn salt_context(&self) -> (&str, &str);
}

// ─── Platform Implementation ─────────────────────────────────────────────────

/// Production implementation using the `keyring` crate.
/// Dispatches to:
///   - Linux: kernel keyutils
///   - macOS: Security.framework Keychain
///   - Windows: Windows Credential Manager
pub struct KeyringProvider {
    service: String,
    user: String,
}

impl KeyringProvider {
    pub fn new() -> Self {
        Self::with_names(KEYRING_SERVICE, KEYRING_USER)
    }

    /// Creates a provider with custom service/user names.
    pub fn with_names(service: &str, user: &str) -> Self {
        Self {
            service: service.to_string(),
            user: user.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, HsmError> {
        keyring::Entry::new(&self.service, &self.user)
            .map_err(|e| map_keyring_error("failed to create keyring entry", e))
    }
}

impl Default for KeyringProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn map_keyring_error(context: &str, e: keyring::Error) -> HsmError {
    match e {
        keyring::Error::NoStorageAccess(inner) => {
            HsmError::Permission(format!("{}: {}", context, inner))
        }
        keyring::Error::PlatformFailure(inner) => {
            HsmError::NotAvailable(format!("{}: {}", context, inner))
        }
        other => HsmError::Internal(format!("{}: {}", context, other)),
    }
}

fn generate_master_secret() -> Zeroizing<Vec<u8>> {
    let mut secret = Zeroizing::new(vec![0u8; MASTER_SECRET_LEN]);
    rand::rng().fill_bytes(&mut secret);
    secret
}

impl MasterKeyProvider for KeyringProvider {
    fn get_or_create_master_secret(&self) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        let entry = self.entry()?;

        match entry.get_secret() {
            Ok(secret) => {
                tracing::debug!("Retrieved existing master secret from keyring");
                Ok(Zeroizing::new(secret))
            }
            Err(keyring::Error::NoEntry) => {
                tracing::info!("No master secret found, generating a new one");
                let secret = generate_master_secret();
                entry
                    .set_secret(&secret)
                    .map_err(|e| map_keyring_error("failed to store master secret", e))?;
                tracing::info!("Master secret stored in platform keyring");
                Ok(secret)
            }
            Err(e) => Err(map_keyring_error("failed to retrieve master secret", e)),
        }
    }

    fn has_master_secret(&self) -> Result<bool, HsmError> {
        let entry = self.entry()?;
        match entry.get_secret() {
            Ok(secret) => {
                drop(Zeroizing::new(secret));
                Ok(true)
            }
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(map_keyring_error("failed to check master secret", e)),
        }
    }

    fn delete_master_secret(&self) -> Result<(), HsmError> {
        let entry = self.entry()?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::warn!("Master secret deleted from keyring; fallback blobs are now unrecoverable");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("No master secret to delete");
                Ok(())
            }
            Err(e) => Err(map_keyring_error("failed to delete master secret", e)),
        }
    }

    fn salt_context(&self) -> (&str, &str) {
        (&self.service, &self.user)
    }
}

// ─── Derivation ──────────────────────────────────────────────────────────────

/// Salt = SHA-256(service || "::" || user)
fn build_salt(service: &str, user: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update(b"::");
    hasher.update(user.as_bytes());
    hasher.finalize().to_vec()
}

pub fn derive_blob_key(
    master_secret: &[u8],
    salt: &[u8],
    kdf: KdfParams,
) -> Result<Zeroizing<Vec<u8>>, HsmError> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(DERIVED_KEY_LEN))
        .map_err(|e| HsmError::Internal(format!("invalid Argon2 params: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut derived_key = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
    argon2
        .hash_password_into(master_secret, salt, &mut derived_key)
        .map_err(|e| HsmError::Memory(format!("Argon2id hash failed: {}", e)))?;
    Ok(derived_key)
}

// ─── Backend ─────────────────────────────────────────────────────────────────

pub struct KeychainBackend {
    provider: Box<dyn MasterKeyProvider>,
    kdf: KdfParams,
    key: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl KeychainBackend {
    pub fn new(provider: Box<dyn MasterKeyProvider>, kdf: KdfParams) -> Self {
        Self {
            provider,
            kdf,
            key: Mutex::new(None),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, HsmError> {
        let guard = self
            .key
            .lock()
            .map_err(|_| HsmError::Internal("keychain key lock poisoned".to_string()))?;
        let key = guard.as_ref().ok_or(HsmError::NotInitialized)?;
        Aes256Gcm::new_from_slice(key)
            .map_err(|e| HsmError::Internal(format!("invalid blob key: {}", e)))
    }
}

impl SealBackend for KeychainBackend {
    fn method(&self) -> HsmMethod {
        HsmMethod::Keychain
    }

    fn is_available(&self) -> bool {
        true
    }

    fn initialize(&self) -> Result<(), HsmError> {
        let mut guard = self
            .key
            .lock()
            .map_err(|_| HsmError::Internal("keychain key lock poisoned".to_string()))?;
        if guard.is_some() {
            return Ok(());
        }
        let master = self.provider.get_or_create_master_secret()?;
        let (service, user) = self.provider.salt_context();
        let salt = build_salt(service, user);
        *guard = Some(derive_blob_key(&master, &salt, self.kdf)?);
        tracing::debug!("Keychain blob key derived");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.key.lock().map(|k| k.is_some()).unwrap_or(false)
    }

    fn status(&self, _policy: &SealPolicy) -> HsmStatus {
        let has_secret = self.provider.has_master_secret().unwrap_or(false);
        HsmStatus {
            method: HsmMethod::Keychain,
            available: true,
            initialized: self.is_initialized() || has_secret,
            description: "Software fallback: AES-256-GCM key derived from a keyring-held master secret".to_string(),
            version: format!("keyring {}", env!("CARGO_PKG_VERSION")),
            tpm: None,
            secure_enclave: None,
        }
    }

    fn seal(
        &self,
        identity: &Identity,
        secret: &[u8],
        _policy: &SealPolicy,
    ) -> Result<SealedPayload, HsmError> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret,
                    aad: identity.as_str().as_bytes(),
                },
            )
            .map_err(|_| HsmError::SealFailed("AES-256-GCM encryption failed".to_string()))?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);
        Ok(SealedPayload {
            ciphertext,
            metadata: BackendMetadata::Keychain,
        })
    }

    fn unseal(
        &self,
        identity: &Identity,
        sealed: &SealedSecret,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        if sealed.method() != HsmMethod::Keychain {
            return Err(HsmError::UnsealFailed(format!(
                "blob was sealed by {}, not the keychain backend",
                sealed.method()
            )));
        }
        let data = sealed.ciphertext()?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(HsmError::UnsealFailed("sealed blob is truncated".to_string()));
        }
        let (nonce, body) = data.split_at(NONCE_LEN);

        let cipher = self.cipher()?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: identity.as_str().as_bytes(),
                },
            )
            .map_err(|_| {
                HsmError::AuthFailed("blob failed authentication with the keychain key".to_string())
            })?;
        Ok(Zeroizing::new(plaintext))
    }
}

// ─── In-Memory Mock for Testing ──────────────────────────────────────────────


// ─── Tests ───────────────────────────────────────────────────────────────────
