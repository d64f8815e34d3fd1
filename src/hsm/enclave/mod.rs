// Pinseal — Secure Enclave backend
//
// Secrets are ECIES-encrypted to a non-exportable P-256 key held by the
// enclave. Two keys exist: a plain one for unattended use and one whose
// access control requires biometrics. The flag recorded in each blob picks
// the key at unseal time.
//
// The ciphertext is kept in the pinseal blob store like every other
// backend's, not as a generic-password item in the macOS keychain. Only
// the enclave key lives in the OS credential store. Store locking and
// `exists` without authentication then behave the same on every backend.

pub mod ecies;
mod simulator;
pub use simulator::{SimulatedEnclave, UserPresence};

#[cfg(all(target_os = "macos", feature = "secure-enclave"))]
mod darwin;
#[cfg(all(target_os = "macos", feature = "secure-enclave"))]
pub use darwin::DarwinEnclave;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use p256::PublicKey;
use zeroize::Zeroizing;

use super::backend::{BiometricGate, SealBackend};
use super::types::{
    BackendMetadata, EnclaveStatus, HsmMethod, HsmStatus, Identity, SealPolicy, SealedPayload,
    SealedSecret,
};
use super::HsmError;

/// Keychain tag prefix for enclave-resident keys.
pub const KEY_TAG_PREFIX: &str = "com.pinseal.se-key.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnclaveKey {
    /// Usable without user interaction while the device is unlocked.
    Standard,
    /// Every private-key operation requires a biometric match.
    Biometric,
}

impl EnclaveKey {
    pub fn for_policy(require_biometric: bool) -> Self {
        if require_biometric {
            EnclaveKey::Biometric
        } else {
            EnclaveKey::Standard
        }
    }

    pub fn tag(&self) -> String {
        match self {
            EnclaveKey::Standard => format!("{}standard", KEY_TAG_PREFIX),
            EnclaveKey::Biometric => format!("{}biometric", KEY_TAG_PREFIX),
        }
    }
}

pub trait EnclaveDevice: Send + Sync {
    fn is_present(&self) -> bool;

    fn biometric_available(&self) -> bool;

    fn key_exists(&self, key: EnclaveKey) -> bool;

    /// Generate the key inside the enclave if it does not exist yet.
    fn ensure_key(&self, key: EnclaveKey) -> Result<(), HsmError>;

    fn public_key(&self, key: EnclaveKey) -> Result<PublicKey, HsmError>;

    /// ECIES-decrypt inside the enclave. May block on a biometric prompt
    /// showing `reason` when `key` is `Biometric`.
    fn decrypt(
        &self,
        key: EnclaveKey,
        message: &[u8],
        reason: &str,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError>;
}

// ─── Platform error codes ────────────────────────────────────────────────────

pub mod os_status {
    pub const USER_CANCELED: i64 = -128;
    pub const ALLOCATE: i64 = -108;
    pub const IO: i64 = -36;
    pub const AUTH_FAILED: i64 = -25293;
    pub const DUPLICATE_ITEM: i64 = -25299;
    pub const ITEM_NOT_FOUND: i64 = -25300;
    pub const INTERACTION_NOT_ALLOWED: i64 = -25308;
    pub const MISSING_ENTITLEMENT: i64 = -34018;
}

pub mod la_error {
    pub const AUTHENTICATION_FAILED: i64 = -1;
    pub const USER_CANCEL: i64 = -2;
    pub const SYSTEM_CANCEL: i64 = -4;
    pub const PASSCODE_NOT_SET: i64 = -5;
    pub const BIOMETRY_NOT_AVAILABLE: i64 = -6;
    pub const BIOMETRY_NOT_ENROLLED: i64 = -7;
    pub const BIOMETRY_LOCKOUT: i64 = -8;
}

/// Normalize a Security.framework `OSStatus`.
pub fn map_os_status(code: i64, context: &str) -> HsmError {
    let detail = format!("{} (OSStatus {})", context, code);
    match code {
        os_status::USER_CANCELED => HsmError::Cancelled,
        os_status::ITEM_NOT_FOUND => HsmError::NotFound(detail),
        os_status::AUTH_FAILED => HsmError::AuthFailed(detail),
        os_status::INTERACTION_NOT_ALLOWED | os_status::MISSING_ENTITLEMENT => {
            HsmError::Permission(detail)
        }
        os_status::ALLOCATE => HsmError::Memory(detail),
        os_status::IO => HsmError::Io(std::io::Error::other(detail)),
        _ => HsmError::Internal(detail),
    }
}

/// Normalize a LocalAuthentication `LAError` code.
pub fn map_la_error(code: i64, context: &str) -> HsmError {
    let detail = format!("{} (LAError {})", context, code);
    match code {
        la_error::USER_CANCEL | la_error::SYSTEM_CANCEL => HsmError::Cancelled,
        la_error::AUTHENTICATION_FAILED | la_error::BIOMETRY_LOCKOUT => {
            HsmError::AuthFailed(detail)
        }
        la_error::PASSCODE_NOT_SET
        | la_error::BIOMETRY_NOT_AVAILABLE
        | la_error::BIOMETRY_NOT_ENROLLED => HsmError::NotAvailable(detail),
        _ => HsmError::Internal(detail),
    }
}

// ─── Backend ─────────────────────────────────────────────────────────────────

pub struct SecureEnclaveBackend {
    device: Arc<dyn EnclaveDevice>,
    initialized: AtomicBool,
}

impl SecureEnclaveBackend {
    pub fn new(device: Arc<dyn EnclaveDevice>) -> Self {
        Self {
            device,
            initialized: AtomicBool::new(false),
        }
    }

    fn ensure_initialized(&self) -> Result<(), HsmError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.initialize()
        }
    }
}

impl SealBackend for SecureEnclaveBackend {
    fn method(&self) -> HsmMethod {
        HsmMethod::SecureEnclave
    }

    fn is_available(&self) -> bool {
        self.device.is_present()
    }

    fn initialize(&self) -> Result<(), HsmError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.device.is_present() {
            return Err(HsmError::NotAvailable("no Secure Enclave".to_string()));
        }
        self.device.ensure_key(EnclaveKey::Standard)?;
        self.initialized.store(true, Ordering::Release);
        tracing::info!("Secure Enclave key ready");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn status(&self, policy: &SealPolicy) -> HsmStatus {
        HsmStatus {
            method: HsmMethod::SecureEnclave,
            available: self.device.is_present(),
            initialized: self.is_initialized(),
            description: "Secure Enclave P-256 key with ECIES (X9.63 SHA-256, AES-GCM)".to_string(),
            version: "1.0".to_string(),
            tpm: None,
            secure_enclave: Some(EnclaveStatus {
                biometric_available: self.device.biometric_available(),
                key_exists: self
                    .device
                    .key_exists(EnclaveKey::for_policy(policy.require_biometric)),
                require_biometric: policy.require_biometric,
            }),
        }
    }

    fn seal(
        &self,
        identity: &Identity,
        secret: &[u8],
        policy: &SealPolicy,
    ) -> Result<SealedPayload, HsmError> {
        self.ensure_initialized()?;
        if policy.require_biometric && !self.device.biometric_available() {
            return Err(HsmError::NotAvailable(
                "biometric authentication is not enrolled on this device".to_string(),
            ));
        }
        let key = EnclaveKey::for_policy(policy.require_biometric);
        self.device.ensure_key(key)?;
        let public = self.device.public_key(key)?;
        tracing::debug!("Sealing '{}' to enclave key {:?}", identity, key);

        Ok(SealedPayload {
            ciphertext: ecies::encrypt(&public, secret)?,
            metadata: BackendMetadata::SecureEnclave {
                require_biometric: policy.require_biometric,
            },
        })
    }

    fn unseal(
        &self,
        identity: &Identity,
        sealed: &SealedSecret,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        let BackendMetadata::SecureEnclave { require_biometric } = sealed.metadata else {
            return Err(HsmError::UnsealFailed(format!(
                "blob was sealed by {}, not the Secure Enclave",
                sealed.method()
            )));
        };
        self.ensure_initialized()?;
        let key = EnclaveKey::for_policy(require_biometric);
        let reason = format!("unlock the hardware token PIN for '{}'", identity);
        self.device
            .decrypt(key, &sealed.ciphertext()?, &reason)
            .map_err(|e| match e {
                HsmError::NotFound(_) => HsmError::NotFound(identity.to_string()),
                other => other,
            })
    }

    fn biometric_gate(&self) -> Option<&dyn BiometricGate> {
        Some(self)
    }
}

impl BiometricGate for SecureEnclaveBackend {
    fn biometric_available(&self) -> bool {
        self.device.biometric_available()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
