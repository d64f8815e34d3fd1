// Pinseal — Simulated Secure Enclave
//
// Holds P-256 keys in process memory (optionally mirrored to a state file)
// and answers biometric prompts from a scripted `UserPresence`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{ecies, la_error, map_la_error, EnclaveDevice, EnclaveKey};
use crate::fsutil;
use crate::hsm::HsmError;

/// Scripted answer to the next biometric prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPresence {
    Approve,
    Decline,
    Fail,
}

#[derive(Default, Serialize, Deserialize)]
struct EnclaveState {
    #[serde(default)]
    standard: Option<String>,
    #[serde(default)]
    biometric: Option<String>,
}

pub struct SimulatedEnclave {
    keys: Mutex<HashMap<EnclaveKey, SecretKey>>,
    presence: Mutex<UserPresence>,
    biometrics: bool,
    prompts: AtomicUsize,
    state_path: Option<PathBuf>,
}

impl SimulatedEnclave {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            presence: Mutex::new(UserPresence::Approve),
            biometrics: true,
            prompts: AtomicUsize::new(0),
            state_path: None,
        }
    }

    pub fn without_biometrics() -> Self {
        Self {
            biometrics: false,
            ..Self::new()
        }
    }

    /// Enclave whose keys persist in a JSON state file.
    pub fn persistent(path: &Path) -> Result<Self, HsmError> {
        let enclave = Self {
            state_path: Some(path.to_path_buf()),
            ..Self::new()
        };
        let state: EnclaveState = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                HsmError::NotAvailable(format!("invalid enclave state {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => EnclaveState::default(),
            Err(e) => return Err(e.into()),
        };
        {
            let mut keys = enclave.lock_keys()?;
            for (slot, encoded) in [
                (EnclaveKey::Standard, state.standard),
                (EnclaveKey::Biometric, state.biometric),
            ] {
                if let Some(encoded) = encoded {
                    let bytes = Zeroizing::new(hex::decode(encoded).map_err(|_| {
                        HsmError::NotAvailable("corrupt enclave key".to_string())
                    })?);
                    let key = SecretKey::from_slice(&bytes)
                        .map_err(|_| HsmError::NotAvailable("corrupt enclave key".to_string()))?;
                    keys.insert(slot, key);
                }
            }
        }
        Ok(enclave)
    }

    pub fn set_presence(&self, presence: UserPresence) {
        if let Ok(mut current) = self.presence.lock() {
            *current = presence;
        }
    }

    /// Number of biometric prompts shown so far.
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    fn lock_keys(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<EnclaveKey, SecretKey>>, HsmError> {
        self.keys
            .lock()
            .map_err(|_| HsmError::Internal("simulated enclave lock poisoned".to_string()))
    }

    fn save(&self, keys: &HashMap<EnclaveKey, SecretKey>) -> Result<(), HsmError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let encode = |slot| keys.get(&slot).map(|k: &SecretKey| hex::encode(k.to_bytes()));
        let state = EnclaveState {
            standard: encode(EnclaveKey::Standard),
            biometric: encode(EnclaveKey::Biometric),
        };
        let json = Zeroizing::new(serde_json::to_vec(&state).map_err(|e| {
            HsmError::Internal(format!("failed to encode enclave state: {}", e))
        })?);
        if let Some(dir) = path.parent() {
            fsutil::ensure_private_dir(dir)?;
        }
        fsutil::atomic_write(path, &json)?;
        Ok(())
    }

    fn prompt(&self, reason: &str) -> Result<(), HsmError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Simulated biometric prompt: {}", reason);
        let presence = *self
            .presence
            .lock()
            .map_err(|_| HsmError::Internal("simulated enclave lock poisoned".to_string()))?;
        match presence {
            UserPresence::Approve => Ok(()),
            UserPresence::Decline => Err(map_la_error(la_error::USER_CANCEL, reason)),
            UserPresence::Fail => Err(map_la_error(la_error::AUTHENTICATION_FAILED, reason)),
        }
    }
}

impl Default for SimulatedEnclave {
    fn default() -> Self {
        Self::new()
    }
}

impl EnclaveDevice for SimulatedEnclave {
    fn is_present(&self) -> bool {
        true
    }

    fn biometric_available(&self) -> bool {
        self.biometrics
    }

    fn key_exists(&self, key: EnclaveKey) -> bool {
        self.keys
            .lock()
            .map(|keys| keys.contains_key(&key))
            .unwrap_or(false)
    }

    fn ensure_key(&self, key: EnclaveKey) -> Result<(), HsmError> {
        let mut keys = self.lock_keys()?;
        if keys.contains_key(&key) {
            return Ok(());
        }
        keys.insert(key, ecies::random_secret_key());
        tracing::debug!("Simulated enclave key {} created", key.tag());
        self.save(&keys)
    }

    fn public_key(&self, key: EnclaveKey) -> Result<PublicKey, HsmError> {
        self.lock_keys()?
            .get(&key)
            .map(SecretKey::public_key)
            .ok_or_else(|| HsmError::NotFound(key.tag()))
    }

    fn decrypt(
        &self,
        key: EnclaveKey,
        message: &[u8],
        reason: &str,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        if key == EnclaveKey::Biometric {
            self.prompt(reason)?;
        }
        let keys = self.lock_keys()?;
        let secret = keys.get(&key).ok_or_else(|| HsmError::NotFound(key.tag()))?;
        ecies::decrypt(secret, message)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_created_once() {
        let enclave = SimulatedEnclave::new();
        enclave.ensure_key(EnclaveKey::Standard).unwrap();
        let first = enclave.public_key(EnclaveKey::Standard).unwrap();
        enclave.ensure_key(EnclaveKey::Standard).unwrap();
        assert_eq!(first, enclave.public_key(EnclaveKey::Standard).unwrap());
        assert!(!enclave.key_exists(EnclaveKey::Biometric));
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let enclave = SimulatedEnclave::new();
        assert!(matches!(
            enclave.public_key(EnclaveKey::Standard),
            Err(HsmError::NotFound(_))
        ));
    }

    #[test]
    fn test_persistent_keys_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enclave.json");

        let first = SimulatedEnclave::persistent(&path).unwrap();
        first.ensure_key(EnclaveKey::Standard).unwrap();
        let public = first.public_key(EnclaveKey::Standard).unwrap();
        let message = ecies::encrypt(&public, b"123456").unwrap();

        let second = SimulatedEnclave::persistent(&path).unwrap();
        assert_eq!(
            second
                .decrypt(EnclaveKey::Standard, &message, "test")
                .unwrap()
                .as_slice(),
            b"123456"
        );
    }
}
