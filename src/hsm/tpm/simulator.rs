// Pinseal — Simulated TPM
//
// Software stand-in for a TPM 2.0 chip: a SHA-256 PCR bank that can be
// extended, a storage seed that plays the role of the owner hierarchy, and
// PolicyPCR-style sealing. Used by tests and by the `tpm-simulator` backend.
// With a state file, separate processes share one simulated chip.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{map_response_code, rc, TpmDevice, TpmOp, TpmSealedObject};
use crate::fsutil;
use crate::hsm::types::{PcrMask, PCR_COUNT};
use crate::hsm::HsmError;

const DIGEST_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// mask(4) || policy digest(32) || nonce(12)
const PUBLIC_LEN: usize = 4 + DIGEST_LEN + NONCE_LEN;

#[derive(Clone, Serialize, Deserialize)]
struct SimState {
    seed: String,
    pcrs: Vec<String>,
    primary_created: bool,
}

struct Inner {
    seed: Zeroizing<[u8; 32]>,
    pcrs: Vec<[u8; DIGEST_LEN]>,
    primary_created: bool,
    pending_failure: Option<u32>,
}

pub struct SimulatedTpm {
    inner: Mutex<Inner>,
    state_path: Option<PathBuf>,
}

impl SimulatedTpm {
    /// Fresh in-memory chip with a random storage seed and zeroed PCRs.
    pub fn new() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut seed[..]);
        Self {
            inner: Mutex::new(Inner {
                seed,
                pcrs: vec![[0u8; DIGEST_LEN]; PCR_COUNT as usize],
                primary_created: false,
                pending_failure: None,
            }),
            state_path: None,
        }
    }

    /// Chip backed by a JSON state file, created on first use.
    pub fn persistent(path: &Path) -> Result<Self, HsmError> {
        let tpm = Self::new();
        let tpm = Self {
            state_path: Some(path.to_path_buf()),
            ..tpm
        };
        match std::fs::read(path) {
            Ok(bytes) => {
                let state: SimState = serde_json::from_slice(&bytes).map_err(|e| {
                    HsmError::NotAvailable(format!("invalid simulator state {}: {}", path.display(), e))
                })?;
                tpm.restore(&state)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => tpm.save()?,
            Err(e) => return Err(e.into()),
        }
        Ok(tpm)
    }

    /// Extend a PCR: `pcr = SHA256(pcr || SHA256(data))`.
    pub fn extend_pcr(&self, index: u8, data: &[u8]) -> Result<(), HsmError> {
        if u32::from(index) >= PCR_COUNT {
            return Err(HsmError::InvalidIdentity(format!("no PCR {}", index)));
        }
        {
            let mut inner = self.lock()?;
            let measurement = Sha256::digest(data);
            let mut hasher = Sha256::new();
            hasher.update(inner.pcrs[index as usize]);
            hasher.update(measurement);
            inner.pcrs[index as usize] = hasher.finalize().into();
        }
        tracing::debug!("Simulated PCR {} extended", index);
        self.save()
    }

    /// Make the next device command fail with `code`.
    pub fn fail_next(&self, code: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pending_failure = Some(code);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, HsmError> {
        self.inner
            .lock()
            .map_err(|_| HsmError::Internal("simulated TPM lock poisoned".to_string()))
    }

    fn take_failure(inner: &mut Inner, op: TpmOp) -> Result<(), HsmError> {
        match inner.pending_failure.take() {
            Some(code) => Err(map_response_code(code, op)),
            None => Ok(()),
        }
    }

    fn restore(&self, state: &SimState) -> Result<(), HsmError> {
        let corrupt = || HsmError::NotAvailable("corrupt simulator state".to_string());
        let seed = hex::decode(&state.seed).map_err(|_| corrupt())?;
        if seed.len() != 32 || state.pcrs.len() != PCR_COUNT as usize {
            return Err(corrupt());
        }
        let mut inner = self.lock()?;
        inner.seed.copy_from_slice(&seed);
        for (slot, value) in inner.pcrs.iter_mut().zip(&state.pcrs) {
            let bytes = hex::decode(value).map_err(|_| corrupt())?;
            if bytes.len() != DIGEST_LEN {
                return Err(corrupt());
            }
            slot.copy_from_slice(&bytes);
        }
        inner.primary_created = state.primary_created;
        Ok(())
    }

    fn save(&self) -> Result<(), HsmError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let state = {
            let inner = self.lock()?;
            SimState {
                seed: hex::encode(&inner.seed[..]),
                pcrs: inner.pcrs.iter().map(hex::encode).collect(),
                primary_created: inner.primary_created,
            }
        };
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| HsmError::Internal(format!("failed to encode simulator state: {}", e)))?;
        if let Some(dir) = path.parent() {
            fsutil::ensure_private_dir(dir)?;
        }
        fsutil::atomic_write(path, &json)?;
        Ok(())
    }

    fn policy_digest(inner: &Inner, mask: PcrMask) -> [u8; DIGEST_LEN] {
        let mut pcr_hasher = Sha256::new();
        for index in mask.indices() {
            pcr_hasher.update(inner.pcrs[index as usize]);
        }
        let mut hasher = Sha256::new();
        hasher.update(b"PolicyPCR");
        hasher.update(mask.bits().to_be_bytes());
        hasher.update(pcr_hasher.finalize());
        hasher.finalize().into()
    }

    fn storage_cipher(inner: &Inner) -> Result<Aes256Gcm, HsmError> {
        let mut hasher = Sha256::new();
        hasher.update(&inner.seed[..]);
        hasher.update(b"pinseal-sim-storage");
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&hasher.finalize());
        Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| HsmError::Internal(format!("invalid storage key: {}", e)))
    }
}

impl Default for SimulatedTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl TpmDevice for SimulatedTpm {
    fn is_present(&self) -> bool {
        true
    }

    fn manufacturer(&self) -> Result<Option<String>, HsmError> {
        Ok(Some("SIM ".to_string()))
    }

    fn ensure_primary(&self) -> Result<(), HsmError> {
        let created = {
            let mut inner = self.lock()?;
            Self::take_failure(&mut inner, TpmOp::Initialize)?;
            let created = !inner.primary_created;
            inner.primary_created = true;
            created
        };
        if created {
            tracing::debug!("Simulated primary key created");
            self.save()?;
        }
        Ok(())
    }

    fn has_primary(&self) -> bool {
        self.inner.lock().map(|i| i.primary_created).unwrap_or(false)
    }

    fn read_pcrs(&self, mask: PcrMask) -> Result<Vec<(u8, Vec<u8>)>, HsmError> {
        let mut inner = self.lock()?;
        Self::take_failure(&mut inner, TpmOp::Query)?;
        Ok(mask
            .indices()
            .into_iter()
            .map(|i| (i, inner.pcrs[i as usize].to_vec()))
            .collect())
    }

    fn seal(&self, data: &[u8], mask: PcrMask) -> Result<TpmSealedObject, HsmError> {
        let mut inner = self.lock()?;
        Self::take_failure(&mut inner, TpmOp::Seal)?;
        if !inner.primary_created {
            return Err(map_response_code(rc::HANDLE, TpmOp::Seal));
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let mut public = Vec::with_capacity(PUBLIC_LEN);
        public.extend_from_slice(&mask.bits().to_be_bytes());
        public.extend_from_slice(&Self::policy_digest(&inner, mask));
        public.extend_from_slice(&nonce);

        let private = Self::storage_cipher(&inner)?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: data,
                    aad: &public,
                },
            )
            .map_err(|_| map_response_code(rc::INTEGRITY, TpmOp::Seal))?;
        Ok(TpmSealedObject { public, private })
    }

    fn unseal(
        &self,
        object: &TpmSealedObject,
        mask: PcrMask,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        let mut inner = self.lock()?;
        Self::take_failure(&mut inner, TpmOp::Unseal)?;
        if !inner.primary_created {
            return Err(map_response_code(rc::HANDLE, TpmOp::Unseal));
        }
        if object.public.len() != PUBLIC_LEN {
            return Err(map_response_code(rc::SIZE, TpmOp::Unseal));
        }

        let expected = &object.public[4..4 + DIGEST_LEN];
        let current = Self::policy_digest(&inner, mask);
        if expected != current.as_slice() {
            tracing::debug!("Simulated PolicyPCR digest mismatch for mask {}", mask);
            return Err(map_response_code(rc::POLICY_FAIL, TpmOp::Unseal));
        }

        let nonce = &object.public[4 + DIGEST_LEN..];
        let plaintext = Self::storage_cipher(&inner)?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: &object.private,
                    aad: &object.public,
                },
            )
            .map_err(|_| map_response_code(rc::INTEGRITY, TpmOp::Unseal))?;
        Ok(Zeroizing::new(plaintext))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_changes_only_target_pcr() {
        let tpm = SimulatedTpm::new();
        let mask = PcrMask::new(0b1100_0000).unwrap();
        let before = tpm.read_pcrs(mask).unwrap();

        tpm.extend_pcr(7, b"measurement").unwrap();
        let after = tpm.read_pcrs(mask).unwrap();
        assert_eq!(before[0], after[0], "PCR 6 must be untouched");
        assert_ne!(before[1], after[1], "PCR 7 must change");
    }

    #[test]
    fn test_extend_rejects_out_of_range_index() {
        let tpm = SimulatedTpm::new();
        assert!(tpm.extend_pcr(24, b"x").is_err());
    }

    #[test]
    fn test_seal_without_primary_is_handle_error() {
        let tpm = SimulatedTpm::new();
        assert!(matches!(
            tpm.seal(b"x", PcrMask::default()),
            Err(HsmError::NotFound(_))
        ));
    }

    #[test]
    fn test_persistent_state_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpm.json");

        let first = SimulatedTpm::persistent(&path).unwrap();
        first.ensure_primary().unwrap();
        let object = first.seal(b"654321", PcrMask::default()).unwrap();

        let second = SimulatedTpm::persistent(&path).unwrap();
        assert!(second.has_primary());
        assert_eq!(
            second.unseal(&object, PcrMask::default()).unwrap().as_slice(),
            b"654321",
            "A second process on the same state file sees the same chip"
        );

        first.extend_pcr(7, b"reboot into a different kernel").unwrap();
        let third = SimulatedTpm::persistent(&path).unwrap();
        assert!(matches!(
            third.unseal(&object, PcrMask::default()),
            Err(HsmError::PcrMismatch)
        ));
    }

    #[test]
    fn test_tampered_public_area_fails() {
        let tpm = SimulatedTpm::new();
        tpm.ensure_primary().unwrap();
        let mut object = tpm.seal(b"123456", PcrMask::default()).unwrap();
        let last = object.public.len() - 1;
        object.public[last] ^= 0xFF;

        assert!(matches!(
            tpm.unseal(&object, PcrMask::default()),
            Err(HsmError::UnsealFailed(_))
        ));
    }
}
