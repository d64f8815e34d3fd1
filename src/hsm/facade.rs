// Pinseal — HSM Facade
//
// One behavioral contract over whichever backend is active. Shapes are
// validated before any I/O, blobs live in the `BlobStore`, and the store
// lock (not in-process state) keeps independent processes consistent.

use std::fmt;

use super::backend::SealBackend;
use super::detect;
use super::store::BlobStore;
use super::types::{validate_secret, HsmMethod, HsmStatus, Identity, PcrMask, SealPolicy, SealedSecret};
use super::HsmError;
use crate::config::Config;

/// Blob directory under the data dir.
pub const SEALED_DIR: &str = "sealed";

pub struct Hsm {
    backend: Box<dyn SealBackend>,
    store: BlobStore,
    default_policy: SealPolicy,
}

impl Hsm {
    pub fn new(backend: Box<dyn SealBackend>, store: BlobStore) -> Self {
        Self::with_default_policy(backend, store, SealPolicy::default())
    }

    /// Facade whose policy falls back to `default_policy` until one is saved.
    pub fn with_default_policy(
        backend: Box<dyn SealBackend>,
        store: BlobStore,
        default_policy: SealPolicy,
    ) -> Self {
        Self {
            backend,
            store,
            default_policy,
        }
    }

    /// Facade for the configured backend and data directory.
    pub fn open(config: &Config) -> Result<Self, HsmError> {
        let backend = detect::build_backend(
            config.backend,
            config.allow_fallback,
            config.kdf,
            &config.data_dir,
        )?;
        tracing::debug!(
            "Using {} backend, store {}",
            backend.method(),
            config.data_dir.display()
        );
        Ok(Self::with_default_policy(
            backend,
            BlobStore::new(config.data_dir.join(SEALED_DIR)),
            config.seal_policy(),
        ))
    }

    pub fn method(&self) -> HsmMethod {
        self.backend.method()
    }

    pub fn available(&self) -> bool {
        self.backend.is_available()
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Effective seal policy: the persisted one, else the configured default.
    pub fn policy(&self) -> Result<SealPolicy, HsmError> {
        Ok(self.store.load_policy()?.unwrap_or(self.default_policy))
    }

    /// Fresh probe of the backend. Never fails; an unreadable policy file
    /// is reported through the default policy.
    pub fn status(&self) -> HsmStatus {
        let policy = self.policy().unwrap_or_else(|e| {
            tracing::warn!("{}", e);
            self.default_policy
        });
        self.backend.status(&policy)
    }

    /// Create backend key material if absent. Idempotent.
    ///
    /// Creation runs under the store's exclusive lock so that independent
    /// facades racing on first use agree on one set of key material.
    pub fn initialize(&self) -> Result<(), HsmError> {
        if self.backend.is_initialized() {
            return Ok(());
        }
        let _lock = self.store.lock_exclusive()?;
        self.backend.initialize()
    }

    /// Seal `secret` for `identity`, replacing any earlier blob.
    pub fn seal(&self, identity: &str, secret: &[u8]) -> Result<(), HsmError> {
        let identity = Identity::parse(identity)?;
        validate_secret(secret)?;

        self.initialize()?;
        let policy = self.policy()?;
        let payload = self.backend.seal(&identity, secret, &policy)?;
        let sealed = SealedSecret::new(&identity, payload);

        let _lock = self.store.lock_exclusive()?;
        self.store.write(&identity, &sealed)?;
        tracing::info!("Sealed secret for '{}' with {}", identity, sealed.method());
        Ok(())
    }

    /// Decrypt the secret for `identity` and hand it to `access` exactly once.
    ///
    /// The plaintext is zeroed as soon as `access` returns, whatever it
    /// returns. An `Err` from `access` is reported as `Internal`.
    pub fn unseal<T, E, F>(&self, identity: &str, access: F) -> Result<T, HsmError>
    where
        E: fmt::Display,
        F: FnOnce(&[u8]) -> Result<T, E>,
    {
        let identity = Identity::parse(identity)?;
        let sealed = {
            let _lock = self.store.lock_shared()?;
            self.store.read(&identity)?
        };

        self.initialize()?;
        let plaintext = self.backend.unseal(&identity, &sealed)?;
        let outcome = access(&plaintext);
        drop(plaintext);

        outcome.map_err(|e| {
            tracing::debug!("Caller rejected the secret for '{}'", identity);
            HsmError::Internal(format!("secret for '{}' could not be used: {}", identity, e))
        })
    }

    /// Presence check without decryption or backend authentication.
    pub fn exists(&self, identity: &str) -> bool {
        match Identity::parse(identity) {
            Ok(identity) => self.store.exists(&identity),
            Err(_) => false,
        }
    }

    pub fn clear(&self, identity: &str) -> Result<(), HsmError> {
        let identity = Identity::parse(identity)?;
        let _lock = self.store.lock_exclusive()?;
        self.store.remove(&identity)?;
        tracing::info!("Cleared secret for '{}'", identity);
        Ok(())
    }

    /// Remove every blob. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, HsmError> {
        let _lock = self.store.lock_exclusive()?;
        let identities = self.store.identities()?;
        for identity in &identities {
            self.store.remove(identity)?;
        }
        tracing::info!("Cleared {} sealed secret(s)", identities.len());
        Ok(identities.len())
    }

    pub fn list_identities(&self) -> Result<Vec<String>, HsmError> {
        let _lock = self.store.lock_shared()?;
        Ok(self
            .store
            .identities()?
            .into_iter()
            .map(|i| i.to_string())
            .collect())
    }

    // ── Extended capabilities ────────────────────────────────────────────────

    /// Bind future seals to `mask`. Existing blobs keep their recorded mask.
    pub fn set_pcr_binding(&self, mask: u32) -> Result<PcrMask, HsmError> {
        if self.backend.pcr_binding().is_none() {
            return Err(HsmError::NotAvailable(format!(
                "PCR binding requires a TPM; active backend is {}",
                self.method()
            )));
        }
        let mask = PcrMask::new(mask)?;
        let policy = SealPolicy {
            pcr_mask: mask,
            ..self.policy()?
        };
        self.store.save_policy(&policy)?;
        tracing::info!("PCR mask for future seals set to {}", mask);
        Ok(mask)
    }

    /// Require (or stop requiring) biometrics for future seals.
    pub fn set_biometric(&self, required: bool) -> Result<(), HsmError> {
        let Some(gate) = self.backend.biometric_gate() else {
            return Err(HsmError::NotAvailable(format!(
                "biometric gating requires the Secure Enclave; active backend is {}",
                self.method()
            )));
        };
        if required && !gate.biometric_available() {
            return Err(HsmError::NotAvailable(
                "biometric authentication is not enrolled on this device".to_string(),
            ));
        }
        let policy = SealPolicy {
            require_biometric: required,
            ..self.policy()?
        };
        self.store.save_policy(&policy)?;
        tracing::info!(
            "Biometric gating for future seals {}",
            if required { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Current values of the policy's PCRs.
    pub fn read_pcrs(&self) -> Result<Vec<(u8, Vec<u8>)>, HsmError> {
        let binding = self.backend.pcr_binding().ok_or_else(|| {
            HsmError::NotAvailable(format!(
                "PCR values require a TPM; active backend is {}",
                self.method()
            ))
        })?;
        binding.read_pcrs(self.policy()?.pcr_mask)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use rand::RngCore;
    use zeroize::Zeroizing;

    use super::*;
    use crate::hsm::enclave::{SecureEnclaveBackend, SimulatedEnclave, UserPresence};
    use crate::hsm::fallback::mock::{test_kdf, MockKeyProvider};
    use crate::hsm::fallback::{KeychainBackend, MasterKeyProvider};
    use crate::hsm::tpm::{SimulatedTpm, TpmBackend};

    fn keychain_hsm(dir: &Path, provider: &MockKeyProvider) -> Hsm {
        Hsm::new(
            Box::new(KeychainBackend::new(Box::new(provider.clone()), test_kdf())),
            BlobStore::new(dir),
        )
    }

    fn tpm_hsm(dir: &Path, tpm: &Arc<SimulatedTpm>) -> Hsm {
        Hsm::new(Box::new(TpmBackend::new(tpm.clone())), BlobStore::new(dir))
    }

    fn enclave_hsm(dir: &Path, enclave: &Arc<SimulatedEnclave>) -> Hsm {
        Hsm::new(
            Box::new(SecureEnclaveBackend::new(enclave.clone())),
            BlobStore::new(dir),
        )
    }

    /// Keyring stand-in whose lookup and store are separate calls with
    /// latency in between, like a real platform keyring.
    #[derive(Clone)]
    struct SlowKeyring {
        secret: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl SlowKeyring {
        fn new() -> Self {
            Self {
                secret: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl MasterKeyProvider for SlowKeyring {
        fn get_or_create_master_secret(&self) -> Result<Zeroizing<Vec<u8>>, HsmError> {
            let existing = self.secret.lock().unwrap().clone();
            if let Some(secret) = existing {
                return Ok(Zeroizing::new(secret));
            }
            thread::sleep(Duration::from_millis(20));
            let mut secret = vec![0u8; 32];
            rand::rng().fill_bytes(&mut secret);
            *self.secret.lock().unwrap() = Some(secret.clone());
            Ok(Zeroizing::new(secret))
        }

        fn has_master_secret(&self) -> Result<bool, HsmError> {
            Ok(self.secret.lock().unwrap().is_some())
        }

        fn delete_master_secret(&self) -> Result<(), HsmError> {
            *self.secret.lock().unwrap() = None;
            Ok(())
        }

        fn salt_context(&self) -> (&str, &str) {
            ("pinseal-test", "slow-keyring")
        }
    }

    fn slow_keyring_hsm(dir: &Path, provider: &SlowKeyring) -> Hsm {
        Hsm::new(
            Box::new(KeychainBackend::new(Box::new(provider.clone()), test_kdf())),
            BlobStore::new(dir),
        )
    }

    fn unseal_vec(hsm: &Hsm, identity: &str) -> Result<Vec<u8>, HsmError> {
        hsm.unseal(identity, |s| Ok::<_, HsmError>(s.to_vec()))
    }

    #[test]
    fn test_round_trip_preserves_binary_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = keychain_hsm(dir.path(), &MockKeyProvider::new());
        let secret: Vec<u8> = vec![0x00, 0xff, 0x00, b'p', b'i', b'n', 0x00, 0x7f];

        hsm.seal("personal", &secret).unwrap();
        assert_eq!(
            unseal_vec(&hsm, "personal").unwrap(),
            secret,
            "Embedded zero bytes must round-trip byte-exact"
        );
    }

    #[test]
    fn test_secret_length_limits() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = keychain_hsm(dir.path(), &MockKeyProvider::new());

        hsm.seal("max", &[0xA5; 256]).unwrap();
        assert_eq!(unseal_vec(&hsm, "max").unwrap(), vec![0xA5; 256]);

        assert!(matches!(
            hsm.seal("over", &[0xA5; 257]),
            Err(HsmError::InvalidIdentity(_))
        ));
        assert!(matches!(
            hsm.seal("empty", b""),
            Err(HsmError::InvalidIdentity(_))
        ));
        assert!(!hsm.exists("over"));
    }

    #[test]
    fn test_rejected_shapes_touch_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sealed");
        let provider = MockKeyProvider::new();
        let hsm = keychain_hsm(&root, &provider);

        assert!(hsm.seal("x", &[1; 257]).is_err());
        assert!(hsm.seal(&"i".repeat(65), b"pin").is_err());
        assert!(!root.exists(), "Validation must fail before the store is created");
        assert!(
            !provider.has_master_secret().unwrap(),
            "Validation must fail before backend key material is created"
        );
    }

    #[test]
    fn test_identity_length_limits() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = keychain_hsm(dir.path(), &MockKeyProvider::new());
        let longest = "i".repeat(64);

        hsm.seal(&longest, b"pin").unwrap();
        assert_eq!(unseal_vec(&hsm, &longest).unwrap(), b"pin");

        assert!(matches!(
            hsm.seal(&"i".repeat(65), b"pin"),
            Err(HsmError::InvalidIdentity(_))
        ));
        assert!(matches!(
            hsm.seal("", b"pin"),
            Err(HsmError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_reseal_keeps_only_newest_secret() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = keychain_hsm(dir.path(), &MockKeyProvider::new());

        hsm.seal("work", b"old-pin").unwrap();
        hsm.seal("work", b"new-pin").unwrap();
        assert_eq!(unseal_vec(&hsm, "work").unwrap(), b"new-pin");
        assert_eq!(hsm.list_identities().unwrap(), vec!["work"]);
    }

    #[test]
    fn test_demo_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = keychain_hsm(dir.path(), &MockKeyProvider::new());

        assert!(!hsm.exists("demo"));
        hsm.seal("demo", b"s3cr3t!").unwrap();
        assert!(hsm.exists("demo"));
        assert_eq!(unseal_vec(&hsm, "demo").unwrap(), b"s3cr3t!");
        hsm.clear("demo").unwrap();
        assert!(!hsm.exists("demo"));
        assert!(matches!(
            unseal_vec(&hsm, "demo"),
            Err(HsmError::NotFound(ref who)) if who == "demo"
        ));
        assert!(
            matches!(hsm.clear("demo"), Err(HsmError::NotFound(_))),
            "Clearing a missing identity is NotFound, not a silent success"
        );
    }

    #[test]
    fn test_exists_on_invalid_identity_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = keychain_hsm(dir.path(), &MockKeyProvider::new());
        assert!(!hsm.exists(""));
        assert!(!hsm.exists(&"x".repeat(65)));
    }

    #[test]
    fn test_exists_never_initializes_backend() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockKeyProvider::new();
        let hsm = keychain_hsm(dir.path(), &provider);
        assert!(!hsm.exists("work"));
        assert!(!provider.has_master_secret().unwrap());
    }

    #[test]
    fn test_caller_failure_is_internal() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = keychain_hsm(dir.path(), &MockKeyProvider::new());
        hsm.seal("work", b"not-a-number").unwrap();

        let mut seen = 0;
        let result: Result<u32, HsmError> = hsm.unseal("work", |s| {
            seen = s.len();
            std::str::from_utf8(s).unwrap_or("").parse::<u32>()
        });
        assert_eq!(seen, 12, "The accessor must still receive the plaintext");
        assert!(
            matches!(result, Err(HsmError::Internal(_))),
            "A caller-side failure is Internal, not a crypto failure"
        );
    }

    #[test]
    fn test_clear_all_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = keychain_hsm(dir.path(), &MockKeyProvider::new());
        for id in ["personal", "work", "ci"] {
            hsm.seal(id, id.as_bytes()).unwrap();
        }
        assert_eq!(hsm.list_identities().unwrap(), vec!["ci", "personal", "work"]);
        assert_eq!(hsm.clear_all().unwrap(), 3);
        assert!(hsm.list_identities().unwrap().is_empty());
        assert_eq!(hsm.clear_all().unwrap(), 0);
    }

    #[test]
    fn test_two_threads_never_swap_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockKeyProvider::with_secret(vec![7u8; 32]);

        let handles: Vec<_> = [("a", "pin-a"), ("b", "pin-b")]
            .into_iter()
            .map(|(id, pin)| {
                let root = dir.path().to_path_buf();
                let provider = provider.clone();
                thread::spawn(move || keychain_hsm(&root, &provider).seal(id, pin.as_bytes()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let hsm = keychain_hsm(dir.path(), &provider);
        assert_eq!(unseal_vec(&hsm, "a").unwrap(), b"pin-a");
        assert_eq!(unseal_vec(&hsm, "b").unwrap(), b"pin-b");
    }

    #[test]
    fn test_ten_independent_facades_seal_and_unseal_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let tpm = Arc::new(SimulatedTpm::new());

        let sealers: Vec<_> = (0..10)
            .map(|i| {
                let root = dir.path().to_path_buf();
                let tpm = tpm.clone();
                thread::spawn(move || {
                    tpm_hsm(&root, &tpm).seal(&format!("id-{}", i), format!("pin-{}", i).as_bytes())
                })
            })
            .collect();
        for handle in sealers {
            handle.join().unwrap().expect("every concurrent seal must succeed");
        }

        let unsealers: Vec<_> = (0..10)
            .map(|i| {
                let root = dir.path().to_path_buf();
                let tpm = tpm.clone();
                thread::spawn(move || {
                    let hsm = tpm_hsm(&root, &tpm);
                    (i, unseal_vec(&hsm, &format!("id-{}", i)))
                })
            })
            .collect();
        for handle in unsealers {
            let (i, secret) = handle.join().unwrap();
            assert_eq!(
                secret.unwrap(),
                format!("pin-{}", i).into_bytes(),
                "Each caller must receive exactly its own secret"
            );
        }
        assert_eq!(tpm_hsm(dir.path(), &tpm).list_identities().unwrap().len(), 10);
    }

    #[test]
    fn test_concurrent_first_seals_share_one_master_secret() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SlowKeyring::new();

        let sealers: Vec<_> = (0..10)
            .map(|i| {
                let root = dir.path().to_path_buf();
                let provider = provider.clone();
                thread::spawn(move || {
                    slow_keyring_hsm(&root, &provider)
                        .seal(&format!("id-{}", i), format!("pin-{}", i).as_bytes())
                })
            })
            .collect();
        for handle in sealers {
            handle.join().unwrap().expect("every first-use seal must succeed");
        }

        let hsm = slow_keyring_hsm(dir.path(), &provider);
        for i in 0..10 {
            assert_eq!(
                unseal_vec(&hsm, &format!("id-{}", i)).unwrap(),
                format!("pin-{}", i).into_bytes(),
                "Secret id-{} must stay readable after racing first use",
                i
            );
        }
    }

    #[test]
    fn test_pcr_change_fails_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let tpm = Arc::new(SimulatedTpm::new());
        let hsm = tpm_hsm(dir.path(), &tpm);

        hsm.seal("work", b"123456").unwrap();
        tpm.extend_pcr(7, b"secure boot toggled").unwrap();
        let err = unseal_vec(&hsm, "work").unwrap_err();
        assert!(matches!(err, HsmError::PcrMismatch));
        assert!(err.diagnostic().contains("re-store"));
    }

    #[test]
    fn test_pcr_mask_applies_to_future_seals_only() {
        let dir = tempfile::tempdir().unwrap();
        let tpm = Arc::new(SimulatedTpm::new());
        let hsm = tpm_hsm(dir.path(), &tpm);

        hsm.seal("old", b"111111").unwrap();
        hsm.set_pcr_binding(1 << 0).unwrap();
        hsm.seal("new", b"222222").unwrap();

        tpm.extend_pcr(0, b"firmware update").unwrap();
        assert_eq!(
            unseal_vec(&hsm, "old").unwrap(),
            b"111111",
            "Blobs sealed before the change keep their PCR 7 binding"
        );
        assert!(matches!(unseal_vec(&hsm, "new"), Err(HsmError::PcrMismatch)));

        assert_eq!(hsm.read_pcrs().unwrap().len(), 1);
        assert!(hsm.set_pcr_binding(0).is_err());
    }

    #[test]
    fn test_capabilities_are_backend_specific() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = keychain_hsm(dir.path(), &MockKeyProvider::new());
        assert!(matches!(
            keychain.set_pcr_binding(1 << 7),
            Err(HsmError::NotAvailable(_))
        ));
        assert!(matches!(
            keychain.set_biometric(true),
            Err(HsmError::NotAvailable(_))
        ));
        assert!(matches!(keychain.read_pcrs(), Err(HsmError::NotAvailable(_))));

        let tpm = tpm_hsm(dir.path(), &Arc::new(SimulatedTpm::new()));
        assert!(matches!(
            tpm.set_biometric(false),
            Err(HsmError::NotAvailable(_))
        ));
    }

    #[test]
    fn test_biometric_decline_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let enclave = Arc::new(SimulatedEnclave::new());
        let hsm = enclave_hsm(dir.path(), &enclave);

        hsm.set_biometric(true).unwrap();
        hsm.seal("work", b"123456").unwrap();

        enclave.set_presence(UserPresence::Decline);
        assert!(matches!(unseal_vec(&hsm, "work"), Err(HsmError::Cancelled)));

        enclave.set_presence(UserPresence::Approve);
        assert_eq!(unseal_vec(&hsm, "work").unwrap(), b"123456");
        assert_eq!(enclave.prompt_count(), 2);
    }

    #[test]
    fn test_unattended_enclave_unseal_never_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let enclave = Arc::new(SimulatedEnclave::new());
        let hsm = enclave_hsm(dir.path(), &enclave);

        hsm.seal("agent", b"123456").unwrap();
        assert_eq!(unseal_vec(&hsm, "agent").unwrap(), b"123456");
        assert_eq!(enclave.prompt_count(), 0);
    }

    #[test]
    fn test_biometric_requires_enrollment() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = enclave_hsm(dir.path(), &Arc::new(SimulatedEnclave::without_biometrics()));
        assert!(matches!(
            hsm.set_biometric(true),
            Err(HsmError::NotAvailable(_))
        ));
        hsm.set_biometric(false).unwrap();
    }

    #[test]
    fn test_status_is_fresh_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let hsm = tpm_hsm(dir.path(), &Arc::new(SimulatedTpm::new()));
        assert!(!hsm.status().initialized);
        hsm.initialize().unwrap();
        hsm.initialize().unwrap();
        let status = hsm.status();
        assert!(status.initialized);
        assert_eq!(status.method, HsmMethod::Tpm);
    }
}
