// Pinseal — Sealed Blob Store
//
// One JSON envelope per identity under `<data_dir>/sealed/`, named by the
// hex encoding of the identity. A `.lock` file in the same directory
// serializes writers across processes; `policy.json` holds the seal policy.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::types::{Identity, SealPolicy, SealedSecret};
use super::HsmError;
use crate::fsutil::{self, StoreLock};

const BLOB_EXTENSION: &str = "sealed";
const LOCK_FILE: &str = ".lock";
const POLICY_FILE: &str = "policy.json";

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic, filesystem-safe path for an identity.
    pub fn blob_path(&self, identity: &Identity) -> PathBuf {
        self.root.join(format!(
            "{}.{}",
            hex::encode(identity.as_str().as_bytes()),
            BLOB_EXTENSION
        ))
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn ensure_root(&self) -> Result<(), HsmError> {
        fsutil::ensure_private_dir(&self.root)?;
        Ok(())
    }

    pub fn lock_exclusive(&self) -> Result<StoreLock, HsmError> {
        self.ensure_root()?;
        Ok(StoreLock::exclusive(&self.lock_path())?)
    }

    pub fn lock_shared(&self) -> Result<StoreLock, HsmError> {
        self.ensure_root()?;
        Ok(StoreLock::shared(&self.lock_path())?)
    }

    // ── Blobs (caller holds the appropriate lock) ────────────────────────────

    pub fn write(&self, identity: &Identity, sealed: &SealedSecret) -> Result<(), HsmError> {
        let json = serde_json::to_vec_pretty(sealed)
            .map_err(|e| HsmError::Internal(format!("failed to encode sealed blob: {}", e)))?;
        fsutil::atomic_write(&self.blob_path(identity), &json)?;
        Ok(())
    }

    pub fn read(&self, identity: &Identity) -> Result<SealedSecret, HsmError> {
        let path = self.blob_path(identity);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HsmError::NotFound(identity.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let sealed: SealedSecret = serde_json::from_slice(&bytes)
            .map_err(|e| HsmError::UnsealFailed(format!("corrupt sealed blob: {}", e)))?;
        if sealed.identity != identity.as_str() {
            return Err(HsmError::UnsealFailed(format!(
                "blob for '{}' is labelled '{}'",
                identity, sealed.identity
            )));
        }
        Ok(sealed)
    }

    /// Stat-only presence check. Takes no lock and decrypts nothing.
    pub fn exists(&self, identity: &Identity) -> bool {
        self.blob_path(identity).is_file()
    }

    pub fn remove(&self, identity: &Identity) -> Result<(), HsmError> {
        match fsutil::scrub_and_remove(&self.blob_path(identity)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(HsmError::NotFound(identity.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Identities with a blob on disk, sorted.
    pub fn identities(&self) -> Result<Vec<Identity>, HsmError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut identities = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match decode_identity(stem) {
                Some(identity) => identities.push(identity),
                None => tracing::warn!("Skipping unrecognized blob file {}", path.display()),
            }
        }
        identities.sort();
        Ok(identities)
    }

    // ── Policy ───────────────────────────────────────────────────────────────

    /// Persisted policy, or `None` when nothing has been configured yet.
    pub fn load_policy(&self) -> Result<Option<SealPolicy>, HsmError> {
        let path = self.root.join(POLICY_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                HsmError::Internal(format!("invalid {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_policy(&self, policy: &SealPolicy) -> Result<(), HsmError> {
        let _lock = self.lock_exclusive()?;
        let json = serde_json::to_vec_pretty(policy)
            .map_err(|e| HsmError::Internal(format!("failed to encode policy: {}", e)))?;
        fsutil::atomic_write(&self.root.join(POLICY_FILE), &json)?;
        Ok(())
    }
}

fn decode_identity(stem: &str) -> Option<Identity> {
    let bytes = hex::decode(stem).ok()?;
    let raw = String::from_utf8(bytes).ok()?;
    Identity::parse(&raw).ok()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::types::{BackendMetadata, PcrMask, SealedPayload};

    fn sealed_for(identity: &Identity) -> SealedSecret {
        SealedSecret::new(
            identity,
            SealedPayload {
                ciphertext: vec![1, 2, 3],
                metadata: BackendMetadata::Keychain,
            },
        )
    }

    #[test]
    fn test_blob_names_are_deterministic_hex() {
        let store = BlobStore::new("/tmp/store");
        let id = Identity::parse("work/../x").unwrap();
        let path = store.blob_path(&id);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "776f726b2f2e2e2f78.sealed",
            "Identity must be hex-encoded so path separators cannot escape the store"
        );
    }

    #[test]
    fn test_write_read_remove_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("sealed"));
        let id = Identity::parse("personal").unwrap();

        assert!(!store.exists(&id));
        let _lock = store.lock_exclusive().unwrap();
        store.write(&id, &sealed_for(&id)).unwrap();
        assert!(store.exists(&id));
        assert_eq!(store.read(&id).unwrap().ciphertext().unwrap(), vec![1, 2, 3]);

        store.remove(&id).unwrap();
        assert!(!store.exists(&id));
        assert!(matches!(store.read(&id), Err(HsmError::NotFound(_))));
        assert!(matches!(store.remove(&id), Err(HsmError::NotFound(_))));
    }

    #[test]
    fn test_identities_are_listed_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        for name in ["zeta", "alpha", "mid"] {
            let id = Identity::parse(name).unwrap();
            store.write(&id, &sealed_for(&id)).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let listed: Vec<String> = store
            .identities()
            .unwrap()
            .iter()
            .map(|i| i.to_string())
            .collect();
        assert_eq!(listed, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_missing_store_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("never-created"));
        assert!(store.identities().unwrap().is_empty());
    }

    #[test]
    fn test_mislabelled_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let a = Identity::parse("a").unwrap();
        let b = Identity::parse("b").unwrap();
        store.write(&a, &sealed_for(&b)).unwrap();

        assert!(matches!(store.read(&a), Err(HsmError::UnsealFailed(_))));
    }

    #[test]
    fn test_policy_defaults_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        assert_eq!(store.load_policy().unwrap(), None);

        let policy = SealPolicy {
            pcr_mask: PcrMask::new(0b1000_0001).unwrap(),
            require_biometric: true,
        };
        store.save_policy(&policy).unwrap();
        assert_eq!(store.load_policy().unwrap(), Some(policy));
    }
}
