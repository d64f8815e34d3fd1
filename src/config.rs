// Pinseal — Configuration
//
// JSON config at `$XDG_CONFIG_HOME/pinseal/config.json`, every field
// defaulted, with environment overrides for the file location, the data
// directory and the backend.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hsm::{BackendPreference, KdfParams, PcrMask, SealPolicy};

pub const ENV_CONFIG: &str = "PINSEAL_CONFIG";
pub const ENV_DATA_DIR: &str = "PINSEAL_DATA_DIR";
pub const ENV_BACKEND: &str = "PINSEAL_BACKEND";

const CONFIG_FILE: &str = "config.json";
const APP_DIR: &str = "pinseal";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid {var}: {detail}")]
    Env { var: &'static str, detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendPreference,
    /// Permit the keyring fallback when no hardware is usable.
    pub allow_fallback: bool,
    /// PCRs new TPM seals bind to until `tpm set-pcr` persists another mask.
    pub pcr_mask: PcrMask,
    pub require_biometric: bool,
    pub kdf: KdfParams,
    /// Interactive pinentry used when the sealed PIN cannot be released.
    pub fallback_pinentry: Option<PathBuf>,
    /// Identity → signing key used by `workstation verify`. The pinentry
    /// helper also matches key IDs in its prompt against these.
    pub signing_keys: BTreeMap<String, String>,
    /// Identity → keygrips whose PIN requests the pinentry helper answers.
    pub keygrips: BTreeMap<String, Vec<String>>,
    /// Refuse `workstation enable` when no hardware token is reachable.
    pub require_token: bool,
    pub data_dir: PathBuf,
    /// Directory holding `settings.json`. Derived, never read from the file.
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            allow_fallback: true,
            pcr_mask: PcrMask::default(),
            require_biometric: false,
            kdf: KdfParams::default(),
            fallback_pinentry: None,
            signing_keys: BTreeMap::new(),
            keygrips: BTreeMap::new(),
            require_token: false,
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
        }
    }
}

/// Default directory for sealed blobs and simulator state.
pub fn default_data_dir() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn default_config_dir() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Config {
    /// Load from the default location with process environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|var| std::env::var(var).ok())
    }

    /// Load using `env` to resolve overrides.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path = env(ENV_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_config_dir().join(CONFIG_FILE));
        let mut config = Self::from_file(&path)?;

        if let Some(dir) = env(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(backend) = env(ENV_BACKEND) {
            config.backend = backend.parse().map_err(|e: crate::hsm::HsmError| ConfigError::Env {
                var: ENV_BACKEND,
                detail: e.to_string(),
            })?;
        }
        tracing::debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse `path`. A missing file yields defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<Config>(&bytes).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            config.config_dir = dir.to_path_buf();
        }
        Ok(config)
    }

    /// Policy used for seals until one is persisted in the store.
    pub fn seal_policy(&self) -> SealPolicy {
        SealPolicy {
            pcr_mask: self.pcr_mask,
            require_biometric: self.require_biometric,
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(crate::mode::SETTINGS_FILE)
    }

    pub fn signing_key(&self, identity: &str) -> Option<&str> {
        self.signing_keys.get(identity).map(String::as_str)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.backend, BackendPreference::Auto);
        assert!(config.allow_fallback);
        assert_eq!(config.pcr_mask.bits(), 1 << 7, "PCR 7 is the default binding");
        assert_eq!(config.kdf, KdfParams::default());
        assert_eq!(config.config_dir, dir.path());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "backend": "tpm-simulator", "pcr_mask": 129, "signing_keys": { "work": "ABCD1234" },
                 "keygrips": { "work": ["3C7E1F20A7B2D1C4E5F60718293A4B5C6D7E8F90"] } }"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.backend, BackendPreference::TpmSimulator);
        assert_eq!(config.pcr_mask.bits(), 0b1000_0001);
        assert_eq!(config.signing_key("work"), Some("ABCD1234"));
        assert_eq!(config.keygrips["work"].len(), 1);
        assert!(config.allow_fallback);
        assert!(!config.require_token);
    }

    #[test]
    fn test_invalid_pcr_mask_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "pcr_mask": 0 }"#).unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_environment_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        fs::write(&path, r#"{ "backend": "tpm" }"#).unwrap();

        let config = Config::load_with(env_from(&[
            (ENV_CONFIG, path.display().to_string()),
            (ENV_DATA_DIR, "/var/lib/pinseal-test".to_string()),
            (ENV_BACKEND, "enclave-simulator".to_string()),
        ]))
        .unwrap();
        assert_eq!(config.backend, BackendPreference::EnclaveSimulator);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pinseal-test"));
        assert_eq!(config.settings_path(), dir.path().join("settings.json"));
    }

    #[test]
    fn test_bad_backend_override_names_the_variable() {
        let err = Config::load_with(env_from(&[
            (ENV_CONFIG, "/nonexistent/pinseal/config.json".to_string()),
            (ENV_BACKEND, "pkcs11".to_string()),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains(ENV_BACKEND));
    }
}
