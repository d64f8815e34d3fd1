// Pinseal — Platform detection and backend selection
//
// `available()` is a cheap, side-effect-free probe suitable for every call
// site. `build_backend()` turns a configured preference into a concrete
// backend, degrading to the keychain fallback only when allowed.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::backend::SealBackend;
use super::enclave::{SecureEnclaveBackend, SimulatedEnclave};
use super::fallback::{KdfParams, KeychainBackend, KeyringProvider};
use super::tpm::{SimulatedTpm, TpmBackend};
use super::types::HsmMethod;
use super::HsmError;

pub const TPM_SIMULATOR_STATE: &str = "tpm-simulator.json";
pub const ENCLAVE_SIMULATOR_STATE: &str = "enclave-simulator.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    #[default]
    Auto,
    Tpm,
    SecureEnclave,
    Keychain,
    TpmSimulator,
    EnclaveSimulator,
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendPreference::Auto => "auto",
            BackendPreference::Tpm => "tpm",
            BackendPreference::SecureEnclave => "secure-enclave",
            BackendPreference::Keychain => "keychain",
            BackendPreference::TpmSimulator => "tpm-simulator",
            BackendPreference::EnclaveSimulator => "enclave-simulator",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendPreference {
    type Err = HsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "tpm" => Ok(BackendPreference::Tpm),
            "secure-enclave" | "se" => Ok(BackendPreference::SecureEnclave),
            "keychain" | "keyring" => Ok(BackendPreference::Keychain),
            "tpm-simulator" => Ok(BackendPreference::TpmSimulator),
            "enclave-simulator" => Ok(BackendPreference::EnclaveSimulator),
            other => Err(HsmError::InvalidIdentity(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}

/// TPM usable on this host: built with `tpm` and a device node exists.
pub fn tpm_present() -> bool {
    cfg!(feature = "tpm") && super::tpm::device_node_present()
}

/// Secure Enclave usable on this host: macOS built with `secure-enclave`.
pub fn secure_enclave_present() -> bool {
    cfg!(all(target_os = "macos", feature = "secure-enclave"))
}

/// Best hardware method on this host without touching any device.
///
/// Degrades to the keychain fallback (or `None` when fallback is disallowed)
/// rather than failing.
pub fn available(allow_fallback: bool) -> HsmMethod {
    if tpm_present() {
        HsmMethod::Tpm
    } else if secure_enclave_present() {
        HsmMethod::SecureEnclave
    } else if allow_fallback {
        HsmMethod::Keychain
    } else {
        HsmMethod::None
    }
}

fn hardware_tpm() -> Result<Box<dyn SealBackend>, HsmError> {
    #[cfg(feature = "tpm")]
    {
        Ok(Box::new(TpmBackend::new(Arc::new(super::tpm::EsapiTpm::new()))))
    }
    #[cfg(not(feature = "tpm"))]
    {
        Err(HsmError::NotAvailable(
            "built without TPM support (enable the `tpm` feature)".to_string(),
        ))
    }
}

fn hardware_enclave() -> Result<Box<dyn SealBackend>, HsmError> {
    #[cfg(all(target_os = "macos", feature = "secure-enclave"))]
    {
        Ok(Box::new(SecureEnclaveBackend::new(Arc::new(
            super::enclave::DarwinEnclave::new(),
        ))))
    }
    #[cfg(not(all(target_os = "macos", feature = "secure-enclave")))]
    {
        Err(HsmError::NotAvailable(
            "Secure Enclave requires macOS and the `secure-enclave` feature".to_string(),
        ))
    }
}

fn keychain(kdf: KdfParams) -> Box<dyn SealBackend> {
    Box::new(KeychainBackend::new(Box::new(KeyringProvider::new()), kdf))
}

/// Build the backend for `preference`.
///
/// Explicit hardware preferences fail with `NotAvailable` when the hardware
/// is missing and fallback is disallowed.
pub fn build_backend(
    preference: BackendPreference,
    allow_fallback: bool,
    kdf: KdfParams,
    data_dir: &Path,
) -> Result<Box<dyn SealBackend>, HsmError> {
    let hardware = match preference {
        BackendPreference::Auto => match available(allow_fallback) {
            HsmMethod::Tpm => hardware_tpm(),
            HsmMethod::SecureEnclave => hardware_enclave(),
            HsmMethod::Keychain => return Ok(keychain(kdf)),
            HsmMethod::None => Err(HsmError::NotAvailable(
                "no TPM or Secure Enclave and keychain fallback is disabled".to_string(),
            )),
        },
        BackendPreference::Tpm if tpm_present() => hardware_tpm(),
        BackendPreference::Tpm => Err(HsmError::NotAvailable("no TPM device found".to_string())),
        BackendPreference::SecureEnclave => hardware_enclave(),
        BackendPreference::Keychain => return Ok(keychain(kdf)),
        BackendPreference::TpmSimulator => {
            let tpm = SimulatedTpm::persistent(&data_dir.join(TPM_SIMULATOR_STATE))?;
            return Ok(Box::new(TpmBackend::new(Arc::new(tpm))));
        }
        BackendPreference::EnclaveSimulator => {
            let enclave = SimulatedEnclave::persistent(&data_dir.join(ENCLAVE_SIMULATOR_STATE))?;
            return Ok(Box::new(SecureEnclaveBackend::new(Arc::new(enclave))));
        }
    };

    match hardware {
        Ok(backend) => Ok(backend),
        Err(e) if allow_fallback => {
            tracing::warn!("{}; using keychain fallback", e);
            Ok(keychain(kdf))
        }
        Err(e) => Err(e),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
