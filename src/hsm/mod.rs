// Pinseal — HSM module
//
// Hardware-backed sealing of short secrets. The `Hsm` facade dispatches to a
// `SealBackend`: TPM 2.0 (PCR-bound), Secure Enclave (ECIES, optional
// biometrics) or the keyring-protected software fallback.

pub mod backend;
pub mod detect;
pub mod enclave;
pub mod error;
pub mod facade;
pub mod fallback;
pub mod secret;
pub mod store;
pub mod tpm;
pub mod types;

pub use backend::{BiometricGate, PcrBinding, SealBackend};
pub use detect::{available, BackendPreference};
pub use error::HsmError;
pub use facade::Hsm;
pub use fallback::{KdfParams, KeychainBackend, KeyringProvider, MasterKeyProvider};
pub use secret::SecretBytes;
pub use store::BlobStore;
pub use types::{HsmMethod, HsmStatus, Identity, PcrMask, SealPolicy};
