// Pinseal — Secure Enclave device over Security.framework (macOS)
//
// Keys are generated with `kSecAttrTokenIDSecureEnclave` and never leave the
// enclave. Encryption runs in-process against the exported public key; the
// enclave performs the matching ECIES decryption.

use core_foundation::base::CFOptionFlags;
use core_foundation::error::CFError;
use p256::PublicKey;
use security_framework::access_control::{ProtectionMode, SecAccessControl};
use security_framework::item::{ItemClass, ItemSearchOptions, Location, Reference, SearchResult};
use security_framework::key::{Algorithm, GenerateKeyOptions, KeyType, SecKey, Token};
use zeroize::Zeroizing;

use super::{map_la_error, map_os_status, EnclaveDevice, EnclaveKey};
use crate::hsm::HsmError;

const ACCESS_PRIVATE_KEY_USAGE: CFOptionFlags = 1 << 30;
const ACCESS_BIOMETRY_CURRENT_SET: CFOptionFlags = 1 << 3;

const LA_ERROR_DOMAIN: &str = "com.apple.LocalAuthentication";

pub struct DarwinEnclave;

impl DarwinEnclave {
    pub fn new() -> Self {
        Self
    }

    fn access_control(key: EnclaveKey) -> Result<SecAccessControl, HsmError> {
        let mut flags = ACCESS_PRIVATE_KEY_USAGE;
        if key == EnclaveKey::Biometric {
            flags |= ACCESS_BIOMETRY_CURRENT_SET;
        }
        SecAccessControl::create_with_protection(
            Some(ProtectionMode::AccessibleWhenUnlockedThisDeviceOnly),
            flags,
        )
        .map_err(|e| map_cf_error(&e, "create access control"))
    }

    fn find(key: EnclaveKey) -> Result<Option<SecKey>, HsmError> {
        let results = match ItemSearchOptions::new()
            .class(ItemClass::key())
            .label(&key.tag())
            .load_refs(true)
            .limit(1)
            .search()
        {
            Ok(results) => results,
            Err(e) if i64::from(e.code()) == super::os_status::ITEM_NOT_FOUND => return Ok(None),
            Err(e) => return Err(map_os_status(i64::from(e.code()), "search enclave key")),
        };
        Ok(results.into_iter().find_map(|r| match r {
            SearchResult::Ref(Reference::Key(k)) => Some(k),
            _ => None,
        }))
    }

    fn require(key: EnclaveKey) -> Result<SecKey, HsmError> {
        Self::find(key)?.ok_or_else(|| HsmError::NotFound(key.tag()))
    }
}

impl Default for DarwinEnclave {
    fn default() -> Self {
        Self::new()
    }
}

fn map_cf_error(e: &CFError, context: &str) -> HsmError {
    let code = e.code() as i64;
    if e.domain().to_string().starts_with(LA_ERROR_DOMAIN) {
        map_la_error(code, context)
    } else {
        map_os_status(code, context)
    }
}

impl EnclaveDevice for DarwinEnclave {
    fn is_present(&self) -> bool {
        Self::access_control(EnclaveKey::Standard).is_ok()
    }

    fn biometric_available(&self) -> bool {
        Self::access_control(EnclaveKey::Biometric).is_ok()
    }

    fn key_exists(&self, key: EnclaveKey) -> bool {
        matches!(Self::find(key), Ok(Some(_)))
    }

    fn ensure_key(&self, key: EnclaveKey) -> Result<(), HsmError> {
        if Self::find(key)?.is_some() {
            return Ok(());
        }
        let mut options = GenerateKeyOptions::default();
        options
            .set_key_type(KeyType::ec())
            .set_size_in_bits(256)
            .set_label(key.tag())
            .set_token(Token::SecureEnclave)
            .set_location(Location::DataProtectionKeychain)
            .set_access_control(Self::access_control(key)?);
        SecKey::new(&options).map_err(|e| map_cf_error(&e, "generate enclave key"))?;
        tracing::info!("Secure Enclave key {} generated", key.tag());
        Ok(())
    }

    fn public_key(&self, key: EnclaveKey) -> Result<PublicKey, HsmError> {
        let private = Self::require(key)?;
        let public = private
            .public_key()
            .ok_or_else(|| HsmError::Internal("enclave key has no public half".to_string()))?;
        let data = public
            .external_representation()
            .ok_or_else(|| HsmError::Internal("enclave public key is not exportable".to_string()))?;
        PublicKey::from_sec1_bytes(data.bytes())
            .map_err(|_| HsmError::Internal("enclave returned an invalid P-256 point".to_string()))
    }

    fn decrypt(
        &self,
        key: EnclaveKey,
        message: &[u8],
        reason: &str,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        let private = Self::require(key)?;
        tracing::debug!("Requesting enclave decryption: {}", reason);
        private
            .decrypt_data(
                Algorithm::ECIESEncryptionCofactorVariableIVX963SHA256AESGCM,
                message,
            )
            .map(Zeroizing::new)
            .map_err(|e| match map_cf_error(&e, "enclave decrypt") {
                HsmError::Internal(detail) => HsmError::UnsealFailed(detail),
                other => other,
            })
    }
}
