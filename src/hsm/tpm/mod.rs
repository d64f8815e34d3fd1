// Pinseal — TPM 2.0 backend
//
// Seals secrets as KEYEDHASH objects under an owner-hierarchy primary key,
// authorized by a PolicyPCR digest over the configured PCR set. The device
// is behind `TpmDevice` so the real chip (ESAPI) and the simulator share one
// backend and one response-code normalization.

mod simulator;
pub use simulator::SimulatedTpm;

#[cfg(feature = "tpm")]
mod esapi;
#[cfg(feature = "tpm")]
pub use esapi::EsapiTpm;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use zeroize::Zeroizing;

use super::backend::{PcrBinding, SealBackend};
use super::types::{
    BackendMetadata, HsmMethod, HsmStatus, Identity, PcrMask, SealPolicy, SealedPayload,
    SealedSecret, TpmStatus,
};
use super::HsmError;

// ─── Device seam ─────────────────────────────────────────────────────────────

/// Public and private areas of a sealed TPM object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmSealedObject {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

impl TpmSealedObject {
    /// `u16 BE public length || public || private`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.public.len() + self.private.len());
        out.extend_from_slice(&(self.public.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&self.private);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HsmError> {
        let corrupt = || HsmError::UnsealFailed("malformed TPM sealed object".to_string());
        if data.len() < 2 {
            return Err(corrupt());
        }
        let public_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let rest = &data[2..];
        if rest.len() < public_len {
            return Err(corrupt());
        }
        let (public, private) = rest.split_at(public_len);
        Ok(Self {
            public: public.to_vec(),
            private: private.to_vec(),
        })
    }
}

pub trait TpmDevice: Send + Sync {
    /// Device node or simulator reachable.
    fn is_present(&self) -> bool;

    /// Four-character manufacturer id, when the device reports one.
    fn manufacturer(&self) -> Result<Option<String>, HsmError>;

    /// Create the owner-hierarchy primary key if needed.
    fn ensure_primary(&self) -> Result<(), HsmError>;

    fn has_primary(&self) -> bool;

    fn read_pcrs(&self, mask: PcrMask) -> Result<Vec<(u8, Vec<u8>)>, HsmError>;

    fn seal(&self, data: &[u8], mask: PcrMask) -> Result<TpmSealedObject, HsmError>;

    fn unseal(
        &self,
        object: &TpmSealedObject,
        mask: PcrMask,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError>;
}

/// Device nodes probed for a kernel TPM, resource manager first.
pub const TPM_DEVICE_NODES: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];

pub fn device_node_present() -> bool {
    TPM_DEVICE_NODES.iter().any(|p| Path::new(p).exists())
}

// ─── Response codes ──────────────────────────────────────────────────────────

/// TPM 2.0 response codes the backend distinguishes.
pub mod rc {
    pub const INITIALIZE: u32 = 0x100;
    pub const DISABLED: u32 = 0x120;
    pub const AUTH_TYPE: u32 = 0x124;
    pub const AUTH_MISSING: u32 = 0x125;
    pub const PCR: u32 = 0x127;
    pub const PCR_CHANGED: u32 = 0x128;
    pub const UPGRADE: u32 = 0x12D;
    pub const AUTH_UNAVAILABLE: u32 = 0x12F;
    pub const COMMAND_CODE: u32 = 0x143;
    pub const AUTH_CONTEXT: u32 = 0x145;
    pub const NV_AUTHORIZATION: u32 = 0x149;

    pub const HIERARCHY: u32 = 0x085;
    pub const HANDLE: u32 = 0x08B;
    pub const AUTH_FAIL: u32 = 0x08E;
    pub const SIZE: u32 = 0x095;
    pub const POLICY_FAIL: u32 = 0x099;
    pub const INTEGRITY: u32 = 0x09F;
    pub const BAD_AUTH: u32 = 0x0A2;

    pub const OBJECT_MEMORY: u32 = 0x902;
    pub const SESSION_MEMORY: u32 = 0x903;
    pub const MEMORY: u32 = 0x904;
    pub const SESSION_HANDLES: u32 = 0x905;
    pub const OBJECT_HANDLES: u32 = 0x906;
    pub const LOCALITY: u32 = 0x907;
    pub const YIELDED: u32 = 0x908;
    pub const CANCELED: u32 = 0x909;
    pub const REFERENCE_H0: u32 = 0x910;
    pub const REFERENCE_H1: u32 = 0x911;
    pub const REFERENCE_H2: u32 = 0x912;
    pub const RETRY: u32 = 0x922;
    pub const NOT_USED: u32 = 0x97F;

    const FMT1: u32 = 0x080;

    /// Strip layer, parameter and handle numbers down to the base code.
    pub fn base(code: u32) -> u32 {
        let code = code & 0xFFFF;
        if code & FMT1 != 0 {
            FMT1 | (code & 0x3F)
        } else {
            code & 0xFFF
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmOp {
    Initialize,
    Seal,
    Unseal,
    Query,
}

/// Normalize a raw TPM/TSS response code into the HSM taxonomy.
pub fn map_response_code(code: u32, op: TpmOp) -> HsmError {
    let detail = format!("TPM response 0x{:08x}", code);
    match rc::base(code) {
        rc::POLICY_FAIL | rc::PCR_CHANGED | rc::PCR => HsmError::PcrMismatch,
        rc::AUTH_FAIL
        | rc::BAD_AUTH
        | rc::AUTH_MISSING
        | rc::AUTH_TYPE
        | rc::AUTH_CONTEXT
        | rc::AUTH_UNAVAILABLE => HsmError::AuthFailed(detail),
        rc::LOCALITY | rc::HIERARCHY | rc::NV_AUTHORIZATION | rc::COMMAND_CODE | rc::DISABLED => {
            HsmError::Permission(detail)
        }
        rc::MEMORY
        | rc::OBJECT_MEMORY
        | rc::SESSION_MEMORY
        | rc::OBJECT_HANDLES
        | rc::SESSION_HANDLES => HsmError::Memory(detail),
        rc::RETRY | rc::YIELDED | rc::CANCELED => HsmError::Timeout(detail),
        rc::HANDLE | rc::REFERENCE_H0 | rc::REFERENCE_H1 | rc::REFERENCE_H2 => {
            HsmError::NotFound(detail)
        }
        rc::INITIALIZE | rc::NOT_USED | rc::UPGRADE => HsmError::NotAvailable(detail),
        _ => match op {
            TpmOp::Seal => HsmError::SealFailed(detail),
            TpmOp::Unseal => HsmError::UnsealFailed(detail),
            TpmOp::Initialize | TpmOp::Query => HsmError::Internal(detail),
        },
    }
}

// ─── Backend ─────────────────────────────────────────────────────────────────

pub struct TpmBackend {
    device: Arc<dyn TpmDevice>,
    initialized: AtomicBool,
}

impl TpmBackend {
    pub fn new(device: Arc<dyn TpmDevice>) -> Self {
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

fn with_identity(err: HsmError, identity: &Identity) -> HsmError {
    match err {
        HsmError::NotFound(detail) => {
            tracing::debug!("TPM object lookup failed: {}", detail);
            HsmError::NotFound(identity.to_string())
        }
        other => other,
    }
}

impl SealBackend for TpmBackend {
    fn method(&self) -> HsmMethod {
        HsmMethod::Tpm
    }

    fn is_available(&self) -> bool {
        self.device.is_present()
    }

    fn initialize(&self) -> Result<(), HsmError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.device.is_present() {
            return Err(HsmError::NotAvailable("no TPM device found".to_string()));
        }
        self.device.ensure_primary()?;
        self.initialized.store(true, Ordering::Release);
        tracing::info!("TPM primary key ready under the owner hierarchy");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn status(&self, policy: &SealPolicy) -> HsmStatus {
        let available = self.device.is_present();
        let manufacturer = if available {
            self.device.manufacturer().unwrap_or_else(|e| {
                tracing::debug!("TPM manufacturer query failed: {}", e);
                None
            })
        } else {
            None
        };
        HsmStatus {
            method: HsmMethod::Tpm,
            available,
            initialized: self.is_initialized(),
            description: "TPM 2.0 sealed object bound to PCR policy".to_string(),
            version: "2.0".to_string(),
            tpm: Some(TpmStatus {
                has_primary_key: self.device.has_primary(),
                manufacturer,
                pcr_mask: policy.pcr_mask,
            }),
            secure_enclave: None,
        }
    }

    fn seal(
        &self,
        identity: &Identity,
        secret: &[u8],
        policy: &SealPolicy,
    ) -> Result<SealedPayload, HsmError> {
        self.ensure_initialized()?;
        tracing::debug!("Sealing '{}' to PCR mask {}", identity, policy.pcr_mask);
        let object = self
            .device
            .seal(secret, policy.pcr_mask)
            .map_err(|e| with_identity(e, identity))?;
        Ok(SealedPayload {
            ciphertext: object.to_bytes(),
            metadata: BackendMetadata::Tpm {
                pcr_mask: policy.pcr_mask,
            },
        })
    }

    fn unseal(
        &self,
        identity: &Identity,
        sealed: &SealedSecret,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        let BackendMetadata::Tpm { pcr_mask } = sealed.metadata else {
            return Err(HsmError::UnsealFailed(format!(
                "blob was sealed by {}, not the TPM",
                sealed.method()
            )));
        };
        self.ensure_initialized()?;
        let object = TpmSealedObject::from_bytes(&sealed.ciphertext()?)?;
        self.device
            .unseal(&object, pcr_mask)
            .map_err(|e| with_identity(e, identity))
    }

    fn pcr_binding(&self) -> Option<&dyn PcrBinding> {
        Some(self)
    }
}

impl PcrBinding for TpmBackend {
    fn read_pcrs(&self, mask: PcrMask) -> Result<Vec<(u8, Vec<u8>)>, HsmError> {
        self.device.read_pcrs(mask)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (Arc<SimulatedTpm>, TpmBackend) {
        let tpm = Arc::new(SimulatedTpm::new());
        let backend = TpmBackend::new(tpm.clone());
        backend.initialize().unwrap();
        (tpm, backend)
    }

    fn seal(backend: &TpmBackend, id: &Identity, secret: &[u8], mask: u32) -> SealedSecret {
        let policy = SealPolicy {
            pcr_mask: PcrMask::new(mask).unwrap(),
            require_biometric: false,
        };
        SealedSecret::new(id, backend.seal(id, secret, &policy).unwrap())
    }

    #[test]
    fn test_response_code_normalization() {
        assert!(matches!(
            map_response_code(rc::POLICY_FAIL, TpmOp::Unseal),
            HsmError::PcrMismatch
        ));
        assert!(matches!(
            map_response_code(rc::PCR_CHANGED, TpmOp::Seal),
            HsmError::PcrMismatch
        ));
        assert!(matches!(
            map_response_code(rc::BAD_AUTH, TpmOp::Unseal),
            HsmError::AuthFailed(_)
        ));
        assert!(matches!(
            map_response_code(rc::LOCALITY, TpmOp::Seal),
            HsmError::Permission(_)
        ));
        assert!(matches!(
            map_response_code(rc::OBJECT_MEMORY, TpmOp::Seal),
            HsmError::Memory(_)
        ));
        assert!(matches!(
            map_response_code(rc::RETRY, TpmOp::Unseal),
            HsmError::Timeout(_)
        ));
        assert!(matches!(
            map_response_code(rc::REFERENCE_H0, TpmOp::Unseal),
            HsmError::NotFound(_)
        ));
        assert!(matches!(
            map_response_code(rc::INITIALIZE, TpmOp::Initialize),
            HsmError::NotAvailable(_)
        ));
    }

    #[test]
    fn test_unknown_codes_depend_on_operation() {
        assert!(matches!(
            map_response_code(rc::INTEGRITY, TpmOp::Seal),
            HsmError::SealFailed(_)
        ));
        assert!(matches!(
            map_response_code(rc::INTEGRITY, TpmOp::Unseal),
            HsmError::UnsealFailed(_)
        ));
        assert!(matches!(
            map_response_code(rc::INTEGRITY, TpmOp::Query),
            HsmError::Internal(_)
        ));
    }

    #[test]
    fn test_format_one_codes_ignore_parameter_number() {
        // BAD_AUTH reported against session 1 (bits 8..11 set), with a TSS layer prefix
        let code = 0x000B_09A2;
        assert_eq!(rc::base(code), rc::BAD_AUTH);
        assert!(matches!(
            map_response_code(code, TpmOp::Unseal),
            HsmError::AuthFailed(_)
        ));
    }

    #[test]
    fn test_sealed_object_framing() {
        let object = TpmSealedObject {
            public: vec![1, 2, 3],
            private: vec![9, 8],
        };
        let bytes = object.to_bytes();
        assert_eq!(TpmSealedObject::from_bytes(&bytes).unwrap(), object);
        assert!(TpmSealedObject::from_bytes(&[0, 9, 1]).is_err());
    }

    #[test]
    fn test_seal_unseal_round_trip() {
        let (_tpm, backend) = backend();
        let id = Identity::parse("work").unwrap();
        let sealed = seal(&backend, &id, b"\x00pin\x00", 1 << 7);
        assert_eq!(
            backend.unseal(&id, &sealed).unwrap().as_slice(),
            b"\x00pin\x00"
        );
    }

    #[test]
    fn test_pcr_change_is_reported_as_mismatch() {
        let (tpm, backend) = backend();
        let id = Identity::parse("work").unwrap();
        let sealed = seal(&backend, &id, b"123456", 1 << 7);

        tpm.extend_pcr(7, b"new bootloader").unwrap();
        assert!(
            matches!(backend.unseal(&id, &sealed), Err(HsmError::PcrMismatch)),
            "A changed PCR 7 must fail distinctly, never degrade"
        );
    }

    #[test]
    fn test_unseal_uses_recorded_mask() {
        let (tpm, backend) = backend();
        let id = Identity::parse("work").unwrap();
        let sealed = seal(&backend, &id, b"123456", 1 << 0);

        // PCR 7 is outside the recorded mask, so extending it is harmless
        tpm.extend_pcr(7, b"noise").unwrap();
        assert_eq!(backend.unseal(&id, &sealed).unwrap().as_slice(), b"123456");

        tpm.extend_pcr(0, b"firmware update").unwrap();
        assert!(matches!(
            backend.unseal(&id, &sealed),
            Err(HsmError::PcrMismatch)
        ));
    }

    #[test]
    fn test_injected_failures_are_normalized() {
        let (tpm, backend) = backend();
        let id = Identity::parse("work").unwrap();
        let sealed = seal(&backend, &id, b"123456", 1 << 7);

        tpm.fail_next(rc::RETRY);
        assert!(matches!(
            backend.unseal(&id, &sealed),
            Err(HsmError::Timeout(_))
        ));

        tpm.fail_next(rc::HANDLE);
        match backend.unseal(&id, &sealed) {
            Err(HsmError::NotFound(who)) => assert_eq!(who, "work"),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_other_chip_cannot_unseal() {
        let (_tpm, first) = backend();
        let (_other_tpm, other) = backend();
        let id = Identity::parse("work").unwrap();
        let sealed = seal(&first, &id, b"123456", 1 << 7);

        assert!(matches!(
            other.unseal(&id, &sealed),
            Err(HsmError::UnsealFailed(_))
        ));
    }

    #[test]
    fn test_status_reports_primary_and_mask() {
        let (_tpm, backend) = backend();
        let status = backend.status(&SealPolicy::default());
        assert!(status.available);
        assert!(status.initialized);
        let tpm = status.tpm.unwrap();
        assert!(tpm.has_primary_key);
        assert_eq!(tpm.manufacturer.as_deref(), Some("SIM "));
        assert_eq!(tpm.pcr_mask.bits(), 1 << 7);
    }

    #[test]
    fn test_pcr_read_capability() {
        let (_tpm, backend) = backend();
        let binding = backend.pcr_binding().expect("TPM exposes PCR binding");
        let values = binding.read_pcrs(PcrMask::new(0b1000_0001).unwrap()).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].0, 0);
        assert_eq!(values[1].0, 7);
        assert_eq!(values[1].1.len(), 32);
    }
}
