// Pinseal — Backend interface
//
// Every protection method implements `SealBackend`. Capabilities only some
// methods have (PCR binding, biometric gating) are exposed through optional
// accessors instead of widening the common trait.

use zeroize::Zeroizing;

use super::types::{
    HsmMethod, HsmStatus, Identity, PcrMask, SealPolicy, SealedPayload, SealedSecret,
};
use super::HsmError;

pub trait SealBackend: Send + Sync {
    fn method(&self) -> HsmMethod;

    /// Cheap check that the underlying device can be used right now.
    fn is_available(&self) -> bool;

    /// Create backend key material if absent. Must be idempotent.
    fn initialize(&self) -> Result<(), HsmError>;

    /// Whether `initialize` has completed on this instance.
    fn is_initialized(&self) -> bool;

    /// Full probe, built fresh per call.
    fn status(&self, policy: &SealPolicy) -> HsmStatus;

    /// Protect `secret` for `identity` under `policy`.
    fn seal(
        &self,
        identity: &Identity,
        secret: &[u8],
        policy: &SealPolicy,
    ) -> Result<SealedPayload, HsmError>;

    /// Recover the plaintext of a stored blob.
    fn unseal(
        &self,
        identity: &Identity,
        sealed: &SealedSecret,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError>;

    fn pcr_binding(&self) -> Option<&dyn PcrBinding> {
        None
    }

    fn biometric_gate(&self) -> Option<&dyn BiometricGate> {
        None
    }
}

/// Extended capability of backends that bind secrets to platform state.
pub trait PcrBinding {
    /// Current SHA-256 values of the selected PCRs, in index order.
    fn read_pcrs(&self, mask: PcrMask) -> Result<Vec<(u8, Vec<u8>)>, HsmError>;
}

/// Extended capability of backends that can gate release on biometrics.
pub trait BiometricGate {
    fn biometric_available(&self) -> bool;
}
