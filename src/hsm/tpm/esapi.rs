// Pinseal — TPM 2.0 device over tpm2-tss ESAPI
//
// Opens a fresh ESAPI context per operation and recreates the owner
// primary key (RSA-2048 restricted decrypt, AES-128-CFB) each time. The
// primary is derived from the owner seed, so it is identical across calls.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use tss_esapi::attributes::{ObjectAttributesBuilder, SessionAttributesBuilder};
use tss_esapi::constants::{PropertyTag, SessionType};
use tss_esapi::handles::{KeyHandle, ObjectHandle, SessionHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Digest, KeyedHashScheme, PcrSelectionList, PcrSelectionListBuilder, PcrSlot, Private,
    Public, PublicBuilder, PublicKeyedHashParameters, RsaExponent, SensitiveData,
    SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::utils::create_restricted_decryption_rsa_public;
use tss_esapi::Context;
use zeroize::Zeroizing;

use super::{device_node_present, map_response_code, TpmDevice, TpmOp, TpmSealedObject};
use crate::hsm::types::PcrMask;
use crate::hsm::HsmError;

pub struct EsapiTpm {
    primary_seen: AtomicBool,
}

impl EsapiTpm {
    pub fn new() -> Self {
        Self {
            primary_seen: AtomicBool::new(false),
        }
    }

    fn tcti() -> Result<TctiNameConf, HsmError> {
        if let Ok(conf) = TctiNameConf::from_environment_variable() {
            return Ok(conf);
        }
        let node = super::TPM_DEVICE_NODES
            .iter()
            .find(|p| std::path::Path::new(p).exists())
            .ok_or_else(|| HsmError::NotAvailable("no TPM device node".to_string()))?;
        let config = DeviceConfig::from_str(node)
            .map_err(|e| HsmError::NotAvailable(format!("invalid TCTI device {}: {}", node, e)))?;
        Ok(TctiNameConf::Device(config))
    }

    fn context(op: TpmOp) -> Result<Context, HsmError> {
        Context::new(Self::tcti()?).map_err(|e| map_esapi(e, op))
    }

    fn create_primary(ctx: &mut Context, op: TpmOp) -> Result<KeyHandle, HsmError> {
        let public = create_restricted_decryption_rsa_public(
            SymmetricDefinitionObject::AES_128_CFB,
            RsaKeyBits::Rsa2048,
            RsaExponent::default(),
        )
        .map_err(|e| map_esapi(e, op))?;
        let result = ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
            })
            .map_err(|e| map_esapi(e, op))?;
        tracing::debug!("TPM primary key loaded");
        Ok(result.key_handle)
    }

    /// Start a session of `kind` and apply PolicyPCR for `mask`.
    fn pcr_policy_session(
        ctx: &mut Context,
        kind: SessionType,
        mask: PcrMask,
        op: TpmOp,
    ) -> Result<PolicySession, HsmError> {
        let session = ctx
            .start_auth_session(
                None,
                None,
                None,
                kind,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(|e| map_esapi(e, op))?
            .ok_or_else(|| HsmError::Internal("TPM returned no session".to_string()))?;
        let (attributes, attributes_mask) = SessionAttributesBuilder::new()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        ctx.tr_sess_set_attributes(session, attributes, attributes_mask)
            .map_err(|e| map_esapi(e, op))?;

        let policy_session =
            PolicySession::try_from(session).map_err(|e| map_esapi(e, op))?;
        ctx.policy_pcr(policy_session, Digest::default(), pcr_selection(mask, op)?)
            .map_err(|e| map_esapi(e, op))?;
        Ok(policy_session)
    }

    fn flush(ctx: &mut Context, handle: ObjectHandle) {
        if let Err(e) = ctx.flush_context(handle) {
            tracing::debug!("Failed to flush TPM handle: {}", e);
        }
    }
}

impl Default for EsapiTpm {
    fn default() -> Self {
        Self::new()
    }
}

fn map_esapi(e: tss_esapi::Error, op: TpmOp) -> HsmError {
    if let tss_esapi::Error::Tss2Error(rc) = e {
        return map_response_code(rc.tss2_rc(), op);
    }
    let detail = format!("ESAPI: {}", e);
    match op {
        TpmOp::Seal => HsmError::SealFailed(detail),
        TpmOp::Unseal => HsmError::UnsealFailed(detail),
        TpmOp::Initialize | TpmOp::Query => HsmError::Internal(detail),
    }
}

fn session_handle(session: PolicySession) -> ObjectHandle {
    ObjectHandle::from(SessionHandle::from(AuthSession::from(session)))
}

fn pcr_selection(mask: PcrMask, op: TpmOp) -> Result<PcrSelectionList, HsmError> {
    let slots = mask
        .indices()
        .into_iter()
        .map(|i| PcrSlot::try_from(1u32 << i))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_esapi(e, op))?;
    PcrSelectionListBuilder::new()
        .with_selection(HashingAlgorithm::Sha256, &slots)
        .build()
        .map_err(|e| map_esapi(e, op))
}

impl TpmDevice for EsapiTpm {
    fn is_present(&self) -> bool {
        device_node_present() || std::env::var_os("TPM2TOOLS_TCTI").is_some()
    }

    fn manufacturer(&self) -> Result<Option<String>, HsmError> {
        let mut ctx = Self::context(TpmOp::Query)?;
        let value = ctx
            .get_tpm_property(PropertyTag::Manufacturer)
            .map_err(|e| map_esapi(e, TpmOp::Query))?;
        Ok(value.map(|v| {
            v.to_be_bytes()
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect()
        }))
    }

    fn ensure_primary(&self) -> Result<(), HsmError> {
        let mut ctx = Self::context(TpmOp::Initialize)?;
        let primary = Self::create_primary(&mut ctx, TpmOp::Initialize)?;
        Self::flush(&mut ctx, primary.into());
        self.primary_seen.store(true, Ordering::Release);
        Ok(())
    }

    fn has_primary(&self) -> bool {
        self.primary_seen.load(Ordering::Acquire)
    }

    fn read_pcrs(&self, mask: PcrMask) -> Result<Vec<(u8, Vec<u8>)>, HsmError> {
        let mut ctx = Self::context(TpmOp::Query)?;
        let (_, _, digests) = ctx
            .pcr_read(pcr_selection(mask, TpmOp::Query)?)
            .map_err(|e| map_esapi(e, TpmOp::Query))?;
        Ok(mask
            .indices()
            .into_iter()
            .zip(digests.value().iter())
            .map(|(index, digest)| {
                tracing::debug!("PCR {:2}: {}", index, hex::encode(digest.value()));
                (index, digest.value().to_vec())
            })
            .collect())
    }

    fn seal(&self, data: &[u8], mask: PcrMask) -> Result<TpmSealedObject, HsmError> {
        let op = TpmOp::Seal;
        let mut ctx = Self::context(op)?;
        let primary = Self::create_primary(&mut ctx, op)?;

        let result = (|| {
            let trial = Self::pcr_policy_session(&mut ctx, SessionType::Trial, mask, op)?;
            let digest = ctx.policy_get_digest(trial).map_err(|e| map_esapi(e, op));
            Self::flush(&mut ctx, session_handle(trial));
            let digest = digest?;

            let attributes = ObjectAttributesBuilder::new()
                .with_fixed_tpm(true)
                .with_fixed_parent(true)
                .build()
                .map_err(|e| map_esapi(e, op))?;
            let template = PublicBuilder::new()
                .with_public_algorithm(PublicAlgorithm::KeyedHash)
                .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
                .with_object_attributes(attributes)
                .with_auth_policy(digest)
                .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
                .with_keyed_hash_unique_identifier(Digest::default())
                .build()
                .map_err(|e| map_esapi(e, op))?;
            let sensitive =
                SensitiveData::try_from(data.to_vec()).map_err(|e| map_esapi(e, op))?;

            let created = ctx
                .execute_with_nullauth_session(|ctx| {
                    ctx.create(primary, template, None, Some(sensitive), None, None)
                })
                .map_err(|e| map_esapi(e, op))?;

            Ok(TpmSealedObject {
                public: created.out_public.marshall().map_err(|e| map_esapi(e, op))?,
                private: created.out_private.value().to_vec(),
            })
        })();

        Self::flush(&mut ctx, primary.into());
        result
    }

    fn unseal(
        &self,
        object: &TpmSealedObject,
        mask: PcrMask,
    ) -> Result<Zeroizing<Vec<u8>>, HsmError> {
        let op = TpmOp::Unseal;
        let public = Public::unmarshall(&object.public).map_err(|e| map_esapi(e, op))?;
        let private = Private::try_from(object.private.clone()).map_err(|e| map_esapi(e, op))?;

        let mut ctx = Self::context(op)?;
        let primary = Self::create_primary(&mut ctx, op)?;

        let result = (|| {
            let loaded = ctx
                .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))
                .map_err(|e| map_esapi(e, op))?;

            let unsealed = Self::pcr_policy_session(&mut ctx, SessionType::Policy, mask, op)
                .and_then(|session| {
                    let data = ctx
                        .execute_with_session(Some(AuthSession::from(session)), |ctx| {
                            ctx.unseal(loaded.into())
                        })
                        .map_err(|e| map_esapi(e, op));
                    Self::flush(&mut ctx, session_handle(session));
                    data
                });
            Self::flush(&mut ctx, loaded.into());

            let data = unsealed?;
            Ok(Zeroizing::new(data.value().to_vec()))
        })();

        Self::flush(&mut ctx, primary.into());
        result
    }
}
