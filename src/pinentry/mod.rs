// Pinseal — Pinentry helper
//
// The program gpg-agent runs instead of a regular pinentry. In trusted
// workstation mode it answers GETPIN from the sealed store when the
// requested key belongs to the trusted identity; otherwise it hands the
// request to an interactive pinentry.

mod assuan;
mod fallback;
mod server;

pub use assuan::{escape, unescape, PromptState};
pub use fallback::{converse, Delegate, ExternalPinentry, Reply};
pub use server::PinentryServer;

use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

use crate::config::Config;
use crate::hsm::{Hsm, HsmError};
use crate::mode::SecurityModeMachine;

#[derive(Debug, Error)]
pub enum PinentryError {
    #[error("trusted workstation mode is not active")]
    NotTrusted,

    #[error("the requested key does not belong to the trusted identity")]
    UnknownKey,

    #[error("no fallback pinentry program found; set fallback_pinentry in the config")]
    NoFallback,

    #[error("could not start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("pinentry protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Hsm(#[from] HsmError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Receives a released PIN while it is still inside the unseal scope.
pub type PinSink<'a> = dyn FnMut(&[u8]) -> io::Result<()> + 'a;

/// Where a PIN comes from when no one is asked.
pub trait PinSource {
    /// Hand the PIN for the key `request` names to `sink`, at most once.
    fn release(&self, request: &PromptState, sink: &mut PinSink<'_>) -> Result<(), PinentryError>;
}

// ── Key directory ──

/// Maps the key gpg-agent asks about to the identity that owns it.
#[derive(Debug, Clone, Default)]
pub struct KeyDirectory {
    /// Upper-case keygrip → identity.
    keygrips: BTreeMap<String, String>,
    /// Identity → upper-case key ID or fingerprint.
    signing_keys: BTreeMap<String, String>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut directory = Self::new();
        for (identity, grips) in &config.keygrips {
            for grip in grips {
                directory = directory.with_keygrip(identity, grip);
            }
        }
        for (identity, key) in &config.signing_keys {
            directory = directory.with_signing_key(identity, key);
        }
        directory
    }

    pub fn with_keygrip(mut self, identity: &str, keygrip: &str) -> Self {
        self.keygrips
            .insert(keygrip.trim().to_ascii_uppercase(), identity.to_string());
        self
    }

    pub fn with_signing_key(mut self, identity: &str, key: &str) -> Self {
        self.signing_keys
            .insert(identity.to_string(), normalize_key_id(key));
        self
    }

    /// Identity owning the requested key: keygrip first, then a key ID
    /// from the description matched by suffix against the signing keys.
    pub fn identity_for(&self, request: &PromptState) -> Option<&str> {
        if let Some(identity) = request
            .keygrip()
            .and_then(|grip| self.keygrips.get(&grip))
        {
            return Some(identity.as_str());
        }
        let key_id = request.key_id()?;
        self.signing_keys
            .iter()
            .find(|(_, key)| !key.is_empty() && (key.ends_with(&key_id) || key_id.ends_with(key.as_str())))
            .map(|(identity, _)| identity.as_str())
    }
}

fn normalize_key_id(key: &str) -> String {
    let key: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    key.strip_prefix("0x")
        .or_else(|| key.strip_prefix("0X"))
        .unwrap_or(&key)
        .to_ascii_uppercase()
}

// ── Sources ──

/// Releases the trusted identity's sealed PIN while the mode allows it and
/// the request is for one of that identity's keys.
pub struct TrustedPin {
    hsm: Hsm,
    modes: SecurityModeMachine,
    keys: KeyDirectory,
}

impl TrustedPin {
    pub fn new(hsm: Hsm, modes: SecurityModeMachine, keys: KeyDirectory) -> Self {
        Self { hsm, modes, keys }
    }
}

impl PinSource for TrustedPin {
    fn release(&self, request: &PromptState, sink: &mut PinSink<'_>) -> Result<(), PinentryError> {
        let identity = self
            .modes
            .trusted_identity()
            .ok_or(PinentryError::NotTrusted)?;
        match self.keys.identity_for(request) {
            Some(owner) if owner == identity => {}
            other => {
                tracing::debug!(
                    "Request for {:?} maps to {:?}, not '{}'",
                    request.keyinfo,
                    other,
                    identity
                );
                return Err(PinentryError::UnknownKey);
            }
        }

        let mut write_error = None;
        let released = self.hsm.unseal(&identity, |pin| {
            sink(pin).map_err(|e| {
                let message = e.to_string();
                write_error = Some(e);
                message
            })
        });
        if let Some(e) = write_error {
            return Err(PinentryError::Io(e));
        }
        released?;
        tracing::info!("Released sealed PIN for '{}'", identity);
        Ok(())
    }
}

/// Used when no HSM could be opened; every request is prompted.
pub struct Untrusted;

impl PinSource for Untrusted {
    fn release(&self, _request: &PromptState, _sink: &mut PinSink<'_>) -> Result<(), PinentryError> {
        Err(PinentryError::NotTrusted)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
