// Pinseal — Hardware token policy collaborator
//
// OpenPGP-card PIN and touch policies, set through `ykman`. A host without
// `ykman` has no token to manage, which is not an error.

use std::fmt;
use std::io;
use std::process::{Command, Stdio};

use serde::Serialize;

use super::WorkstationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenProbe {
    /// No token tooling on this host.
    NotApplicable,
    Reachable,
    /// Tooling present but no token connected.
    Unreachable,
}

/// How often the signature PIN must be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPolicy {
    Once,
    Always,
}

impl PinPolicy {
    fn as_arg(&self) -> &'static str {
        match self {
            PinPolicy::Once => "once",
            PinPolicy::Always => "always",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Signature,
    Encryption,
    Authentication,
}

impl KeySlot {
    fn as_arg(&self) -> &'static str {
        match self {
            KeySlot::Signature => "sig",
            KeySlot::Encryption => "enc",
            KeySlot::Authentication => "aut",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPolicy {
    Off,
    On,
    Fixed,
    Cached,
    CachedFixed,
}

impl TouchPolicy {
    fn as_arg(&self) -> &'static str {
        match self {
            TouchPolicy::Off => "off",
            TouchPolicy::On => "on",
            TouchPolicy::Fixed => "fixed",
            TouchPolicy::Cached => "cached",
            TouchPolicy::CachedFixed => "cached-fixed",
        }
    }
}

impl fmt::Display for TouchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub openpgp_version: Option<String>,
    pub pin_tries_remaining: Option<u32>,
    pub signature_pin_policy: Option<String>,
    pub signature_touch_policy: Option<String>,
}

pub trait TokenPolicy {
    fn probe(&self) -> TokenProbe;
    fn info(&self) -> Result<TokenInfo, WorkstationError>;
    fn set_signature_pin_policy(&self, policy: PinPolicy) -> Result<(), WorkstationError>;
    fn set_touch_policy(&self, slot: KeySlot, policy: TouchPolicy) -> Result<(), WorkstationError>;
}

/// Parse `ykman openpgp info`.
pub fn parse_openpgp_info(text: &str) -> TokenInfo {
    let mut info = TokenInfo::default();
    let mut section = "";
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if value.is_empty() {
            section = key;
            continue;
        }
        match (section, key) {
            (_, "OpenPGP version") => info.openpgp_version = Some(value.to_string()),
            (_, "PIN tries remaining") => info.pin_tries_remaining = value.parse().ok(),
            ("Touch policies", "Signature key") => {
                info.signature_touch_policy = Some(value.to_string())
            }
            ("PIN policies", "Signature key") => info.signature_pin_policy = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

pub struct Ykman {
    program: String,
}

impl Ykman {
    pub fn new() -> Self {
        Self::with_program("ykman")
    }

    pub fn with_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Run `ykman <args>`. The terminal stays attached to stdin so ykman can
    /// ask for the admin PIN itself.
    fn run(&self, args: &[&str], stdin: Stdio) -> Result<String, WorkstationError> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(stdin)
            .output()
            .map_err(|e| WorkstationError::Token(format!("{}: {}", self.program, e)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(WorkstationError::Token(format!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl Default for Ykman {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenPolicy for Ykman {
    fn probe(&self) -> TokenProbe {
        match Command::new(&self.program)
            .arg("list")
            .stdin(Stdio::null())
            .output()
        {
            Err(e) if e.kind() == io::ErrorKind::NotFound => TokenProbe::NotApplicable,
            Err(e) => {
                tracing::debug!("{} list: {}", self.program, e);
                TokenProbe::Unreachable
            }
            Ok(o) if o.status.success() && !o.stdout.trim_ascii().is_empty() => {
                TokenProbe::Reachable
            }
            Ok(_) => TokenProbe::Unreachable,
        }
    }

    fn info(&self) -> Result<TokenInfo, WorkstationError> {
        let text = self.run(&["openpgp", "info"], Stdio::null())?;
        Ok(parse_openpgp_info(&text))
    }

    fn set_signature_pin_policy(&self, policy: PinPolicy) -> Result<(), WorkstationError> {
        self.run(
            &["openpgp", "access", "set-signature-policy", policy.as_arg()],
            Stdio::inherit(),
        )?;
        tracing::info!("Token signature PIN policy set to {}", policy.as_arg());
        Ok(())
    }

    fn set_touch_policy(&self, slot: KeySlot, policy: TouchPolicy) -> Result<(), WorkstationError> {
        self.run(
            &["openpgp", "keys", "set-touch", slot.as_arg(), policy.as_arg(), "--force"],
            Stdio::inherit(),
        )?;
        tracing::info!("Token {} touch policy set to {}", slot.as_arg(), policy);
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
