// Pinseal — Security Mode State Machine
//
// Three operator-chosen postures persisted as one settings value. The
// machine only records the mode; rewiring the signing agent belongs to the
// workstation orchestrator. Entering TrustedWorkstation is guarded by a
// probe of the sealed-secret store.

mod error;
mod settings;

pub use error::ModeError;
pub use settings::{CapturedPinentry, Settings, SettingsStore, SETTINGS_FILE};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hsm::Hsm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// PIN typed for every operation; nothing is cached.
    #[default]
    MaximumSecurity,
    /// PIN cached by the agent for the session.
    DeveloperWorkflow,
    /// PIN released from the HSM without interaction.
    TrustedWorkstation,
}

impl SecurityMode {
    pub const ALL: [SecurityMode; 3] = [
        SecurityMode::MaximumSecurity,
        SecurityMode::DeveloperWorkflow,
        SecurityMode::TrustedWorkstation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::MaximumSecurity => "maximum_security",
            SecurityMode::DeveloperWorkflow => "developer_workflow",
            SecurityMode::TrustedWorkstation => "trusted_workstation",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SecurityMode::MaximumSecurity => "PIN required for every signing operation",
            SecurityMode::DeveloperWorkflow => "PIN cached by the signing agent for the session",
            SecurityMode::TrustedWorkstation => {
                "PIN released from hardware-sealed storage without prompting"
            }
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityMode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        SecurityMode::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| ModeError::UnknownMode(s.to_string()))
    }
}

// ─── Prerequisites ───────────────────────────────────────────────────────────

/// A condition that must hold before entering TrustedWorkstation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisite {
    IdentityRequired,
    HsmUnavailable,
    SecretNotSealed(String),
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prerequisite::IdentityRequired => f.write_str("no identity given"),
            Prerequisite::HsmUnavailable => f.write_str("no hardware security module available"),
            Prerequisite::SecretNotSealed(identity) => {
                write!(f, "no PIN sealed for '{}' (run `pinseal pin store {}`)", identity, identity)
            }
        }
    }
}

/// What the machine needs to know about the sealed-secret store.
pub trait SealedSecretProbe {
    fn is_available(&self) -> bool;
    fn exists(&self, identity: &str) -> bool;
}

impl SealedSecretProbe for Hsm {
    fn is_available(&self) -> bool {
        self.available()
    }

    fn exists(&self, identity: &str) -> bool {
        Hsm::exists(self, identity)
    }
}

// ─── Machine ─────────────────────────────────────────────────────────────────

pub struct SecurityModeMachine {
    settings: SettingsStore,
}

impl SecurityModeMachine {
    pub fn new(settings: SettingsStore) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn current(&self) -> SecurityMode {
        self.settings.load().default_security_mode
    }

    /// Identity recorded when TrustedWorkstation was entered.
    pub fn trusted_identity(&self) -> Option<String> {
        let settings = self.settings.load();
        match settings.default_security_mode {
            SecurityMode::TrustedWorkstation => settings.trusted_identity,
            _ => None,
        }
    }

    /// Unmet conditions for entering `target`. Empty means allowed.
    pub fn missing_prerequisites(
        &self,
        target: SecurityMode,
        identity: Option<&str>,
        probe: &dyn SealedSecretProbe,
    ) -> Vec<Prerequisite> {
        if target != SecurityMode::TrustedWorkstation {
            return Vec::new();
        }
        let mut missing = Vec::new();
        if !probe.is_available() {
            missing.push(Prerequisite::HsmUnavailable);
        }
        match identity {
            None => missing.push(Prerequisite::IdentityRequired),
            Some(id) if !probe.exists(id) => {
                missing.push(Prerequisite::SecretNotSealed(id.to_string()))
            }
            Some(_) => {}
        }
        missing
    }

    /// Switch to `target`, returning the mode that was active before.
    ///
    /// A refused transition leaves the settings untouched.
    pub fn transition(
        &self,
        target: SecurityMode,
        identity: Option<&str>,
        probe: &dyn SealedSecretProbe,
    ) -> Result<SecurityMode, ModeError> {
        let missing = self.missing_prerequisites(target, identity, probe);
        if !missing.is_empty() {
            tracing::warn!("Transition to {} refused", target);
            return Err(ModeError::Refused { target, missing });
        }

        self.record(target, identity)
    }

    /// Leave TrustedWorkstation for the mode recorded on entry.
    pub fn restore_previous(&self) -> Result<SecurityMode, ModeError> {
        let settings = self.settings.load();
        let target = match settings.default_security_mode {
            SecurityMode::TrustedWorkstation => settings
                .previous_security_mode
                .filter(|m| *m != SecurityMode::TrustedWorkstation)
                .unwrap_or_default(),
            current => current,
        };
        self.record(target, None)?;
        Ok(target)
    }

    fn record(
        &self,
        target: SecurityMode,
        identity: Option<&str>,
    ) -> Result<SecurityMode, ModeError> {
        let previous = self.settings.update(|s| {
            let previous = s.default_security_mode;
            if target == SecurityMode::TrustedWorkstation {
                if previous != SecurityMode::TrustedWorkstation {
                    s.previous_security_mode = Some(previous);
                }
                s.trusted_identity = identity.map(str::to_string);
            } else {
                s.trusted_identity = None;
                s.previous_security_mode = None;
            }
            s.default_security_mode = target;
            previous
        })?;
        tracing::info!("Security mode: {} -> {}", previous, target);
        Ok(previous)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeProbe {
        available: bool,
        sealed: HashSet<String>,
    }

    impl FakeProbe {
        fn new(available: bool, sealed: &[&str]) -> Self {
            Self {
                available,
                sealed: sealed.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl SealedSecretProbe for FakeProbe {
        fn is_available(&self) -> bool {
            self.available
        }
        fn exists(&self, identity: &str) -> bool {
            self.sealed.contains(identity)
        }
    }

    fn machine(dir: &tempfile::TempDir) -> SecurityModeMachine {
        SecurityModeMachine::new(SettingsStore::new(dir.path().join(SETTINGS_FILE)))
    }

    #[test]
    fn test_initial_mode_is_maximum_security() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(machine(&dir).current(), SecurityMode::MaximumSecurity);
    }

    #[test]
    fn test_mode_parsing_accepts_both_spellings() {
        assert_eq!(
            "developer-workflow".parse::<SecurityMode>().unwrap(),
            SecurityMode::DeveloperWorkflow
        );
        assert_eq!(
            "trusted_workstation".parse::<SecurityMode>().unwrap(),
            SecurityMode::TrustedWorkstation
        );
        assert!("paranoid".parse::<SecurityMode>().is_err());
    }

    #[test]
    fn test_unguarded_transitions_are_free() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);
        let probe = FakeProbe::new(false, &[]);

        let previous = machine
            .transition(SecurityMode::DeveloperWorkflow, None, &probe)
            .unwrap();
        assert_eq!(previous, SecurityMode::MaximumSecurity);
        assert_eq!(machine.current(), SecurityMode::DeveloperWorkflow);
    }

    #[test]
    fn test_trusted_workstation_without_sealed_secret_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);
        let probe = FakeProbe::new(true, &[]);

        let err = machine
            .transition(SecurityMode::TrustedWorkstation, Some("work"), &probe)
            .unwrap_err();
        match err {
            ModeError::Refused { missing, .. } => {
                assert_eq!(missing, vec![Prerequisite::SecretNotSealed("work".into())])
            }
            other => panic!("expected refusal, got {}", other),
        }
        assert_eq!(
            machine.current(),
            SecurityMode::MaximumSecurity,
            "A refused transition must not change the mode"
        );
        assert!(
            !dir.path().join(SETTINGS_FILE).exists(),
            "A refused transition must not write settings"
        );
    }

    #[test]
    fn test_all_missing_prerequisites_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = machine(&dir).missing_prerequisites(
            SecurityMode::TrustedWorkstation,
            None,
            &FakeProbe::new(false, &[]),
        );
        assert_eq!(
            missing,
            vec![Prerequisite::HsmUnavailable, Prerequisite::IdentityRequired]
        );
    }

    #[test]
    fn test_trusted_workstation_records_identity_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);
        let probe = FakeProbe::new(true, &["work"]);

        machine
            .transition(SecurityMode::DeveloperWorkflow, None, &probe)
            .unwrap();
        machine
            .transition(SecurityMode::TrustedWorkstation, Some("work"), &probe)
            .unwrap();
        assert_eq!(machine.trusted_identity().as_deref(), Some("work"));

        // Re-entering keeps the original mode to return to
        machine
            .transition(SecurityMode::TrustedWorkstation, Some("work"), &probe)
            .unwrap();

        assert_eq!(
            machine.restore_previous().unwrap(),
            SecurityMode::DeveloperWorkflow
        );
        assert_eq!(machine.current(), SecurityMode::DeveloperWorkflow);
        assert_eq!(machine.trusted_identity(), None);
    }

    #[test]
    fn test_mode_is_persisted_in_snake_case() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(&dir);
        machine
            .transition(
                SecurityMode::TrustedWorkstation,
                Some("work"),
                &FakeProbe::new(true, &["work"]),
            )
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join(SETTINGS_FILE)).unwrap();
        assert!(raw.contains(r#""defaultSecurityMode": "trusted_workstation""#));
        assert!(raw.contains(r#""trustedIdentity": "work""#));
    }
}
