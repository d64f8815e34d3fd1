// Pinseal — Trusted Workstation Orchestrator
//
// Wires the HSM facade to the signing agent and the hardware token. Enable
// seals the PIN, points the agent's pinentry at `pinseal-pinentry`, relaxes
// the token's PIN caching (best effort) and only then flips the security
// mode. Disable restores what enable captured.

mod agent;
mod error;
mod token;

pub use agent::{
    default_helper_path, parse_pinentry_program, rewrite_pinentry_program, GpgAgent,
    SigningAgent,
};
pub use error::WorkstationError;
pub use token::{
    parse_openpgp_info, KeySlot, PinPolicy, TokenInfo, TokenPolicy, TokenProbe, TouchPolicy,
    Ykman,
};

use std::path::PathBuf;

use serde::Serialize;

use crate::hsm::types::validate_secret;
use crate::hsm::{Hsm, HsmMethod, Identity, SecretBytes};
use crate::mode::{CapturedPinentry, SecurityMode, SecurityModeMachine};

#[derive(Debug, Clone)]
pub struct EnableReport {
    pub message: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DisableReport {
    pub message: String,
    pub mode: SecurityMode,
    /// Pinentry written back to the agent, `Some(None)` for the agent default.
    pub restored_pinentry: Option<Option<String>>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub message: String,
    pub warnings: Vec<String>,
}

/// Read-only view across the HSM, the agent and the token.
#[derive(Debug, Clone, Serialize)]
pub struct TrustedWorkstationStatus {
    pub identity: String,
    pub mode: SecurityMode,
    pub trusted_identity: Option<String>,
    pub hsm_method: HsmMethod,
    pub hsm_available: bool,
    pub pin_stored: bool,
    pub agent_present: bool,
    pub pinentry_program: Option<String>,
    pub agent_wired: bool,
    pub token: TokenProbe,
    pub token_info: Option<TokenInfo>,
}

impl TrustedWorkstationStatus {
    pub fn fully_wired(&self) -> bool {
        self.mode == SecurityMode::TrustedWorkstation
            && self.trusted_identity.as_deref() == Some(self.identity.as_str())
            && self.hsm_available
            && self.pin_stored
            && self.agent_wired
    }
}

pub struct Orchestrator {
    hsm: Hsm,
    modes: SecurityModeMachine,
    agent: Box<dyn SigningAgent>,
    token: Box<dyn TokenPolicy>,
    helper: PathBuf,
    require_token: bool,
}

impl Orchestrator {
    pub fn new(
        hsm: Hsm,
        modes: SecurityModeMachine,
        agent: Box<dyn SigningAgent>,
        token: Box<dyn TokenPolicy>,
        helper: PathBuf,
    ) -> Self {
        Self {
            hsm,
            modes,
            agent,
            token,
            helper,
            require_token: false,
        }
    }

    /// Treat a missing hardware token as an unmet prerequisite.
    pub fn require_token(mut self, required: bool) -> Self {
        self.require_token = required;
        self
    }

    pub fn hsm(&self) -> &Hsm {
        &self.hsm
    }

    pub fn modes(&self) -> &SecurityModeMachine {
        &self.modes
    }

    fn helper_program(&self) -> String {
        self.helper.to_string_lossy().into_owned()
    }

    fn prerequisites(&self, token: TokenProbe) -> Vec<String> {
        let mut missing = Vec::new();
        if !self.hsm.available() {
            missing.push("no hardware security module available".to_string());
        }
        if !self.agent.is_present() {
            missing.push("signing agent not found (is gpg-agent installed?)".to_string());
        }
        if self.require_token {
            match token {
                TokenProbe::Reachable => {}
                TokenProbe::Unreachable => {
                    missing.push("hardware token not connected".to_string())
                }
                TokenProbe::NotApplicable => {
                    missing.push("hardware token tooling (ykman) not installed".to_string())
                }
            }
        }
        missing
    }

    // ── Enable ───────────────────────────────────────────────────────────────

    pub fn enable(&self, identity: &str, pin: &SecretBytes) -> Result<EnableReport, WorkstationError> {
        let identity = Identity::parse(identity)?;
        validate_secret(pin.as_bytes())?;

        let token = self.token.probe();
        let missing = self.prerequisites(token);
        if !missing.is_empty() {
            return Err(WorkstationError::PrerequisitesUnmet(missing));
        }

        self.hsm.seal(identity.as_str(), pin.as_bytes())?;

        if let Err(e) = self.wire_agent() {
            tracing::warn!("Signing agent rewiring failed: {}", e);
            return Err(WorkstationError::Partial(format!(
                "PIN for '{}' is sealed, but the signing agent could not be rewired: {}",
                identity, e
            )));
        }

        let warnings = self.apply_token_policy(token);

        if let Err(e) = self.modes.transition(
            SecurityMode::TrustedWorkstation,
            Some(identity.as_str()),
            &self.hsm,
        ) {
            return Err(WorkstationError::Partial(format!(
                "PIN sealed and signing agent rewired, but the security mode was not switched: {}",
                e
            )));
        }

        let mut message = format!(
            "Trusted workstation mode enabled for '{}' ({})",
            identity,
            self.hsm.method().display_name()
        );
        if !warnings.is_empty() {
            message.push_str(&format!(" with {} warning(s)", warnings.len()));
        }
        Ok(EnableReport { message, warnings })
    }

    fn wire_agent(&self) -> Result<(), WorkstationError> {
        let helper = self.helper_program();
        let current = self.agent.pinentry_program()?;
        self.modes.settings().update(|s| {
            if s.captured_pinentry.is_none() && current.as_deref() != Some(helper.as_str()) {
                s.captured_pinentry = Some(CapturedPinentry {
                    program: current.clone(),
                });
            }
        })?;
        self.agent.set_pinentry_program(Some(&helper))?;
        self.agent.reload()
    }

    fn apply_token_policy(&self, probe: TokenProbe) -> Vec<String> {
        let mut warnings = Vec::new();
        match probe {
            TokenProbe::NotApplicable => {}
            TokenProbe::Unreachable => warnings
                .push("hardware token not connected; PIN caching policy left unchanged".to_string()),
            TokenProbe::Reachable => {
                if let Err(e) = self.token.set_signature_pin_policy(PinPolicy::Once) {
                    warnings.push(format!("could not set signature PIN policy: {}", e));
                }
                if let Err(e) = self
                    .token
                    .set_touch_policy(KeySlot::Signature, TouchPolicy::Cached)
                {
                    warnings.push(format!("could not set signature touch policy: {}", e));
                }
            }
        }
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        warnings
    }

    // ── Disable ──────────────────────────────────────────────────────────────

    /// Restore the agent and the previous mode. The sealed PIN is kept.
    pub fn disable(&self, identity: &str) -> Result<DisableReport, WorkstationError> {
        let identity = Identity::parse(identity)?;
        let mut warnings = Vec::new();
        if let Some(trusted) = self.modes.trusted_identity() {
            if trusted != identity.as_str() {
                warnings.push(format!(
                    "trusted workstation mode was enabled for '{}', not '{}'",
                    trusted, identity
                ));
            }
        }

        let helper = self.helper_program();
        let restore = match self.modes.settings().load().captured_pinentry {
            Some(captured) => Some(captured.program),
            None if self.agent.pinentry_program()?.as_deref() == Some(helper.as_str()) => {
                Some(None)
            }
            None => None,
        };

        if let Some(program) = &restore {
            self.agent.set_pinentry_program(program.as_deref())?;
            if let Err(e) = self.agent.reload() {
                warnings.push(format!("signing agent not reloaded: {}", e));
            }
            self.modes.settings().update(|s| s.captured_pinentry = None)?;
        }

        let mode = self.modes.restore_previous()?;
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        Ok(DisableReport {
            message: format!(
                "Trusted workstation mode disabled; security mode is now {}",
                mode
            ),
            mode,
            restored_pinentry: restore,
            warnings,
        })
    }

    // ── Verify ───────────────────────────────────────────────────────────────

    /// Unseal the PIN and produce one real signature through the agent.
    pub fn verify(
        &self,
        identity: &str,
        signing_key: Option<&str>,
    ) -> Result<VerifyReport, WorkstationError> {
        self.hsm
            .unseal(identity, |pin| std::str::from_utf8(pin).map(|_| ()))?;

        let mut warnings = Vec::new();
        if self.modes.trusted_identity().as_deref() != Some(identity) {
            warnings.push(format!(
                "trusted workstation mode is not enabled for '{}'; the agent may prompt",
                identity
            ));
        }
        if self.agent.pinentry_program()?.as_deref() != Some(self.helper_program().as_str()) {
            warnings.push("signing agent pinentry does not point at pinseal-pinentry".to_string());
        }

        self.agent.test_sign(signing_key)?;
        Ok(VerifyReport {
            message: format!(
                "PIN for '{}' unsealed and a test signature succeeded",
                identity
            ),
            warnings,
        })
    }

    // ── Status ───────────────────────────────────────────────────────────────

    pub fn status(&self, identity: &str) -> TrustedWorkstationStatus {
        let pinentry_program = self.agent.pinentry_program().unwrap_or_else(|e| {
            tracing::debug!("Could not read agent pinentry: {}", e);
            None
        });
        let agent_wired = pinentry_program.as_deref() == Some(self.helper_program().as_str());
        let token = self.token.probe();
        let token_info = match token {
            TokenProbe::Reachable => self.token.info().map_err(|e| {
                tracing::debug!("Token info unavailable: {}", e);
            }).ok(),
            _ => None,
        };
        let settings = self.modes.settings().load();

        TrustedWorkstationStatus {
            identity: identity.to_string(),
            mode: settings.default_security_mode,
            trusted_identity: settings.trusted_identity,
            hsm_method: self.hsm.method(),
            hsm_available: self.hsm.available(),
            pin_stored: self.hsm.exists(identity),
            agent_present: self.agent.is_present(),
            pinentry_program,
            agent_wired,
            token,
            token_info,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::hsm::fallback::mock::{test_kdf, MockKeyProvider};
    use crate::hsm::{BlobStore, HsmError, KeychainBackend, MasterKeyProvider};
    use crate::mode::{SettingsStore, SETTINGS_FILE};

    const HELPER: &str = "/opt/pinseal/bin/pinseal-pinentry";
    const ORIGINAL: &str = "/usr/bin/pinentry-gnome3";

    #[derive(Default)]
    struct AgentState {
        absent: bool,
        pinentry: Option<String>,
        fail_reload: bool,
        fail_sign: bool,
        reloads: usize,
        signatures: usize,
    }

    #[derive(Clone, Default)]
    struct FakeAgent(Arc<Mutex<AgentState>>);

    impl FakeAgent {
        fn with_pinentry(program: &str) -> Self {
            let agent = Self::default();
            agent.0.lock().unwrap().pinentry = Some(program.to_string());
            agent
        }

        fn state(&self) -> std::sync::MutexGuard<'_, AgentState> {
            self.0.lock().unwrap()
        }
    }

    impl SigningAgent for FakeAgent {
        fn is_present(&self) -> bool {
            !self.state().absent
        }
        fn pinentry_program(&self) -> Result<Option<String>, WorkstationError> {
            Ok(self.state().pinentry.clone())
        }
        fn set_pinentry_program(&self, program: Option<&str>) -> Result<(), WorkstationError> {
            self.state().pinentry = program.map(str::to_string);
            Ok(())
        }
        fn reload(&self) -> Result<(), WorkstationError> {
            let mut state = self.state();
            if state.fail_reload {
                return Err(WorkstationError::Agent("agent not running".to_string()));
            }
            state.reloads += 1;
            Ok(())
        }
        fn test_sign(&self, _key: Option<&str>) -> Result<(), WorkstationError> {
            let mut state = self.state();
            if state.fail_sign {
                return Err(WorkstationError::Verify("no secret key".to_string()));
            }
            state.signatures += 1;
            Ok(())
        }
    }

    struct TokenState {
        probe: TokenProbe,
        fail_policy: bool,
        pin_policy: Option<PinPolicy>,
        touch: Option<(KeySlot, TouchPolicy)>,
    }

    #[derive(Clone)]
    struct FakeToken(Arc<Mutex<TokenState>>);

    impl FakeToken {
        fn new(probe: TokenProbe) -> Self {
            Self(Arc::new(Mutex::new(TokenState {
                probe,
                fail_policy: false,
                pin_policy: None,
                touch: None,
            })))
        }
    }

    impl TokenPolicy for FakeToken {
        fn probe(&self) -> TokenProbe {
            self.0.lock().unwrap().probe
        }
        fn info(&self) -> Result<TokenInfo, WorkstationError> {
            Ok(TokenInfo {
                openpgp_version: Some("3.4".to_string()),
                ..TokenInfo::default()
            })
        }
        fn set_signature_pin_policy(&self, policy: PinPolicy) -> Result<(), WorkstationError> {
            let mut state = self.0.lock().unwrap();
            if state.fail_policy {
                return Err(WorkstationError::Token("admin PIN required".to_string()));
            }
            state.pin_policy = Some(policy);
            Ok(())
        }
        fn set_touch_policy(&self, slot: KeySlot, policy: TouchPolicy) -> Result<(), WorkstationError> {
            let mut state = self.0.lock().unwrap();
            if state.fail_policy {
                return Err(WorkstationError::Token("admin PIN required".to_string()));
            }
            state.touch = Some((slot, policy));
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        provider: MockKeyProvider,
        agent: FakeAgent,
        token: FakeToken,
    }

    impl Fixture {
        fn new(agent: FakeAgent, token: FakeToken) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                provider: MockKeyProvider::new(),
                agent,
                token,
            }
        }

        fn orchestrator(&self) -> Orchestrator {
            let hsm = Hsm::new(
                Box::new(KeychainBackend::new(
                    Box::new(self.provider.clone()),
                    test_kdf(),
                )),
                BlobStore::new(self.dir.path().join("sealed")),
            );
            let modes = SecurityModeMachine::new(SettingsStore::new(
                self.dir.path().join(SETTINGS_FILE),
            ));
            Orchestrator::new(
                hsm,
                modes,
                Box::new(self.agent.clone()),
                Box::new(self.token.clone()),
                PathBuf::from(HELPER),
            )
        }
    }

    fn pin() -> SecretBytes {
        SecretBytes::from("123456")
    }

    #[test]
    fn test_enable_fully_wires_the_chain() {
        let fx = Fixture::new(
            FakeAgent::with_pinentry(ORIGINAL),
            FakeToken::new(TokenProbe::Reachable),
        );
        let orch = fx.orchestrator();

        let report = orch.enable("work", &pin()).unwrap();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report.message.contains("enabled for 'work'"));

        assert!(orch.hsm().exists("work"));
        assert_eq!(fx.agent.state().pinentry.as_deref(), Some(HELPER));
        assert_eq!(fx.agent.state().reloads, 1);
        assert_eq!(orch.modes().current(), SecurityMode::TrustedWorkstation);
        assert_eq!(orch.modes().trusted_identity().as_deref(), Some("work"));

        let token = fx.token.0.lock().unwrap();
        assert_eq!(token.pin_policy, Some(PinPolicy::Once));
        assert_eq!(token.touch, Some((KeySlot::Signature, TouchPolicy::Cached)));
        drop(token);

        assert!(orch.status("work").fully_wired());
    }

    #[test]
    fn test_missing_agent_is_refused_before_any_change() {
        let agent = FakeAgent::default();
        agent.state().absent = true;
        let fx = Fixture::new(agent, FakeToken::new(TokenProbe::NotApplicable));
        let orch = fx.orchestrator();

        let err = orch.enable("work", &pin()).unwrap_err();
        assert!(matches!(err, WorkstationError::PrerequisitesUnmet(_)));
        assert!(!orch.hsm().exists("work"), "Nothing may be sealed when prerequisites fail");
        assert_eq!(orch.modes().current(), SecurityMode::MaximumSecurity);
        assert!(!fx.dir.path().join(SETTINGS_FILE).exists());
    }

    #[test]
    fn test_required_token_must_be_connected() {
        let fx = Fixture::new(
            FakeAgent::default(),
            FakeToken::new(TokenProbe::Unreachable),
        );
        let orch = fx.orchestrator().require_token(true);
        match orch.enable("work", &pin()) {
            Err(WorkstationError::PrerequisitesUnmet(missing)) => {
                assert_eq!(missing, vec!["hardware token not connected".to_string()])
            }
            other => panic!("expected unmet prerequisites, got {:?}", other.map(|r| r.message)),
        }
    }

    #[test]
    fn test_invalid_pin_is_rejected_up_front() {
        let fx = Fixture::new(FakeAgent::default(), FakeToken::new(TokenProbe::NotApplicable));
        let orch = fx.orchestrator();
        let err = orch
            .enable("work", &SecretBytes::new(vec![b'1'; 257]))
            .unwrap_err();
        assert!(matches!(err, WorkstationError::Hsm(HsmError::InvalidIdentity(_))));
        assert_eq!(fx.agent.state().pinentry, None);
    }

    #[test]
    fn test_agent_failure_is_partial_and_mode_unchanged() {
        let agent = FakeAgent::with_pinentry(ORIGINAL);
        agent.state().fail_reload = true;
        let fx = Fixture::new(agent, FakeToken::new(TokenProbe::NotApplicable));
        let orch = fx.orchestrator();

        let err = orch.enable("work", &pin()).unwrap_err();
        assert!(matches!(err, WorkstationError::Partial(_)));
        assert!(orch.hsm().exists("work"), "The seal step had completed");
        assert_eq!(
            orch.modes().current(),
            SecurityMode::MaximumSecurity,
            "The mode must never flip while the chain is incomplete"
        );
        assert!(!orch.status("work").fully_wired());
    }

    #[test]
    fn test_token_policy_failure_is_only_a_warning() {
        let token = FakeToken::new(TokenProbe::Reachable);
        token.0.lock().unwrap().fail_policy = true;
        let fx = Fixture::new(FakeAgent::default(), token);
        let orch = fx.orchestrator();

        let report = orch.enable("work", &pin()).unwrap();
        assert_eq!(report.warnings.len(), 2);
        assert!(report.message.contains("2 warning(s)"));
        assert_eq!(orch.modes().current(), SecurityMode::TrustedWorkstation);
    }

    #[test]
    fn test_disable_restores_captured_pinentry_and_keeps_secret() {
        let fx = Fixture::new(
            FakeAgent::with_pinentry(ORIGINAL),
            FakeToken::new(TokenProbe::NotApplicable),
        );
        let orch = fx.orchestrator();
        orch.modes()
            .transition(SecurityMode::DeveloperWorkflow, None, orch.hsm())
            .unwrap();

        orch.enable("work", &pin()).unwrap();
        // A second enable must not capture our own helper as the original
        orch.enable("work", &pin()).unwrap();

        let report = orch.disable("work").unwrap();
        assert_eq!(report.restored_pinentry, Some(Some(ORIGINAL.to_string())));
        assert_eq!(report.mode, SecurityMode::DeveloperWorkflow);
        assert_eq!(fx.agent.state().pinentry.as_deref(), Some(ORIGINAL));
        assert_eq!(orch.modes().current(), SecurityMode::DeveloperWorkflow);
        assert!(orch.hsm().exists("work"), "Disable must not clear the sealed PIN");
    }

    #[test]
    fn test_disable_restores_agent_default() {
        let fx = Fixture::new(FakeAgent::default(), FakeToken::new(TokenProbe::NotApplicable));
        let orch = fx.orchestrator();
        orch.enable("work", &pin()).unwrap();

        let report = orch.disable("work").unwrap();
        assert_eq!(report.restored_pinentry, Some(None));
        assert_eq!(fx.agent.state().pinentry, None);
        assert_eq!(orch.modes().current(), SecurityMode::MaximumSecurity);
    }

    #[test]
    fn test_disable_without_enable_touches_nothing() {
        let fx = Fixture::new(
            FakeAgent::with_pinentry(ORIGINAL),
            FakeToken::new(TokenProbe::NotApplicable),
        );
        let orch = fx.orchestrator();
        let report = orch.disable("work").unwrap();
        assert_eq!(report.restored_pinentry, None);
        assert_eq!(fx.agent.state().pinentry.as_deref(), Some(ORIGINAL));
        assert_eq!(fx.agent.state().reloads, 0);
    }

    #[test]
    fn test_verify_exercises_unseal_and_signature() {
        let fx = Fixture::new(FakeAgent::default(), FakeToken::new(TokenProbe::NotApplicable));
        let orch = fx.orchestrator();

        assert!(matches!(
            orch.verify("work", None),
            Err(WorkstationError::Hsm(HsmError::NotFound(_)))
        ));

        orch.enable("work", &pin()).unwrap();
        let report = orch.verify("work", Some("ABCD1234")).unwrap();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(fx.agent.state().signatures, 1);

        fx.agent.state().fail_sign = true;
        assert!(matches!(
            orch.verify("work", None),
            Err(WorkstationError::Verify(_))
        ));
    }

    #[test]
    fn test_verify_rejects_non_text_pin() {
        let fx = Fixture::new(FakeAgent::default(), FakeToken::new(TokenProbe::NotApplicable));
        let orch = fx.orchestrator();
        orch.hsm().seal("work", &[0xff, 0xfe]).unwrap();
        assert!(matches!(
            orch.verify("work", None),
            Err(WorkstationError::Hsm(HsmError::Internal(_)))
        ));
        assert_eq!(fx.agent.state().signatures, 0);
    }

    #[test]
    fn test_status_is_read_only() {
        let fx = Fixture::new(
            FakeAgent::with_pinentry(ORIGINAL),
            FakeToken::new(TokenProbe::Reachable),
        );
        let orch = fx.orchestrator();

        let status = orch.status("work");
        assert!(!status.pin_stored);
        assert!(!status.agent_wired);
        assert_eq!(status.mode, SecurityMode::MaximumSecurity);
        assert_eq!(
            status.token_info.and_then(|i| i.openpgp_version).as_deref(),
            Some("3.4")
        );
        assert!(!fx.dir.path().join(SETTINGS_FILE).exists());
        assert!(!fx.provider.has_master_secret().unwrap());
        assert_eq!(fx.agent.state().pinentry.as_deref(), Some(ORIGINAL));
    }
}
