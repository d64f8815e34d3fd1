// Pinseal — CLI Command Handlers
//
// Each function handles one CLI subcommand. They open the HSM facade from
// the loaded configuration and coordinate it with the security mode machine
// and, for `workstation`, the orchestrator.

use std::io::{self, BufRead, IsTerminal, Write};

use zeroize::Zeroizing;

use crate::config::Config;
use crate::error::{PinsealError, Result};
use crate::hsm::{Hsm, SecretBytes};
use crate::mode::{SecurityMode, SecurityModeMachine, SettingsStore};
use crate::workstation::{default_helper_path, GpgAgent, Orchestrator, TokenProbe, Ykman};

use super::{Commands, EnclaveAction, ModeAction, PinAction, TpmAction, Toggle, WorkstationAction};

/// Execute the parsed CLI command.
pub fn execute(command: Commands) -> Result<()> {
    let config = Config::load()?;
    match command {
        Commands::Status { json } => cmd_status(&config, json),
        Commands::Init => cmd_init(&config),
        Commands::Pin { action } => match action {
            PinAction::Store { identity, pin } => cmd_pin_store(&config, &identity, pin),
            PinAction::Status { identity } => cmd_pin_status(&config, &identity),
            PinAction::Clear { identity } => cmd_pin_clear(&config, &identity),
            PinAction::ClearAll => cmd_pin_clear_all(&config),
            PinAction::List => cmd_pin_list(&config),
        },
        Commands::UnsealPin { identity } => cmd_unseal_pin(&config, &identity),
        Commands::Mode { action } => match action.unwrap_or(ModeAction::Get) {
            ModeAction::Get => cmd_mode_get(&config),
            ModeAction::Set { mode, identity } => cmd_mode_set(&config, &mode, identity.as_deref()),
        },
        Commands::Workstation { action } => match action {
            WorkstationAction::Enable {
                identity,
                pin,
                require_token,
            } => cmd_workstation_enable(&config, &identity, pin, require_token),
            WorkstationAction::Disable { identity } => cmd_workstation_disable(&config, &identity),
            WorkstationAction::Verify { identity, key } => {
                cmd_workstation_verify(&config, &identity, key)
            }
            WorkstationAction::Status { identity, json } => {
                cmd_workstation_status(&config, &identity, json)
            }
        },
        Commands::Tpm { action } => match action {
            TpmAction::SetPcr { mask } => cmd_tpm_set_pcr(&config, &mask),
            TpmAction::Pcrs => cmd_tpm_pcrs(&config),
        },
        Commands::Enclave { action } => match action {
            EnclaveAction::Biometric { state } => cmd_enclave_biometric(&config, state),
        },
    }
}

fn modes(config: &Config) -> SecurityModeMachine {
    SecurityModeMachine::new(SettingsStore::new(config.settings_path()))
}

/// Take the PIN from the flag, else one line of stdin.
fn read_pin(flag: Option<String>) -> Result<SecretBytes> {
    if let Some(pin) = flag {
        return Ok(SecretBytes::from(pin));
    }
    let stdin = io::stdin();
    if stdin.is_terminal() {
        eprint!("PIN: ");
        io::stderr().flush()?;
    }
    let mut line = Zeroizing::new(String::new());
    stdin.lock().read_line(&mut line)?;
    let pin = line.trim_end_matches(['\r', '\n']);
    Ok(SecretBytes::from(pin))
}

/// `0x80`, `0b10000000` or `128`.
pub fn parse_pcr_mask(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(bin) = raw.strip_prefix("0b") {
        u32::from_str_radix(bin, 2)
    } else {
        raw.parse()
    };
    parsed.map_err(|e| PinsealError::Other(format!("Invalid PCR mask '{}': {}", raw, e)))
}

// ─── Status / Init ───────────────────────────────────────────────────────────

fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let hsm = Hsm::open(config)?;
    let status = hsm.status();
    let mode = modes(config).current();

    if json {
        let value = serde_json::json!({
            "hsm": status,
            "securityMode": mode,
            "storedIdentities": hsm.list_identities()?,
        });
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| PinsealError::Other(format!("Failed to encode status: {}", e)))?;
        println!("{}", text);
        return Ok(());
    }

    println!("HSM:            {} ({})", status.method.display_name(), status.description);
    println!("Available:      {}", if status.available { "yes" } else { "no" });
    println!("Version:        {}", status.version);
    if let Some(tpm) = &status.tpm {
        println!(
            "TPM:            manufacturer {}, primary key {}, PCR mask {}",
            tpm.manufacturer.as_deref().unwrap_or("unknown"),
            if tpm.has_primary_key { "present" } else { "absent" },
            tpm.pcr_mask
        );
    }
    if let Some(se) = &status.secure_enclave {
        println!(
            "Secure Enclave: key {}, biometrics {}, required {}",
            if se.key_exists { "present" } else { "absent" },
            if se.biometric_available { "available" } else { "unavailable" },
            if se.require_biometric { "yes" } else { "no" }
        );
    }
    println!("Security mode:  {} ({})", mode, mode.description());
    Ok(())
}

fn cmd_init(config: &Config) -> Result<()> {
    let hsm = Hsm::open(config)?;
    hsm.initialize()?;
    println!("✓ HSM initialized ({})", hsm.method().display_name());
    Ok(())
}

// ─── PIN storage ─────────────────────────────────────────────────────────────

fn cmd_pin_store(config: &Config, identity: &str, pin: Option<String>) -> Result<()> {
    let hsm = Hsm::open(config)?;
    let pin = read_pin(pin)?;
    hsm.seal(identity, pin.as_bytes())?;
    println!("✓ PIN stored for '{}' ({})", identity, hsm.method().display_name());
    Ok(())
}

fn cmd_pin_status(config: &Config, identity: &str) -> Result<()> {
    let hsm = Hsm::open(config)?;
    if hsm.exists(identity) {
        println!("PIN stored for '{}' ({})", identity, hsm.method().display_name());
    } else {
        println!("No PIN stored for '{}'", identity);
    }
    Ok(())
}

fn cmd_pin_clear(config: &Config, identity: &str) -> Result<()> {
    Hsm::open(config)?.clear(identity)?;
    println!("✓ PIN cleared for '{}'", identity);
    Ok(())
}

fn cmd_pin_clear_all(config: &Config) -> Result<()> {
    let removed = Hsm::open(config)?.clear_all()?;
    println!("✓ Cleared {} sealed PIN(s)", removed);
    Ok(())
}

fn cmd_pin_list(config: &Config) -> Result<()> {
    let identities = Hsm::open(config)?.list_identities()?;
    if identities.is_empty() {
        println!("No PINs stored. Use `pinseal pin store <identity>` to add one.");
        return Ok(());
    }
    for identity in identities {
        println!("{}", identity);
    }
    Ok(())
}

fn cmd_unseal_pin(config: &Config, identity: &str) -> Result<()> {
    let hsm = Hsm::open(config)?;
    hsm.unseal(identity, |pin| {
        let mut out = io::stdout().lock();
        out.write_all(pin)?;
        out.write_all(b"\n")?;
        out.flush()
    })?;
    Ok(())
}

// ─── Security mode ───────────────────────────────────────────────────────────

fn cmd_mode_get(config: &Config) -> Result<()> {
    let modes = modes(config);
    let current = modes.current();
    for mode in SecurityMode::ALL {
        let marker = if mode == current { "*" } else { " " };
        println!("{} {:<20} {}", marker, mode.as_str(), mode.description());
    }
    if let Some(identity) = modes.trusted_identity() {
        println!("\nTrusted identity: {}", identity);
    }
    Ok(())
}

fn cmd_mode_set(config: &Config, mode: &str, identity: Option<&str>) -> Result<()> {
    let target: SecurityMode = mode.parse()?;
    let hsm = Hsm::open(config)?;
    let previous = modes(config).transition(target, identity, &hsm)?;
    println!("✓ Security mode: {} -> {}", previous, target);
    if target == SecurityMode::TrustedWorkstation {
        println!("  Use `pinseal workstation enable` to also wire the signing agent.");
    }
    Ok(())
}

// ─── Trusted workstation ─────────────────────────────────────────────────────

fn orchestrator(config: &Config, require_token: bool) -> Result<Orchestrator> {
    let hsm = Hsm::open(config)?;
    Ok(Orchestrator::new(
        hsm,
        modes(config),
        Box::new(GpgAgent::new()),
        Box::new(Ykman::new()),
        default_helper_path()?,
    )
    .require_token(require_token || config.require_token))
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("  ! {}", warning);
    }
}

fn cmd_workstation_enable(
    config: &Config,
    identity: &str,
    pin: Option<String>,
    require_token: bool,
) -> Result<()> {
    let orchestrator = orchestrator(config, require_token)?;
    let pin = read_pin(pin)?;
    let mut report = orchestrator.enable(identity, &pin)?;
    if !config.keygrips.contains_key(identity) && config.signing_key(identity).is_none() {
        report.warnings.push(format!(
            "no keygrips or signing key configured for '{}'; pinseal-pinentry will keep prompting",
            identity
        ));
    }
    println!("✓ {}", report.message);
    print_warnings(&report.warnings);
    Ok(())
}

fn cmd_workstation_disable(config: &Config, identity: &str) -> Result<()> {
    let report = orchestrator(config, false)?.disable(identity)?;
    println!("✓ {}", report.message);
    match &report.restored_pinentry {
        Some(Some(program)) => println!("  pinentry-program restored to {}", program),
        Some(None) => println!("  pinentry-program reset to the agent default"),
        None => {}
    }
    print_warnings(&report.warnings);
    Ok(())
}

fn cmd_workstation_verify(config: &Config, identity: &str, key: Option<String>) -> Result<()> {
    let key = key.or_else(|| config.signing_key(identity).map(str::to_string));
    let report = orchestrator(config, false)?.verify(identity, key.as_deref())?;
    println!("✓ {}", report.message);
    print_warnings(&report.warnings);
    Ok(())
}

fn cmd_workstation_status(config: &Config, identity: &str, json: bool) -> Result<()> {
    let status = orchestrator(config, false)?.status(identity);

    if json {
        let text = serde_json::to_string_pretty(&status)
            .map_err(|e| PinsealError::Other(format!("Failed to encode status: {}", e)))?;
        println!("{}", text);
        return Ok(());
    }

    let check = |ok: bool| if ok { "✓" } else { "✗" };
    println!("Trusted workstation status for '{}'", identity);
    println!("{:-<60}", "");
    println!(
        "{} HSM             {}",
        check(status.hsm_available),
        status.hsm_method.display_name()
    );
    println!("{} PIN sealed", check(status.pin_stored));
    println!("{} Signing agent   gpg-agent", check(status.agent_present));
    println!(
        "{} Pinentry        {}",
        check(status.agent_wired),
        status.pinentry_program.as_deref().unwrap_or("(agent default)")
    );
    let token = match status.token {
        TokenProbe::Reachable => "connected",
        TokenProbe::Unreachable => "not connected",
        TokenProbe::NotApplicable => "no token tooling",
    };
    println!(
        "{} Hardware token  {}",
        check(status.token != TokenProbe::Unreachable),
        token
    );
    if let Some(info) = &status.token_info {
        if let Some(policy) = &info.signature_pin_policy {
            println!("    signature PIN policy: {}", policy);
        }
        if let Some(policy) = &info.signature_touch_policy {
            println!("    signature touch policy: {}", policy);
        }
    }
    println!(
        "{} Security mode   {}",
        check(status.mode == SecurityMode::TrustedWorkstation),
        status.mode
    );
    println!();
    if status.fully_wired() {
        println!("Trusted workstation mode is fully wired.");
    } else {
        println!("Trusted workstation mode is not fully wired.");
    }
    Ok(())
}

// ─── Backend-specific ────────────────────────────────────────────────────────

fn cmd_tpm_set_pcr(config: &Config, mask: &str) -> Result<()> {
    let mask = Hsm::open(config)?.set_pcr_binding(parse_pcr_mask(mask)?)?;
    println!("✓ Future seals bind to PCR mask {}", mask);
    println!("  Existing PINs keep their mask; re-store them to rebind.");
    Ok(())
}

fn cmd_tpm_pcrs(config: &Config) -> Result<()> {
    for (index, value) in Hsm::open(config)?.read_pcrs()? {
        println!("PCR[{:>2}] {}", index, hex::encode(value));
    }
    Ok(())
}

fn cmd_enclave_biometric(config: &Config, state: Toggle) -> Result<()> {
    let required = state == Toggle::On;
    Hsm::open(config)?.set_biometric(required)?;
    println!(
        "✓ Biometric authentication {} for future seals",
        if required { "required" } else { "not required" }
    );
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
