// Pinseal — CLI Module
//
// Command-line interface using clap derive macros.
// Subcommands: status, init, pin, unseal-pin, mode, workstation, tpm, enclave.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};

pub use commands::{execute, parse_pcr_mask};

/// Pinseal — hardware-sealed PINs for hardware tokens.
#[derive(Parser, Debug)]
#[command(name = "pinseal")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the active HSM backend and security mode.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Create the backend key material (idempotent).
    Init,

    /// Store, inspect and remove sealed PINs.
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },

    /// Print the sealed PIN for an identity on stdout, and nothing else.
    UnsealPin {
        identity: String,
    },

    /// Show or change the security mode.
    Mode {
        #[command(subcommand)]
        action: Option<ModeAction>,
    },

    /// Trusted workstation mode: seal the PIN and wire the signing agent.
    Workstation {
        #[command(subcommand)]
        action: WorkstationAction,
    },

    /// TPM-specific settings.
    Tpm {
        #[command(subcommand)]
        action: TpmAction,
    },

    /// Secure Enclave-specific settings.
    Enclave {
        #[command(subcommand)]
        action: EnclaveAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum PinAction {
    /// Seal a PIN. Read from stdin when --pin is omitted.
    Store {
        identity: String,
        /// The PIN. Prefer stdin to keep it out of shell history.
        #[arg(long)]
        pin: Option<String>,
    },

    /// Report whether a PIN is stored (never decrypts it).
    Status {
        identity: String,
    },

    /// Remove the sealed PIN for one identity.
    Clear {
        identity: String,
    },

    /// Remove every sealed PIN.
    ClearAll,

    /// List identities with a sealed PIN.
    List,
}

#[derive(Subcommand, Debug)]
pub enum ModeAction {
    /// Print the current mode (the default when no action is given).
    Get,

    /// Switch mode. trusted_workstation needs --identity and a sealed PIN.
    Set {
        /// maximum_security, developer_workflow or trusted_workstation.
        mode: String,
        #[arg(long)]
        identity: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkstationAction {
    /// Seal the PIN, point gpg-agent at pinseal-pinentry and switch mode.
    Enable {
        identity: String,
        /// The PIN. Read from stdin when omitted.
        #[arg(long)]
        pin: Option<String>,
        /// Fail unless a hardware token is connected.
        #[arg(long)]
        require_token: bool,
    },

    /// Restore the previous pinentry and security mode. The PIN stays sealed.
    Disable {
        identity: String,
    },

    /// Unseal the PIN and make one test signature.
    Verify {
        identity: String,
        /// Signing key to use; defaults to the configured key for the identity.
        #[arg(long)]
        key: Option<String>,
    },

    /// Report how far the trusted workstation chain is wired.
    Status {
        identity: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum TpmAction {
    /// Bind future seals to a PCR mask (e.g. 0x80 for PCR 7).
    SetPcr {
        mask: String,
    },

    /// Print the current values of the bound PCRs.
    Pcrs,
}

#[derive(Subcommand, Debug)]
pub enum EnclaveAction {
    /// Require biometrics for future seals.
    Biometric {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}
