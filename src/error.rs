// Pinseal — Top-level error types
//
// Aggregates the module errors into a single enum for the binaries. The
// exit code follows the HSM taxonomy whenever an HSM error is the cause.

use thiserror::Error;

use crate::config::ConfigError;
use crate::hsm::HsmError;
use crate::mode::ModeError;
use crate::pinentry::PinentryError;
use crate::workstation::WorkstationError;

/// Top-level error type for all Pinseal operations.
#[derive(Debug, Error)]
pub enum PinsealError {
    #[error(transparent)]
    Hsm(#[from] HsmError),

    #[error("Security mode error: {0}")]
    Mode(#[from] ModeError),

    #[error(transparent)]
    Workstation(#[from] WorkstationError),

    #[error("Pinentry error: {0}")]
    Pinentry(#[from] PinentryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PinsealError {
    fn hsm(&self) -> Option<&HsmError> {
        match self {
            PinsealError::Hsm(e)
            | PinsealError::Workstation(WorkstationError::Hsm(e))
            | PinsealError::Pinentry(PinentryError::Hsm(e)) => Some(e),
            _ => None,
        }
    }

    /// Operator-facing text printed after `Error: `.
    pub fn diagnostic(&self) -> String {
        match self.hsm() {
            Some(e) => e.diagnostic(),
            None => self.to_string(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.hsm() {
            Some(e) => i32::from(e.code()),
            None => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, PinsealError>;
