// Pinseal — Workstation orchestration errors

use std::io;

use thiserror::Error;

use crate::hsm::HsmError;
use crate::mode::ModeError;

#[derive(Debug, Error)]
pub enum WorkstationError {
    /// Reported before anything was changed.
    #[error("Prerequisites not met: {}", .0.join("; "))]
    PrerequisitesUnmet(Vec<String>),

    /// Some steps ran; the security mode was left as it was.
    #[error("Partially wired: {0}")]
    Partial(String),

    #[error("Signing agent error: {0}")]
    Agent(String),

    #[error("Hardware token error: {0}")]
    Token(String),

    #[error("Verification failed: {0}")]
    Verify(String),

    #[error(transparent)]
    Hsm(#[from] HsmError),

    #[error(transparent)]
    Mode(#[from] ModeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
