// Pinseal — Security mode errors

use std::io;

use thiserror::Error;

use super::{Prerequisite, SecurityMode};

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("Refusing to switch to {target}: {}", describe(.missing))]
    Refused {
        target: SecurityMode,
        missing: Vec<Prerequisite>,
    },

    #[error("Unknown security mode '{0}'")]
    UnknownMode(String),

    #[error("Settings I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Settings encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

fn describe(missing: &[Prerequisite]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
