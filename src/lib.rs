// Pinseal — Library root
//
// Hardware-sealed PIN storage, the security mode state machine, the trusted
// workstation orchestrator and the pinentry helper behind it.

pub mod cli;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod hsm;
pub mod mode;
pub mod pinentry;
pub mod workstation;

pub use error::{PinsealError, Result};

/// Install the stderr-only tracing subscriber used by both binaries.
/// `RUST_LOG=pinseal=debug` enables backend detail; the default `info`
/// level never includes secret values.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pinseal=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
