// Pinseal — Pinentry helper entry point
//
// Started by gpg-agent with the Assuan conversation on stdin/stdout.
// Command-line arguments (`--display`, `--ttyname`, ...) are ignored;
// the agent repeats them as OPTION lines. Logs go to stderr only.

use std::io;

use pinseal::config::Config;
use pinseal::hsm::Hsm;
use pinseal::mode::{SecurityModeMachine, SettingsStore};
use pinseal::pinentry::{
    ExternalPinentry, KeyDirectory, PinSource, PinentryServer, TrustedPin, Untrusted,
};

fn run() -> pinseal::Result<()> {
    let config = Config::load()?;
    let modes = SecurityModeMachine::new(SettingsStore::new(config.settings_path()));
    let captured = modes
        .settings()
        .load()
        .captured_pinentry
        .and_then(|c| c.program);
    let delegate = ExternalPinentry::resolve(config.fallback_pinentry.as_deref(), captured.as_deref());

    let source: Box<dyn PinSource> = match Hsm::open(&config) {
        Ok(hsm) => Box::new(TrustedPin::new(hsm, modes, KeyDirectory::from_config(&config))),
        Err(e) => {
            tracing::warn!("HSM unavailable, every request will be prompted: {}", e);
            Box::new(Untrusted)
        }
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    PinentryServer::new(source.as_ref(), &delegate).serve(stdin.lock(), stdout.lock())?;
    Ok(())
}

fn main() {
    pinseal::init_logging();

    if let Err(e) = run() {
        eprintln!("Error: {}", e.diagnostic());
        std::process::exit(e.exit_code());
    }
}
