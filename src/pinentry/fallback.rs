// Pinseal — Fallback pinentry
//
// When no sealed PIN may be released, the request is replayed to an
// ordinary interactive pinentry and its answer relayed back to the agent.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::assuan::{self, PromptState};
use super::PinentryError;
use crate::hsm::SecretBytes;

const CANDIDATES: &[&str] = &[
    "/usr/local/bin/pinentry-mac",
    "/opt/homebrew/bin/pinentry-mac",
    "/usr/bin/pinentry-gnome3",
    "/usr/bin/pinentry-qt",
    "/usr/bin/pinentry-gtk-2",
    "/usr/bin/pinentry-curses",
    "/usr/bin/pinentry-tty",
    "/usr/bin/pinentry",
];

/// Interactive side of the helper.
pub trait Delegate {
    /// `None` when the user cancelled.
    fn get_pin(&self, state: &PromptState) -> Result<Option<SecretBytes>, PinentryError>;
    fn confirm(&self, state: &PromptState) -> Result<bool, PinentryError>;
    fn message(&self, state: &PromptState) -> Result<(), PinentryError>;
}

/// Final answer of the fallback to one request.
#[derive(Debug)]
pub enum Reply {
    Ok(Option<SecretBytes>),
    Err(String),
}

/// Replay `state` and send `command` over an established connection.
pub fn converse<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
    state: &PromptState,
    command: &str,
) -> Result<Reply, PinentryError> {
    match read_reply(&mut reader)? {
        Reply::Ok(_) => {}
        Reply::Err(e) => {
            return Err(PinentryError::Protocol(format!("fallback refused connection: {}", e)))
        }
    }

    for line in state.replay() {
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        if let Reply::Err(e) = read_reply(&mut reader)? {
            tracing::debug!("Fallback pinentry rejected '{}': {}", line, e);
        }
    }

    writeln!(writer, "{}", command)?;
    writer.flush()?;
    let reply = read_reply(&mut reader)?;

    if writeln!(writer, "BYE").and_then(|_| writer.flush()).is_err() {
        tracing::debug!("Fallback pinentry closed before BYE");
    }
    Ok(reply)
}

fn read_reply<R: BufRead>(reader: &mut R) -> Result<Reply, PinentryError> {
    let mut data: Option<SecretBytes> = None;
    loop {
        let mut line = zeroize::Zeroizing::new(String::new());
        if reader.read_line(&mut line)? == 0 {
            return Err(PinentryError::Protocol(
                "fallback pinentry closed the connection".to_string(),
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "OK" || line.starts_with("OK ") {
            return Ok(Reply::Ok(data));
        }
        if let Some(error) = line.strip_prefix("ERR ") {
            return Ok(Reply::Err(error.to_string()));
        }
        if let Some(payload) = line.strip_prefix("D ") {
            let mut bytes = data.take().map(|d| d.as_bytes().to_vec()).unwrap_or_default();
            bytes.extend_from_slice(&assuan::unescape(payload.as_bytes()));
            data = Some(SecretBytes::new(bytes));
        }
        // Status (`S`) and comment lines are ignored
    }
}

/// A pinentry program started once per request.
#[derive(Debug, Clone)]
pub struct ExternalPinentry {
    program: Option<PathBuf>,
}

impl ExternalPinentry {
    pub fn new(program: Option<PathBuf>) -> Self {
        Self { program }
    }

    /// Pick the program to delegate to: the configured one, else the
    /// pinentry the agent used before pinseal took over, else the first
    /// installed well-known pinentry.
    pub fn resolve(configured: Option<&Path>, captured: Option<&str>) -> Self {
        let program = configured
            .map(Path::to_path_buf)
            .or_else(|| {
                captured
                    .map(PathBuf::from)
                    .filter(|p| !is_pinseal_helper(p))
            })
            .or_else(|| {
                CANDIDATES
                    .iter()
                    .map(PathBuf::from)
                    .find(|p| p.is_file())
            });
        match &program {
            Some(p) => tracing::debug!("Fallback pinentry: {}", p.display()),
            None => tracing::warn!("No fallback pinentry program found"),
        }
        Self { program }
    }

    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    fn run(&self, state: &PromptState, command: &str) -> Result<Reply, PinentryError> {
        let program = self.program.as_ref().ok_or(PinentryError::NoFallback)?;
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| PinentryError::Spawn {
                program: program.display().to_string(),
                source,
            })?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(PinentryError::Protocol("fallback pipes unavailable".to_string())),
        };
        let reply = converse(BufReader::new(stdout), stdin, state, command);
        if let Err(e) = child.wait() {
            tracing::debug!("Waiting for fallback pinentry: {}", e);
        }
        reply
    }
}

fn is_pinseal_helper(path: &Path) -> bool {
    path.file_stem()
        .map(|s| s.to_string_lossy() == "pinseal-pinentry")
        .unwrap_or(false)
}

impl Delegate for ExternalPinentry {
    fn get_pin(&self, state: &PromptState) -> Result<Option<SecretBytes>, PinentryError> {
        match self.run(state, "GETPIN")? {
            Reply::Ok(pin) => Ok(Some(pin.unwrap_or_else(|| SecretBytes::new(Vec::new())))),
            Reply::Err(e) => {
                tracing::debug!("Fallback GETPIN ended with: {}", e);
                Ok(None)
            }
        }
    }

    fn confirm(&self, state: &PromptState) -> Result<bool, PinentryError> {
        Ok(matches!(self.run(state, "CONFIRM")?, Reply::Ok(_)))
    }

    fn message(&self, state: &PromptState) -> Result<(), PinentryError> {
        self.run(state, "MESSAGE").map(|_| ())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn state() -> PromptState {
        PromptState {
            title: Some("Unlock card".to_string()),
            prompt: Some("PIN".to_string()),
            ..PromptState::default()
        }
    }

    #[test]
    fn test_converse_replays_state_and_relays_pin() {
        let responses = "OK Pleased to meet you\nOK\nOK\nS PINENTRY_LAUNCHED 42\nD 12%2534\nOK\nOK closing connection\n";
        let mut sent = Vec::new();
        let reply = converse(Cursor::new(responses), &mut sent, &state(), "GETPIN").unwrap();

        match reply {
            Reply::Ok(Some(pin)) => assert_eq!(pin.as_bytes(), b"12%34"),
            other => panic!("expected a PIN, got {:?}", other),
        }
        assert_eq!(
            String::from_utf8(sent).unwrap(),
            "SETTITLE Unlock card\nSETPROMPT PIN\nGETPIN\nBYE\n"
        );
    }

    #[test]
    fn test_converse_reports_cancellation() {
        let responses = "OK hi\nERR 83886179 Operation cancelled <Pinentry>\n";
        let reply = converse(
            Cursor::new(responses),
            Vec::new(),
            &PromptState::default(),
            "GETPIN",
        )
        .unwrap();
        assert!(matches!(reply, Reply::Err(ref e) if e.starts_with("83886179")));
    }

    #[test]
    fn test_converse_detects_early_hangup() {
        let err = converse(Cursor::new("OK hi\n"), Vec::new(), &PromptState::default(), "GETPIN")
            .unwrap_err();
        assert!(matches!(err, PinentryError::Protocol(_)));
    }

    #[test]
    fn test_resolve_prefers_configured_then_captured() {
        let configured = ExternalPinentry::resolve(
            Some(Path::new("/opt/custom/pinentry")),
            Some("/usr/bin/pinentry-curses"),
        );
        assert_eq!(configured.program(), Some(Path::new("/opt/custom/pinentry")));

        let captured = ExternalPinentry::resolve(None, Some("/usr/bin/pinentry-curses"));
        assert_eq!(captured.program(), Some(Path::new("/usr/bin/pinentry-curses")));

        let looped = ExternalPinentry::resolve(None, Some("/usr/local/bin/pinseal-pinentry"));
        assert_ne!(
            looped.program(),
            Some(Path::new("/usr/local/bin/pinseal-pinentry")),
            "The helper must never delegate to itself"
        );
    }

    #[test]
    fn test_missing_program_is_reported() {
        let pinentry = ExternalPinentry::new(None);
        assert!(matches!(
            pinentry.get_pin(&PromptState::default()),
            Err(PinentryError::NoFallback)
        ));
        let pinentry = ExternalPinentry::new(Some(PathBuf::from("/nonexistent/pinseal-test/pinentry")));
        assert!(matches!(
            pinentry.confirm(&PromptState::default()),
            Err(PinentryError::Spawn { .. })
        ));
    }
}
