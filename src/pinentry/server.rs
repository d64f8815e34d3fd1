// Pinseal — Pinentry Assuan server
//
// Speaks the subset of the pinentry protocol gpg-agent uses. GETPIN is
// answered from the sealed store when trusted workstation mode allows it,
// and by the fallback pinentry otherwise.

use std::io::{self, BufRead, Write};

use super::assuan::{self, PromptState, ERR_CANCELLED, ERR_NOT_CONFIRMED, ERR_NO_PINENTRY};
use super::fallback::Delegate;
use super::{PinSource, PinentryError};

const GREETING: &str = "OK Pleased to meet you, I am pinseal-pinentry";

enum Flow {
    Continue,
    Close,
}

pub struct PinentryServer<'a> {
    source: &'a dyn PinSource,
    delegate: &'a dyn Delegate,
    state: PromptState,
}

impl<'a> PinentryServer<'a> {
    pub fn new(source: &'a dyn PinSource, delegate: &'a dyn Delegate) -> Self {
        Self {
            source,
            delegate,
            state: PromptState::default(),
        }
    }

    /// Serve one agent connection until BYE or end of input.
    pub fn serve<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> Result<(), PinentryError> {
        writeln!(output, "{}", GREETING)?;
        output.flush()?;

        for line in input.lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let flow = self.handle(line, &mut output)?;
            output.flush()?;
            if let Flow::Close = flow {
                break;
            }
        }
        Ok(())
    }

    fn handle<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow, PinentryError> {
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, Some(arg.to_string())),
            None => (line, None),
        };
        let command = command.to_ascii_uppercase();

        match command.as_str() {
            "SETDESC" => self.state.description = arg,
            "SETPROMPT" => self.state.prompt = arg,
            "SETTITLE" => self.state.title = arg,
            "SETERROR" => self.state.error = arg,
            "SETOK" => self.state.ok = arg,
            "SETCANCEL" => self.state.cancel = arg,
            "SETNOTOK" => self.state.not_ok = arg,
            "SETKEYINFO" => self.state.keyinfo = arg,
            "SETREPEAT" => self.state.repeat = Some(arg.unwrap_or_default()),
            "SETTIMEOUT" => self.state.timeout = arg.and_then(|a| a.trim().parse().ok()),
            "OPTION" => {
                if let Some(option) = arg {
                    self.state.options.push(option);
                }
            }
            "SETQUALITYBAR" | "SETQUALITYBAR_TT" | "SETGENPIN" | "SETGENPIN_TT"
            | "CLEARPASSPHRASE" | "NOP" | "CANCEL" => {}
            "RESET" => self.state = PromptState::default(),
            "GETINFO" => return self.getinfo(arg.as_deref().unwrap_or(""), out),
            "GETPIN" => {
                self.getpin(out)?;
                return Ok(Flow::Continue);
            }
            "CONFIRM" => {
                match self.delegate.confirm(&self.state) {
                    Ok(true) => writeln!(out, "OK")?,
                    Ok(false) => writeln!(out, "{}", ERR_NOT_CONFIRMED)?,
                    Err(e) => {
                        tracing::warn!("CONFIRM not delegated: {}", e);
                        writeln!(out, "{}", ERR_NO_PINENTRY)?;
                    }
                }
                return Ok(Flow::Continue);
            }
            "MESSAGE" => {
                if let Err(e) = self.delegate.message(&self.state) {
                    tracing::warn!("MESSAGE not delegated: {}", e);
                }
            }
            "BYE" => {
                writeln!(out, "OK closing connection")?;
                return Ok(Flow::Close);
            }
            _ => {
                writeln!(out, "ERR 275 Unknown IPC command: {}", command)?;
                return Ok(Flow::Continue);
            }
        }
        writeln!(out, "OK")?;
        Ok(Flow::Continue)
    }

    fn getinfo<W: Write>(&self, what: &str, out: &mut W) -> Result<Flow, PinentryError> {
        let value = match what.trim() {
            "pid" => std::process::id().to_string(),
            "version" => env!("CARGO_PKG_VERSION").to_string(),
            "flavor" => "pinseal".to_string(),
            "ttyinfo" => "- - -".to_string(),
            _ => {
                writeln!(out, "ERR 275 Unknown GETINFO option")?;
                return Ok(Flow::Continue);
            }
        };
        writeln!(out, "D {}", value)?;
        writeln!(out, "OK")?;
        Ok(Flow::Continue)
    }

    fn getpin<W: Write>(&mut self, out: &mut W) -> Result<(), PinentryError> {
        let released = self
            .source
            .release(&self.state, &mut |pin: &[u8]| write_data(&mut *out, pin));
        let answered = match released {
            Ok(()) => true,
            Err(PinentryError::Io(e)) => return Err(PinentryError::Io(e)),
            Err(PinentryError::NotTrusted) => {
                tracing::debug!("Not in trusted workstation mode; prompting");
                self.prompt(out)?
            }
            Err(PinentryError::UnknownKey) => {
                tracing::debug!("Key is not the trusted identity's; prompting");
                self.prompt(out)?
            }
            Err(e) => {
                tracing::warn!("Sealed PIN unavailable, prompting instead: {}", e);
                self.prompt(out)?
            }
        };
        // SETERROR applies to a single prompt
        self.state.error = None;

        if answered {
            writeln!(out, "OK")?;
        } else {
            writeln!(out, "{}", ERR_CANCELLED)?;
        }
        Ok(())
    }

    /// Ask the fallback pinentry. `false` when the user cancelled or no
    /// pinentry could be run.
    fn prompt<W: Write>(&self, out: &mut W) -> Result<bool, PinentryError> {
        let pin = self.delegate.get_pin(&self.state).unwrap_or_else(|e| {
            tracing::warn!("Fallback pinentry failed: {}", e);
            None
        });
        match pin {
            Some(pin) => {
                write_data(out, pin.as_bytes())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// `D` line for `pin`; an empty PIN is sent as no data at all.
fn write_data<W: Write>(out: &mut W, pin: &[u8]) -> io::Result<()> {
    if !pin.is_empty() {
        out.write_all(b"D ")?;
        out.write_all(&assuan::escape(pin))?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
