// Pinseal — Signing agent collaborator
//
// The orchestrator only needs to read and replace the agent's pinentry
// program, reload it, and run one real signature. `GpgAgent` does this for
// gpg-agent through `gpg-agent.conf` and `gpgconf`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::WorkstationError;
use crate::fsutil;

const AGENT_CONF: &str = "gpg-agent.conf";
const PINENTRY_KEY: &str = "pinentry-program";
const VERIFY_PAYLOAD: &[u8] = b"pinseal trusted workstation verification\n";

pub trait SigningAgent {
    /// Agent installed and its socket resolvable.
    fn is_present(&self) -> bool;

    /// Configured pinentry program, `None` when the agent default applies.
    fn pinentry_program(&self) -> Result<Option<String>, WorkstationError>;

    /// Replace (or with `None`, remove) the pinentry program setting.
    fn set_pinentry_program(&self, program: Option<&str>) -> Result<(), WorkstationError>;

    fn reload(&self) -> Result<(), WorkstationError>;

    /// Produce one real signature, optionally with a specific key.
    fn test_sign(&self, key: Option<&str>) -> Result<(), WorkstationError>;
}

/// Last `pinentry-program` line of an agent config.
pub fn parse_pinentry_program(conf: &str) -> Option<String> {
    conf.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| {
            let (key, value) = l.split_once(char::is_whitespace)?;
            (key == PINENTRY_KEY).then(|| value.trim().to_string())
        })
        .filter(|v| !v.is_empty())
        .last()
}

/// `conf` with every `pinentry-program` line removed and, when given, one
/// new line appended. Other lines and comments are kept in order.
pub fn rewrite_pinentry_program(conf: &str, program: Option<&str>) -> String {
    let mut out: String = conf
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with('#') || t.split_whitespace().next() != Some(PINENTRY_KEY)
        })
        .map(|l| format!("{}\n", l))
        .collect();
    if let Some(program) = program {
        out.push_str(&format!("{} {}\n", PINENTRY_KEY, program));
    }
    out
}

pub struct GpgAgent {
    home: PathBuf,
    explicit_home: bool,
}

impl GpgAgent {
    /// Agent for `$GNUPGHOME`, defaulting to `~/.gnupg`.
    pub fn new() -> Self {
        match std::env::var_os("GNUPGHOME") {
            Some(home) => Self {
                home: PathBuf::from(home),
                explicit_home: true,
            },
            None => Self {
                home: dirs_next::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".gnupg"),
                explicit_home: false,
            },
        }
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            explicit_home: true,
        }
    }

    pub fn conf_path(&self) -> PathBuf {
        self.home.join(AGENT_CONF)
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        if self.explicit_home {
            cmd.env("GNUPGHOME", &self.home);
        }
        cmd
    }

    fn read_conf(&self) -> Result<String, WorkstationError> {
        match fs::read_to_string(self.conf_path()) {
            Ok(conf) => Ok(conf),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for GpgAgent {
    fn default() -> Self {
        Self::new()
    }
}

fn run_checked(cmd: &mut Command, what: &str) -> Result<(), WorkstationError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| WorkstationError::Agent(format!("{}: {}", what, e)))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(WorkstationError::Agent(format!(
            "{} failed: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl SigningAgent for GpgAgent {
    fn is_present(&self) -> bool {
        self.command("gpgconf")
            .args(["--list-dirs", "agent-socket"])
            .stdin(Stdio::null())
            .output()
            .map(|o| o.status.success() && !o.stdout.is_empty())
            .unwrap_or(false)
    }

    fn pinentry_program(&self) -> Result<Option<String>, WorkstationError> {
        Ok(parse_pinentry_program(&self.read_conf()?))
    }

    fn set_pinentry_program(&self, program: Option<&str>) -> Result<(), WorkstationError> {
        let updated = rewrite_pinentry_program(&self.read_conf()?, program);
        fsutil::ensure_private_dir(&self.home)?;
        fsutil::atomic_write(&self.conf_path(), updated.as_bytes())?;
        tracing::info!(
            "{} {} in {}",
            PINENTRY_KEY,
            program.unwrap_or("(agent default)"),
            self.conf_path().display()
        );
        Ok(())
    }

    fn reload(&self) -> Result<(), WorkstationError> {
        run_checked(
            self.command("gpgconf").args(["--reload", "gpg-agent"]),
            "gpgconf --reload gpg-agent",
        )
    }

    fn test_sign(&self, key: Option<&str>) -> Result<(), WorkstationError> {
        let mut cmd = self.command("gpg");
        cmd.args(["--batch", "--clearsign"]);
        if let Some(key) = key {
            cmd.args(["--local-user", key]);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkstationError::Verify(format!("gpg: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(VERIFY_PAYLOAD)?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(WorkstationError::Verify(format!(
                "gpg --clearsign failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Sibling `pinseal-pinentry` of the running executable.
pub fn default_helper_path() -> Result<PathBuf, WorkstationError> {
    let exe = std::env::current_exe()?;
    Ok(helper_beside(&exe))
}

fn helper_beside(exe: &Path) -> PathBuf {
    exe.with_file_name(format!("pinseal-pinentry{}", std::env::consts::EXE_SUFFIX))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
