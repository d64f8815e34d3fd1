// Pinseal — Application settings
//
// `settings.json` holds the global security mode plus the bookkeeping the
// workstation orchestrator needs to undo itself. Keys this crate does not
// know about are preserved on rewrite.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ModeError, SecurityMode};
use crate::fsutil::{self, StoreLock};

pub const SETTINGS_FILE: &str = "settings.json";

/// Pinentry configuration seen before the first enable.
/// `program: None` means the agent used its built-in default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPinentry {
    pub program: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub default_security_mode: SecurityMode,

    /// Identity whose sealed PIN the pinentry helper releases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_identity: Option<String>,

    /// Mode to return to when trusted workstation mode is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_security_mode: Option<SecurityMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_pinentry: Option<CapturedPinentry>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Current settings. Missing or unreadable files yield defaults.
    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable settings {}: {}",
                    self.path.display(),
                    e
                );
                Settings::default()
            }
        }
    }

    fn try_load(&self) -> Result<Settings, ModeError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write under an exclusive lock. An unreadable file is an
    /// error and is left untouched.
    pub fn update<T>(
        &self,
        change: impl FnOnce(&mut Settings) -> T,
    ) -> Result<T, ModeError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let _lock = StoreLock::exclusive(&self.lock_path())?;
        let mut settings = self.try_load()?;
        let out = change(&mut settings);
        let json = serde_json::to_vec_pretty(&settings)?;
        fsutil::atomic_write(&self.path, &json)?;
        Ok(out)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
