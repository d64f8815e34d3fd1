// Pinseal — Assuan line helpers
//
// Percent escaping for `D` lines and the prompt state a pinentry accumulates
// between GETPIN requests.

use zeroize::Zeroizing;

/// `gpg-error` source 5 (pinentry) with GPG_ERR_CANCELED.
pub const ERR_CANCELLED: &str = "ERR 83886179 Operation cancelled";
/// GPG_ERR_NOT_CONFIRMED.
pub const ERR_NOT_CONFIRMED: &str = "ERR 83886194 Not confirmed";
/// GPG_ERR_NO_PIN_ENTRY.
pub const ERR_NO_PINENTRY: &str = "ERR 83886165 No pinentry";

/// Escape `%`, CR and LF so `data` fits on one `D` line.
pub fn escape(data: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(data.len()));
    for &b in data {
        match b {
            b'%' => out.extend_from_slice(b"%25"),
            b'\r' => out.extend_from_slice(b"%0D"),
            b'\n' => out.extend_from_slice(b"%0A"),
            _ => out.push(b),
        }
    }
    out
}

/// Decode `%XX` sequences. Malformed sequences are kept literally.
pub fn unescape(data: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(data.len()));
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'%' && i + 2 < data.len() {
            let hex = [data[i + 1], data[i + 2]];
            if let Some(byte) = std::str::from_utf8(&hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Everything the agent told us before asking for a PIN. Values are kept
/// exactly as received (still escaped) so they can be replayed verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptState {
    pub options: Vec<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub error: Option<String>,
    pub ok: Option<String>,
    pub cancel: Option<String>,
    pub not_ok: Option<String>,
    pub timeout: Option<u32>,
    pub keyinfo: Option<String>,
    pub repeat: Option<String>,
}

impl PromptState {
    /// Commands that reproduce this state on another pinentry.
    pub fn replay(&self) -> Vec<String> {
        let mut commands: Vec<String> =
            self.options.iter().map(|o| format!("OPTION {}", o)).collect();
        let fields = [
            ("SETTITLE", &self.title),
            ("SETDESC", &self.description),
            ("SETPROMPT", &self.prompt),
            ("SETERROR", &self.error),
            ("SETOK", &self.ok),
            ("SETCANCEL", &self.cancel),
            ("SETNOTOK", &self.not_ok),
            ("SETKEYINFO", &self.keyinfo),
        ];
        for (command, value) in fields {
            if let Some(value) = value {
                commands.push(format!("{} {}", command, value));
            }
        }
        if let Some(timeout) = self.timeout {
            commands.push(format!("SETTIMEOUT {}", timeout));
        }
        commands
    }

    /// Keygrip named by SETKEYINFO: `n/GRIP`, `s/SERIALNO/GRIP` or a bare grip.
    pub fn keygrip(&self) -> Option<String> {
        let info = self.keyinfo.as_deref()?.trim();
        let grip = info.rsplit('/').next()?;
        (grip.len() == KEYGRIP_LEN && is_hex(grip)).then(|| grip.to_ascii_uppercase())
    }

    /// Key ID mentioned in the description ("key 8547785CA25F0AA8",
    /// "0xA25F0AA8"). Long IDs win over short ones.
    pub fn key_id(&self) -> Option<String> {
        let description = unescape(self.description.as_deref()?.as_bytes());
        let text = String::from_utf8_lossy(&description);
        let words: Vec<&str> = text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .map(|w| {
                w.strip_prefix("0x")
                    .or_else(|| w.strip_prefix("0X"))
                    .unwrap_or(w)
            })
            .filter(|w| is_hex(w))
            .collect();
        [16, 8]
            .iter()
            .find_map(|&len| words.iter().find(|w| w.len() == len))
            .map(|w| w.to_ascii_uppercase())
    }
}

const KEYGRIP_LEN: usize = 40;

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
