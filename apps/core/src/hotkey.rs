use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HotkeyParseError {
    #[error("hotkey must include at least one modifier and one key")]
    MissingParts,
    #[error("unsupported modifier '{0}'; use Ctrl, Alt, Shift or Win")]
    UnsupportedModifier(String),
    #[error("key must be A-Z, 0-9, Space, or F1-F24 (got '{0}')")]
    UnsupportedKey(String),
    #[error("'{0}' is reserved by the operating system")]
    Reserved(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Win,
}

impl Modifier {
    fn label(self) -> &'static str {
        match self {
            Self::Ctrl => "Ctrl",
            Self::Alt => "Alt",
            Self::Shift => "Shift",
            Self::Win => "Win",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hotkey {
    pub modifiers: BTreeSet<Modifier>,
    pub key: String,
}

impl Hotkey {
    pub fn has(&self, modifier: Modifier) -> bool {
        self.modifiers.contains(&modifier)
    }
}

impl fmt::Display for Hotkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for modifier in &self.modifiers {
            write!(f, "{}+", modifier.label())?;
        }
        f.write_str(&self.key)
    }
}

/// Parses and canonicalizes a chord such as `ctrl+shift+space` into `Ctrl+Shift+Space`.
pub fn parse_hotkey(input: &str) -> Result<Hotkey, HotkeyParseError> {
    let parts: Vec<&str> = input
        .split('+')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.len() < 2 {
        return Err(HotkeyParseError::MissingParts);
    }

    let key = normalize_key(parts[parts.len() - 1])?;
    let mut modifiers = BTreeSet::new();
    for part in &parts[..parts.len() - 1] {
        modifiers.insert(normalize_modifier(part)?);
    }

    let hotkey = Hotkey { modifiers, key };
    let canonical = hotkey.to_string();
    if is_reserved_hotkey(&canonical) {
        return Err(HotkeyParseError::Reserved(canonical));
    }
    Ok(hotkey)
}

fn normalize_modifier(input: &str) -> Result<Modifier, HotkeyParseError> {
    match input.to_ascii_lowercase().as_str() {
        "ctrl" | "control" => Ok(Modifier::Ctrl),
        "alt" | "option" => Ok(Modifier::Alt),
        "shift" => Ok(Modifier::Shift),
        "win" | "meta" | "super" | "cmd" | "command" => Ok(Modifier::Win),
        _ => Err(HotkeyParseError::UnsupportedModifier(input.to_string())),
    }
}

fn normalize_key(input: &str) -> Result<String, HotkeyParseError> {
    let upper = input.to_ascii_uppercase();
    if upper == "SPACE" {
        return Ok("Space".to_string());
    }

    if let Some(number) = upper.strip_prefix('F') {
        if let Ok(parsed) = number.parse::<u8>() {
            if (1..=24).contains(&parsed) {
                return Ok(format!("F{parsed}"));
            }
        }
    }

    let mut chars = upper.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_alphanumeric() {
            return Ok(upper);
        }
    }

    Err(HotkeyParseError::UnsupportedKey(input.to_string()))
}

fn is_reserved_hotkey(canonical: &str) -> bool {
    matches!(
        canonical,
        "Alt+F4" | "Alt+Space" | "Win+L" | "Win+D" | "Win+Space"
    )
}
