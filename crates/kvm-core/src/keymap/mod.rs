//! Key-name normalization and chord expansion.
//!
//! Operators send friendly key names (`"ctrl"`, `"Delete"`, `"win"`) or a
//! `+`-joined combination (`"ctrl+alt+del"`).  A `+` standing where a key
//! name is expected is the plus key itself, so `"+"` and `"ctrl++"` work.  The remote unit wants one
//! event per key transition, identified by its DOM `KeyboardEvent.code`
//! (`"ControlLeft"`, `"Delete"`, `"MetaLeft"`).
//!
//! # Chord ordering
//!
//! A [`Chord`] presses keys in order (modifiers first) and releases them in
//! exactly the reverse order.  For `ctrl+alt+del` that yields:
//!
//! ```text
//! press ctrl, press alt, press del, release del, release alt, release ctrl
//! ```
//!
//! Releasing in reverse matters: some targets (Windows secure attention,
//! BIOS hotkeys) only recognise the combination when the outermost modifier
//! is held until the very end.

use serde::{Deserialize, Serialize};

/// Combinations that can be sent by name as a single key.
///
/// `win` is a lone key but is listed here because operators send it as a
/// shortcut for the command/meta key.
pub const NAMED_COMBINATIONS: &[(&str, &[&str])] = &[
    ("ctrl+alt+del", &["ctrl", "alt", "del"]),
    ("alt+tab", &["alt", "tab"]),
    ("win", &["cmd"]),
];

/// Maps a friendly key name onto its canonical lowercase form.
///
/// Unknown names are lowercased and returned unchanged.
pub fn normalize_key(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "control" | "controlleft" => "ctrl",
        "delete" => "del",
        "meta" | "super" | "windows" | "win" | "command" => "cmd",
        "option" => "alt",
        "escape" => "esc",
        "return" => "enter",
        "spacebar" | " " => "space",
        "+" | "add" => "plus",
        _ => return lower,
    };
    canonical.to_string()
}

/// Looks up a named combination, e.g. `"ctrl+alt+del"`.
pub fn named_combination(name: &str) -> Option<&'static [&'static str]> {
    let lower = name.trim().to_ascii_lowercase();
    NAMED_COMBINATIONS
        .iter()
        .find(|(n, _)| *n == lower)
        .map(|(_, keys)| *keys)
}

/// One key transition sent to the unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStroke {
    /// Canonical key name (see [`normalize_key`]).
    pub key: String,
    /// `true` for press, `false` for release.
    pub pressed: bool,
}

/// An ordered set of keys held down together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Chord {
    keys: Vec<String>,
}

impl Chord {
    /// Builds a chord from `modifiers` followed by `keys`.
    ///
    /// Every entry may itself be a `+`-joined combination or a name from
    /// [`NAMED_COMBINATIONS`]; those are expanded in place.  Duplicates keep
    /// their first position.
    pub fn build<K, M>(keys: &[K], modifiers: &[M]) -> Self
    where
        K: AsRef<str>,
        M: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        let entries = modifiers
            .iter()
            .map(|m| m.as_ref())
            .chain(keys.iter().map(|k| k.as_ref()));

        for entry in entries {
            for name in expand_entry(entry) {
                if !out.contains(&name) {
                    out.push(name);
                }
            }
        }

        Self { keys: out }
    }

    /// The normalized keys in press order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Press events, in order.
    pub fn presses(&self) -> Vec<KeyStroke> {
        self.keys
            .iter()
            .map(|k| KeyStroke {
                key: k.clone(),
                pressed: true,
            })
            .collect()
    }

    /// Release events, in reverse press order.
    pub fn releases(&self) -> Vec<KeyStroke> {
        self.keys
            .iter()
            .rev()
            .map(|k| KeyStroke {
                key: k.clone(),
                pressed: false,
            })
            .collect()
    }

    /// All presses followed by all releases.
    pub fn events(&self) -> Vec<KeyStroke> {
        let mut events = self.presses();
        events.extend(self.releases());
        events
    }
}

fn expand_entry(entry: &str) -> Vec<String> {
    if let Some(named) = named_combination(entry) {
        return named.iter().map(|k| k.to_string()).collect();
    }
    split_combination(entry)
        .into_iter()
        .filter(|part| !part.trim().is_empty())
        .map(normalize_key)
        .collect()
}

/// Splits `"ctrl+alt+del"` on `+`, reading a leading `+` as a key name.
fn split_combination(entry: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = entry.trim_start();
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('+') {
            parts.push("+");
            // Skip the separator that follows a literal plus.
            rest = tail.strip_prefix('+').unwrap_or(tail).trim_start();
            continue;
        }
        match rest.split_once('+') {
            Some((name, tail)) => {
                parts.push(name);
                rest = tail.trim_start();
            }
            None => {
                parts.push(rest);
                rest = "";
            }
        }
    }
    parts
}

/// Returns the DOM `KeyboardEvent.code` for a canonical key name.
///
/// Names with no mapping (already DOM codes, or exotic keys) are passed
/// through unchanged so the unit can decide.
pub fn dom_code(name: &str) -> String {
    let key = normalize_key(name);

    if key.len() == 1 {
        let c = key.as_bytes()[0];
        if c.is_ascii_lowercase() {
            return format!("Key{}", (c as char).to_ascii_uppercase());
        }
        if c.is_ascii_digit() {
            return format!("Digit{}", c as char);
        }
    }

    if let Some(n) = key.strip_prefix('f') {
        if let Ok(num) = n.parse::<u8>() {
            if (1..=12).contains(&num) {
                return format!("F{num}");
            }
        }
    }

    let code = match key.as_str() {
        "ctrl" => "ControlLeft",
        "alt" => "AltLeft",
        "shift" => "ShiftLeft",
        "cmd" => "MetaLeft",
        "del" => "Delete",
        "tab" => "Tab",
        "enter" => "Enter",
        "esc" => "Escape",
        "space" => "Space",
        "backspace" => "Backspace",
        "insert" => "Insert",
        "home" => "Home",
        "end" => "End",
        "pageup" => "PageUp",
        "pagedown" => "PageDown",
        "up" | "arrowup" => "ArrowUp",
        "down" | "arrowdown" => "ArrowDown",
        "left" | "arrowleft" => "ArrowLeft",
        "right" | "arrowright" => "ArrowRight",
        "capslock" => "CapsLock",
        "printscreen" => "PrintScreen",
        "pause" => "Pause",
        "-" => "Minus",
        "=" => "Equal",
        "plus" => "NumpadAdd",
        "[" => "BracketLeft",
        "]" => "BracketRight",
        ";" => "Semicolon",
        "'" => "Quote",
        "," => "Comma",
        "." => "Period",
        "/" => "Slash",
        "\\" => "Backslash",
        "`" => "Backquote",
        _ => return name.trim().to_string(),
    };
    code.to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
