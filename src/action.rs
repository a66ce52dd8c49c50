//! Token to action resolution.
//!
//! Mapping-file tokens come in three families, tried in order: the four hat
//! tokens, gamepad button names (`BTN_*` plus a handful of single-letter
//! aliases), and keyboard key names with pattern and numeric fallbacks.
//! Resolution is pure; an unknown token is reported as a [`TokenError`] and
//! the caller decides whether to skip the record.

use evdev::Key;
use thiserror::Error;

/// Which virtual device an action is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Gamepad,
    Keyboard,
}

/// One of the four hat switch directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HatDirection {
    Up,
    Down,
    Left,
    Right,
}

/// The effect of a resolved token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Moves one direction of the shared gamepad hat.
    Hat(HatDirection),
    /// Presses/releases an EV_KEY code on the given device.
    KeyPress { device: DeviceKind, key: Key },
}

/// Immutable description of what a mapped input does.
///
/// Built once at startup from mapping resolution and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    /// Original token, kept for diagnostics.
    pub token: String,
}

impl Action {
    pub fn new(kind: ActionKind, token: impl Into<String>) -> Self {
        Self {
            kind,
            token: token.into(),
        }
    }
}

/// Errors from token resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("empty token")]
    Empty,

    #[error("unknown token: {0}")]
    Unknown(String),
}

/// Gamepad buttons supported by name.
pub const BUTTON_TABLE: &[(&str, Key)] = &[
    ("BTN_SOUTH", Key::BTN_SOUTH),
    ("BTN_EAST", Key::BTN_EAST),
    ("BTN_NORTH", Key::BTN_NORTH),
    ("BTN_WEST", Key::BTN_WEST),
    ("BTN_TL", Key::BTN_TL),
    ("BTN_TR", Key::BTN_TR),
    ("BTN_TL2", Key::BTN_TL2),
    ("BTN_TR2", Key::BTN_TR2),
    ("BTN_SELECT", Key::BTN_SELECT),
    ("BTN_START", Key::BTN_START),
    ("BTN_MODE", Key::BTN_MODE),
    ("BTN_THUMBL", Key::BTN_THUMBL),
    ("BTN_THUMBR", Key::BTN_THUMBR),
    ("BTN_DPAD_UP", Key::BTN_DPAD_UP),
    ("BTN_DPAD_DOWN", Key::BTN_DPAD_DOWN),
    ("BTN_DPAD_LEFT", Key::BTN_DPAD_LEFT),
    ("BTN_DPAD_RIGHT", Key::BTN_DPAD_RIGHT),
    // BTN_GAMEPAD is the kernel alias for BTN_SOUTH (0x130).
    ("BTN_GAMEPAD", Key::BTN_SOUTH),
];

/// Keyboard keys supported by name (patterns below cover the rest).
pub const KEY_TABLE: &[(&str, Key)] = &[
    ("KEY_ENTER", Key::KEY_ENTER),
    ("KEY_ESC", Key::KEY_ESC),
    ("KEY_TAB", Key::KEY_TAB),
    ("KEY_SPACE", Key::KEY_SPACE),
    ("KEY_BACKSPACE", Key::KEY_BACKSPACE),
    ("KEY_LEFTCTRL", Key::KEY_LEFTCTRL),
    ("KEY_RIGHTCTRL", Key::KEY_RIGHTCTRL),
    ("KEY_LEFTSHIFT", Key::KEY_LEFTSHIFT),
    ("KEY_RIGHTSHIFT", Key::KEY_RIGHTSHIFT),
    ("KEY_LEFTALT", Key::KEY_LEFTALT),
    ("KEY_RIGHTALT", Key::KEY_RIGHTALT),
    ("KEY_LEFTMETA", Key::KEY_LEFTMETA),
    ("KEY_RIGHTMETA", Key::KEY_RIGHTMETA),
    ("KEY_CAPSLOCK", Key::KEY_CAPSLOCK),
    ("KEY_UP", Key::KEY_UP),
    ("KEY_DOWN", Key::KEY_DOWN),
    ("KEY_LEFT", Key::KEY_LEFT),
    ("KEY_RIGHT", Key::KEY_RIGHT),
    ("KEY_HOME", Key::KEY_HOME),
    ("KEY_END", Key::KEY_END),
    ("KEY_PAGEUP", Key::KEY_PAGEUP),
    ("KEY_PAGEDOWN", Key::KEY_PAGEDOWN),
    ("KEY_INSERT", Key::KEY_INSERT),
    ("KEY_DELETE", Key::KEY_DELETE),
    ("KEY_MINUS", Key::KEY_MINUS),
    ("KEY_EQUAL", Key::KEY_EQUAL),
    ("KEY_LEFTBRACE", Key::KEY_LEFTBRACE),
    ("KEY_RIGHTBRACE", Key::KEY_RIGHTBRACE),
    ("KEY_BACKSLASH", Key::KEY_BACKSLASH),
    ("KEY_SEMICOLON", Key::KEY_SEMICOLON),
    ("KEY_APOSTROPHE", Key::KEY_APOSTROPHE),
    ("KEY_GRAVE", Key::KEY_GRAVE),
    ("KEY_COMMA", Key::KEY_COMMA),
    ("KEY_DOT", Key::KEY_DOT),
    ("KEY_SLASH", Key::KEY_SLASH),
    ("KEY_SYSRQ", Key::KEY_SYSRQ),
    ("KEY_PAUSE", Key::KEY_PAUSE),
    ("KEY_SCROLLLOCK", Key::KEY_SCROLLLOCK),
    ("KEY_NUMLOCK", Key::KEY_NUMLOCK),
    ("KEY_PRINT", Key::KEY_PRINT),
    ("KEY_VOLUMEUP", Key::KEY_VOLUMEUP),
    ("KEY_VOLUMEDOWN", Key::KEY_VOLUMEDOWN),
    ("KEY_MUTE", Key::KEY_MUTE),
    ("KEY_PLAYPAUSE", Key::KEY_PLAYPAUSE),
    ("KEY_NEXTSONG", Key::KEY_NEXTSONG),
    ("KEY_PREVIOUSSONG", Key::KEY_PREVIOUSSONG),
    ("KEY_STOPCD", Key::KEY_STOPCD),
];

/// `KEY_A`..`KEY_Z` in alphabetical order.
pub(crate) const LETTER_KEYS: [Key; 26] = [
    Key::KEY_A,
    Key::KEY_B,
    Key::KEY_C,
    Key::KEY_D,
    Key::KEY_E,
    Key::KEY_F,
    Key::KEY_G,
    Key::KEY_H,
    Key::KEY_I,
    Key::KEY_J,
    Key::KEY_K,
    Key::KEY_L,
    Key::KEY_M,
    Key::KEY_N,
    Key::KEY_O,
    Key::KEY_P,
    Key::KEY_Q,
    Key::KEY_R,
    Key::KEY_S,
    Key::KEY_T,
    Key::KEY_U,
    Key::KEY_V,
    Key::KEY_W,
    Key::KEY_X,
    Key::KEY_Y,
    Key::KEY_Z,
];

/// `KEY_0`..`KEY_9`, indexed by digit value.
pub(crate) const DIGIT_KEYS: [Key; 10] = [
    Key::KEY_0,
    Key::KEY_1,
    Key::KEY_2,
    Key::KEY_3,
    Key::KEY_4,
    Key::KEY_5,
    Key::KEY_6,
    Key::KEY_7,
    Key::KEY_8,
    Key::KEY_9,
];

/// `KEY_F1`..`KEY_F24`.
pub(crate) const FUNCTION_KEYS: [Key; 24] = [
    Key::KEY_F1,
    Key::KEY_F2,
    Key::KEY_F3,
    Key::KEY_F4,
    Key::KEY_F5,
    Key::KEY_F6,
    Key::KEY_F7,
    Key::KEY_F8,
    Key::KEY_F9,
    Key::KEY_F10,
    Key::KEY_F11,
    Key::KEY_F12,
    Key::KEY_F13,
    Key::KEY_F14,
    Key::KEY_F15,
    Key::KEY_F16,
    Key::KEY_F17,
    Key::KEY_F18,
    Key::KEY_F19,
    Key::KEY_F20,
    Key::KEY_F21,
    Key::KEY_F22,
    Key::KEY_F23,
    Key::KEY_F24,
];

/// `KEY_KP0`..`KEY_KP9`, indexed by digit value.
pub(crate) const KEYPAD_KEYS: [Key; 10] = [
    Key::KEY_KP0,
    Key::KEY_KP1,
    Key::KEY_KP2,
    Key::KEY_KP3,
    Key::KEY_KP4,
    Key::KEY_KP5,
    Key::KEY_KP6,
    Key::KEY_KP7,
    Key::KEY_KP8,
    Key::KEY_KP9,
];

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn table_lookup(table: &[(&str, Key)], token: &str) -> Option<Key> {
    table
        .iter()
        .find(|(name, _)| *name == token)
        .map(|&(_, key)| key)
}

/// Resolve a button token (already trimmed and upper-cased).
///
/// A bare numeric token is a raw EV_KEY code routed to the gamepad.
fn resolve_button(token: &str) -> Option<Key> {
    if is_all_digits(token) {
        return token.parse::<u16>().ok().map(Key::new);
    }

    // Sugar aliases for the common face buttons.
    let token = match token {
        "A" => "BTN_SOUTH",
        "B" => "BTN_EAST",
        "X" => "BTN_WEST",
        "Y" => "BTN_NORTH",
        "START" => "BTN_START",
        "SELECT" => "BTN_SELECT",
        other => other,
    };

    table_lookup(BUTTON_TABLE, token)
}

/// Resolve a keyboard token (already trimmed and upper-cased).
///
/// Handles aliases, single letters/digits, the named-key table, the
/// `KEY_A..Z`/`KEY_0..9`/`KEY_F1..F24`/`KEY_KP0..KP9` patterns, and a bare
/// numeric fallback meaning a raw EV_KEY code.
fn resolve_key(token: &str) -> Option<Key> {
    if is_all_digits(token) {
        return token.parse::<u16>().ok().map(Key::new);
    }

    let token = match token {
        "ENTER" => "KEY_ENTER",
        "ESC" => "KEY_ESC",
        "SPACE" => "KEY_SPACE",
        "TAB" => "KEY_TAB",
        "BACKSPACE" => "KEY_BACKSPACE",
        "UP" => "KEY_UP",
        "DOWN" => "KEY_DOWN",
        "LEFT" => "KEY_LEFT",
        "RIGHT" => "KEY_RIGHT",
        other => other,
    };

    let bytes = token.as_bytes();
    if bytes.len() == 1 {
        if bytes[0].is_ascii_uppercase() {
            return Some(LETTER_KEYS[(bytes[0] - b'A') as usize]);
        }
        if bytes[0].is_ascii_digit() {
            return Some(DIGIT_KEYS[(bytes[0] - b'0') as usize]);
        }
    }

    if let Some(key) = table_lookup(KEY_TABLE, token) {
        return Some(key);
    }

    if let Some(tail) = token.strip_prefix("KEY_") {
        let tail_bytes = tail.as_bytes();
        if tail_bytes.len() == 1 {
            if tail_bytes[0].is_ascii_uppercase() {
                return Some(LETTER_KEYS[(tail_bytes[0] - b'A') as usize]);
            }
            if tail_bytes[0].is_ascii_digit() {
                return Some(DIGIT_KEYS[(tail_bytes[0] - b'0') as usize]);
            }
        }

        // KEY_F1..KEY_F24
        if let Some(digits) = tail.strip_prefix('F') {
            if is_all_digits(digits) {
                if let Ok(f @ 1..=24) = digits.parse::<usize>() {
                    return Some(FUNCTION_KEYS[f - 1]);
                }
            }
        }

        // KEY_KP0..KEY_KP9
        if let Some(digit) = tail.strip_prefix("KP") {
            if digit.len() == 1 && digit.as_bytes()[0].is_ascii_digit() {
                return Some(KEYPAD_KEYS[(digit.as_bytes()[0] - b'0') as usize]);
            }
        }
    }

    None
}

/// Resolve a free-form mapping token into an [`Action`].
pub fn resolve(token: &str) -> Result<Action, TokenError> {
    let normalized = token.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return Err(TokenError::Empty);
    }

    let hat = match normalized.as_str() {
        "HAT_UP" => Some(HatDirection::Up),
        "HAT_DOWN" => Some(HatDirection::Down),
        "HAT_LEFT" => Some(HatDirection::Left),
        "HAT_RIGHT" => Some(HatDirection::Right),
        _ => None,
    };
    if let Some(dir) = hat {
        return Ok(Action::new(ActionKind::Hat(dir), normalized));
    }

    let buttonish = normalized.starts_with("BTN_")
        || matches!(normalized.as_str(), "A" | "B" | "X" | "Y" | "START" | "SELECT");
    if buttonish {
        return resolve_button(&normalized)
            .map(|key| {
                Action::new(
                    ActionKind::KeyPress {
                        device: DeviceKind::Gamepad,
                        key,
                    },
                    normalized.clone(),
                )
            })
            .ok_or(TokenError::Unknown(normalized));
    }

    // Everything else is a keyboard token (names, aliases, numeric raw code).
    resolve_key(&normalized)
        .map(|key| {
            Action::new(
                ActionKind::KeyPress {
                    device: DeviceKind::Keyboard,
                    key,
                },
                normalized.clone(),
            )
        })
        .ok_or(TokenError::Unknown(normalized))
}

/// Print every recognized mapping target and token to stdout.
///
/// Backs the `--list-options` discovery mode; the process exits afterwards
/// without starting the event loop.
pub fn print_token_catalog() {
    println!("Mapping targets (first column in map file):");
    println!("  <line_offset>    -> numeric GPIO line offset (e.g. 17)");
    println!("  D2 .. D13        -> peripheral digital pins (when --i2c-bus is used)");
    println!("  I2C:D2 .. D13    -> explicit peripheral notation; same as bare D#");
    println!();
    println!("HAT (gamepad hat switch):");
    println!("  HAT_UP, HAT_DOWN, HAT_LEFT, HAT_RIGHT");
    println!();
    println!("BTN_* (gamepad buttons supported by name):");
    for (name, _) in BUTTON_TABLE {
        println!("  {name}");
    }
    println!();
    println!("KEY_* (keyboard keys supported by name):");
    for (name, _) in KEY_TABLE {
        println!("  {name}");
    }
    println!();
    println!("KEY_* patterns supported:");
    println!("  KEY_A .. KEY_Z");
    println!("  KEY_0 .. KEY_9");
    println!("  KEY_F1 .. KEY_F24");
    println!("  KEY_KP0 .. KEY_KP9");
    println!();
    println!("Aliases (keyboard):");
    println!("  A..Z, 0..9, ENTER, ESC, SPACE, TAB, BACKSPACE, UP, DOWN, LEFT, RIGHT");
    println!();
    println!("Numeric raw code (keyboard by default):");
    println!("  e.g. 28   (sends EV_KEY code 28 on the keyboard device)");
}
