//! Mapping table: which input drives which action.
//!
//! The table is assembled at startup from (in order) the built-in defaults
//! or a mapping file, a range filter, and auto-assignment of the remaining
//! unmapped GPIO lines. File parsing is tolerant: malformed records are
//! skipped with a warning so one bad line never takes the bridge down.

use std::collections::{HashMap, HashSet};

use evdev::Key;
use tracing::warn;

use crate::action::{
    self, Action, ActionKind, DeviceKind, DIGIT_KEYS, FUNCTION_KEYS, LETTER_KEYS,
};

/// Offset excluded from monitoring and mapping on every chip.
pub const EXCLUDED_OFFSET: u32 = 36;

/// Peripheral digital pins run D2..D13 inclusive.
pub const PIN_MIN: u8 = 2;
pub const PIN_MAX: u8 = 13;

/// What the first column of a mapping record names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapTarget {
    /// A GPIO line offset on the monitored chip.
    Line(u32),
    /// A peripheral digital pin (D2..D13).
    Pin(u8),
}

/// Parse the target column: a bare offset, `D<n>`, `I2C:D<n>` or `I2C:<n>`.
pub fn parse_target(field: &str) -> Option<MapTarget> {
    let field = field.trim().to_ascii_uppercase();

    let (is_i2c, pin_part) = match field.strip_prefix("I2C:") {
        Some(rest) => (true, rest.trim()),
        None => (false, field.as_str()),
    };

    if let Some(stripped) = pin_part.strip_prefix('D') {
        return parse_pin(stripped);
    }
    if is_i2c {
        return parse_pin(pin_part);
    }

    field.parse::<u32>().ok().map(MapTarget::Line)
}

fn parse_pin(digits: &str) -> Option<MapTarget> {
    let pin: u8 = digits.parse().ok()?;
    (PIN_MIN..=PIN_MAX).contains(&pin).then_some(MapTarget::Pin(pin))
}

/// How unmapped lines in the monitored range get actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AutoMode {
    /// Assign gamepad buttons (BTN_SOUTH, BTN_EAST, ...).
    Buttons,
    /// Assign keyboard keys (letters, digits, function keys).
    Keys,
    /// Leave unmapped lines unmapped.
    None,
}

/// Complete input-to-action table for one run.
#[derive(Debug, Default, Clone)]
pub struct MappingTable {
    pub lines: HashMap<u32, Action>,
    pub pins: HashMap<u8, Action>,
}

impl MappingTable {
    /// Built-in table used when no mapping file is given.
    pub fn default_table() -> Self {
        let mut table = Self::default();
        let defaults: [(u32, &str); 5] = [
            (15, "HAT_UP"),
            (18, "HAT_DOWN"),
            (4, "HAT_LEFT"),
            (14, "HAT_RIGHT"),
            (21, "BTN_SOUTH"),
        ];
        for (offset, token) in defaults {
            // Built-in tokens always resolve.
            if let Ok(act) = action::resolve(token) {
                table.lines.insert(offset, act);
            }
        }
        table
    }

    /// Parse mapping-file text.
    ///
    /// One record per line: `<target> <token>`, with `:` accepted as a
    /// separator. `#` starts a comment. Extra fields are ignored; a later
    /// record for the same target overwrites an earlier one.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            // Colons double as separators so `17: BTN_SOUTH` parses too.
            // `I2C:D5` keeps its colon because it has no surrounding space.
            let normalized = normalize_separators(line);
            let mut fields = normalized.split_whitespace();
            let (target_field, token_field) = match (fields.next(), fields.next()) {
                (Some(t), Some(tok)) => (t, tok),
                (Some(_), None) => {
                    warn!("map line {lineno}: missing token, skipped");
                    continue;
                }
                _ => continue, // blank line
            };

            let target = match parse_target(target_field) {
                Some(t) => t,
                None => {
                    warn!("map line {lineno}: bad target '{target_field}', skipped");
                    continue;
                }
            };

            let act = match action::resolve(token_field) {
                Ok(act) => act,
                Err(err) => {
                    warn!("map line {lineno}: {err}, skipped");
                    continue;
                }
            };

            match target {
                MapTarget::Line(offset) => {
                    table.lines.insert(offset, act);
                }
                MapTarget::Pin(pin) => {
                    table.pins.insert(pin, act);
                }
            }
        }

        table
    }

    /// Drop line entries outside `[start, end]` and the excluded offset.
    pub fn retain_in_range(&mut self, start: u32, end: u32) {
        self.lines.retain(|&offset, act| {
            let keep = (start..=end).contains(&offset) && offset != EXCLUDED_OFFSET;
            if !keep {
                warn!(
                    "dropping mapping for offset {offset} ({}): outside monitored range",
                    act.token
                );
            }
            keep
        });
    }

    /// Assign actions to every unmapped line in `[start, end]`.
    ///
    /// Codes already used by explicit records (lines or pins) on the same
    /// device are skipped so every assigned line gets a unique code.
    pub fn auto_assign(&mut self, start: u32, end: u32, mode: AutoMode) {
        let device = match mode {
            AutoMode::Buttons => DeviceKind::Gamepad,
            AutoMode::Keys => DeviceKind::Keyboard,
            AutoMode::None => return,
        };

        let mut used: HashSet<Key> = self
            .lines
            .values()
            .chain(self.pins.values())
            .filter_map(|act| match act.kind {
                ActionKind::KeyPress { device: d, key } if d == device => Some(key),
                _ => None,
            })
            .collect();

        for offset in start..=end {
            if offset == EXCLUDED_OFFSET || self.lines.contains_key(&offset) {
                continue;
            }

            let token = match mode {
                AutoMode::Buttons => "AUTO_BTN",
                AutoMode::Keys => "AUTO_KEY",
                AutoMode::None => unreachable!(),
            };
            let mut idx: usize = 0;
            loop {
                let key = match mode {
                    AutoMode::Buttons => auto_button_code(idx),
                    AutoMode::Keys => auto_key_code(idx),
                    AutoMode::None => unreachable!(),
                };
                idx += 1;
                let fresh = used.insert(key);
                if !fresh && idx <= 2000 {
                    continue;
                }
                if !fresh {
                    warn!("auto-assignment pool exhausted, offset {offset} reuses a code");
                }
                self.lines.insert(
                    offset,
                    Action::new(ActionKind::KeyPress { device, key }, token),
                );
                break;
            }
        }
    }
}

/// Replace `:` separators with spaces, except inside an `I2C:` target.
fn normalize_separators(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let upper = line.to_ascii_uppercase();
    let mut skip_next_colon_at = None;
    if let Some(pos) = upper.find("I2C:") {
        skip_next_colon_at = Some(pos + 3);
    }
    for (i, ch) in line.char_indices() {
        if ch == ':' && Some(i) != skip_next_colon_at {
            out.push(' ');
        } else {
            out.push(ch);
        }
    }
    out
}

const AUTO_BUTTON_SEQUENCE: [Key; 13] = [
    Key::BTN_SOUTH,
    Key::BTN_EAST,
    Key::BTN_NORTH,
    Key::BTN_WEST,
    Key::BTN_TL,
    Key::BTN_TR,
    Key::BTN_TL2,
    Key::BTN_TR2,
    Key::BTN_SELECT,
    Key::BTN_START,
    Key::BTN_THUMBL,
    Key::BTN_THUMBR,
    Key::BTN_MODE,
];

const AUTO_EXTRA_BUTTONS: [Key; 10] = [
    Key::BTN_0,
    Key::BTN_1,
    Key::BTN_2,
    Key::BTN_3,
    Key::BTN_4,
    Key::BTN_5,
    Key::BTN_6,
    Key::BTN_7,
    Key::BTN_8,
    Key::BTN_9,
];

/// Candidate gamepad code at position `idx` of the auto sequence.
pub fn auto_button_code(idx: usize) -> Key {
    if idx < AUTO_BUTTON_SEQUENCE.len() {
        return AUTO_BUTTON_SEQUENCE[idx];
    }
    let rest = idx - AUTO_BUTTON_SEQUENCE.len();
    AUTO_EXTRA_BUTTONS[rest % AUTO_EXTRA_BUTTONS.len()]
}

/// Candidate keyboard code at position `idx` of the auto sequence.
pub fn auto_key_code(idx: usize) -> Key {
    if idx < 26 {
        return LETTER_KEYS[idx];
    }
    let rest = idx - 26;
    if rest < 10 {
        return DIGIT_KEYS[rest];
    }
    let rest = rest - 10;
    if rest < 12 {
        return FUNCTION_KEYS[rest];
    }
    LETTER_KEYS[(rest - 12) % 26]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::HatDirection;

    #[test]
    fn test_parse_target_notations() {
        assert_eq!(parse_target("17"), Some(MapTarget::Line(17)));
        assert_eq!(parse_target("D5"), Some(MapTarget::Pin(5)));
        assert_eq!(parse_target("d13"), Some(MapTarget::Pin(13)));
        assert_eq!(parse_target("I2C:D5"), Some(MapTarget::Pin(5)));
        assert_eq!(parse_target("i2c:d2"), Some(MapTarget::Pin(2)));
        assert_eq!(parse_target("I2C:5"), Some(MapTarget::Pin(5)));
        // Out of the D2..D13 pin range.
        assert_eq!(parse_target("D1"), None);
        assert_eq!(parse_target("D14"), None);
        assert_eq!(parse_target("I2C:14"), None);
        assert_eq!(parse_target("bogus"), None);
    }

    #[test]
    fn test_parse_space_and_colon_equivalent() {
        let a = MappingTable::parse("17 BTN_SOUTH\n");
        let b = MappingTable::parse("17: BTN_SOUTH\n");
        let c = MappingTable::parse("17:BTN_SOUTH\n");
        for t in [&a, &b, &c] {
            assert_eq!(t.lines[&17].token, "BTN_SOUTH");
        }
    }

    #[test]
    fn test_parse_comments_and_blank_lines() {
        let table = MappingTable::parse("# header\n\n17 A # trailing\n");
        assert_eq!(table.lines.len(), 1);
        assert!(table.pins.is_empty());
    }

    #[test]
    fn test_parse_skips_bad_records() {
        let table = MappingTable::parse("17 NOT_A_TOKEN\nbogus A\n18\n19 B\n");
        assert_eq!(table.lines.len(), 1);
        assert!(table.lines.contains_key(&19));
    }

    #[test]
    fn test_parse_later_record_wins() {
        let table = MappingTable::parse("17 A\n17 B\n");
        assert_eq!(table.lines[&17].token, "B");
    }

    #[test]
    fn test_parse_pin_records() {
        let table = MappingTable::parse("D5 KEY_ENTER\nI2C:D6 HAT_UP\n");
        assert_eq!(table.pins.len(), 2);
        assert_eq!(table.pins[&5].token, "KEY_ENTER");
        assert_eq!(table.pins[&6].kind, ActionKind::Hat(HatDirection::Up));
    }

    #[test]
    fn test_default_table() {
        let table = MappingTable::default_table();
        assert_eq!(table.lines.len(), 5);
        assert_eq!(table.lines[&15].kind, ActionKind::Hat(HatDirection::Up));
        assert_eq!(table.lines[&18].kind, ActionKind::Hat(HatDirection::Down));
        assert_eq!(table.lines[&4].kind, ActionKind::Hat(HatDirection::Left));
        assert_eq!(table.lines[&14].kind, ActionKind::Hat(HatDirection::Right));
        assert_eq!(
            table.lines[&21].kind,
            ActionKind::KeyPress {
                device: DeviceKind::Gamepad,
                key: Key::BTN_SOUTH
            }
        );
    }

    #[test]
    fn test_retain_in_range() {
        let mut table = MappingTable::parse("3 A\n17 B\n30 X\n36 Y\n");
        table.retain_in_range(5, 36);
        assert!(!table.lines.contains_key(&3)); // below range
        assert!(table.lines.contains_key(&17));
        assert!(table.lines.contains_key(&30));
        assert!(!table.lines.contains_key(&36)); // excluded offset
    }

    fn assigned_keys(table: &MappingTable, device: DeviceKind) -> Vec<Key> {
        table
            .lines
            .values()
            .filter_map(|act| match act.kind {
                ActionKind::KeyPress { device: d, key } if d == device => Some(key),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_auto_assign_buttons_unique() {
        let mut table = MappingTable::default();
        table.auto_assign(5, 27, AutoMode::Buttons);
        assert!(!table.lines.is_empty());
        let keys = assigned_keys(&table, DeviceKind::Gamepad);
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(keys.len(), unique.len());
        assert_eq!(keys.len(), 23);
    }

    #[test]
    fn test_auto_assign_keys_unique() {
        let mut table = MappingTable::default();
        table.auto_assign(5, 27, AutoMode::Keys);
        let keys = assigned_keys(&table, DeviceKind::Keyboard);
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(keys.len(), unique.len());
    }

    #[test]
    fn test_auto_assign_skips_explicit_codes() {
        // BTN_SOUTH is the first auto candidate; an explicit record must
        // push auto-assignment past it.
        let mut table = MappingTable::parse("21 BTN_SOUTH\n");
        table.auto_assign(20, 22, AutoMode::Buttons);
        let keys = assigned_keys(&table, DeviceKind::Gamepad);
        let south_count = keys.iter().filter(|&&k| k == Key::BTN_SOUTH).count();
        assert_eq!(south_count, 1);
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_auto_assign_respects_pin_codes() {
        let mut table = MappingTable::parse("D5 BTN_SOUTH\n");
        table.auto_assign(10, 10, AutoMode::Buttons);
        assert_eq!(table.lines[&10].kind, ActionKind::KeyPress {
            device: DeviceKind::Gamepad,
            key: Key::BTN_EAST
        });
    }

    #[test]
    fn test_auto_assign_none_leaves_table() {
        let mut table = MappingTable::default_table();
        let before = table.lines.len();
        table.auto_assign(5, 27, AutoMode::None);
        assert_eq!(table.lines.len(), before);
    }

    #[test]
    fn test_auto_assign_skips_excluded_offset() {
        let mut table = MappingTable::default();
        table.auto_assign(35, 37, AutoMode::Buttons);
        assert!(!table.lines.contains_key(&EXCLUDED_OFFSET));
        assert_eq!(table.lines.len(), 2);
    }

    #[test]
    fn test_auto_key_sequence_order() {
        assert_eq!(auto_key_code(0), Key::KEY_A);
        assert_eq!(auto_key_code(25), Key::KEY_Z);
        assert_eq!(auto_key_code(26), Key::KEY_0);
        assert_eq!(auto_key_code(35), Key::KEY_9);
        assert_eq!(auto_key_code(36), Key::KEY_F1);
        assert_eq!(auto_key_code(47), Key::KEY_F12);
        assert_eq!(auto_key_code(48), Key::KEY_A);
    }

    #[test]
    fn test_auto_button_sequence_order() {
        assert_eq!(auto_button_code(0), Key::BTN_SOUTH);
        assert_eq!(auto_button_code(9), Key::BTN_START);
        assert_eq!(auto_button_code(10), Key::BTN_THUMBL);
        assert_eq!(auto_button_code(11), Key::BTN_THUMBR);
        assert_eq!(auto_button_code(12), Key::BTN_MODE);
        assert_eq!(auto_button_code(13), Key::BTN_0);
        assert_eq!(auto_button_code(22), Key::BTN_9);
        assert_eq!(auto_button_code(23), Key::BTN_0);
    }
}
