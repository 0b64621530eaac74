//! Character and named-key tables (US layout)

use super::keycodes::*;
use super::Modifiers;

/// A single key press: modifiers held together with one keycode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStroke {
    pub modifiers: Modifiers,
    pub keycode: u8,
}

impl KeyStroke {
    pub const fn new(modifiers: Modifiers, keycode: u8) -> Self {
        Self { modifiers, keycode }
    }

    pub const fn plain(keycode: u8) -> Self {
        Self::new(Modifiers::empty(), keycode)
    }

    pub const fn shifted(keycode: u8) -> Self {
        Self::new(Modifiers::LEFT_SHIFT, keycode)
    }
}

const VO: Modifiers = Modifiers::LEFT_CTRL.union(Modifiers::LEFT_ALT);
const VO_CMD: Modifiers = VO.union(Modifiers::LEFT_GUI);
const VO_SHIFT: Modifiers = VO.union(Modifiers::LEFT_SHIFT);

/// Named keys accepted by `KEY_COMBO`
///
/// Accessibility entries use the VoiceOver key (Ctrl+Alt).
const NAMED_KEYS: &[(&str, KeyStroke)] = &[
    ("next", KeyStroke::new(VO, KEY_RIGHT_ARROW)),
    ("prev", KeyStroke::new(VO, KEY_LEFT_ARROW)),
    ("previous", KeyStroke::new(VO, KEY_LEFT_ARROW)),
    ("activate", KeyStroke::new(VO, KEY_SPACE)),
    ("home_screen", KeyStroke::new(VO, KEY_H)),
    ("rotor_next", KeyStroke::new(VO_CMD, KEY_RIGHT_ARROW)),
    ("rotor_prev", KeyStroke::new(VO_CMD, KEY_LEFT_ARROW)),
    ("rotor_up", KeyStroke::new(VO_CMD, KEY_UP_ARROW)),
    ("rotor_down", KeyStroke::new(VO_CMD, KEY_DOWN_ARROW)),
    ("scroll_up", KeyStroke::new(VO_SHIFT, KEY_UP_ARROW)),
    ("scroll_down", KeyStroke::new(VO_SHIFT, KEY_DOWN_ARROW)),
    ("spotlight", KeyStroke::new(Modifiers::LEFT_GUI, KEY_SPACE)),
    ("app_switcher", KeyStroke::new(Modifiers::LEFT_GUI, KEY_TAB)),
    ("back", KeyStroke::plain(KEY_ESCAPE)),
    ("enter", KeyStroke::plain(KEY_ENTER)),
    ("return", KeyStroke::plain(KEY_ENTER)),
    ("escape", KeyStroke::plain(KEY_ESCAPE)),
    ("esc", KeyStroke::plain(KEY_ESCAPE)),
    ("tab", KeyStroke::plain(KEY_TAB)),
    ("space", KeyStroke::plain(KEY_SPACE)),
    ("backspace", KeyStroke::plain(KEY_BACKSPACE)),
    ("delete", KeyStroke::plain(KEY_DELETE)),
    ("insert", KeyStroke::plain(KEY_INSERT)),
    ("home", KeyStroke::plain(KEY_HOME)),
    ("end", KeyStroke::plain(KEY_END)),
    ("pageup", KeyStroke::plain(KEY_PAGE_UP)),
    ("page_up", KeyStroke::plain(KEY_PAGE_UP)),
    ("pagedown", KeyStroke::plain(KEY_PAGE_DOWN)),
    ("page_down", KeyStroke::plain(KEY_PAGE_DOWN)),
    ("up", KeyStroke::plain(KEY_UP_ARROW)),
    ("down", KeyStroke::plain(KEY_DOWN_ARROW)),
    ("left", KeyStroke::plain(KEY_LEFT_ARROW)),
    ("right", KeyStroke::plain(KEY_RIGHT_ARROW)),
    ("caps_lock", KeyStroke::plain(KEY_CAPS_LOCK)),
    ("f1", KeyStroke::plain(KEY_F1)),
    ("f2", KeyStroke::plain(KEY_F2)),
    ("f3", KeyStroke::plain(KEY_F3)),
    ("f4", KeyStroke::plain(KEY_F4)),
    ("f5", KeyStroke::plain(KEY_F5)),
    ("f6", KeyStroke::plain(KEY_F6)),
    ("f7", KeyStroke::plain(KEY_F7)),
    ("f8", KeyStroke::plain(KEY_F8)),
    ("f9", KeyStroke::plain(KEY_F9)),
    ("f10", KeyStroke::plain(KEY_F10)),
    ("f11", KeyStroke::plain(KEY_F11)),
    ("f12", KeyStroke::plain(KEY_F12)),
];

/// What a `KEY_COMBO` argument resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComboKey {
    /// A named key with its own fixed modifier set
    Named(KeyStroke),
    /// A single character; combined with the configured combo modifiers
    Char(KeyStroke),
}

/// Static lookup tables from characters and key names to [`KeyStroke`]s
pub struct KeyMap;

impl KeyMap {
    /// Look up a printable character (plus `\n` and `\t`)
    pub fn char_stroke(c: char) -> Option<KeyStroke> {
        let stroke = match c {
            'a'..='z' => KeyStroke::plain(KEY_A + (c as u8 - b'a')),
            'A'..='Z' => KeyStroke::shifted(KEY_A + (c as u8 - b'A')),
            '1'..='9' => KeyStroke::plain(KEY_1 + (c as u8 - b'1')),
            '0' => KeyStroke::plain(KEY_0),
            ' ' => KeyStroke::plain(KEY_SPACE),
            '\n' | '\r' => KeyStroke::plain(KEY_ENTER),
            '\t' => KeyStroke::plain(KEY_TAB),
            '-' => KeyStroke::plain(KEY_MINUS),
            '=' => KeyStroke::plain(KEY_EQUAL),
            '[' => KeyStroke::plain(KEY_LEFT_BRACKET),
            ']' => KeyStroke::plain(KEY_RIGHT_BRACKET),
            '\\' => KeyStroke::plain(KEY_BACKSLASH),
            ';' => KeyStroke::plain(KEY_SEMICOLON),
            '\'' => KeyStroke::plain(KEY_QUOTE),
            '`' => KeyStroke::plain(KEY_GRAVE),
            ',' => KeyStroke::plain(KEY_COMMA),
            '.' => KeyStroke::plain(KEY_PERIOD),
            '/' => KeyStroke::plain(KEY_SLASH),
            '!' => KeyStroke::shifted(KEY_1),
            '@' => KeyStroke::shifted(KEY_2),
            '#' => KeyStroke::shifted(KEY_3),
            '$' => KeyStroke::shifted(KEY_4),
            '%' => KeyStroke::shifted(KEY_5),
            '^' => KeyStroke::shifted(KEY_6),
            '&' => KeyStroke::shifted(KEY_7),
            '*' => KeyStroke::shifted(KEY_8),
            '(' => KeyStroke::shifted(KEY_9),
            ')' => KeyStroke::shifted(KEY_0),
            '_' => KeyStroke::shifted(KEY_MINUS),
            '+' => KeyStroke::shifted(KEY_EQUAL),
            '{' => KeyStroke::shifted(KEY_LEFT_BRACKET),
            '}' => KeyStroke::shifted(KEY_RIGHT_BRACKET),
            '|' => KeyStroke::shifted(KEY_BACKSLASH),
            ':' => KeyStroke::shifted(KEY_SEMICOLON),
            '"' => KeyStroke::shifted(KEY_QUOTE),
            '~' => KeyStroke::shifted(KEY_GRAVE),
            '<' => KeyStroke::shifted(KEY_COMMA),
            '>' => KeyStroke::shifted(KEY_PERIOD),
            '?' => KeyStroke::shifted(KEY_SLASH),
            _ => return None,
        };
        Some(stroke)
    }

    /// Look up a named key, case-insensitively
    pub fn named(name: &str) -> Option<KeyStroke> {
        let name = name.to_ascii_lowercase();
        NAMED_KEYS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, stroke)| *stroke)
    }

    /// Resolve a `KEY_COMBO` argument
    ///
    /// A single character is a character key; anything longer must be a
    /// known name.
    pub fn combo_key(token: &str) -> Option<ComboKey> {
        let mut chars = token.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::char_stroke(c).map(ComboKey::Char),
            (Some(_), Some(_)) => Self::named(token).map(ComboKey::Named),
            (None, _) => None,
        }
    }

    /// All known key names
    pub fn names() -> impl Iterator<Item = &'static str> {
        NAMED_KEYS.iter().map(|(n, _)| *n)
    }
}
