//! Intent command parser
//!
//! Two line grammars are accepted:
//!
//! ```text
//! TAP 0.5 0.5            k:Hello
//! SWIPE 0 -0.4           m:10,-5
//! TYPE some text         mc:left
//! KEY_COMBO next         mp:left
//! MOUSE_CLICK right      mr:left
//! PING
//! ```
//!
//! Verbs are case-insensitive. A parse failure never yields a partial command.
//! Text payloads decode `\n`, `\r`, `\t` and `\\` so that a newline can
//! travel inside a single line.

use std::fmt;
use thiserror::Error;

use crate::hid::{ComboKey, KeyMap, MouseButtons, MOVE_LIMIT};

/// Parse errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Unknown verb: {0}")]
    UnknownVerb(String),

    #[error("{verb} expects {expected} argument(s), got {actual}")]
    Arity {
        verb: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid number for {verb}: {value:?}")]
    InvalidNumber { verb: &'static str, value: String },

    #[error("{verb} coordinate {value} outside 0..1")]
    OutOfRange { verb: &'static str, value: f64 },

    #[error("{verb} displacement {value} exceeds {MOVE_LIMIT}")]
    MoveTooLarge { verb: &'static str, value: i32 },

    #[error("Keycode out of range 0..=255: {0}")]
    KeycodeRange(String),

    #[error("Unknown mouse button: {0}")]
    UnknownButton(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Mouse button named by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn mask(&self) -> MouseButtons {
        match self {
            MouseButton::Left => MouseButtons::LEFT,
            MouseButton::Right => MouseButtons::RIGHT,
            MouseButton::Middle => MouseButtons::MIDDLE,
        }
    }

    fn parse(s: &str) -> ParseResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(MouseButton::Left),
            "right" | "r" => Ok(MouseButton::Right),
            "middle" | "m" => Ok(MouseButton::Middle),
            _ => Err(ParseError::UnknownButton(s.to_string())),
        }
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MouseButton::Left => write!(f, "left"),
            MouseButton::Right => write!(f, "right"),
            MouseButton::Middle => write!(f, "middle"),
        }
    }
}

/// A parsed intent
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Tap at a normalised screen position
    Tap { x: f64, y: f64 },
    DoubleTap { x: f64, y: f64 },
    /// Swipe by a normalised displacement
    Swipe { dx: f64, dy: f64 },
    Type(String),
    KeyCombo(ComboKey),
    KeyComboSpecial(u8),
    MouseMove { dx: i32, dy: i32 },
    MouseClick(MouseButton),
    MousePress(MouseButton),
    MouseRelease(MouseButton),
    Scroll { dx: i32, dy: i32 },
    Ping,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Tap { .. } => "TAP",
            Command::DoubleTap { .. } => "DOUBLE_TAP",
            Command::Swipe { .. } => "SWIPE",
            Command::Type(_) => "TYPE",
            Command::KeyCombo(_) => "KEY_COMBO",
            Command::KeyComboSpecial(_) => "KEY_COMBO_SPECIAL",
            Command::MouseMove { .. } => "MOUSE_MOVE",
            Command::MouseClick(_) => "MOUSE_CLICK",
            Command::MousePress(_) => "MOUSE_PRESS",
            Command::MouseRelease(_) => "MOUSE_RELEASE",
            Command::Scroll { .. } => "SCROLL",
            Command::Ping => "PING",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Tap { x, y } | Command::DoubleTap { x, y } => {
                write!(f, "{} {} {}", self.verb(), x, y)
            }
            Command::Swipe { dx, dy } => write!(f, "{} {} {}", self.verb(), dx, dy),
            Command::Type(text) => write!(f, "{} ({} chars)", self.verb(), text.chars().count()),
            Command::KeyCombo(key) => write!(f, "{} {:?}", self.verb(), key),
            Command::KeyComboSpecial(code) => write!(f, "{} {:#04x}", self.verb(), code),
            Command::MouseMove { dx, dy } | Command::Scroll { dx, dy } => {
                write!(f, "{} {} {}", self.verb(), dx, dy)
            }
            Command::MouseClick(b) | Command::MousePress(b) | Command::MouseRelease(b) => {
                write!(f, "{} {}", self.verb(), b)
            }
            Command::Ping => write!(f, "{}", self.verb()),
        }
    }
}

/// Parse one inbound line
///
/// Returns `Ok(None)` for blank lines.
pub fn parse(line: &str) -> ParseResult<Option<Command>> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    if let Some(command) = parse_compact(line)? {
        return Ok(Some(command));
    }

    let trimmed = line.trim_start();
    let (verb, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest),
        None => (trimmed, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match verb.to_ascii_uppercase().as_str() {
        "TAP" => {
            let [x, y] = arity::<2>("TAP", &args)?;
            Command::Tap {
                x: coordinate("TAP", x)?,
                y: coordinate("TAP", y)?,
            }
        }
        "DOUBLE_TAP" => {
            let [x, y] = arity::<2>("DOUBLE_TAP", &args)?;
            Command::DoubleTap {
                x: coordinate("DOUBLE_TAP", x)?,
                y: coordinate("DOUBLE_TAP", y)?,
            }
        }
        "SWIPE" => {
            let [dx, dy] = arity::<2>("SWIPE", &args)?;
            Command::Swipe {
                dx: float("SWIPE", dx)?,
                dy: float("SWIPE", dy)?,
            }
        }
        "TYPE" => {
            if rest.is_empty() {
                return Err(ParseError::Arity {
                    verb: "TYPE",
                    expected: 1,
                    actual: 0,
                });
            }
            Command::Type(unescape(rest))
        }
        "KEY_COMBO" => {
            // A lone space after the verb is the space character itself
            let key = if rest == " " { rest } else { rest.trim() };
            if key.is_empty() {
                return Err(ParseError::Arity {
                    verb: "KEY_COMBO",
                    expected: 1,
                    actual: 0,
                });
            }
            let resolved =
                KeyMap::combo_key(key).ok_or_else(|| ParseError::UnknownKey(key.to_string()))?;
            Command::KeyCombo(resolved)
        }
        "KEY_COMBO_SPECIAL" => {
            let [code] = arity::<1>("KEY_COMBO_SPECIAL", &args)?;
            Command::KeyComboSpecial(keycode(code)?)
        }
        "MOUSE_MOVE" => {
            let [dx, dy] = arity::<2>("MOUSE_MOVE", &args)?;
            Command::MouseMove {
                dx: displacement("MOUSE_MOVE", dx)?,
                dy: displacement("MOUSE_MOVE", dy)?,
            }
        }
        "MOUSE_CLICK" => {
            let [b] = arity::<1>("MOUSE_CLICK", &args)?;
            Command::MouseClick(MouseButton::parse(b)?)
        }
        "MOUSE_PRESS" => {
            let [b] = arity::<1>("MOUSE_PRESS", &args)?;
            Command::MousePress(MouseButton::parse(b)?)
        }
        "MOUSE_RELEASE" => {
            let [b] = arity::<1>("MOUSE_RELEASE", &args)?;
            Command::MouseRelease(MouseButton::parse(b)?)
        }
        "SCROLL" => {
            let [dx, dy] = arity::<2>("SCROLL", &args)?;
            Command::Scroll {
                dx: integer("SCROLL", dx)?,
                dy: integer("SCROLL", dy)?,
            }
        }
        "PING" => {
            arity::<0>("PING", &args)?;
            Command::Ping
        }
        _ => return Err(ParseError::UnknownVerb(verb.to_string())),
    };

    Ok(Some(command))
}

/// Compact `prefix:payload` grammar; `Ok(None)` when the line is not compact
fn parse_compact(line: &str) -> ParseResult<Option<Command>> {
    let Some((prefix, payload)) = line.split_once(':') else {
        return Ok(None);
    };

    let command = match prefix {
        "k" => {
            if payload.is_empty() {
                return Err(ParseError::Arity {
                    verb: "k",
                    expected: 1,
                    actual: 0,
                });
            }
            Command::Type(unescape(payload))
        }
        "m" => {
            let args: Vec<&str> = payload.split(',').map(str::trim).collect();
            let [dx, dy] = arity::<2>("m", &args)?;
            Command::MouseMove {
                dx: displacement("m", dx)?,
                dy: displacement("m", dy)?,
            }
        }
        "mc" => Command::MouseClick(MouseButton::parse(payload.trim())?),
        "mp" => Command::MousePress(MouseButton::parse(payload.trim())?),
        "mr" => Command::MouseRelease(MouseButton::parse(payload.trim())?),
        _ => return Ok(None),
    };

    Ok(Some(command))
}

fn arity<'a, const N: usize>(verb: &'static str, args: &[&'a str]) -> ParseResult<[&'a str; N]> {
    <[&str; N]>::try_from(args).map_err(|_| ParseError::Arity {
        verb,
        expected: N,
        actual: args.len(),
    })
}

fn float(verb: &'static str, s: &str) -> ParseResult<f64> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidNumber {
            verb,
            value: s.to_string(),
        }),
    }
}

fn coordinate(verb: &'static str, s: &str) -> ParseResult<f64> {
    let value = float(verb, s)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ParseError::OutOfRange { verb, value });
    }
    Ok(value)
}

fn integer(verb: &'static str, s: &str) -> ParseResult<i32> {
    s.parse::<i32>().map_err(|_| ParseError::InvalidNumber {
        verb,
        value: s.to_string(),
    })
}

fn displacement(verb: &'static str, s: &str) -> ParseResult<i32> {
    let value = integer(verb, s)?;
    if value.abs() > MOVE_LIMIT {
        return Err(ParseError::MoveTooLarge { verb, value });
    }
    Ok(value)
}

/// Decode backslash escapes; unknown escapes are kept as written
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn keycode(s: &str) -> ParseResult<u8> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => s.parse::<i64>(),
    }
    .map_err(|_| ParseError::InvalidNumber {
        verb: "KEY_COMBO_SPECIAL",
        value: s.to_string(),
    })?;

    u8::try_from(value).map_err(|_| ParseError::KeycodeRange(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::{keycodes, KeyStroke};

    fn ok(line: &str) -> Command {
        parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_parse_tap() {
        assert_eq!(ok("TAP 0.5 0.25"), Command::Tap { x: 0.5, y: 0.25 });
        assert_eq!(ok("tap 1 0\r\n"), Command::Tap { x: 1.0, y: 0.0 });
        assert_eq!(ok("Double_Tap 0.1 0.9"), Command::DoubleTap { x: 0.1, y: 0.9 });
    }

    #[test]
    fn test_parse_type_keeps_text_verbatim() {
        assert_eq!(ok("TYPE Hi"), Command::Type("Hi".into()));
        assert_eq!(
            ok("TYPE  two  spaces \r"),
            Command::Type(" two  spaces ".into())
        );
        assert!(matches!(
            parse("TYPE"),
            Err(ParseError::Arity { verb: "TYPE", .. })
        ));
    }

    #[test]
    fn test_parse_key_combo() {
        assert_eq!(
            ok("KEY_COMBO a"),
            Command::KeyCombo(ComboKey::Char(KeyStroke::plain(keycodes::KEY_A)))
        );
        assert!(matches!(ok("KEY_COMBO rotor_next"), Command::KeyCombo(ComboKey::Named(_))));
        assert_eq!(
            ok("KEY_COMBO  "),
            Command::KeyCombo(ComboKey::Char(KeyStroke::plain(keycodes::KEY_SPACE)))
        );
        assert_eq!(
            parse("KEY_COMBO warp"),
            Err(ParseError::UnknownKey("warp".into()))
        );
    }

    #[test]
    fn test_parse_key_combo_special() {
        assert_eq!(ok("KEY_COMBO_SPECIAL 40"), Command::KeyComboSpecial(40));
        assert_eq!(ok("KEY_COMBO_SPECIAL 0x4f"), Command::KeyComboSpecial(0x4F));
        assert_eq!(
            parse("KEY_COMBO_SPECIAL 256"),
            Err(ParseError::KeycodeRange("256".into()))
        );
        assert!(parse("KEY_COMBO_SPECIAL -1").is_err());
    }

    #[test]
    fn test_parse_mouse() {
        assert_eq!(ok("MOUSE_MOVE -300 12"), Command::MouseMove { dx: -300, dy: 12 });
        assert_eq!(ok("mouse_click RIGHT"), Command::MouseClick(MouseButton::Right));
        assert_eq!(ok("MOUSE_PRESS left"), Command::MousePress(MouseButton::Left));
        assert_eq!(ok("MOUSE_RELEASE middle"), Command::MouseRelease(MouseButton::Middle));
        assert_eq!(ok("SCROLL 0 -3"), Command::Scroll { dx: 0, dy: -3 });
        assert_eq!(
            parse("MOUSE_CLICK side"),
            Err(ParseError::UnknownButton("side".into()))
        );
    }

    #[test]
    fn test_parse_compact_grammar() {
        assert_eq!(ok("k:Hello from the Pi!"), Command::Type("Hello from the Pi!".into()));
        assert_eq!(ok("m:50,-50"), Command::MouseMove { dx: 50, dy: -50 });
        assert_eq!(ok("mc:left"), Command::MouseClick(MouseButton::Left));
        assert_eq!(ok("mp:right"), Command::MousePress(MouseButton::Right));
        assert_eq!(ok("mr:middle"), Command::MouseRelease(MouseButton::Middle));
        assert!(parse("m:1").is_err());
    }

    #[test]
    fn test_type_escapes_are_decoded() {
        assert_eq!(ok("TYPE a\\nb"), Command::Type("a\nb".into()));
        assert_eq!(ok("k:x\\ty"), Command::Type("x\ty".into()));
        assert_eq!(ok(r"TYPE C:\\dir"), Command::Type(r"C:\dir".into()));
        assert_eq!(ok(r"TYPE \q and \"), Command::Type(r"\q and \".into()));
    }

    #[test]
    fn test_verb_split_on_any_whitespace() {
        assert_eq!(ok("TAP\t0.5\t0.5"), Command::Tap { x: 0.5, y: 0.5 });
        assert_eq!(ok("TYPE\thi"), Command::Type("hi".into()));
        assert_eq!(ok("PING\t"), Command::Ping);
    }

    #[test]
    fn test_oversized_moves_rejected() {
        assert_eq!(
            parse("MOUSE_MOVE 2147483647 0"),
            Err(ParseError::MoveTooLarge {
                verb: "MOUSE_MOVE",
                value: i32::MAX
            })
        );
        assert!(matches!(
            parse("m:0,-9000"),
            Err(ParseError::MoveTooLarge { verb: "m", value: -9000 })
        ));
        assert_eq!(
            ok(&format!("MOUSE_MOVE {} 0", MOVE_LIMIT)),
            Command::MouseMove { dx: MOVE_LIMIT, dy: 0 }
        );
    }

    #[test]
    fn test_compact_prefix_inside_type_text() {
        assert_eq!(ok("TYPE k:v"), Command::Type("k:v".into()));
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        assert_eq!(parse(""), Ok(None));
        assert_eq!(parse("   \r\n"), Ok(None));
    }

    #[test]
    fn test_malformed_lines() {
        assert_eq!(parse("FOO 1 2"), Err(ParseError::UnknownVerb("FOO".into())));
        assert!(matches!(
            parse("TAP notanumber 0.5"),
            Err(ParseError::InvalidNumber { verb: "TAP", .. })
        ));
        assert!(matches!(
            parse("TAP 0.5"),
            Err(ParseError::Arity { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(parse("SWIPE NaN 0"), Err(ParseError::InvalidNumber { .. })));
        assert!(matches!(parse("SWIPE inf 0"), Err(ParseError::InvalidNumber { .. })));
        assert!(matches!(parse("TAP 1.5 0"), Err(ParseError::OutOfRange { .. })));
        assert!(matches!(parse("PING now"), Err(ParseError::Arity { .. })));
    }

    #[test]
    fn test_ping() {
        assert_eq!(ok("PING"), Command::Ping);
        assert_eq!(ok("ping\r"), Command::Ping);
    }
}
