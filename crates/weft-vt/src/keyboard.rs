//! Key-event → PTY byte encoding.
//!
//! The daemon reconstructs a key event from the client's `key_input`
//! notification and encodes it against the emulator's keyboard state:
//! cursor-key application mode, keypad mode, modifyOtherKeys, kitty
//! keyboard flags, plus the per-client Option-as-Alt preference.

use crate::modes::{Modes, kitty};

/// A keyboard event as reported by the client. `key` uses W3C
/// `KeyboardEvent.key` names ("a", "Enter", "ArrowUp", ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub code: String,
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub meta: bool,
}

/// Per-client macOS Option-as-Alt preference. When disabled the client
/// already composed the character, so Alt never produces an ESC prefix for
/// printable keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptionAsAlt {
    #[default]
    None,
    Left,
    Right,
    Both,
}

impl OptionAsAlt {
    pub fn parse(s: &str) -> Self {
        match s {
            "left" => OptionAsAlt::Left,
            "right" => OptionAsAlt::Right,
            "true" | "both" => OptionAsAlt::Both,
            _ => OptionAsAlt::None,
        }
    }

    pub fn active(self) -> bool {
        !matches!(self, OptionAsAlt::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NamedKey {
    Enter,
    Tab,
    Backspace,
    Escape,
    Up,
    Down,
    Right,
    Left,
    Home,
    End,
    PageUp,
    PageDown,
    Insert,
    Delete,
    F(u8),
}

fn named_key(key: &str) -> Option<NamedKey> {
    Some(match key {
        "Enter" => NamedKey::Enter,
        "Tab" => NamedKey::Tab,
        "Backspace" => NamedKey::Backspace,
        "Escape" => NamedKey::Escape,
        "ArrowUp" => NamedKey::Up,
        "ArrowDown" => NamedKey::Down,
        "ArrowRight" => NamedKey::Right,
        "ArrowLeft" => NamedKey::Left,
        "Home" => NamedKey::Home,
        "End" => NamedKey::End,
        "PageUp" => NamedKey::PageUp,
        "PageDown" => NamedKey::PageDown,
        "Insert" => NamedKey::Insert,
        "Delete" => NamedKey::Delete,
        _ => {
            let n = key.strip_prefix('F')?.parse::<u8>().ok()?;
            if (1..=12).contains(&n) {
                NamedKey::F(n)
            } else {
                return None;
            }
        }
    })
}

/// xterm modifier parameter: 1 + shift|alt|ctrl|meta bits.
fn mods_param(event: &KeyEvent, alt: bool) -> u32 {
    let mut m = 0;
    if event.shift {
        m |= 1;
    }
    if alt {
        m |= 2;
    }
    if event.ctrl {
        m |= 4;
    }
    if event.meta {
        m |= 8;
    }
    m + 1
}

fn ctrl_byte(c: char) -> Option<u8> {
    let c = c.to_ascii_lowercase();
    Some(match c {
        'a'..='z' => c as u8 - b'a' + 1,
        ' ' | '@' => 0,
        '[' => 0x1b,
        '\\' => 0x1c,
        ']' => 0x1d,
        '^' => 0x1e,
        '_' | '/' => 0x1f,
        '?' => 0x7f,
        _ => return None,
    })
}

/// Encode a key event for the PTY, or `None` when nothing should be
/// written (e.g. a release without the kitty event-types flag).
pub fn encode_key(
    event: &KeyEvent,
    modes: &Modes,
    option_as_alt: OptionAsAlt,
    release: bool,
) -> Option<Vec<u8>> {
    if modes.kitty_flags != 0 {
        if release && modes.kitty_flags & kitty::REPORT_EVENT_TYPES == 0 {
            return None;
        }
        return encode_kitty(event, modes, option_as_alt, release);
    }
    if release {
        return None;
    }
    encode_legacy(event, modes, option_as_alt)
}

fn encode_legacy(event: &KeyEvent, modes: &Modes, option_as_alt: OptionAsAlt) -> Option<Vec<u8>> {
    if let Some(named) = named_key(&event.key) {
        return encode_named(named, event, modes);
    }

    let mut chars = event.key.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        // Multi-char name we do not recognize (media keys, IME compose).
        return None;
    }

    let alt_active = event.alt && option_as_alt.active();

    if modes.modify_other_keys == 2 && (event.ctrl || alt_active) && !c.is_control() {
        let mods = mods_param(event, alt_active);
        return Some(format!("\x1b[27;{};{}~", mods, c as u32).into_bytes());
    }

    let mut out = Vec::new();
    if alt_active {
        out.push(0x1b);
    }
    if event.ctrl && let Some(byte) = ctrl_byte(c) {
        out.push(byte);
    } else {
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
    Some(out)
}

fn encode_named(key: NamedKey, event: &KeyEvent, modes: &Modes) -> Option<Vec<u8>> {
    let mods = mods_param(event, event.alt);

    // Shift+Tab is its own sequence.
    if key == NamedKey::Tab && event.shift {
        return Some(b"\x1b[Z".to_vec());
    }

    if mods == 1 {
        let bytes: Vec<u8> = match key {
            NamedKey::Enter => b"\r".to_vec(),
            NamedKey::Tab => b"\t".to_vec(),
            NamedKey::Backspace => b"\x7f".to_vec(),
            NamedKey::Escape => b"\x1b".to_vec(),
            NamedKey::Up => cursor_seq(modes, 'A'),
            NamedKey::Down => cursor_seq(modes, 'B'),
            NamedKey::Right => cursor_seq(modes, 'C'),
            NamedKey::Left => cursor_seq(modes, 'D'),
            NamedKey::Home => cursor_seq(modes, 'H'),
            NamedKey::End => cursor_seq(modes, 'F'),
            NamedKey::PageUp => b"\x1b[5~".to_vec(),
            NamedKey::PageDown => b"\x1b[6~".to_vec(),
            NamedKey::Insert => b"\x1b[2~".to_vec(),
            NamedKey::Delete => b"\x1b[3~".to_vec(),
            NamedKey::F(n @ 1..=4) => {
                let c = (b'P' + n - 1) as char;
                format!("\x1bO{}", c).into_bytes()
            }
            NamedKey::F(n) => format!("\x1b[{}~", f_key_code(n)).into_bytes(),
        };
        return Some(bytes);
    }

    // Modified: CSI 1;mods X for cursor keys, CSI n;mods ~ for tilde keys,
    // ESC prefix for the C0 trio.
    let bytes: Vec<u8> = match key {
        NamedKey::Enter => modified_c0(b'\r', event),
        NamedKey::Tab => modified_c0(b'\t', event),
        NamedKey::Backspace => modified_c0(0x7f, event),
        NamedKey::Escape => modified_c0(0x1b, event),
        NamedKey::Up => format!("\x1b[1;{}A", mods).into_bytes(),
        NamedKey::Down => format!("\x1b[1;{}B", mods).into_bytes(),
        NamedKey::Right => format!("\x1b[1;{}C", mods).into_bytes(),
        NamedKey::Left => format!("\x1b[1;{}D", mods).into_bytes(),
        NamedKey::Home => format!("\x1b[1;{}H", mods).into_bytes(),
        NamedKey::End => format!("\x1b[1;{}F", mods).into_bytes(),
        NamedKey::PageUp => format!("\x1b[5;{}~", mods).into_bytes(),
        NamedKey::PageDown => format!("\x1b[6;{}~", mods).into_bytes(),
        NamedKey::Insert => format!("\x1b[2;{}~", mods).into_bytes(),
        NamedKey::Delete => format!("\x1b[3;{}~", mods).into_bytes(),
        NamedKey::F(n @ 1..=4) => {
            let c = (b'P' + n - 1) as char;
            format!("\x1b[1;{}{}", mods, c).into_bytes()
        }
        NamedKey::F(n) => format!("\x1b[{};{}~", f_key_code(n), mods).into_bytes(),
    };
    Some(bytes)
}

fn modified_c0(base: u8, event: &KeyEvent) -> Vec<u8> {
    let mut out = Vec::new();
    if event.alt {
        out.push(0x1b);
    }
    out.push(base);
    out
}

fn cursor_seq(modes: &Modes, c: char) -> Vec<u8> {
    if modes.app_cursor {
        format!("\x1bO{}", c).into_bytes()
    } else {
        format!("\x1b[{}", c).into_bytes()
    }
}

fn f_key_code(n: u8) -> u8 {
    match n {
        5 => 15,
        6 => 17,
        7 => 18,
        8 => 19,
        9 => 20,
        10 => 21,
        11 => 23,
        _ => 24,
    }
}

fn encode_kitty(
    event: &KeyEvent,
    modes: &Modes,
    option_as_alt: OptionAsAlt,
    release: bool,
) -> Option<Vec<u8>> {
    let report_all = modes.kitty_flags & kitty::REPORT_ALL_KEYS_AS_ESCAPE != 0;
    let report_events = modes.kitty_flags & kitty::REPORT_EVENT_TYPES != 0;
    let alt_active = event.alt && (option_as_alt.active() || named_key(&event.key).is_some());
    let mods = mods_param(event, alt_active);

    let event_suffix = |mods: u32| -> String {
        if release && report_events {
            format!("{}:3", mods)
        } else {
            mods.to_string()
        }
    };

    if let Some(named) = named_key(&event.key) {
        let bytes = match named {
            NamedKey::Up => format!("\x1b[1;{}A", event_suffix(mods)).into_bytes(),
            NamedKey::Down => format!("\x1b[1;{}B", event_suffix(mods)).into_bytes(),
            NamedKey::Right => format!("\x1b[1;{}C", event_suffix(mods)).into_bytes(),
            NamedKey::Left => format!("\x1b[1;{}D", event_suffix(mods)).into_bytes(),
            NamedKey::Home => format!("\x1b[1;{}H", event_suffix(mods)).into_bytes(),
            NamedKey::End => format!("\x1b[1;{}F", event_suffix(mods)).into_bytes(),
            NamedKey::Enter => format!("\x1b[13;{}u", event_suffix(mods)).into_bytes(),
            NamedKey::Tab => format!("\x1b[9;{}u", event_suffix(mods)).into_bytes(),
            NamedKey::Backspace => format!("\x1b[127;{}u", event_suffix(mods)).into_bytes(),
            NamedKey::Escape => format!("\x1b[27;{}u", event_suffix(mods)).into_bytes(),
            NamedKey::PageUp => format!("\x1b[5;{}~", event_suffix(mods)).into_bytes(),
            NamedKey::PageDown => format!("\x1b[6;{}~", event_suffix(mods)).into_bytes(),
            NamedKey::Insert => format!("\x1b[2;{}~", event_suffix(mods)).into_bytes(),
            NamedKey::Delete => format!("\x1b[3;{}~", event_suffix(mods)).into_bytes(),
            NamedKey::F(n @ 1..=4) => {
                let c = (b'P' + n - 1) as char;
                format!("\x1b[1;{}{}", event_suffix(mods), c).into_bytes()
            }
            NamedKey::F(n) => format!("\x1b[{};{}~", f_key_code(n), event_suffix(mods)).into_bytes(),
        };
        return Some(bytes);
    }

    let mut chars = event.key.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }

    // Plain printable keys stay plain text unless the program asked for
    // everything as escape codes.
    let plain = mods == 1 || (mods == 2 && event.shift);
    if plain && !report_all && !release {
        let mut buf = [0u8; 4];
        return Some(c.encode_utf8(&mut buf).as_bytes().to_vec());
    }

    let codepoint = c.to_lowercase().next().unwrap_or(c) as u32;
    Some(format!("\x1b[{};{}u", codepoint, event_suffix(mods)).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> KeyEvent {
        KeyEvent {
            key: k.to_string(),
            code: String::new(),
            shift: false,
            ctrl: false,
            alt: false,
            meta: false,
        }
    }

    fn enc(event: &KeyEvent, modes: &Modes) -> Option<Vec<u8>> {
        encode_key(event, modes, OptionAsAlt::Both, false)
    }

    #[test]
    fn test_plain_char() {
        let modes = Modes::default();
        assert_eq!(enc(&key("a"), &modes), Some(b"a".to_vec()));
        assert_eq!(enc(&key("é"), &modes), Some("é".as_bytes().to_vec()));
    }

    #[test]
    fn test_enter_tab_backspace() {
        let modes = Modes::default();
        assert_eq!(enc(&key("Enter"), &modes), Some(b"\r".to_vec()));
        assert_eq!(enc(&key("Tab"), &modes), Some(b"\t".to_vec()));
        assert_eq!(enc(&key("Backspace"), &modes), Some(b"\x7f".to_vec()));
    }

    #[test]
    fn test_arrows_normal_and_application() {
        let mut modes = Modes::default();
        assert_eq!(enc(&key("ArrowUp"), &modes), Some(b"\x1b[A".to_vec()));
        modes.app_cursor = true;
        assert_eq!(enc(&key("ArrowUp"), &modes), Some(b"\x1bOA".to_vec()));
    }

    #[test]
    fn test_ctrl_letter() {
        let modes = Modes::default();
        let mut ev = key("c");
        ev.ctrl = true;
        assert_eq!(enc(&ev, &modes), Some(vec![0x03]));
    }

    #[test]
    fn test_alt_prefix_gated_by_option_as_alt() {
        let modes = Modes::default();
        let mut ev = key("b");
        ev.alt = true;
        assert_eq!(
            encode_key(&ev, &modes, OptionAsAlt::Both, false),
            Some(b"\x1bb".to_vec())
        );
        // Option-as-Alt off: the client composed the character itself.
        assert_eq!(
            encode_key(&ev, &modes, OptionAsAlt::None, false),
            Some(b"b".to_vec())
        );
    }

    #[test]
    fn test_shift_tab() {
        let modes = Modes::default();
        let mut ev = key("Tab");
        ev.shift = true;
        assert_eq!(enc(&ev, &modes), Some(b"\x1b[Z".to_vec()));
    }

    #[test]
    fn test_modified_arrow() {
        let modes = Modes::default();
        let mut ev = key("ArrowRight");
        ev.ctrl = true;
        assert_eq!(enc(&ev, &modes), Some(b"\x1b[1;5C".to_vec()));
    }

    #[test]
    fn test_function_keys() {
        let modes = Modes::default();
        assert_eq!(enc(&key("F1"), &modes), Some(b"\x1bOP".to_vec()));
        assert_eq!(enc(&key("F5"), &modes), Some(b"\x1b[15~".to_vec()));
        assert_eq!(enc(&key("F12"), &modes), Some(b"\x1b[24~".to_vec()));
        let mut ev = key("F5");
        ev.shift = true;
        assert_eq!(enc(&ev, &modes), Some(b"\x1b[15;2~".to_vec()));
    }

    #[test]
    fn test_release_dropped_without_kitty() {
        let modes = Modes::default();
        assert_eq!(encode_key(&key("a"), &modes, OptionAsAlt::Both, true), None);
    }

    #[test]
    fn test_modify_other_keys_level2() {
        let mut modes = Modes::default();
        modes.modify_other_keys = 2;
        let mut ev = key("a");
        ev.ctrl = true;
        assert_eq!(enc(&ev, &modes), Some(b"\x1b[27;5;97~".to_vec()));
    }

    #[test]
    fn test_kitty_disambiguate() {
        let mut modes = Modes::default();
        modes.kitty_flags = kitty::DISAMBIGUATE;
        // Plain text keys stay plain.
        assert_eq!(enc(&key("a"), &modes), Some(b"a".to_vec()));
        // Ctrl combos become CSI u.
        let mut ev = key("a");
        ev.ctrl = true;
        assert_eq!(enc(&ev, &modes), Some(b"\x1b[97;5u".to_vec()));
        // Escape is unambiguous now.
        assert_eq!(enc(&key("Escape"), &modes), Some(b"\x1b[27;1u".to_vec()));
    }

    #[test]
    fn test_kitty_release_events() {
        let mut modes = Modes::default();
        modes.kitty_flags = kitty::DISAMBIGUATE | kitty::REPORT_EVENT_TYPES;
        let mut ev = key("a");
        ev.ctrl = true;
        assert_eq!(
            encode_key(&ev, &modes, OptionAsAlt::Both, true),
            Some(b"\x1b[97;5:3u".to_vec())
        );
    }

    #[test]
    fn test_kitty_report_all() {
        let mut modes = Modes::default();
        modes.kitty_flags = kitty::REPORT_ALL_KEYS_AS_ESCAPE;
        assert_eq!(enc(&key("a"), &modes), Some(b"\x1b[97;1u".to_vec()));
    }

    #[test]
    fn test_option_as_alt_parse() {
        assert_eq!(OptionAsAlt::parse("true"), OptionAsAlt::Both);
        assert_eq!(OptionAsAlt::parse("left"), OptionAsAlt::Left);
        assert_eq!(OptionAsAlt::parse("false"), OptionAsAlt::None);
        assert!(!OptionAsAlt::parse("nonsense").active());
    }
}
