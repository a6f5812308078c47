/// Which mouse events the program asked to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseLevel {
    #[default]
    None,
    /// DECSET 9: presses only, no modifiers or releases.
    X10,
    /// DECSET 1000: presses and releases.
    Normal,
    /// DECSET 1002: plus motion while a button is held.
    Button,
    /// DECSET 1003: all motion.
    Any,
}

/// How mouse events are encoded on the PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseFormat {
    /// Legacy single-byte coordinates, capped at 223.
    #[default]
    X10,
    /// DECSET 1005: UTF-8 extended coordinates.
    Utf8,
    /// DECSET 1006: CSI < ... M/m.
    Sgr,
    /// DECSET 1016: SGR with pixel coordinates.
    SgrPixels,
}

/// DECSCUSR cursor shape, collapsed to the three wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorShape {
    #[default]
    Block,
    Beam,
    Underline,
}

impl CursorShape {
    pub fn code(self) -> u8 {
        match self {
            CursorShape::Block => 0,
            CursorShape::Beam => 1,
            CursorShape::Underline => 2,
        }
    }
}

/// Pointer shape requested via OSC 22. Closed set; unknown names are
/// ignored and leave the previous shape in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseShape {
    #[default]
    Default,
    Text,
    Pointer,
    Help,
    Progress,
    Wait,
    Crosshair,
    Cell,
    Move,
    Grab,
    Grabbing,
    NotAllowed,
}

impl MouseShape {
    pub fn name(self) -> &'static str {
        match self {
            MouseShape::Default => "default",
            MouseShape::Text => "text",
            MouseShape::Pointer => "pointer",
            MouseShape::Help => "help",
            MouseShape::Progress => "progress",
            MouseShape::Wait => "wait",
            MouseShape::Crosshair => "crosshair",
            MouseShape::Cell => "cell",
            MouseShape::Move => "move",
            MouseShape::Grab => "grab",
            MouseShape::Grabbing => "grabbing",
            MouseShape::NotAllowed => "not-allowed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "default" => MouseShape::Default,
            "text" => MouseShape::Text,
            "pointer" => MouseShape::Pointer,
            "help" => MouseShape::Help,
            "progress" => MouseShape::Progress,
            "wait" => MouseShape::Wait,
            "crosshair" => MouseShape::Crosshair,
            "cell" => MouseShape::Cell,
            "move" => MouseShape::Move,
            "grab" => MouseShape::Grab,
            "grabbing" => MouseShape::Grabbing,
            "not-allowed" => MouseShape::NotAllowed,
            _ => return None,
        })
    }
}

/// Kitty keyboard protocol flag bits.
pub mod kitty {
    pub const DISAMBIGUATE: u8 = 0b0000_0001;
    pub const REPORT_EVENT_TYPES: u8 = 0b0000_0010;
    pub const REPORT_ALTERNATE_KEYS: u8 = 0b0000_0100;
    pub const REPORT_ALL_KEYS_AS_ESCAPE: u8 = 0b0000_1000;
    pub const REPORT_ASSOCIATED_TEXT: u8 = 0b0001_0000;
    pub const ALL: u8 = 0b0001_1111;
}

/// Terminal mode state read by input encoding and the frame scheduler.
#[derive(Debug, Clone)]
pub struct Modes {
    pub app_cursor: bool,
    pub app_keypad: bool,
    pub insert: bool,
    pub origin: bool,
    pub autowrap: bool,
    pub cursor_visible: bool,
    pub bracketed_paste: bool,
    pub focus_events: bool,
    pub alt_screen: bool,
    pub alternate_scroll: bool,
    /// Mode 2026: the program brackets a multi-write update; rendering is
    /// suppressed until it clears.
    pub synchronized_output: bool,
    /// Mode 2048: report window size changes in-band as CSI 48 t.
    pub in_band_resize: bool,
    pub mouse_level: MouseLevel,
    pub mouse_format: MouseFormat,
    /// XTMODKEYS modifyOtherKeys level (0, 1 or 2).
    pub modify_other_keys: u8,
    pub kitty_flags: u8,
    pub(crate) kitty_stack: Vec<u8>,
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            app_cursor: false,
            app_keypad: false,
            insert: false,
            origin: false,
            autowrap: true,
            cursor_visible: true,
            bracketed_paste: false,
            focus_events: false,
            alt_screen: false,
            alternate_scroll: false,
            synchronized_output: false,
            in_band_resize: false,
            mouse_level: MouseLevel::None,
            mouse_format: MouseFormat::X10,
            modify_other_keys: 0,
            kitty_flags: 0,
            kitty_stack: Vec::new(),
        }
    }
}

impl Modes {
    pub fn mouse_reporting(&self) -> bool {
        self.mouse_level != MouseLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let modes = Modes::default();
        assert!(modes.autowrap);
        assert!(modes.cursor_visible);
        assert!(!modes.mouse_reporting());
        assert_eq!(modes.mouse_format, MouseFormat::X10);
    }

    #[test]
    fn test_mouse_shape_names_roundtrip() {
        for shape in [
            MouseShape::Default,
            MouseShape::Text,
            MouseShape::Pointer,
            MouseShape::Grabbing,
            MouseShape::NotAllowed,
        ] {
            assert_eq!(MouseShape::from_name(shape.name()), Some(shape));
        }
        assert_eq!(MouseShape::from_name("lava-lamp"), None);
    }

    #[test]
    fn test_cursor_shape_codes() {
        assert_eq!(CursorShape::Block.code(), 0);
        assert_eq!(CursorShape::Beam.code(), 1);
        assert_eq!(CursorShape::Underline.code(), 2);
    }
}
