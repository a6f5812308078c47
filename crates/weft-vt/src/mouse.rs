//! Mouse-event → PTY byte encoding.
//!
//! Events arrive from clients in floating-point cell units; the active
//! mouse level gates which events are reported at all, and the format
//! decides the wire shape (legacy X10 bytes, UTF-8 extended, SGR, or SGR
//! with pixel coordinates).

use crate::modes::{Modes, MouseFormat, MouseLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    /// Motion with no button held.
    None,
    WheelUp,
    WheelDown,
}

impl MouseButton {
    pub fn from_wire(n: u64) -> Option<Self> {
        Some(match n {
            0 => MouseButton::Left,
            1 => MouseButton::Middle,
            2 => MouseButton::Right,
            3 => MouseButton::None,
            4 => MouseButton::WheelUp,
            5 => MouseButton::WheelDown,
            _ => return None,
        })
    }

    pub fn is_wheel(self) -> bool {
        matches!(self, MouseButton::WheelUp | MouseButton::WheelDown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEventKind {
    Press,
    Release,
    Motion,
}

impl MouseEventKind {
    pub fn from_wire(n: u64) -> Option<Self> {
        Some(match n {
            0 => MouseEventKind::Press,
            1 => MouseEventKind::Release,
            2 => MouseEventKind::Motion,
            _ => return None,
        })
    }
}

/// Modifier bits as carried on the wire (matching the key-event encoding).
pub mod mods {
    pub const SHIFT: u8 = 1;
    pub const ALT: u8 = 2;
    pub const CTRL: u8 = 4;
    pub const META: u8 = 8;
}

#[derive(Debug, Clone, Copy)]
pub struct MouseEvent {
    /// Cell coordinates, 0-based, fractional.
    pub col: f32,
    pub row: f32,
    pub button: MouseButton,
    pub kind: MouseEventKind,
    pub mods: u8,
}

/// Encode a mouse event per the terminal's reporting level and format.
/// Returns `None` when the current level does not report this event.
pub fn encode_mouse(
    event: &MouseEvent,
    modes: &Modes,
    cell_width: u16,
    cell_height: u16,
) -> Option<Vec<u8>> {
    match modes.mouse_level {
        MouseLevel::None => return None,
        MouseLevel::X10 => {
            if event.kind != MouseEventKind::Press || event.button.is_wheel() {
                return None;
            }
        }
        MouseLevel::Normal => {
            if event.kind == MouseEventKind::Motion {
                return None;
            }
        }
        MouseLevel::Button => {
            if event.kind == MouseEventKind::Motion && event.button == MouseButton::None {
                return None;
            }
        }
        MouseLevel::Any => {}
    }

    // Wheel release is never reported.
    if event.button.is_wheel() && event.kind == MouseEventKind::Release {
        return None;
    }

    let sgr = matches!(
        modes.mouse_format,
        MouseFormat::Sgr | MouseFormat::SgrPixels
    );

    let mut cb: u32 = match event.button {
        MouseButton::Left => 0,
        MouseButton::Middle => 1,
        MouseButton::Right => 2,
        MouseButton::None => 3,
        MouseButton::WheelUp => 64,
        MouseButton::WheelDown => 65,
    };
    // Non-SGR formats cannot distinguish which button was released.
    if event.kind == MouseEventKind::Release && !sgr {
        cb = 3;
    }
    if event.kind == MouseEventKind::Motion {
        cb += 32;
    }
    // X10 level predates modifier reporting.
    if modes.mouse_level != MouseLevel::X10 {
        if event.mods & mods::SHIFT != 0 {
            cb += 4;
        }
        if event.mods & mods::META != 0 || event.mods & mods::ALT != 0 {
            cb += 8;
        }
        if event.mods & mods::CTRL != 0 {
            cb += 16;
        }
    }

    let col = event.col.max(0.0) as u32;
    let row = event.row.max(0.0) as u32;

    let bytes = match modes.mouse_format {
        MouseFormat::Sgr => {
            let terminator = if event.kind == MouseEventKind::Release {
                'm'
            } else {
                'M'
            };
            format!("\x1b[<{};{};{}{}", cb, col + 1, row + 1, terminator).into_bytes()
        }
        MouseFormat::SgrPixels => {
            let px = (event.col * f32::from(cell_width.max(1))) as u32 + 1;
            let py = (event.row * f32::from(cell_height.max(1))) as u32 + 1;
            let terminator = if event.kind == MouseEventKind::Release {
                'm'
            } else {
                'M'
            };
            format!("\x1b[<{};{};{}{}", cb, px, py, terminator).into_bytes()
        }
        MouseFormat::X10 => {
            let mut out = b"\x1b[M".to_vec();
            out.push(32 + cb.min(223) as u8);
            out.push(32 + (col + 1).min(223) as u8);
            out.push(32 + (row + 1).min(223) as u8);
            out
        }
        MouseFormat::Utf8 => {
            let mut out = b"\x1b[M".to_vec();
            push_utf8_coord(&mut out, 32 + cb.min(2015));
            push_utf8_coord(&mut out, 32 + (col + 1).min(2015));
            push_utf8_coord(&mut out, 32 + (row + 1).min(2015));
            out
        }
    };
    Some(bytes)
}

fn push_utf8_coord(out: &mut Vec<u8>, value: u32) {
    if value < 128 {
        out.push(value as u8);
    } else if let Some(c) = char::from_u32(value) {
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
}
