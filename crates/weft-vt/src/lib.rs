pub mod cell;
pub mod keyboard;
pub mod modes;
pub mod mouse;
pub mod screen;
pub mod selection;
pub mod style;

// Primary re-exports
pub use cell::Cell;
pub use keyboard::{KeyEvent, OptionAsAlt, encode_key};
pub use modes::{CursorShape, Modes, MouseFormat, MouseLevel, MouseShape};
pub use mouse::{MouseButton, MouseEvent, MouseEventKind, encode_mouse};
pub use screen::{CWD_LEN_MAX, ColorTarget, Screen, TITLE_LEN_MAX, Terminal, VtEvent};
pub use selection::{Granularity, Pin, Selection};
pub use style::{Color, Rgb, Style, UnderlineStyle};
