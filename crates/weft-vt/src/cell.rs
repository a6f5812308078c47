use crate::style::Style;

/// One grid cell.
///
/// A wide character occupies two columns: the head cell carries the
/// character with `width == 2`, the following column holds a spacer tail
/// (`width == 0`) that is never emitted on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Base codepoint.
    ch: char,
    /// Full grapheme cluster when zero-width marks were attached.
    cluster: Option<Box<str>>,
    pub style: Style,
    /// 0 = spacer tail, 1 = normal, 2 = wide head.
    pub width: u8,
    /// Hyperlink ID, 0 = none.
    pub hyperlink: u16,
}

impl Cell {
    pub fn blank(style: Style) -> Self {
        Self {
            ch: ' ',
            cluster: None,
            style,
            width: 1,
            hyperlink: 0,
        }
    }

    pub fn new(ch: char, style: Style, width: u8, hyperlink: u16) -> Self {
        Self {
            ch,
            cluster: None,
            style,
            width,
            hyperlink,
        }
    }

    pub fn spacer_tail(style: Style) -> Self {
        Self {
            ch: ' ',
            cluster: None,
            style,
            width: 0,
            hyperlink: 0,
        }
    }

    pub fn is_spacer_tail(&self) -> bool {
        self.width == 0
    }

    /// Attach a zero-width character (combining mark, variation selector).
    pub fn push_zerowidth(&mut self, zw: char) {
        let mut text = match self.cluster.take() {
            Some(s) => s.into_string(),
            None => self.ch.to_string(),
        };
        text.push(zw);
        self.cluster = Some(text.into_boxed_str());
    }

    /// The cell's character data as written on the wire.
    pub fn text(&self) -> String {
        match &self.cluster {
            Some(s) => s.to_string(),
            None => self.ch.to_string(),
        }
    }

    pub fn ch(&self) -> char {
        self.ch
    }

    /// Content equality, the collapse key for run-length encoding.
    pub fn same_content(&self, other: &Cell) -> bool {
        self.ch == other.ch
            && self.cluster == other.cluster
            && self.width == other.width
            && self.hyperlink == other.hyperlink
    }

    pub fn is_blank_default(&self) -> bool {
        self.ch == ' ' && self.cluster.is_none() && self.style.is_default() && self.hyperlink == 0
    }
}
