//! The terminal screen model.
//!
//! `Screen` owns the cell grids (primary + alternate), scrollback, cursor,
//! pen, modes, and selection, and implements [`vte::Perform`] so the byte
//! stream from the PTY drives it directly. Callbacks the daemon must react
//! to (title, CWD, OSC color queries, DA1) are collected as [`VtEvent`]s and
//! drained after each `process` call; replies the emulator can answer on its
//! own (DSR, DA2, kitty queries) come back as `VtEvent::PtyReply` bytes.

use std::collections::VecDeque;

use tracing::trace;
use unicode_width::UnicodeWidthChar;
use vte::{Params, Perform};

use crate::cell::Cell;
use crate::modes::{CursorShape, Modes, MouseFormat, MouseLevel, MouseShape, kitty};
use crate::selection::{Granularity, Pin, Selection};
use crate::style::{Color, Rgb, Style, UnderlineStyle};

/// Title and CWD buffers are truncated to this many bytes.
pub const TITLE_LEN_MAX: usize = 4096;
pub const CWD_LEN_MAX: usize = 4096;

/// Which color an OSC query asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorTarget {
    Palette(u8),
    Foreground,
    Background,
    Cursor,
}

impl ColorTarget {
    /// The OSC slot number the query (and its reply) use.
    pub fn osc_slot(self) -> u8 {
        match self {
            ColorTarget::Palette(_) => 4,
            ColorTarget::Foreground => 10,
            ColorTarget::Background => 11,
            ColorTarget::Cursor => 12,
        }
    }
}

/// Callbacks surfaced to the PTY supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VtEvent {
    TitleChanged,
    CwdChanged,
    ColorQuery(ColorTarget),
    /// DA1 was requested. The reply is deferred by the supervisor until
    /// outstanding color queries settle.
    PrimaryDeviceAttributes,
    /// Bytes the emulator answers itself; written to the PTY master.
    PtyReply(Vec<u8>),
    Bell,
}

/// Row-granular dirty tracking consumed by the redraw builder.
#[derive(Debug, Clone)]
pub struct Damage {
    full: bool,
    rows: Vec<bool>,
    /// Non-grid state changed: cursor, title, shapes, selection.
    other: bool,
}

impl Damage {
    fn new(rows: usize) -> Self {
        Self {
            full: true,
            rows: vec![true; rows],
            other: true,
        }
    }

    fn mark_row(&mut self, row: usize) {
        if let Some(slot) = self.rows.get_mut(row) {
            *slot = true;
        }
    }

    fn mark_rows(&mut self, from: usize, to: usize) {
        for row in from..=to {
            self.mark_row(row);
        }
    }

    fn mark_all(&mut self) {
        self.full = true;
        self.rows.iter_mut().for_each(|r| *r = true);
        self.other = true;
    }

    fn mark_other(&mut self) {
        self.other = true;
    }

    fn resize(&mut self, rows: usize) {
        self.rows.resize(rows, true);
        self.mark_all();
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn row_dirty(&self, row: usize) -> bool {
        self.full || self.rows.get(row).copied().unwrap_or(false)
    }

    pub fn any(&self) -> bool {
        self.full || self.other || self.rows.iter().any(|r| *r)
    }

    pub fn clear(&mut self) {
        self.full = false;
        self.other = false;
        self.rows.iter_mut().for_each(|r| *r = false);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    row: usize,
    col: usize,
    pending_wrap: bool,
}

#[derive(Debug, Clone, Copy)]
struct SavedCursor {
    row: usize,
    col: usize,
    pen: Style,
    origin: bool,
    charsets: [Charset; 2],
    active_charset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Charset {
    #[default]
    Ascii,
    DecGraphics,
}

/// DEC special graphics for codepoints 0x60..=0x7e.
const DEC_GRAPHICS: [char; 31] = [
    '◆', '▒', '␉', '␌', '␍', '␊', '°', '±', '␤', '␋', '┘', '┐', '┌', '└', '┼', '⎺', '⎻', '─', '⎼',
    '⎽', '├', '┤', '┴', '┬', '│', '≤', '≥', 'π', '≠', '£', '·',
];

fn map_charset(c: char, charset: Charset) -> char {
    match charset {
        Charset::Ascii => c,
        Charset::DecGraphics => {
            if ('`'..='~').contains(&c) {
                DEC_GRAPHICS[c as usize - 0x60]
            } else {
                c
            }
        }
    }
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
}

pub struct Screen {
    rows: usize,
    cols: usize,
    grid: Vec<Vec<Cell>>,
    alt_grid: Vec<Vec<Cell>>,
    scrollback: VecDeque<Vec<Cell>>,
    scrollback_max: usize,
    /// Lines scrolled back into history; 0 = live view.
    display_offset: usize,
    cursor: Cursor,
    saved_cursor: Option<SavedCursor>,
    pen: Style,
    /// Current pen hyperlink ID; 0 = none.
    hyperlink: u16,
    hyperlinks: Vec<String>,
    scroll_top: usize,
    scroll_bottom: usize,
    modes: Modes,
    cursor_shape: CursorShape,
    mouse_shape: MouseShape,
    title: Option<String>,
    title_dirty: bool,
    cwd: Option<String>,
    selection: Option<Selection>,
    charsets: [Charset; 2],
    active_charset: usize,
    last_printed: Option<char>,
    damage: Damage,
    events: VecDeque<VtEvent>,
}

impl Screen {
    pub fn new(rows: u16, cols: u16, scrollback_max: usize) -> Self {
        let rows = rows.max(1) as usize;
        let cols = cols.max(1) as usize;
        let blank_row = vec![Cell::blank(Style::default()); cols];
        Self {
            rows,
            cols,
            grid: vec![blank_row.clone(); rows],
            alt_grid: vec![blank_row; rows],
            scrollback: VecDeque::new(),
            scrollback_max,
            display_offset: 0,
            cursor: Cursor::default(),
            saved_cursor: None,
            pen: Style::default(),
            hyperlink: 0,
            hyperlinks: Vec::new(),
            scroll_top: 0,
            scroll_bottom: rows - 1,
            modes: Modes::default(),
            cursor_shape: CursorShape::default(),
            mouse_shape: MouseShape::default(),
            title: None,
            title_dirty: false,
            cwd: None,
            selection: None,
            charsets: [Charset::Ascii; 2],
            active_charset: 0,
            last_printed: None,
            damage: Damage::new(rows),
            events: VecDeque::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn modes(&self) -> &Modes {
        &self.modes
    }

    pub fn cursor_pos(&self) -> (usize, usize) {
        (self.cursor.row, self.cursor.col)
    }

    pub fn cursor_visible(&self) -> bool {
        self.modes.cursor_visible
    }

    pub fn cursor_shape(&self) -> CursorShape {
        self.cursor_shape
    }

    pub fn mouse_shape(&self) -> MouseShape {
        self.mouse_shape
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn title_dirty(&self) -> bool {
        self.title_dirty
    }

    pub fn clear_title_dirty(&mut self) {
        self.title_dirty = false;
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn hyperlink_uri(&self, id: u16) -> Option<&str> {
        if id == 0 {
            None
        } else {
            self.hyperlinks.get(id as usize - 1).map(|s| s.as_str())
        }
    }

    pub fn damage(&self) -> &Damage {
        &self.damage
    }

    pub fn damage_clear(&mut self) {
        self.damage.clear();
    }

    pub fn take_events(&mut self) -> Vec<VtEvent> {
        self.events.drain(..).collect()
    }

    fn push_event(&mut self, event: VtEvent) {
        self.events.push_back(event);
    }

    // --- Grid access -----------------------------------------------------

    fn active(&mut self) -> &mut Vec<Vec<Cell>> {
        if self.modes.alt_screen {
            &mut self.alt_grid
        } else {
            &mut self.grid
        }
    }

    fn active_ref(&self) -> &Vec<Vec<Cell>> {
        if self.modes.alt_screen {
            &self.alt_grid
        } else {
            &self.grid
        }
    }

    /// The row shown at viewport line `vrow`, honoring the display offset.
    pub fn viewport_row(&self, vrow: usize) -> &[Cell] {
        if !self.modes.alt_screen && self.display_offset > 0 {
            if vrow < self.display_offset {
                let idx = self.scrollback.len() - self.display_offset + vrow;
                return &self.scrollback[idx];
            }
            return &self.grid[vrow - self.display_offset];
        }
        &self.active_ref()[vrow]
    }

    pub fn display_offset(&self) -> usize {
        self.display_offset
    }

    /// Scroll the viewport into history (positive) or back toward live
    /// (negative). No-op on the alternate screen.
    pub fn scroll_display(&mut self, delta: isize) {
        if self.modes.alt_screen {
            return;
        }
        let max = self.scrollback.len();
        let next = if delta >= 0 {
            self.display_offset.saturating_add(delta as usize).min(max)
        } else {
            self.display_offset.saturating_sub(delta.unsigned_abs())
        };
        if next != self.display_offset {
            self.display_offset = next;
            self.damage.mark_all();
        }
    }

    fn blank_cell(&self) -> Cell {
        // Erased cells keep the pen background, per BCE.
        let style = Style {
            bg: self.pen.bg,
            ..Style::default()
        };
        Cell::blank(style)
    }

    fn blank_row(&self) -> Vec<Cell> {
        vec![self.blank_cell(); self.cols]
    }

    // --- Printing --------------------------------------------------------

    fn print_char(&mut self, c: char) {
        let c = map_charset(c, self.charsets[self.active_charset]);
        let width = UnicodeWidthChar::width(c).unwrap_or(0);

        if width == 0 {
            let col = if self.cursor.pending_wrap {
                self.cursor.col
            } else {
                self.cursor.col.saturating_sub(1)
            };
            let row = self.cursor.row;
            if let Some(cell) = self.active().get_mut(row).and_then(|r| r.get_mut(col)) {
                cell.push_zerowidth(c);
            }
            self.damage.mark_row(row);
            return;
        }

        if self.cursor.pending_wrap {
            if self.modes.autowrap {
                self.cursor.pending_wrap = false;
                self.cursor.col = 0;
                self.linefeed();
            } else {
                self.cursor.pending_wrap = false;
            }
        }

        // A wide char that does not fit in the remaining columns wraps early.
        if width == 2 && self.cursor.col + 1 >= self.cols {
            if self.modes.autowrap {
                let (row, col) = (self.cursor.row, self.cursor.col);
                let blank = self.blank_cell();
                self.active()[row][col] = blank;
                self.cursor.col = 0;
                self.linefeed();
            } else {
                return;
            }
        }

        let row = self.cursor.row;
        let col = self.cursor.col;

        if self.modes.insert {
            let width = width.min(self.cols - col);
            let line = &mut self.active()[row];
            for _ in 0..width {
                line.pop();
            }
            for _ in 0..width {
                line.insert(col, Cell::blank(Style::default()));
            }
        }

        self.fixup_wide_overwrite(row, col);
        if width == 2 {
            self.fixup_wide_overwrite(row, col + 1);
        }

        let cell = Cell::new(c, self.pen, width as u8, self.hyperlink);
        self.active()[row][col] = cell;
        if width == 2 {
            let tail = Cell::spacer_tail(self.pen);
            self.active()[row][col + 1] = tail;
        }

        let end = col + width;
        if end >= self.cols {
            self.cursor.col = self.cols - 1;
            self.cursor.pending_wrap = true;
        } else {
            self.cursor.col = end;
        }

        self.last_printed = Some(c);
        self.damage.mark_row(row);
    }

    /// Overwriting half of a wide character blanks the other half.
    fn fixup_wide_overwrite(&mut self, row: usize, col: usize) {
        let (is_tail, is_head) = {
            let line = &self.active_ref()[row];
            let cell = &line[col];
            (cell.is_spacer_tail(), cell.width == 2)
        };
        if is_tail && col > 0 {
            let blank = self.blank_cell();
            self.active()[row][col - 1] = blank;
        }
        if is_head && col + 1 < self.cols {
            let blank = self.blank_cell();
            self.active()[row][col + 1] = blank;
        }
    }

    // --- Cursor and scrolling -------------------------------------------

    fn clamp_cursor(&mut self) {
        self.cursor.row = self.cursor.row.min(self.rows - 1);
        self.cursor.col = self.cursor.col.min(self.cols - 1);
    }

    fn move_cursor(&mut self, row: usize, col: usize) {
        self.cursor.row = row.min(self.rows - 1);
        self.cursor.col = col.min(self.cols - 1);
        self.cursor.pending_wrap = false;
        self.damage.mark_other();
    }

    fn linefeed(&mut self) {
        if self.cursor.row == self.scroll_bottom {
            self.scroll_up(1);
        } else if self.cursor.row + 1 < self.rows {
            self.cursor.row += 1;
        }
        self.damage.mark_other();
    }

    fn reverse_index(&mut self) {
        if self.cursor.row == self.scroll_top {
            self.scroll_down(1);
        } else if self.cursor.row > 0 {
            self.cursor.row -= 1;
        }
        self.damage.mark_other();
    }

    fn scroll_up(&mut self, n: usize) {
        let region_len = self.scroll_bottom - self.scroll_top + 1;
        let n = n.min(region_len);
        let full_region = self.scroll_top == 0 && self.scroll_bottom == self.rows - 1;
        for _ in 0..n {
            let scroll_top = self.scroll_top;
            let removed = self.active().remove(scroll_top);
            if full_region && !self.modes.alt_screen && self.scrollback_max > 0 {
                if self.scrollback.len() >= self.scrollback_max {
                    self.scrollback.pop_front();
                    self.display_offset = self.display_offset.min(self.scrollback.len());
                }
                self.scrollback.push_back(removed);
                // A scrolled-back viewport stays pinned on the same content.
                if self.display_offset > 0 {
                    self.display_offset = (self.display_offset + 1).min(self.scrollback.len());
                }
            }
            let blank = self.blank_row();
            let scroll_bottom = self.scroll_bottom;
            self.active().insert(scroll_bottom, blank);
        }
        self.damage.mark_rows(self.scroll_top, self.scroll_bottom);
    }

    fn scroll_down(&mut self, n: usize) {
        let region_len = self.scroll_bottom - self.scroll_top + 1;
        let n = n.min(region_len);
        for _ in 0..n {
            let scroll_bottom = self.scroll_bottom;
            self.active().remove(scroll_bottom);
            let blank = self.blank_row();
            let scroll_top = self.scroll_top;
            self.active().insert(scroll_top, blank);
        }
        self.damage.mark_rows(self.scroll_top, self.scroll_bottom);
    }

    // --- Erase / edit ----------------------------------------------------

    fn erase_in_display(&mut self, mode: u16) {
        let row = self.cursor.row;
        match mode {
            0 => {
                self.erase_in_line(0);
                for r in row + 1..self.rows {
                    let blank = self.blank_row();
                    self.active()[r] = blank;
                }
                self.damage.mark_rows(row, self.rows - 1);
            }
            1 => {
                self.erase_in_line(1);
                for r in 0..row {
                    let blank = self.blank_row();
                    self.active()[r] = blank;
                }
                self.damage.mark_rows(0, row);
            }
            2 => {
                for r in 0..self.rows {
                    let blank = self.blank_row();
                    self.active()[r] = blank;
                }
                self.damage.mark_all();
            }
            3 => {
                for r in 0..self.rows {
                    let blank = self.blank_row();
                    self.active()[r] = blank;
                }
                self.scrollback.clear();
                self.display_offset = 0;
                self.damage.mark_all();
            }
            _ => {}
        }
        self.cursor.pending_wrap = false;
    }

    fn erase_in_line(&mut self, mode: u16) {
        let (row, col) = (self.cursor.row, self.cursor.col);
        let cols = self.cols;
        let blank = self.blank_cell();
        let line = &mut self.active()[row];
        let range = match mode {
            0 => col..cols,
            1 => 0..col + 1,
            2 => 0..cols,
            _ => return,
        };
        for cell in &mut line[range] {
            *cell = blank.clone();
        }
        self.damage.mark_row(row);
        self.cursor.pending_wrap = false;
    }

    fn insert_lines(&mut self, n: usize) {
        if self.cursor.row < self.scroll_top || self.cursor.row > self.scroll_bottom {
            return;
        }
        let n = n.min(self.scroll_bottom - self.cursor.row + 1);
        let row = self.cursor.row;
        for _ in 0..n {
            let scroll_bottom = self.scroll_bottom;
            self.active().remove(scroll_bottom);
            let blank = self.blank_row();
            self.active().insert(row, blank);
        }
        self.damage.mark_rows(row, self.scroll_bottom);
    }

    fn delete_lines(&mut self, n: usize) {
        if self.cursor.row < self.scroll_top || self.cursor.row > self.scroll_bottom {
            return;
        }
        let n = n.min(self.scroll_bottom - self.cursor.row + 1);
        let row = self.cursor.row;
        for _ in 0..n {
            self.active().remove(row);
            let blank = self.blank_row();
            let scroll_bottom = self.scroll_bottom;
            self.active().insert(scroll_bottom, blank);
        }
        self.damage.mark_rows(row, self.scroll_bottom);
    }

    fn insert_chars(&mut self, n: usize) {
        let (row, col) = (self.cursor.row, self.cursor.col);
        let n = n.min(self.cols - col);
        let blank = self.blank_cell();
        let line = &mut self.active()[row];
        for _ in 0..n {
            line.pop();
            line.insert(col, blank.clone());
        }
        self.damage.mark_row(row);
    }

    fn delete_chars(&mut self, n: usize) {
        let (row, col) = (self.cursor.row, self.cursor.col);
        let n = n.min(self.cols - col);
        let blank = self.blank_cell();
        let line = &mut self.active()[row];
        for _ in 0..n {
            line.remove(col);
            line.push(blank.clone());
        }
        self.damage.mark_row(row);
    }

    fn erase_chars(&mut self, n: usize) {
        let (row, col) = (self.cursor.row, self.cursor.col);
        let end = (col + n).min(self.cols);
        let blank = self.blank_cell();
        let line = &mut self.active()[row];
        for cell in &mut line[col..end] {
            *cell = blank.clone();
        }
        self.damage.mark_row(row);
    }

    // --- Resize ----------------------------------------------------------

    pub fn resize(&mut self, rows: u16, cols: u16) {
        let rows = rows.max(1) as usize;
        let cols = cols.max(1) as usize;
        if rows == self.rows && cols == self.cols {
            return;
        }

        for line in self.grid.iter_mut().chain(self.alt_grid.iter_mut()) {
            line.resize(cols, Cell::blank(Style::default()));
        }
        for line in self.scrollback.iter_mut() {
            line.resize(cols, Cell::blank(Style::default()));
        }

        // Shrinking pushes top rows of the primary screen into scrollback;
        // growing pulls them back out.
        while self.grid.len() > rows {
            let removed = self.grid.remove(0);
            if self.scrollback_max > 0 {
                if self.scrollback.len() >= self.scrollback_max {
                    self.scrollback.pop_front();
                }
                self.scrollback.push_back(removed);
            }
            self.cursor.row = self.cursor.row.saturating_sub(1);
        }
        while self.grid.len() < rows {
            match self.scrollback.pop_back() {
                Some(line) => {
                    self.grid.insert(0, line);
                    self.cursor.row += 1;
                }
                None => self.grid.push(vec![Cell::blank(Style::default()); cols]),
            }
        }
        self.alt_grid
            .resize(rows, vec![Cell::blank(Style::default()); cols]);

        self.rows = rows;
        self.cols = cols;
        self.scroll_top = 0;
        self.scroll_bottom = rows - 1;
        self.display_offset = 0;
        self.selection = None;
        self.clamp_cursor();
        self.cursor.pending_wrap = false;
        self.damage.resize(rows);
    }

    // --- Selection -------------------------------------------------------

    fn clamp_pin(&self, pin: Pin) -> Pin {
        Pin::new(pin.row.min(self.rows - 1), pin.col.min(self.cols - 1))
    }

    /// Set the selection from anchor and lead, applying the granularity at
    /// both ends.
    pub fn set_selection(&mut self, anchor: Pin, lead: Pin, granularity: Granularity) {
        let base = Selection::spanning(self.clamp_pin(anchor), self.clamp_pin(lead), granularity);
        let (start, end) = match granularity {
            Granularity::Char => (base.start, base.end),
            Granularity::Word => (self.word_start(base.start), self.word_end(base.end)),
            Granularity::Line => (
                Pin::new(base.start.row, 0),
                Pin::new(base.end.row, self.cols - 1),
            ),
        };
        self.selection = Some(Selection {
            start,
            end,
            granularity,
        });
        self.damage.mark_other();
    }

    pub fn select_word_at(&mut self, pin: Pin) {
        self.set_selection(pin, pin, Granularity::Word);
    }

    pub fn select_line_at(&mut self, pin: Pin) {
        self.set_selection(pin, pin, Granularity::Line);
    }

    pub fn clear_selection(&mut self) {
        if self.selection.take().is_some() {
            self.damage.mark_other();
        }
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn selection_bounds(&self) -> Option<(Pin, Pin)> {
        self.selection.as_ref().map(|s| (s.start, s.end))
    }

    fn is_word_cell(&self, pin: Pin) -> bool {
        let cell = &self.viewport_row(pin.row)[pin.col];
        let c = cell.ch();
        !cell.is_spacer_tail() && (c.is_alphanumeric() || "_-./~".contains(c))
    }

    fn word_start(&self, pin: Pin) -> Pin {
        let mut col = pin.col;
        if !self.is_word_cell(pin) {
            return pin;
        }
        while col > 0 && self.is_word_cell(Pin::new(pin.row, col - 1)) {
            col -= 1;
        }
        Pin::new(pin.row, col)
    }

    fn word_end(&self, pin: Pin) -> Pin {
        let mut col = pin.col;
        if !self.is_word_cell(pin) {
            return pin;
        }
        while col + 1 < self.cols && self.is_word_cell(Pin::new(pin.row, col + 1)) {
            col += 1;
        }
        Pin::new(pin.row, col)
    }

    /// Extract the selected text, rows joined with newlines, trailing
    /// whitespace per row trimmed.
    pub fn selection_to_string(&self) -> Option<String> {
        let sel = self.selection.as_ref()?;
        let mut out = String::new();
        for row in sel.start.row..=sel.end.row {
            let line = self.viewport_row(row);
            let from = if row == sel.start.row { sel.start.col } else { 0 };
            let to = if row == sel.end.row {
                sel.end.col
            } else {
                self.cols - 1
            };
            let mut text = String::new();
            for cell in &line[from..=to.min(self.cols - 1)] {
                if cell.is_spacer_tail() {
                    continue;
                }
                text.push_str(&cell.text());
            }
            if row != sel.start.row {
                out.push('\n');
            }
            out.push_str(text.trim_end());
        }
        Some(out)
    }

    // --- Mode switches ---------------------------------------------------

    fn set_dec_mode(&mut self, mode: u16, enabled: bool) {
        match mode {
            1 => self.modes.app_cursor = enabled,
            6 => {
                self.modes.origin = enabled;
                self.move_cursor(if enabled { self.scroll_top } else { 0 }, 0);
            }
            7 => self.modes.autowrap = enabled,
            9 => self.set_mouse_level(MouseLevel::X10, enabled),
            25 => {
                self.modes.cursor_visible = enabled;
                self.damage.mark_other();
            }
            47 | 1047 => self.set_alt_screen(enabled, false),
            1048 => {
                if enabled {
                    self.save_cursor();
                } else {
                    self.restore_cursor();
                }
            }
            1049 => self.set_alt_screen(enabled, true),
            1000 => self.set_mouse_level(MouseLevel::Normal, enabled),
            1002 => self.set_mouse_level(MouseLevel::Button, enabled),
            1003 => self.set_mouse_level(MouseLevel::Any, enabled),
            1004 => self.modes.focus_events = enabled,
            1005 => self.set_mouse_format(MouseFormat::Utf8, enabled),
            1006 => self.set_mouse_format(MouseFormat::Sgr, enabled),
            1016 => self.set_mouse_format(MouseFormat::SgrPixels, enabled),
            1007 => self.modes.alternate_scroll = enabled,
            2004 => self.modes.bracketed_paste = enabled,
            2026 => self.modes.synchronized_output = enabled,
            2048 => self.modes.in_band_resize = enabled,
            12 => {}
            other => trace!(event = "vt.screen.dec_mode_ignored", mode = other),
        }
    }

    fn set_mouse_level(&mut self, level: MouseLevel, enabled: bool) {
        if enabled {
            self.modes.mouse_level = level;
        } else if self.modes.mouse_level == level {
            self.modes.mouse_level = MouseLevel::None;
        }
    }

    fn set_mouse_format(&mut self, format: MouseFormat, enabled: bool) {
        if enabled {
            self.modes.mouse_format = format;
        } else if self.modes.mouse_format == format {
            self.modes.mouse_format = MouseFormat::X10;
        }
    }

    fn set_alt_screen(&mut self, enabled: bool, save_cursor: bool) {
        if enabled == self.modes.alt_screen {
            return;
        }
        if enabled {
            if save_cursor {
                self.save_cursor();
            }
            self.modes.alt_screen = true;
            let blank = self.blank_row();
            for line in self.alt_grid.iter_mut() {
                *line = blank.clone();
            }
            self.move_cursor(0, 0);
            self.display_offset = 0;
        } else {
            self.modes.alt_screen = false;
            if save_cursor {
                self.restore_cursor();
            }
        }
        self.selection = None;
        self.damage.mark_all();
    }

    fn save_cursor(&mut self) {
        self.saved_cursor = Some(SavedCursor {
            row: self.cursor.row,
            col: self.cursor.col,
            pen: self.pen,
            origin: self.modes.origin,
            charsets: self.charsets,
            active_charset: self.active_charset,
        });
    }

    fn restore_cursor(&mut self) {
        if let Some(saved) = self.saved_cursor {
            self.cursor.row = saved.row.min(self.rows - 1);
            self.cursor.col = saved.col.min(self.cols - 1);
            self.cursor.pending_wrap = false;
            self.pen = saved.pen;
            self.modes.origin = saved.origin;
            self.charsets = saved.charsets;
            self.active_charset = saved.active_charset;
            self.damage.mark_other();
        }
    }

    fn reset(&mut self) {
        let title = self.title.take();
        let cwd = self.cwd.take();
        *self = Screen::new(self.rows as u16, self.cols as u16, self.scrollback_max);
        self.title = title;
        self.cwd = cwd;
    }

    fn soft_reset(&mut self) {
        self.modes.cursor_visible = true;
        self.modes.origin = false;
        self.modes.insert = false;
        self.modes.app_cursor = false;
        self.pen = Style::default();
        self.scroll_top = 0;
        self.scroll_bottom = self.rows - 1;
        self.saved_cursor = None;
        self.damage.mark_other();
    }

    // --- SGR -------------------------------------------------------------

    fn handle_sgr(&mut self, params: &Params) {
        let groups: Vec<Vec<u16>> = params.iter().map(|p| p.to_vec()).collect();
        if groups.is_empty() {
            self.pen = Style::default();
            return;
        }
        let mut i = 0;
        while i < groups.len() {
            let group = &groups[i];
            let code = group.first().copied().unwrap_or(0);
            match code {
                0 => self.pen = Style::default(),
                1 => self.pen.bold = true,
                2 => self.pen.dim = true,
                3 => self.pen.italic = true,
                4 => {
                    self.pen.underline = match group.get(1) {
                        Some(&sub) => UnderlineStyle::from_sgr(sub),
                        None => UnderlineStyle::Single,
                    };
                }
                5 | 6 => self.pen.blink = true,
                7 => self.pen.reverse = true,
                9 => self.pen.strikethrough = true,
                21 => self.pen.underline = UnderlineStyle::Double,
                22 => {
                    self.pen.bold = false;
                    self.pen.dim = false;
                }
                23 => self.pen.italic = false,
                24 => self.pen.underline = UnderlineStyle::None,
                25 => self.pen.blink = false,
                27 => self.pen.reverse = false,
                29 => self.pen.strikethrough = false,
                30..=37 => self.pen.fg = Color::Indexed(code as u8 - 30),
                38 => {
                    if let Some(color) = parse_extended_color(&groups, &mut i) {
                        self.pen.fg = color;
                    }
                }
                39 => self.pen.fg = Color::Default,
                40..=47 => self.pen.bg = Color::Indexed(code as u8 - 40),
                48 => {
                    if let Some(color) = parse_extended_color(&groups, &mut i) {
                        self.pen.bg = color;
                    }
                }
                49 => self.pen.bg = Color::Default,
                58 => {
                    if let Some(color) = parse_extended_color(&groups, &mut i) {
                        self.pen.underline_color = color;
                    }
                }
                59 => self.pen.underline_color = Color::Default,
                90..=97 => self.pen.fg = Color::Indexed(code as u8 - 90 + 8),
                100..=107 => self.pen.bg = Color::Indexed(code as u8 - 100 + 8),
                other => trace!(event = "vt.screen.sgr_ignored", code = other),
            }
            i += 1;
        }
    }

    // --- OSC helpers -----------------------------------------------------

    fn set_title(&mut self, raw: &[&[u8]]) {
        let mut title = raw
            .iter()
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(";");
        truncate_utf8(&mut title, TITLE_LEN_MAX);
        if self.title.as_deref() != Some(title.as_str()) {
            self.title = Some(title);
            self.title_dirty = true;
            self.damage.mark_other();
            self.push_event(VtEvent::TitleChanged);
        }
    }

    fn set_cwd(&mut self, raw: &[u8]) {
        // OSC 7 carries a file:// URL; keep the path portion.
        let text = String::from_utf8_lossy(raw);
        let mut cwd = match text.strip_prefix("file://") {
            Some(rest) => match rest.find('/') {
                Some(idx) => rest[idx..].to_string(),
                None => rest.to_string(),
            },
            None => text.into_owned(),
        };
        truncate_utf8(&mut cwd, CWD_LEN_MAX);
        if self.cwd.as_deref() != Some(cwd.as_str()) {
            self.cwd = Some(cwd);
            self.push_event(VtEvent::CwdChanged);
        }
    }

    fn set_hyperlink(&mut self, uri: &[u8]) {
        if uri.is_empty() {
            self.hyperlink = 0;
            return;
        }
        let uri = String::from_utf8_lossy(uri).into_owned();
        if let Some(idx) = self.hyperlinks.iter().position(|u| *u == uri) {
            self.hyperlink = idx as u16 + 1;
        } else if self.hyperlinks.len() < u16::MAX as usize - 1 {
            self.hyperlinks.push(uri);
            self.hyperlink = self.hyperlinks.len() as u16;
        }
    }

    // --- Kitty keyboard stack --------------------------------------------

    fn kitty_set(&mut self, flags: u8, mode: u16) {
        match mode {
            2 => self.modes.kitty_flags |= flags,
            3 => self.modes.kitty_flags &= !flags,
            _ => self.modes.kitty_flags = flags,
        }
    }

    fn kitty_push(&mut self, flags: u8) {
        self.modes.kitty_stack.push(self.modes.kitty_flags);
        self.modes.kitty_flags = flags & kitty::ALL;
    }

    fn kitty_pop(&mut self, count: usize) {
        for _ in 0..count.max(1) {
            match self.modes.kitty_stack.pop() {
                Some(flags) => self.modes.kitty_flags = flags,
                None => {
                    self.modes.kitty_flags = 0;
                    break;
                }
            }
        }
    }
}

/// SGR 38/48/58 extended color, both the colon form (one group) and the
/// legacy semicolon form (consumes following groups, advancing `i`).
fn parse_extended_color(groups: &[Vec<u16>], i: &mut usize) -> Option<Color> {
    let group = &groups[*i];
    if group.len() > 1 {
        match group[1] {
            5 => group.get(2).map(|&idx| Color::Indexed(idx as u8)),
            2 if group.len() >= 6 => Some(Color::Rgb(Rgb::new(
                group[3] as u8,
                group[4] as u8,
                group[5] as u8,
            ))),
            2 if group.len() >= 5 => Some(Color::Rgb(Rgb::new(
                group[2] as u8,
                group[3] as u8,
                group[4] as u8,
            ))),
            _ => None,
        }
    } else {
        let mode = groups.get(*i + 1).and_then(|g| g.first()).copied();
        match mode {
            Some(5) => {
                let idx = groups.get(*i + 2).and_then(|g| g.first()).copied()?;
                *i += 2;
                Some(Color::Indexed(idx as u8))
            }
            Some(2) => {
                let r = groups.get(*i + 2).and_then(|g| g.first()).copied()?;
                let g = groups.get(*i + 3).and_then(|g| g.first()).copied()?;
                let b = groups.get(*i + 4).and_then(|g| g.first()).copied()?;
                *i += 4;
                Some(Color::Rgb(Rgb::new(r as u8, g as u8, b as u8)))
            }
            _ => None,
        }
    }
}

fn param_or(params: &Params, index: usize, default: u16) -> u16 {
    params
        .iter()
        .nth(index)
        .and_then(|p| p.first())
        .copied()
        .unwrap_or(default)
}

fn param_min1(params: &Params, index: usize) -> usize {
    param_or(params, index, 1).max(1) as usize
}

impl Perform for Screen {
    fn print(&mut self, c: char) {
        self.print_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x07 => self.push_event(VtEvent::Bell),
            0x08 => {
                self.cursor.col = self.cursor.col.saturating_sub(1);
                self.cursor.pending_wrap = false;
                self.damage.mark_other();
            }
            0x09 => {
                let next = ((self.cursor.col / 8) + 1) * 8;
                self.cursor.col = next.min(self.cols - 1);
                self.damage.mark_other();
            }
            0x0a..=0x0c => self.linefeed(),
            0x0d => {
                self.cursor.col = 0;
                self.cursor.pending_wrap = false;
                self.damage.mark_other();
            }
            0x0e => self.active_charset = 1,
            0x0f => self.active_charset = 0,
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        let Some(code) = params.first() else {
            return;
        };
        match *code {
            b"0" | b"2" => self.set_title(&params[1..]),
            b"1" => {}
            b"4" => {
                for pair in params[1..].chunks(2) {
                    if let [index, spec] = pair
                        && *spec == b"?"
                        && let Ok(text) = std::str::from_utf8(index)
                        && let Ok(idx) = text.parse::<u8>()
                    {
                        self.push_event(VtEvent::ColorQuery(ColorTarget::Palette(idx)));
                    }
                }
            }
            b"7" => {
                if let Some(url) = params.get(1) {
                    self.set_cwd(url);
                }
            }
            b"8" => {
                if let Some(uri) = params.get(2) {
                    self.set_hyperlink(uri);
                }
            }
            b"10" | b"11" | b"12" => {
                if params.get(1) == Some(&&b"?"[..]) {
                    let target = match *code {
                        b"10" => ColorTarget::Foreground,
                        b"11" => ColorTarget::Background,
                        _ => ColorTarget::Cursor,
                    };
                    self.push_event(VtEvent::ColorQuery(target));
                }
            }
            b"22" => {
                if let Some(name) = params.get(1)
                    && let Ok(text) = std::str::from_utf8(name)
                    && let Some(shape) = MouseShape::from_name(text)
                {
                    self.mouse_shape = shape;
                    self.damage.mark_other();
                }
            }
            b"133" => {}
            other => {
                trace!(
                    event = "vt.screen.osc_ignored",
                    code = %String::from_utf8_lossy(other),
                );
            }
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        match (intermediates, action) {
            ([], 'A') => {
                let n = param_min1(params, 0);
                self.move_cursor(self.cursor.row.saturating_sub(n), self.cursor.col);
            }
            ([], 'B') | ([], 'e') => {
                let n = param_min1(params, 0);
                self.move_cursor(self.cursor.row + n, self.cursor.col);
            }
            ([], 'C') | ([], 'a') => {
                let n = param_min1(params, 0);
                self.move_cursor(self.cursor.row, self.cursor.col + n);
            }
            ([], 'D') => {
                let n = param_min1(params, 0);
                self.move_cursor(self.cursor.row, self.cursor.col.saturating_sub(n));
            }
            ([], 'E') => {
                let n = param_min1(params, 0);
                self.move_cursor(self.cursor.row + n, 0);
            }
            ([], 'F') => {
                let n = param_min1(params, 0);
                self.move_cursor(self.cursor.row.saturating_sub(n), 0);
            }
            ([], 'G') | ([], '`') => {
                let col = param_min1(params, 0) - 1;
                self.move_cursor(self.cursor.row, col);
            }
            ([], 'H') | ([], 'f') => {
                let mut row = param_min1(params, 0) - 1;
                let col = param_min1(params, 1) - 1;
                if self.modes.origin {
                    row = (row + self.scroll_top).min(self.scroll_bottom);
                }
                self.move_cursor(row, col);
            }
            ([], 'd') => {
                let row = param_min1(params, 0) - 1;
                self.move_cursor(row, self.cursor.col);
            }
            ([], 'J') => self.erase_in_display(param_or(params, 0, 0)),
            ([], 'K') => self.erase_in_line(param_or(params, 0, 0)),
            ([], 'L') => self.insert_lines(param_min1(params, 0)),
            ([], 'M') => self.delete_lines(param_min1(params, 0)),
            ([], '@') => self.insert_chars(param_min1(params, 0)),
            ([], 'P') => self.delete_chars(param_min1(params, 0)),
            ([], 'X') => self.erase_chars(param_min1(params, 0)),
            ([], 'S') => self.scroll_up(param_min1(params, 0)),
            ([], 'T') => self.scroll_down(param_min1(params, 0)),
            ([], 'Z') => {
                let n = param_min1(params, 0);
                let col = (self.cursor.col / 8).saturating_sub(n) * 8;
                self.move_cursor(self.cursor.row, col);
            }
            ([], 'b') => {
                if let Some(c) = self.last_printed {
                    for _ in 0..param_min1(params, 0) {
                        self.print_char(c);
                    }
                }
            }
            ([], 'r') => {
                let top = param_min1(params, 0) - 1;
                let bottom = param_or(params, 1, self.rows as u16).max(1) as usize - 1;
                if top < bottom && bottom < self.rows {
                    self.scroll_top = top;
                    self.scroll_bottom = bottom;
                    self.move_cursor(if self.modes.origin { top } else { 0 }, 0);
                }
            }
            ([], 'm') => self.handle_sgr(params),
            ([], 'h') => {
                if param_or(params, 0, 0) == 4 {
                    self.modes.insert = true;
                }
            }
            ([], 'l') => {
                if param_or(params, 0, 0) == 4 {
                    self.modes.insert = false;
                }
            }
            ([], 'n') => match param_or(params, 0, 0) {
                5 => self.push_event(VtEvent::PtyReply(b"\x1b[0n".to_vec())),
                6 => {
                    let row = if self.modes.origin {
                        self.cursor.row - self.scroll_top
                    } else {
                        self.cursor.row
                    };
                    let reply = format!("\x1b[{};{}R", row + 1, self.cursor.col + 1);
                    self.push_event(VtEvent::PtyReply(reply.into_bytes()));
                }
                _ => {}
            },
            ([], 'c') => {
                if param_or(params, 0, 0) == 0 {
                    self.push_event(VtEvent::PrimaryDeviceAttributes);
                }
            }
            ([b'>'], 'c') => {
                self.push_event(VtEvent::PtyReply(b"\x1b[>0;0;0c".to_vec()));
            }
            ([b'?'], 'h') => {
                for group in params.iter() {
                    if let Some(&mode) = group.first() {
                        self.set_dec_mode(mode, true);
                    }
                }
            }
            ([b'?'], 'l') => {
                for group in params.iter() {
                    if let Some(&mode) = group.first() {
                        self.set_dec_mode(mode, false);
                    }
                }
            }
            ([b' '], 'q') => {
                self.cursor_shape = match param_or(params, 0, 0) {
                    0..=2 => CursorShape::Block,
                    3 | 4 => CursorShape::Underline,
                    5 | 6 => CursorShape::Beam,
                    _ => self.cursor_shape,
                };
                self.damage.mark_other();
            }
            ([b'>'], 'm') => {
                if param_or(params, 0, 0) == 4 {
                    self.modes.modify_other_keys = param_or(params, 1, 0).min(2) as u8;
                }
            }
            ([b'='], 'u') => {
                let flags = param_or(params, 0, 0) as u8 & kitty::ALL;
                self.kitty_set(flags, param_or(params, 1, 1));
            }
            ([b'>'], 'u') => self.kitty_push(param_or(params, 0, 0) as u8),
            ([b'<'], 'u') => self.kitty_pop(param_or(params, 0, 1) as usize),
            ([b'?'], 'u') => {
                let reply = format!("\x1b[?{}u", self.modes.kitty_flags);
                self.push_event(VtEvent::PtyReply(reply.into_bytes()));
            }
            ([b'!'], 'p') => self.soft_reset(),
            (intermediates, action) => {
                trace!(
                    event = "vt.screen.csi_ignored",
                    action = %action,
                    intermediates = ?intermediates,
                );
            }
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        match (intermediates, byte) {
            ([], b'7') => self.save_cursor(),
            ([], b'8') => self.restore_cursor(),
            ([b'#'], b'8') => {
                let cell = Cell::new('E', Style::default(), 1, 0);
                for row in 0..self.rows {
                    let line = vec![cell.clone(); self.cols];
                    self.active()[row] = line;
                }
                self.damage.mark_all();
            }
            ([], b'D') => self.linefeed(),
            ([], b'E') => {
                self.cursor.col = 0;
                self.linefeed();
            }
            ([], b'M') => self.reverse_index(),
            ([], b'c') => self.reset(),
            ([], b'=') => self.modes.app_keypad = true,
            ([], b'>') => self.modes.app_keypad = false,
            ([b'('], b'0') => self.charsets[0] = Charset::DecGraphics,
            ([b'('], b'B') => self.charsets[0] = Charset::Ascii,
            ([b')'], b'0') => self.charsets[1] = Charset::DecGraphics,
            ([b')'], b'B') => self.charsets[1] = Charset::Ascii,
            ([], b'\\') => {}
            (intermediates, byte) => {
                trace!(
                    event = "vt.screen.esc_ignored",
                    byte = byte,
                    intermediates = ?intermediates,
                );
            }
        }
    }
}

/// A `Screen` paired with its escape-sequence parser.
///
/// This is the unit the PTY supervisor protects with the terminal lock.
pub struct Terminal {
    parser: vte::Parser,
    screen: Screen,
}

impl Terminal {
    pub fn new(rows: u16, cols: u16, scrollback_max: usize) -> Self {
        Self {
            parser: vte::Parser::new(),
            screen: Screen::new(rows, cols, scrollback_max),
        }
    }

    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.screen, bytes);
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn screen_mut(&mut self) -> &mut Screen {
        &mut self.screen
    }
}
