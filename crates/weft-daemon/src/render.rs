//! Redraw builder.
//!
//! Turns the screen's dirty state into one `redraw` notification: a list of
//! `[name, [args…]]` events ending in `flush`. Style IDs are scoped to the
//! frame (0 is the reserved default); adjacent cells with identical
//! content and style collapse into a single entry with a repeat count.

use std::collections::{HashMap, HashSet};

use rmpv::Value;
use weft_vt::style::{Color, Style, UnderlineStyle};
use weft_vt::{Screen, TITLE_LEN_MAX};

fn event(name: &str, args: Vec<Value>) -> Value {
    Value::Array(vec![Value::from(name), Value::Array(args)])
}

struct StyleInterner {
    map: HashMap<Style, u64>,
    next: u64,
}

impl StyleInterner {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            next: 1,
        }
    }

    /// Resolve a style to its frame-local ID, emitting a `style` event on
    /// first sight. ID 0 is the pre-declared default.
    fn intern(&mut self, style: Style, events: &mut Vec<Value>) -> u64 {
        if style.is_default() {
            return 0;
        }
        if let Some(&id) = self.map.get(&style) {
            return id;
        }
        let id = self.next;
        self.next += 1;
        self.map.insert(style, id);
        events.push(event("style", vec![Value::from(id), style_value(&style)]));
        id
    }
}

fn style_value(style: &Style) -> Value {
    let mut map: Vec<(Value, Value)> = Vec::new();
    match style.fg {
        Color::Default => {}
        Color::Indexed(idx) => map.push((Value::from("fg_idx"), Value::from(idx))),
        Color::Rgb(rgb) => map.push((Value::from("fg"), Value::from(rgb.packed()))),
    }
    match style.bg {
        Color::Default => {}
        Color::Indexed(idx) => map.push((Value::from("bg_idx"), Value::from(idx))),
        Color::Rgb(rgb) => map.push((Value::from("bg"), Value::from(rgb.packed()))),
    }
    for (name, set) in [
        ("bold", style.bold),
        ("dim", style.dim),
        ("italic", style.italic),
        ("reverse", style.reverse),
        ("blink", style.blink),
        ("strikethrough", style.strikethrough),
    ] {
        if set {
            map.push((Value::from(name), Value::from(true)));
        }
    }
    if style.underline != UnderlineStyle::None {
        map.push((Value::from("underline"), Value::from(true)));
        map.push((Value::from("ul_style"), Value::from(style.underline.code())));
    }
    match style.underline_color {
        Color::Default => {}
        Color::Indexed(idx) => map.push((Value::from("ul_idx"), Value::from(idx))),
        Color::Rgb(rgb) => map.push((Value::from("ul_color"), Value::from(rgb.packed()))),
    }
    Value::Map(map)
}

struct Run {
    text: String,
    style_id: u64,
    width: u8,
    hyperlink: u16,
    count: u64,
}

/// Build one cell entry `[grapheme, style_id?, repeat?, width?,
/// hyperlink_id?]`, nil-carrying the style and trimming trailing nils.
fn run_entry(run: &Run, prev_style: &mut Option<u64>) -> Value {
    let style_val = if *prev_style == Some(run.style_id) {
        Value::Nil
    } else {
        *prev_style = Some(run.style_id);
        Value::from(run.style_id)
    };
    let repeat_val = if run.count >= 2 {
        Value::from(run.count)
    } else {
        Value::Nil
    };
    let width_val = if run.width == 2 {
        Value::from(2u8)
    } else {
        Value::Nil
    };
    let link_val = if run.hyperlink != 0 {
        Value::from(run.hyperlink)
    } else {
        Value::Nil
    };

    let mut entry = vec![
        Value::from(run.text.as_str()),
        style_val,
        repeat_val,
        width_val,
        link_val,
    ];
    while entry.len() > 1 && entry.last().is_some_and(|v| v.is_nil()) {
        entry.pop();
    }
    Value::Array(entry)
}

/// Build the `redraw` notification params for one PTY.
///
/// `full` forces every row (and the `resize` header); otherwise only rows
/// with their dirty bit set are emitted. `consume` clears the dirty state
/// afterwards — a full redraw built for a single newly-attached client
/// passes `consume = false` so other clients still get their incremental
/// frame.
pub fn build_redraw(screen: &mut Screen, pty_id: u64, full: bool, consume: bool) -> Value {
    let full = full || screen.damage().is_full();
    let mut events: Vec<Value> = Vec::new();
    let mut interner = StyleInterner::new();
    let mut declared_links: HashSet<u16> = HashSet::new();

    if full {
        events.push(event(
            "resize",
            vec![
                Value::from(pty_id),
                Value::from(screen.rows() as u64),
                Value::from(screen.cols() as u64),
            ],
        ));
        // The default style is pre-declared so every frame shape is
        // self-contained.
        events.push(event("style", vec![Value::from(0u8), Value::Map(vec![])]));
    }

    if full || screen.title_dirty() {
        let mut title = screen.title().unwrap_or("").to_string();
        title.truncate(title.len().min(TITLE_LEN_MAX));
        events.push(event(
            "title",
            vec![Value::from(pty_id), Value::from(title)],
        ));
    }

    for row in 0..screen.rows() {
        if !full && !screen.damage().row_dirty(row) {
            continue;
        }

        let mut entries: Vec<Value> = Vec::new();
        let mut prev_style: Option<u64> = None;
        let mut current: Option<Run> = None;

        // Collect the row's runs; style/hyperlink declarations must land
        // in the event list before the row's write does.
        let cells = screen.viewport_row(row);
        for cell in cells {
            if cell.is_spacer_tail() {
                continue;
            }
            let style_id = interner.intern(cell.style, &mut events);
            if cell.hyperlink != 0 && declared_links.insert(cell.hyperlink) {
                let uri = screen.hyperlink_uri(cell.hyperlink).unwrap_or("");
                events.push(event(
                    "hyperlink",
                    vec![Value::from(cell.hyperlink), Value::from(uri)],
                ));
            }
            let text = cell.text();
            let width = cell.width.max(1);
            match &mut current {
                Some(run)
                    if run.text == text
                        && run.style_id == style_id
                        && run.width == width
                        && run.hyperlink == cell.hyperlink =>
                {
                    run.count += 1;
                }
                _ => {
                    if let Some(run) = current.take() {
                        entries.push(run_entry(&run, &mut prev_style));
                    }
                    current = Some(Run {
                        text,
                        style_id,
                        width,
                        hyperlink: cell.hyperlink,
                        count: 1,
                    });
                }
            }
        }
        if let Some(run) = current.take() {
            entries.push(run_entry(&run, &mut prev_style));
        }

        events.push(event(
            "write",
            vec![
                Value::from(pty_id),
                Value::from(row as u64),
                Value::from(0u8),
                Value::Array(entries),
            ],
        ));
    }

    let (cursor_row, cursor_col) = screen.cursor_pos();
    events.push(event(
        "cursor_pos",
        vec![
            Value::from(pty_id),
            Value::from(cursor_row as u64),
            Value::from(cursor_col as u64),
            Value::from(screen.cursor_visible()),
        ],
    ));
    events.push(event(
        "cursor_shape",
        vec![Value::from(pty_id), Value::from(screen.cursor_shape().code())],
    ));
    events.push(event(
        "mouse_shape",
        vec![Value::from(pty_id), Value::from(screen.mouse_shape().name())],
    ));

    let selection_args = match screen.selection_bounds() {
        Some((start, end)) => vec![
            Value::from(pty_id),
            Value::from(start.row as u64),
            Value::from(start.col as u64),
            Value::from(end.row as u64),
            Value::from(end.col as u64),
        ],
        None => vec![
            Value::from(pty_id),
            Value::Nil,
            Value::Nil,
            Value::Nil,
            Value::Nil,
        ],
    };
    events.push(event("selection", selection_args));

    events.push(event("flush", vec![]));

    if consume {
        screen.damage_clear();
        screen.clear_title_dirty();
    }

    Value::Array(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_vt::Terminal;

    fn event_names(frame: &Value) -> Vec<String> {
        frame
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e.as_array().unwrap()[0].as_str().unwrap().to_string())
            .collect()
    }

    fn events_named<'a>(frame: &'a Value, name: &str) -> Vec<&'a Vec<Value>> {
        frame
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e.as_array().unwrap()[0].as_str() == Some(name))
            .map(|e| e.as_array().unwrap()[1].as_array().unwrap())
            .collect()
    }

    #[test]
    fn test_full_redraw_shape() {
        let mut term = Terminal::new(4, 10, 100);
        term.process(b"hi");
        let frame = build_redraw(term.screen_mut(), 0, true, true);
        let names = event_names(&frame);

        assert_eq!(names[0], "resize");
        assert!(names.contains(&"style".to_string()));
        assert_eq!(names.iter().filter(|n| *n == "write").count(), 4);
        assert!(names.contains(&"cursor_pos".to_string()));
        assert!(names.contains(&"cursor_shape".to_string()));
        assert!(names.contains(&"mouse_shape".to_string()));
        assert!(names.contains(&"selection".to_string()));
        assert_eq!(names.last().unwrap(), "flush");

        let resize = events_named(&frame, "resize")[0];
        assert_eq!(resize[1].as_u64(), Some(4));
        assert_eq!(resize[2].as_u64(), Some(10));

        // Style 0 is declared.
        let styles = events_named(&frame, "style");
        assert_eq!(styles[0][0].as_u64(), Some(0));
    }

    #[test]
    fn test_incremental_emits_only_dirty_rows() {
        let mut term = Terminal::new(4, 10, 100);
        term.process(b"a");
        let _ = build_redraw(term.screen_mut(), 0, true, true);
        term.process(b"\x1b[3;1Hx");
        let frame = build_redraw(term.screen_mut(), 0, false, true);
        let writes = events_named(&frame, "write");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][1].as_u64(), Some(2));
    }

    #[test]
    fn test_consume_false_preserves_damage() {
        let mut term = Terminal::new(4, 10, 100);
        term.process(b"text");
        let _ = build_redraw(term.screen_mut(), 0, true, false);
        assert!(term.screen().damage().any());
        let _ = build_redraw(term.screen_mut(), 0, true, true);
        assert!(!term.screen().damage().any());
    }

    #[test]
    fn test_run_length_collapse() {
        let mut term = Terminal::new(1, 10, 0);
        term.process(b"aaab");
        let frame = build_redraw(term.screen_mut(), 0, true, true);
        let writes = events_named(&frame, "write");
        let cells = writes[0][3].as_array().unwrap();
        // Runs: "a"x3, "b", " "x6 — no adjacent pair left collapsible.
        assert_eq!(cells.len(), 3);
        let first = cells[0].as_array().unwrap();
        assert_eq!(first[0].as_str(), Some("a"));
        assert_eq!(first[1].as_u64(), Some(0));
        assert_eq!(first[2].as_u64(), Some(3));
        let second = cells[1].as_array().unwrap();
        assert_eq!(second[0].as_str(), Some("b"));
        // Style carried: nil or trimmed away entirely.
        assert!(second.len() == 1 || second[1].is_nil());
    }

    #[test]
    fn test_every_referenced_style_is_defined() {
        let mut term = Terminal::new(2, 20, 0);
        term.process(b"\x1b[31mred\x1b[0m plain \x1b[1;44mbold\x1b[0m");
        let frame = build_redraw(term.screen_mut(), 0, true, true);

        let mut defined: HashSet<u64> = HashSet::new();
        let mut last_style: u64 = 0;
        for entry in frame.as_array().unwrap() {
            let entry = entry.as_array().unwrap();
            let name = entry[0].as_str().unwrap();
            let args = entry[1].as_array().unwrap();
            match name {
                "style" => {
                    defined.insert(args[0].as_u64().unwrap());
                }
                "write" => {
                    for cell in args[3].as_array().unwrap() {
                        let cell = cell.as_array().unwrap();
                        if let Some(style) = cell.get(1)
                            && let Some(id) = style.as_u64()
                        {
                            last_style = id;
                        }
                        assert!(
                            last_style == 0 || defined.contains(&last_style),
                            "style {} referenced before definition",
                            last_style
                        );
                    }
                }
                _ => {}
            }
        }
        // Red and bold-on-blue produce two non-default styles.
        assert!(defined.len() >= 3);
    }

    #[test]
    fn test_wide_cell_entry() {
        let mut term = Terminal::new(1, 10, 0);
        term.process("漢".as_bytes());
        let frame = build_redraw(term.screen_mut(), 0, true, true);
        let writes = events_named(&frame, "write");
        let cells = writes[0][3].as_array().unwrap();
        let first = cells[0].as_array().unwrap();
        assert_eq!(first[0].as_str(), Some("漢"));
        assert_eq!(first[3].as_u64(), Some(2));
        // Spacer tail not emitted: remaining run covers 8 blank columns.
        let rest = cells[1].as_array().unwrap();
        assert_eq!(rest[2].as_u64(), Some(8));
    }

    #[test]
    fn test_title_only_when_dirty() {
        let mut term = Terminal::new(2, 10, 0);
        term.process(b"\x1b]2;t\x07");
        let frame = build_redraw(term.screen_mut(), 0, false, true);
        assert_eq!(events_named(&frame, "title").len(), 1);
        term.process(b"x");
        let frame = build_redraw(term.screen_mut(), 0, false, true);
        assert_eq!(events_named(&frame, "title").len(), 0);
    }

    #[test]
    fn test_selection_event_bounds() {
        let mut term = Terminal::new(2, 10, 0);
        term.process(b"abcdef");
        term.screen_mut().set_selection(
            weft_vt::Pin::new(0, 1),
            weft_vt::Pin::new(0, 3),
            weft_vt::Granularity::Char,
        );
        let frame = build_redraw(term.screen_mut(), 0, true, true);
        let selection = events_named(&frame, "selection")[0];
        assert_eq!(selection[1].as_u64(), Some(0));
        assert_eq!(selection[2].as_u64(), Some(1));
        assert_eq!(selection[4].as_u64(), Some(3));

        term.screen_mut().clear_selection();
        let frame = build_redraw(term.screen_mut(), 0, true, true);
        let selection = events_named(&frame, "selection")[0];
        assert!(selection[1].is_nil());
    }

    #[test]
    fn test_hyperlink_declared_before_use() {
        let mut term = Terminal::new(1, 20, 0);
        term.process(b"\x1b]8;;https://e.com\x1b\\ln\x1b]8;;\x1b\\");
        let frame = build_redraw(term.screen_mut(), 0, true, true);
        let names = event_names(&frame);
        let link_pos = names.iter().position(|n| n == "hyperlink").unwrap();
        let write_pos = names.iter().position(|n| n == "write").unwrap();
        assert!(link_pos < write_pos);
        let link = events_named(&frame, "hyperlink")[0];
        assert_eq!(link[0].as_u64(), Some(1));
        assert_eq!(link[1].as_str(), Some("https://e.com"));
    }
}
