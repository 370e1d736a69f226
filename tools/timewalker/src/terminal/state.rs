//! Immutable screen model produced by the terminal machine.

use bitflags::bitflags;
use crate::digest::sha256_hex;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AttrFlags: u16 {
        const BOLD = 0b0000_0001;
        const DIM = 0b0000_0010;
        const ITALIC = 0b0000_0100;
        const UNDERLINE = 0b0000_1000;
        const BLINK = 0b0001_0000;
        const INVERSE = 0b0010_0000;
        const HIDDEN = 0b0100_0000;
        const STRIKETHROUGH = 0b1000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Color {
    pub fn is_default(&self) -> bool {
        matches!(self, Color::Default)
    }
}

fn is_one(width: &u8) -> bool {
    *width == 1
}

fn one() -> u8 {
    1
}

/// One grid cell. A wide character occupies its cell with `width == 2`
/// and the cell to its right with `width == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub ch: char,
    #[serde(default, skip_serializing_if = "Color::is_default")]
    pub fg: Color,
    #[serde(default, skip_serializing_if = "Color::is_default")]
    pub bg: Color,
    #[serde(default, skip_serializing_if = "AttrFlags::is_empty")]
    pub attrs: AttrFlags,
    #[serde(default = "one", skip_serializing_if = "is_one")]
    pub width: u8,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            fg: Color::Default,
            bg: Color::Default,
            attrs: AttrFlags::empty(),
            width: 1,
        }
    }
}

impl Cell {
    pub fn blank(bg: Color) -> Self {
        Self {
            bg,
            ..Self::default()
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }

    /// Same glyph and presentation; the comparison used by the diff engine.
    pub fn same_content(&self, other: &Cell) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            visible: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalState {
    pub rows: u16,
    pub cols: u16,
    pub cursor: Cursor,
    pub alternate_screen: bool,
    pub title: String,
    pub grid: Vec<Vec<Cell>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scrollback: Vec<Vec<Cell>>,
}

impl TerminalState {
    pub fn blank(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            cursor: Cursor::default(),
            alternate_screen: false,
            title: String::new(),
            grid: vec![vec![Cell::default(); cols as usize]; rows as usize],
            scrollback: Vec::new(),
        }
    }

    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        self.grid.get(row as usize)?.get(col as usize)
    }

    /// Visible text of one row with trailing blanks removed.
    pub fn row_text(&self, row: u16) -> String {
        self.grid
            .get(row as usize)
            .map(|cells| line_text(cells).trim_end().to_string())
            .unwrap_or_default()
    }

    /// Text of the cells in `[col_start, col_end)` on `row`, blanks preserved.
    pub fn range_text(&self, row: u16, col_start: u16, col_end: u16) -> String {
        let Some(cells) = self.grid.get(row as usize) else {
            return String::new();
        };
        let end = (col_end as usize).min(cells.len());
        let start = (col_start as usize).min(end);
        line_text(&cells[start..end])
    }

    pub fn text_lines(&self) -> Vec<String> {
        (0..self.rows).map(|row| self.row_text(row)).collect()
    }

    /// Screen text with trailing empty rows dropped.
    pub fn render_text(&self) -> String {
        let mut lines = self.text_lines();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    pub fn contains_text(&self, needle: &str) -> bool {
        self.text_lines().iter().any(|line| line.contains(needle))
    }

    /// sha256 over the canonical JSON encoding of the whole state.
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&encoded)
    }
}

pub fn line_text(cells: &[Cell]) -> String {
    cells
        .iter()
        .filter(|cell| !cell.is_continuation())
        .map(|cell| cell.ch)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_state_renders_empty_rows() {
        let state = TerminalState::blank(3, 5);
        assert_eq!(state.text_lines(), vec!["", "", ""]);
        assert_eq!(state.render_text(), "");
        assert_eq!(state.range_text(0, 1, 4), "   ");
    }

    #[test]
    fn compact_cell_encoding_skips_defaults() {
        let cell = Cell::default();
        let json = serde_json::to_string(&cell).expect("serialize");
        assert_eq!(json, r#"{"ch":" "}"#);
        let bold = Cell {
            ch: 'x',
            fg: Color::Indexed(1),
            attrs: AttrFlags::BOLD,
            ..Cell::default()
        };
        let back: Cell =
            serde_json::from_str(&serde_json::to_string(&bold).expect("serialize")).expect("parse");
        assert_eq!(back, bold);
    }

    #[test]
    fn digest_changes_with_content() {
        let a = TerminalState::blank(2, 2);
        let mut b = a.clone();
        assert_eq!(a.digest(), b.digest());
        b.grid[0][0].ch = 'x';
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
