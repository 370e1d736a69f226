use super::parser::{Action, CsiSequence, EscSequence, OscSequence, VtParser};
use super::state::{AttrFlags, Cell, Color, Cursor, TerminalState};
use super::{escape_sequence_text, Capability, CapabilitySet, TerminalNotice, UnknownReason};
use std::collections::VecDeque;
use unicode_width::UnicodeWidthChar;

const TAB_WIDTH: u16 = 8;
const MAX_TITLE_CHARS: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Pen {
    fg: Color,
    bg: Color,
    attrs: AttrFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SavedCursor {
    row: u16,
    col: u16,
    pen: Pen,
    pending_wrap: bool,
}

/// Incremental decoder from bytes to [`TerminalState`].
///
/// Holds no I/O resources. Two machines built with the same configuration
/// and fed the same bytes, in any chunking, end in equal states.
#[derive(Debug, Clone)]
pub struct TerminalMachine {
    capabilities: CapabilitySet,
    scrollback_limit: usize,
    initial_rows: u16,
    initial_cols: u16,
    parser: VtParser,
    rows: u16,
    cols: u16,
    primary: Vec<Vec<Cell>>,
    alternate: Vec<Vec<Cell>>,
    on_alternate: bool,
    scrollback: VecDeque<Vec<Cell>>,
    cursor: Cursor,
    pending_wrap: bool,
    pen: Pen,
    saved_cursor: Option<SavedCursor>,
    saved_primary_cursor: Option<SavedCursor>,
    scroll_top: u16,
    scroll_bottom: u16,
    autowrap: bool,
    title: String,
    bytes_fed: u64,
}

impl TerminalMachine {
    pub fn new(rows: u16, cols: u16, capabilities: CapabilitySet, scrollback_limit: usize) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        Self {
            capabilities,
            scrollback_limit,
            initial_rows: rows,
            initial_cols: cols,
            parser: VtParser::new(),
            rows,
            cols,
            primary: blank_screen(rows, cols),
            alternate: blank_screen(rows, cols),
            on_alternate: false,
            scrollback: VecDeque::new(),
            cursor: Cursor::default(),
            pending_wrap: false,
            pen: Pen::default(),
            saved_cursor: None,
            saved_primary_cursor: None,
            scroll_top: 0,
            scroll_bottom: rows - 1,
            autowrap: true,
            title: String::new(),
            bytes_fed: 0,
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn bytes_fed(&self) -> u64 {
        self.bytes_fed
    }

    pub fn size(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    pub fn append_bytes(&mut self, chunk: &[u8]) -> Vec<TerminalNotice> {
        let mut notices = Vec::new();
        let mut actions = Vec::new();
        for byte in chunk {
            self.bytes_fed += 1;
            self.parser.advance(*byte, &mut actions);
            for action in actions.drain(..) {
                self.apply(action, &mut notices);
            }
        }
        notices
    }

    /// Immutable snapshot of the active screen.
    pub fn current_grid(&self) -> TerminalState {
        TerminalState {
            rows: self.rows,
            cols: self.cols,
            cursor: self.cursor,
            alternate_screen: self.on_alternate,
            title: self.title.clone(),
            grid: self.screen().clone(),
            scrollback: self.scrollback.iter().cloned().collect(),
        }
    }

    /// Back to the blank grid the machine was created with.
    pub fn reset(&mut self) {
        *self = Self::new(
            self.initial_rows,
            self.initial_cols,
            self.capabilities.clone(),
            self.scrollback_limit,
        );
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        if rows == 0 || cols == 0 || (rows == self.rows && cols == self.cols) {
            return;
        }
        for line in self.primary.iter_mut().chain(self.alternate.iter_mut()) {
            resize_line(line, cols);
        }

        if rows < self.rows {
            let surplus = (self.rows - rows) as usize;
            if !self.on_alternate {
                let overflow = (self.cursor.row as usize + 1).saturating_sub(rows as usize);
                let lifted = overflow.min(surplus);
                for _ in 0..lifted {
                    let line = self.primary.remove(0);
                    self.push_scrollback(line);
                }
                self.cursor.row = self.cursor.row.saturating_sub(lifted as u16);
            }
            self.primary.truncate(rows as usize);
            self.alternate.truncate(rows as usize);
        }
        while self.primary.len() < rows as usize {
            self.primary.push(vec![Cell::default(); cols as usize]);
        }
        while self.alternate.len() < rows as usize {
            self.alternate.push(vec![Cell::default(); cols as usize]);
        }

        self.rows = rows;
        self.cols = cols;
        self.scroll_top = 0;
        self.scroll_bottom = rows - 1;
        self.pending_wrap = false;
        self.cursor.row = self.cursor.row.min(rows - 1);
        self.cursor.col = self.cursor.col.min(cols - 1);
        for saved in [&mut self.saved_cursor, &mut self.saved_primary_cursor]
            .into_iter()
            .flatten()
        {
            saved.row = saved.row.min(rows - 1);
            saved.col = saved.col.min(cols - 1);
        }
    }

    fn screen(&self) -> &Vec<Vec<Cell>> {
        if self.on_alternate {
            &self.alternate
        } else {
            &self.primary
        }
    }

    fn screen_mut(&mut self) -> &mut Vec<Vec<Cell>> {
        if self.on_alternate {
            &mut self.alternate
        } else {
            &mut self.primary
        }
    }

    fn apply(&mut self, action: Action, notices: &mut Vec<TerminalNotice>) {
        match action {
            Action::Print(ch) => self.print(ch),
            Action::Execute(byte) => self.execute(byte, notices),
            Action::Csi(seq) => self.csi(&seq, notices),
            Action::Esc(seq) => self.esc(&seq, notices),
            Action::Osc(seq) => self.osc(&seq, notices),
            Action::Unsupported(raw) => self.unknown(&raw, UnknownReason::Unsupported, notices),
        }
    }

    fn unknown(&self, raw: &[u8], reason: UnknownReason, notices: &mut Vec<TerminalNotice>) {
        notices.push(TerminalNotice::UnknownSequence {
            sequence: escape_sequence_text(raw),
            reason,
            offset: self.bytes_fed,
        });
    }

    /// Checks the capability gate; reports and returns false when closed.
    fn allowed(&self, cap: Capability, raw: &[u8], notices: &mut Vec<TerminalNotice>) -> bool {
        if self.capabilities.contains(cap) {
            return true;
        }
        self.unknown(raw, UnknownReason::Disabled, notices);
        false
    }

    // ── printing and C0 ───────────────────────────────────────────────────────

    fn print(&mut self, ch: char) {
        let width = match ch.width() {
            Some(w) if w > 0 => w.min(2) as u16,
            _ => return,
        };
        if self.pending_wrap && self.autowrap {
            self.carriage_return();
            self.linefeed();
        }
        self.pending_wrap = false;

        if width == 2 && self.cursor.col + 1 >= self.cols {
            if !self.autowrap || self.cols < 2 {
                return;
            }
            self.carriage_return();
            self.linefeed();
        }

        let row = self.cursor.row as usize;
        let col = self.cursor.col as usize;
        self.clear_wide_overlap(row, col);
        if width == 2 {
            self.clear_wide_overlap(row, col + 1);
        }
        let pen = self.pen;
        let line = &mut self.screen_mut()[row];
        line[col] = Cell {
            ch,
            fg: pen.fg,
            bg: pen.bg,
            attrs: pen.attrs,
            width: width as u8,
        };
        if width == 2 {
            line[col + 1] = Cell {
                ch: ' ',
                fg: pen.fg,
                bg: pen.bg,
                attrs: pen.attrs,
                width: 0,
            };
        }

        let next = self.cursor.col + width;
        if next >= self.cols {
            self.cursor.col = self.cols - 1;
            self.pending_wrap = self.autowrap;
        } else {
            self.cursor.col = next;
        }
    }

    /// Blanks the other half of a wide character about to be overwritten.
    fn clear_wide_overlap(&mut self, row: usize, col: usize) {
        let cols = self.cols as usize;
        let line = &mut self.screen_mut()[row];
        if col >= cols {
            return;
        }
        if line[col].width == 0 && col > 0 {
            line[col - 1] = Cell::blank(line[col - 1].bg);
        }
        if line[col].width == 2 && col + 1 < cols {
            line[col + 1] = Cell::blank(line[col + 1].bg);
        }
    }

    fn execute(&mut self, byte: u8, notices: &mut Vec<TerminalNotice>) {
        match byte {
            0x07 => notices.push(TerminalNotice::Bell {
                offset: self.bytes_fed,
            }),
            0x08 => {
                self.pending_wrap = false;
                self.cursor.col = self.cursor.col.saturating_sub(1);
            }
            0x09 => {
                self.pending_wrap = false;
                let next = (self.cursor.col / TAB_WIDTH + 1) * TAB_WIDTH;
                self.cursor.col = next.min(self.cols - 1);
            }
            0x0a..=0x0c => {
                self.pending_wrap = false;
                self.linefeed();
            }
            0x0d => self.carriage_return(),
            _ => {}
        }
    }

    fn carriage_return(&mut self) {
        self.pending_wrap = false;
        self.cursor.col = 0;
    }

    fn linefeed(&mut self) {
        if self.cursor.row == self.scroll_bottom {
            self.scroll_up(1);
        } else if self.cursor.row + 1 < self.rows {
            self.cursor.row += 1;
        }
    }

    fn reverse_index(&mut self) {
        self.pending_wrap = false;
        if self.cursor.row == self.scroll_top {
            self.scroll_down(1);
        } else if self.cursor.row > 0 {
            self.cursor.row -= 1;
        }
    }

    // ── scrolling ─────────────────────────────────────────────────────────────

    fn blank_line(&self) -> Vec<Cell> {
        vec![Cell::blank(self.pen.bg); self.cols as usize]
    }

    fn scroll_up(&mut self, count: u16) {
        let top = self.scroll_top as usize;
        let bottom = self.scroll_bottom as usize;
        let count = (count as usize).min(bottom - top + 1);
        for _ in 0..count {
            let blank = self.blank_line();
            let on_alternate = self.on_alternate;
            let screen = self.screen_mut();
            let line = screen.remove(top);
            screen.insert(bottom, blank);
            if !on_alternate && top == 0 {
                self.push_scrollback(line);
            }
        }
    }

    fn scroll_down(&mut self, count: u16) {
        let top = self.scroll_top as usize;
        let bottom = self.scroll_bottom as usize;
        let count = (count as usize).min(bottom - top + 1);
        for _ in 0..count {
            let blank = self.blank_line();
            let screen = self.screen_mut();
            screen.remove(bottom);
            screen.insert(top, blank);
        }
    }

    fn push_scrollback(&mut self, mut line: Vec<Cell>) {
        if self.scrollback_limit == 0 {
            return;
        }
        while line.last().is_some_and(|cell| *cell == Cell::default()) {
            line.pop();
        }
        self.scrollback.push_back(line);
        while self.scrollback.len() > self.scrollback_limit {
            self.scrollback.pop_front();
        }
    }

    // ── CSI ───────────────────────────────────────────────────────────────────

    fn csi(&mut self, seq: &CsiSequence, notices: &mut Vec<TerminalNotice>) {
        if seq.private == Some(b'?') && seq.intermediates.is_empty() {
            match seq.final_byte {
                b'h' => return self.private_modes(seq, true, notices),
                b'l' => return self.private_modes(seq, false, notices),
                _ => {}
            }
        }
        let Some(cap) = csi_capability(seq) else {
            return self.unknown(&seq.raw, UnknownReason::Unsupported, notices);
        };
        if !self.allowed(cap, &seq.raw, notices) {
            return;
        }

        let n = seq.param(0, 1);
        match seq.final_byte {
            b'A' => self.cursor_up(n),
            b'B' | b'e' => self.cursor_down(n),
            b'C' | b'a' => self.move_to(self.cursor.row, self.cursor.col.saturating_add(n)),
            b'D' => self.move_to(self.cursor.row, self.cursor.col.saturating_sub(n)),
            b'E' => {
                self.cursor_down(n);
                self.cursor.col = 0;
            }
            b'F' => {
                self.cursor_up(n);
                self.cursor.col = 0;
            }
            b'G' | b'`' => self.move_to(self.cursor.row, n - 1),
            b'H' | b'f' => self.move_to(seq.param(0, 1) - 1, seq.param(1, 1) - 1),
            b'd' => self.move_to(n - 1, self.cursor.col),
            b'J' => self.erase_display(seq.params.first().copied().unwrap_or(0)),
            b'K' => self.erase_line(seq.params.first().copied().unwrap_or(0)),
            b'X' => {
                let start = self.cursor.col;
                self.erase_cells(self.cursor.row, start, start.saturating_add(n));
            }
            b'r' => self.set_scroll_region(seq.param(0, 1), seq.param(1, self.rows)),
            b'S' => self.scroll_up(n),
            b'T' => self.scroll_down(n),
            b'm' => self.sgr(&seq.params),
            b'@' => self.insert_chars(n),
            b'P' => self.delete_chars(n),
            b'L' => self.insert_lines(n),
            b'M' => self.delete_lines(n),
            b's' => self.save_cursor(),
            b'u' => self.restore_cursor(),
            _ => {}
        }
    }

    fn private_modes(&mut self, seq: &CsiSequence, enable: bool, notices: &mut Vec<TerminalNotice>) {
        for mode in seq.params.iter().copied() {
            let cap = match mode {
                25 => Capability::CursorVisibility,
                47 | 1047 | 1049 => Capability::AlternateScreen,
                1048 => Capability::SaveRestoreCursor,
                7 => Capability::Autowrap,
                _ => {
                    self.unknown(&seq.raw, UnknownReason::Unsupported, notices);
                    continue;
                }
            };
            if !self.allowed(cap, &seq.raw, notices) {
                continue;
            }
            match (mode, enable) {
                (25, visible) => self.cursor.visible = visible,
                (7, on) => {
                    self.autowrap = on;
                    if !on {
                        self.pending_wrap = false;
                    }
                }
                (1048, true) => self.save_cursor(),
                (1048, false) => self.restore_cursor(),
                (mode, true) => self.enter_alternate(mode),
                (mode, false) => self.leave_alternate(mode),
            }
        }
    }

    fn move_to(&mut self, row: u16, col: u16) {
        self.pending_wrap = false;
        self.cursor.row = row.min(self.rows - 1);
        self.cursor.col = col.min(self.cols - 1);
    }

    fn cursor_up(&mut self, n: u16) {
        let floor = if self.cursor.row >= self.scroll_top {
            self.scroll_top
        } else {
            0
        };
        let row = self.cursor.row.saturating_sub(n).max(floor);
        self.move_to(row, self.cursor.col);
    }

    fn cursor_down(&mut self, n: u16) {
        let ceiling = if self.cursor.row <= self.scroll_bottom {
            self.scroll_bottom
        } else {
            self.rows - 1
        };
        let row = self.cursor.row.saturating_add(n).min(ceiling);
        self.move_to(row, self.cursor.col);
    }

    fn erase_cells(&mut self, row: u16, start: u16, end: u16) {
        let blank = Cell::blank(self.pen.bg);
        let cols = self.cols;
        let line = &mut self.screen_mut()[row as usize];
        let end = end.min(cols) as usize;
        let start = (start as usize).min(end);
        for cell in &mut line[start..end] {
            *cell = blank;
        }
        // A wide character cut in half loses both halves.
        if start > 0 && line.get(start).is_some_and(|c| c.width == 0) {
            line[start - 1] = blank;
        }
        if start < end && end < cols as usize && line[end].width == 0 {
            line[end] = blank;
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let row = self.cursor.row;
        let col = self.cursor.col;
        match mode {
            0 => self.erase_cells(row, col, self.cols),
            1 => self.erase_cells(row, 0, col + 1),
            2 => self.erase_cells(row, 0, self.cols),
            _ => {}
        }
    }

    fn erase_display(&mut self, mode: u16) {
        let row = self.cursor.row;
        match mode {
            0 => {
                self.erase_line(0);
                for r in row + 1..self.rows {
                    self.erase_cells(r, 0, self.cols);
                }
            }
            1 => {
                for r in 0..row {
                    self.erase_cells(r, 0, self.cols);
                }
                self.erase_line(1);
            }
            2 => {
                for r in 0..self.rows {
                    self.erase_cells(r, 0, self.cols);
                }
            }
            3 => self.scrollback.clear(),
            _ => {}
        }
    }

    fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let top = top.saturating_sub(1);
        let bottom = bottom.min(self.rows).saturating_sub(1);
        if top >= bottom {
            return;
        }
        self.scroll_top = top;
        self.scroll_bottom = bottom;
        self.move_to(0, 0);
    }

    fn insert_chars(&mut self, n: u16) {
        let col = self.cursor.col as usize;
        let cols = self.cols as usize;
        let blank = Cell::blank(self.pen.bg);
        let n = (n as usize).min(cols - col);
        let row = self.cursor.row as usize;
        let line = &mut self.screen_mut()[row];
        for _ in 0..n {
            line.pop();
            line.insert(col, blank);
        }
        if line[cols - 1].width == 2 {
            line[cols - 1] = blank;
        }
        self.pending_wrap = false;
    }

    fn delete_chars(&mut self, n: u16) {
        let col = self.cursor.col as usize;
        let cols = self.cols as usize;
        let blank = Cell::blank(self.pen.bg);
        let n = (n as usize).min(cols - col);
        let row = self.cursor.row as usize;
        let line = &mut self.screen_mut()[row];
        for _ in 0..n {
            line.remove(col);
            line.push(blank);
        }
        if line[col].width == 0 {
            line[col] = blank;
        }
        self.pending_wrap = false;
    }

    fn insert_lines(&mut self, n: u16) {
        if self.cursor.row < self.scroll_top || self.cursor.row > self.scroll_bottom {
            return;
        }
        let row = self.cursor.row as usize;
        let bottom = self.scroll_bottom as usize;
        let n = (n as usize).min(bottom - row + 1);
        for _ in 0..n {
            let blank = self.blank_line();
            let screen = self.screen_mut();
            screen.remove(bottom);
            screen.insert(row, blank);
        }
        self.carriage_return();
    }

    fn delete_lines(&mut self, n: u16) {
        if self.cursor.row < self.scroll_top || self.cursor.row > self.scroll_bottom {
            return;
        }
        let row = self.cursor.row as usize;
        let bottom = self.scroll_bottom as usize;
        let n = (n as usize).min(bottom - row + 1);
        for _ in 0..n {
            let blank = self.blank_line();
            let screen = self.screen_mut();
            screen.remove(row);
            screen.insert(bottom, blank);
        }
        self.carriage_return();
    }

    fn sgr(&mut self, params: &[u16]) {
        if params.is_empty() {
            self.pen = Pen::default();
            return;
        }
        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => self.pen = Pen::default(),
                1 => self.pen.attrs.insert(AttrFlags::BOLD),
                2 => self.pen.attrs.insert(AttrFlags::DIM),
                3 => self.pen.attrs.insert(AttrFlags::ITALIC),
                4 | 21 => self.pen.attrs.insert(AttrFlags::UNDERLINE),
                5 | 6 => self.pen.attrs.insert(AttrFlags::BLINK),
                7 => self.pen.attrs.insert(AttrFlags::INVERSE),
                8 => self.pen.attrs.insert(AttrFlags::HIDDEN),
                9 => self.pen.attrs.insert(AttrFlags::STRIKETHROUGH),
                22 => self.pen.attrs.remove(AttrFlags::BOLD | AttrFlags::DIM),
                23 => self.pen.attrs.remove(AttrFlags::ITALIC),
                24 => self.pen.attrs.remove(AttrFlags::UNDERLINE),
                25 => self.pen.attrs.remove(AttrFlags::BLINK),
                27 => self.pen.attrs.remove(AttrFlags::INVERSE),
                28 => self.pen.attrs.remove(AttrFlags::HIDDEN),
                29 => self.pen.attrs.remove(AttrFlags::STRIKETHROUGH),
                code @ 30..=37 => self.pen.fg = Color::Indexed((code - 30) as u8),
                38 => {
                    let (color, used) = extended_color(&params[i + 1..]);
                    if let Some(color) = color {
                        self.pen.fg = color;
                    }
                    i += used;
                }
                39 => self.pen.fg = Color::Default,
                code @ 40..=47 => self.pen.bg = Color::Indexed((code - 40) as u8),
                48 => {
                    let (color, used) = extended_color(&params[i + 1..]);
                    if let Some(color) = color {
                        self.pen.bg = color;
                    }
                    i += used;
                }
                49 => self.pen.bg = Color::Default,
                code @ 90..=97 => self.pen.fg = Color::Indexed((code - 90 + 8) as u8),
                code @ 100..=107 => self.pen.bg = Color::Indexed((code - 100 + 8) as u8),
                _ => {}
            }
            i += 1;
        }
    }

    fn save_cursor(&mut self) {
        self.saved_cursor = Some(self.snapshot_cursor());
    }

    fn restore_cursor(&mut self) {
        match self.saved_cursor {
            Some(saved) => self.apply_saved(saved),
            None => {
                self.move_to(0, 0);
                self.pen = Pen::default();
            }
        }
    }

    fn snapshot_cursor(&self) -> SavedCursor {
        SavedCursor {
            row: self.cursor.row,
            col: self.cursor.col,
            pen: self.pen,
            pending_wrap: self.pending_wrap,
        }
    }

    fn apply_saved(&mut self, saved: SavedCursor) {
        self.cursor.row = saved.row.min(self.rows - 1);
        self.cursor.col = saved.col.min(self.cols - 1);
        self.pen = saved.pen;
        self.pending_wrap = saved.pending_wrap;
    }

    fn enter_alternate(&mut self, mode: u16) {
        if self.on_alternate {
            return;
        }
        if mode == 1049 {
            self.saved_primary_cursor = Some(self.snapshot_cursor());
            self.alternate = blank_screen(self.rows, self.cols);
        }
        self.on_alternate = true;
        self.pending_wrap = false;
    }

    fn leave_alternate(&mut self, mode: u16) {
        if !self.on_alternate {
            return;
        }
        if mode == 1047 || mode == 1049 {
            self.alternate = blank_screen(self.rows, self.cols);
        }
        self.on_alternate = false;
        self.pending_wrap = false;
        if mode == 1049 {
            if let Some(saved) = self.saved_primary_cursor.take() {
                self.apply_saved(saved);
            }
        }
    }

    // ── ESC and OSC ───────────────────────────────────────────────────────────

    fn esc(&mut self, seq: &EscSequence, notices: &mut Vec<TerminalNotice>) {
        match (seq.intermediates.as_slice(), seq.final_byte) {
            // Charset designation and keypad modes do not affect the grid.
            ([b'(' | b')' | b'*' | b'+'], _) | ([], b'=' | b'>') => {}
            ([], b'7') => {
                if self.allowed(Capability::SaveRestoreCursor, &seq.raw, notices) {
                    self.save_cursor();
                }
            }
            ([], b'8') => {
                if self.allowed(Capability::SaveRestoreCursor, &seq.raw, notices) {
                    self.restore_cursor();
                }
            }
            ([], b'D') => {
                if self.allowed(Capability::CursorMovement, &seq.raw, notices) {
                    self.pending_wrap = false;
                    self.linefeed();
                }
            }
            ([], b'E') => {
                if self.allowed(Capability::CursorMovement, &seq.raw, notices) {
                    self.carriage_return();
                    self.linefeed();
                }
            }
            ([], b'M') => {
                if self.allowed(Capability::CursorMovement, &seq.raw, notices) {
                    self.reverse_index();
                }
            }
            ([], b'c') => {
                if self.allowed(Capability::Erase, &seq.raw, notices) {
                    self.full_reset();
                }
            }
            _ => self.unknown(&seq.raw, UnknownReason::Unsupported, notices),
        }
    }

    /// RIS: like [`Self::reset`] but keeps the current size and stream position.
    fn full_reset(&mut self) {
        let bytes_fed = self.bytes_fed;
        let parser = std::mem::take(&mut self.parser);
        let (initial_rows, initial_cols) = (self.initial_rows, self.initial_cols);
        *self = Self::new(
            self.rows,
            self.cols,
            self.capabilities.clone(),
            self.scrollback_limit,
        );
        self.initial_rows = initial_rows;
        self.initial_cols = initial_cols;
        self.parser = parser;
        self.bytes_fed = bytes_fed;
    }

    fn osc(&mut self, seq: &OscSequence, notices: &mut Vec<TerminalNotice>) {
        let payload = String::from_utf8_lossy(&seq.payload);
        let (code, text) = payload.split_once(';').unwrap_or((payload.as_ref(), ""));
        match code {
            "0" | "1" | "2" => {
                if !self.allowed(Capability::Title, &seq.raw, notices) {
                    return;
                }
                let title: String = text.chars().take(MAX_TITLE_CHARS).collect();
                self.title = title.clone();
                notices.push(TerminalNotice::TitleChanged {
                    title,
                    offset: self.bytes_fed,
                });
            }
            _ => self.unknown(&seq.raw, UnknownReason::Unsupported, notices),
        }
    }
}

/// Capability behind a non-private CSI sequence, `None` when unrecognised.
fn csi_capability(seq: &CsiSequence) -> Option<Capability> {
    if seq.private.is_some() || !seq.intermediates.is_empty() {
        return None;
    }
    match seq.final_byte {
        b'A' | b'B' | b'C' | b'D' | b'E' | b'F' | b'G' | b'H' | b'f' | b'd' | b'`' | b'a'
        | b'e' => Some(Capability::CursorMovement),
        b'J' | b'K' | b'X' => Some(Capability::Erase),
        b'r' | b'S' | b'T' => Some(Capability::ScrollRegion),
        b'm' => Some(Capability::Sgr),
        b'@' | b'P' | b'L' | b'M' => Some(Capability::Edit),
        b's' | b'u' => Some(Capability::SaveRestoreCursor),
        _ => None,
    }
}

/// Parses the tail of an SGR 38/48 sequence. Returns the colour and how many
/// parameters it consumed.
fn extended_color(rest: &[u16]) -> (Option<Color>, usize) {
    match rest {
        [5, index, ..] => (Some(Color::Indexed((*index).min(255) as u8)), 2),
        [2, r, g, b, ..] => (
            Some(Color::Rgb(
                (*r).min(255) as u8,
                (*g).min(255) as u8,
                (*b).min(255) as u8,
            )),
            4,
        ),
        [5] | [2, ..] => (None, rest.len()),
        _ => (None, 0),
    }
}

fn blank_screen(rows: u16, cols: u16) -> Vec<Vec<Cell>> {
    vec![vec![Cell::default(); cols as usize]; rows as usize]
}

fn resize_line(line: &mut Vec<Cell>, cols: u16) {
    let cols = cols as usize;
    line.resize(cols, Cell::default());
    if let Some(last) = line.last_mut() {
        if last.width == 2 {
            *last = Cell::blank(last.bg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(rows: u16, cols: u16) -> TerminalMachine {
        TerminalMachine::new(rows, cols, CapabilitySet::all(), 100)
    }

    fn feed(m: &mut TerminalMachine, text: &str) -> Vec<TerminalNotice> {
        m.append_bytes(text.as_bytes())
    }

    #[test]
    fn prints_text_and_handles_crlf() {
        let mut m = machine(3, 10);
        feed(&mut m, "hello\r\nworld");
        let state = m.current_grid();
        assert_eq!(state.text_lines(), vec!["hello", "world", ""]);
        assert_eq!((state.cursor.row, state.cursor.col), (1, 5));
    }

    #[test]
    fn wraps_at_right_margin_and_scrolls_into_scrollback() {
        let mut m = machine(2, 4);
        feed(&mut m, "abcdefgh\r\nij");
        let state = m.current_grid();
        assert_eq!(state.text_lines(), vec!["efgh", "ij"]);
        assert_eq!(state.scrollback.len(), 1);
        assert_eq!(crate::terminal::state::line_text(&state.scrollback[0]), "abcd");
    }

    #[test]
    fn cursor_positioning_and_erase_in_line() {
        let mut m = machine(3, 10);
        feed(&mut m, "0123456789\x1b[1;4H\x1b[K\x1b[3;2HX");
        let state = m.current_grid();
        assert_eq!(state.row_text(0), "012");
        assert_eq!(state.row_text(2), " X");
        feed(&mut m, "\x1b[2J");
        assert_eq!(m.current_grid().render_text(), "");
    }

    #[test]
    fn sgr_sets_colors_and_attributes() {
        let mut m = machine(1, 10);
        feed(&mut m, "\x1b[1;31ma\x1b[38;5;200;48;2;1;2;3mb\x1b[0mc");
        let state = m.current_grid();
        let a = state.cell(0, 0).expect("a");
        assert!(a.attrs.contains(AttrFlags::BOLD));
        assert_eq!(a.fg, Color::Indexed(1));
        let b = state.cell(0, 1).expect("b");
        assert_eq!(b.fg, Color::Indexed(200));
        assert_eq!(b.bg, Color::Rgb(1, 2, 3));
        let c = state.cell(0, 2).expect("c");
        assert_eq!(*c, Cell { ch: 'c', ..Cell::default() });
    }

    #[test]
    fn scroll_region_confines_scrolling() {
        let mut m = machine(4, 5);
        feed(&mut m, "top\r\n\x1b[2;3r\x1b[2;1Ha\r\nb\r\nc");
        let state = m.current_grid();
        assert_eq!(state.text_lines(), vec!["top", "b", "c", ""]);
        assert!(state.scrollback.is_empty());
    }

    #[test]
    fn alternate_screen_round_trip_restores_primary() {
        let mut m = machine(2, 10);
        feed(&mut m, "shell$ ");
        feed(&mut m, "\x1b[?1049h\x1b[Hfullscreen");
        assert!(m.current_grid().alternate_screen);
        assert_eq!(m.current_grid().row_text(0), "fullscreen");
        feed(&mut m, "\x1b[?1049l");
        let state = m.current_grid();
        assert!(!state.alternate_screen);
        assert_eq!(state.row_text(0), "shell$");
        assert_eq!(state.cursor.col, 7);
    }

    #[test]
    fn title_bell_and_unknown_sequences_are_reported() {
        let mut m = machine(1, 10);
        let notices = feed(&mut m, "\x1b]0;my title\x07\x07\x1b[5nx");
        assert_eq!(m.current_grid().title, "my title");
        assert!(matches!(&notices[0], TerminalNotice::TitleChanged { title, .. } if title == "my title"));
        assert!(matches!(notices[1], TerminalNotice::Bell { .. }));
        assert!(matches!(
            &notices[2],
            TerminalNotice::UnknownSequence { sequence, reason: UnknownReason::Unsupported, .. }
                if sequence == "\\x1b[5n"
        ));
        assert_eq!(m.current_grid().row_text(0), "x");
    }

    #[test]
    fn disabled_capability_is_consumed_and_reported() {
        let caps = CapabilitySet::all().without(Capability::Sgr);
        let mut m = TerminalMachine::new(1, 10, caps, 0);
        let notices = m.append_bytes(b"\x1b[1mbold");
        let state = m.current_grid();
        assert_eq!(state.row_text(0), "bold");
        assert!(state.cell(0, 0).expect("cell").attrs.is_empty());
        assert!(matches!(
            notices[0],
            TerminalNotice::UnknownSequence { reason: UnknownReason::Disabled, .. }
        ));
    }

    #[test]
    fn chunking_never_changes_the_result() {
        let stream = "prompt$ \x1b[32mgreen\x1b[0m 漢字\r\n\x1b]2;t\x1b\\\x1b[2;3Hz\x1b[?25l";
        let mut whole = machine(5, 20);
        whole.append_bytes(stream.as_bytes());
        for size in [1, 2, 3, 7] {
            let mut split = machine(5, 20);
            for chunk in stream.as_bytes().chunks(size) {
                split.append_bytes(chunk);
            }
            assert_eq!(split.current_grid(), whole.current_grid());
        }
        assert!(!whole.current_grid().cursor.visible);
    }

    #[test]
    fn wide_characters_take_two_cells() {
        let mut m = machine(1, 6);
        feed(&mut m, "a漢b");
        let state = m.current_grid();
        assert_eq!(state.cell(0, 1).expect("wide").width, 2);
        assert!(state.cell(0, 2).expect("tail").is_continuation());
        assert_eq!(state.row_text(0), "a漢b");
        assert_eq!(state.cursor.col, 4);
    }

    #[test]
    fn insert_and_delete_characters_shift_the_line() {
        let mut m = machine(1, 6);
        feed(&mut m, "abcdef\x1b[1;2H\x1b[2P");
        assert_eq!(m.current_grid().row_text(0), "adef");
        feed(&mut m, "\x1b[1@");
        assert_eq!(m.current_grid().row_text(0), "a def");
    }

    #[test]
    fn resize_keeps_cursor_line_visible() {
        let mut m = machine(4, 10);
        feed(&mut m, "1\r\n2\r\n3\r\n4");
        m.resize(2, 5);
        let state = m.current_grid();
        assert_eq!(state.text_lines(), vec!["3", "4"]);
        assert_eq!(state.scrollback.len(), 2);
        assert_eq!((state.rows, state.cols), (2, 5));
        assert_eq!(state.cursor.row, 1);
    }

    #[test]
    fn reset_returns_to_blank_grid() {
        let mut m = machine(2, 5);
        feed(&mut m, "abc\x1b]2;x\x07");
        m.reset();
        assert_eq!(m.current_grid(), TerminalState::blank(2, 5));
        assert_eq!(m.bytes_fed(), 0);
    }
}
