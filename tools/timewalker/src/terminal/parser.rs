//! VT byte decoder.
//!
//! A tagged-state dispatcher over single bytes. It knows nothing about the
//! screen: every complete unit (printable character, C0 control, CSI, ESC or
//! OSC sequence) is handed out as an [`Action`]. Incomplete escape sequences
//! and partial UTF-8 characters stay buffered until the next byte arrives, so
//! chunk boundaries never change the decoded result.

const MAX_PARAMS: usize = 32;
const MAX_SEQUENCE_BYTES: usize = 1024;
const MAX_OSC_BYTES: usize = 4096;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const CAN: u8 = 0x18;
const SUB: u8 = 0x1a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Print(char),
    Execute(u8),
    Csi(CsiSequence),
    Esc(EscSequence),
    Osc(OscSequence),
    /// Sequence consumed without interpretation (string controls, malformed or
    /// interrupted sequences).
    Unsupported(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiSequence {
    pub private: Option<u8>,
    pub params: Vec<u16>,
    pub intermediates: Vec<u8>,
    pub final_byte: u8,
    pub raw: Vec<u8>,
}

impl CsiSequence {
    /// Parameter `idx`, with zero or absent meaning `default`.
    pub fn param(&self, idx: usize, default: u16) -> u16 {
        match self.params.get(idx) {
            None | Some(0) => default,
            Some(value) => *value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscSequence {
    pub intermediates: Vec<u8>,
    pub final_byte: u8,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscSequence {
    pub payload: Vec<u8>,
    pub raw: Vec<u8>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    CsiIgnore,
    OscString,
    EscapeInOsc,
    StringIgnore,
    EscapeInString,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VtParser {
    state: ParserState,
    params: Vec<u16>,
    current_param: Option<u16>,
    private: Option<u8>,
    intermediates: Vec<u8>,
    raw: Vec<u8>,
    osc: Vec<u8>,
    osc_truncated: bool,
    utf8: Vec<u8>,
    utf8_needed: usize,
}

impl VtParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a sequence or character is only partially received.
    pub fn is_mid_sequence(&self) -> bool {
        self.state != ParserState::Ground || self.utf8_needed > 0
    }

    pub fn advance(&mut self, byte: u8, out: &mut Vec<Action>) {
        if self.utf8_needed > 0 {
            if byte & 0xc0 == 0x80 {
                self.utf8.push(byte);
                if self.utf8.len() == self.utf8_needed {
                    let ch = std::str::from_utf8(&self.utf8)
                        .ok()
                        .and_then(|s| s.chars().next())
                        .unwrap_or(char::REPLACEMENT_CHARACTER);
                    self.reset_utf8();
                    out.push(Action::Print(ch));
                }
                return;
            }
            self.reset_utf8();
            out.push(Action::Print(char::REPLACEMENT_CHARACTER));
        }

        match self.state {
            ParserState::Ground => self.ground(byte, out),
            ParserState::Escape => self.escape(byte, out),
            ParserState::EscapeIntermediate => self.escape_intermediate(byte, out),
            ParserState::CsiEntry => self.csi_entry(byte, out),
            ParserState::CsiParam => self.csi_param(byte, out),
            ParserState::CsiIntermediate => self.csi_intermediate(byte, out),
            ParserState::CsiIgnore => self.csi_ignore(byte, out),
            ParserState::OscString => self.osc_string(byte, out),
            ParserState::EscapeInOsc => self.escape_in_osc(byte, out),
            ParserState::StringIgnore => self.string_ignore(byte, out),
            ParserState::EscapeInString => self.escape_in_string(byte, out),
        }
    }

    fn reset_utf8(&mut self) {
        self.utf8.clear();
        self.utf8_needed = 0;
    }

    fn push_raw(&mut self, byte: u8) {
        if self.raw.len() < MAX_SEQUENCE_BYTES {
            self.raw.push(byte);
        }
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.params.clear();
        self.current_param = None;
        self.private = None;
        self.intermediates.clear();
        self.raw.clear();
        self.raw.push(ESC);
    }

    fn to_ground(&mut self) {
        self.state = ParserState::Ground;
        self.raw.clear();
    }

    fn unsupported(&mut self, out: &mut Vec<Action>) {
        out.push(Action::Unsupported(std::mem::take(&mut self.raw)));
        self.state = ParserState::Ground;
    }

    /// C0 handling shared by the escape and CSI states. Returns true when the
    /// byte was consumed.
    fn control_in_sequence(&mut self, byte: u8, out: &mut Vec<Action>) -> bool {
        match byte {
            ESC => {
                out.push(Action::Unsupported(std::mem::take(&mut self.raw)));
                self.enter_escape();
                true
            }
            CAN | SUB => {
                self.to_ground();
                true
            }
            0x00..=0x1f => {
                out.push(Action::Execute(byte));
                true
            }
            _ => false,
        }
    }

    fn ground(&mut self, byte: u8, out: &mut Vec<Action>) {
        match byte {
            ESC => self.enter_escape(),
            0x00..=0x1f | 0x7f => out.push(Action::Execute(byte)),
            0x20..=0x7e => out.push(Action::Print(byte as char)),
            0xc2..=0xdf => self.begin_utf8(byte, 2),
            0xe0..=0xef => self.begin_utf8(byte, 3),
            0xf0..=0xf4 => self.begin_utf8(byte, 4),
            _ => out.push(Action::Print(char::REPLACEMENT_CHARACTER)),
        }
    }

    fn begin_utf8(&mut self, lead: u8, needed: usize) {
        self.utf8.clear();
        self.utf8.push(lead);
        self.utf8_needed = needed;
    }

    fn escape(&mut self, byte: u8, out: &mut Vec<Action>) {
        if self.control_in_sequence(byte, out) {
            return;
        }
        self.push_raw(byte);
        match byte {
            b'[' => self.state = ParserState::CsiEntry,
            b']' => {
                self.osc.clear();
                self.osc_truncated = false;
                self.state = ParserState::OscString;
            }
            b'P' | b'X' | b'^' | b'_' => self.state = ParserState::StringIgnore,
            0x20..=0x2f => {
                self.intermediates.push(byte);
                self.state = ParserState::EscapeIntermediate;
            }
            0x30..=0x7e => self.dispatch_esc(byte, out),
            0x7f => {}
            _ => self.unsupported(out),
        }
    }

    fn escape_intermediate(&mut self, byte: u8, out: &mut Vec<Action>) {
        if self.control_in_sequence(byte, out) {
            return;
        }
        self.push_raw(byte);
        match byte {
            0x20..=0x2f => self.intermediates.push(byte),
            0x30..=0x7e => self.dispatch_esc(byte, out),
            0x7f => {}
            _ => self.unsupported(out),
        }
    }

    fn csi_entry(&mut self, byte: u8, out: &mut Vec<Action>) {
        if self.control_in_sequence(byte, out) {
            return;
        }
        self.push_raw(byte);
        match byte {
            b'0'..=b'9' => {
                self.current_param = Some(u16::from(byte - b'0'));
                self.state = ParserState::CsiParam;
            }
            b';' | b':' => {
                self.params.push(0);
                self.state = ParserState::CsiParam;
            }
            0x3c..=0x3f => {
                self.private = Some(byte);
                self.state = ParserState::CsiParam;
            }
            0x20..=0x2f => {
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7e => self.dispatch_csi(byte, out),
            0x7f => {}
            _ => self.unsupported(out),
        }
    }

    fn csi_param(&mut self, byte: u8, out: &mut Vec<Action>) {
        if self.control_in_sequence(byte, out) {
            return;
        }
        self.push_raw(byte);
        if self.raw.len() >= MAX_SEQUENCE_BYTES {
            self.state = ParserState::CsiIgnore;
            return;
        }
        match byte {
            b'0'..=b'9' => {
                let digit = u16::from(byte - b'0');
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
            }
            b';' | b':' => {
                self.params.push(self.current_param.take().unwrap_or(0));
                if self.params.len() > MAX_PARAMS {
                    self.state = ParserState::CsiIgnore;
                }
            }
            0x3c..=0x3f => self.state = ParserState::CsiIgnore,
            0x20..=0x2f => {
                if let Some(param) = self.current_param.take() {
                    self.params.push(param);
                }
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7e => {
                if let Some(param) = self.current_param.take() {
                    self.params.push(param);
                }
                self.dispatch_csi(byte, out);
            }
            0x7f => {}
            _ => self.unsupported(out),
        }
    }

    fn csi_intermediate(&mut self, byte: u8, out: &mut Vec<Action>) {
        if self.control_in_sequence(byte, out) {
            return;
        }
        self.push_raw(byte);
        match byte {
            0x20..=0x2f => self.intermediates.push(byte),
            0x30..=0x3f => self.state = ParserState::CsiIgnore,
            0x40..=0x7e => self.dispatch_csi(byte, out),
            0x7f => {}
            _ => self.unsupported(out),
        }
    }

    fn csi_ignore(&mut self, byte: u8, out: &mut Vec<Action>) {
        if self.control_in_sequence(byte, out) {
            return;
        }
        self.push_raw(byte);
        if (0x40..=0x7e).contains(&byte) || byte >= 0x80 {
            self.unsupported(out);
        }
    }

    fn osc_string(&mut self, byte: u8, out: &mut Vec<Action>) {
        match byte {
            BEL => {
                self.push_raw(byte);
                self.dispatch_osc(out);
            }
            ESC => {
                self.push_raw(byte);
                self.state = ParserState::EscapeInOsc;
            }
            CAN | SUB => self.to_ground(),
            0x00..=0x1f => {}
            _ => {
                self.push_raw(byte);
                if self.osc.len() < MAX_OSC_BYTES {
                    self.osc.push(byte);
                } else {
                    self.osc_truncated = true;
                }
            }
        }
    }

    fn escape_in_osc(&mut self, byte: u8, out: &mut Vec<Action>) {
        if byte == b'\\' {
            self.push_raw(byte);
            self.dispatch_osc(out);
            return;
        }
        // Unterminated OSC followed by a new escape sequence.
        if let Some(last) = self.raw.last() {
            if *last == ESC {
                self.raw.pop();
            }
        }
        self.dispatch_osc(out);
        self.enter_escape();
        self.escape(byte, out);
    }

    fn string_ignore(&mut self, byte: u8, out: &mut Vec<Action>) {
        match byte {
            ESC => {
                self.push_raw(byte);
                self.state = ParserState::EscapeInString;
            }
            BEL => {
                self.push_raw(byte);
                self.unsupported(out);
            }
            CAN | SUB => self.to_ground(),
            _ => self.push_raw(byte),
        }
    }

    fn escape_in_string(&mut self, byte: u8, out: &mut Vec<Action>) {
        if byte == b'\\' {
            self.push_raw(byte);
            self.unsupported(out);
            return;
        }
        if let Some(last) = self.raw.last() {
            if *last == ESC {
                self.raw.pop();
            }
        }
        self.unsupported(out);
        self.enter_escape();
        self.escape(byte, out);
    }

    fn dispatch_esc(&mut self, final_byte: u8, out: &mut Vec<Action>) {
        out.push(Action::Esc(EscSequence {
            intermediates: std::mem::take(&mut self.intermediates),
            final_byte,
            raw: std::mem::take(&mut self.raw),
        }));
        self.state = ParserState::Ground;
    }

    fn dispatch_csi(&mut self, final_byte: u8, out: &mut Vec<Action>) {
        out.push(Action::Csi(CsiSequence {
            private: self.private.take(),
            params: std::mem::take(&mut self.params),
            intermediates: std::mem::take(&mut self.intermediates),
            final_byte,
            raw: std::mem::take(&mut self.raw),
        }));
        self.current_param = None;
        self.state = ParserState::Ground;
    }

    fn dispatch_osc(&mut self, out: &mut Vec<Action>) {
        out.push(Action::Osc(OscSequence {
            payload: std::mem::take(&mut self.osc),
            raw: std::mem::take(&mut self.raw),
            truncated: self.osc_truncated,
        }));
        self.osc_truncated = false;
        self.state = ParserState::Ground;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> Vec<Action> {
        let mut parser = VtParser::new();
        let mut out = Vec::new();
        for byte in bytes {
            parser.advance(*byte, &mut out);
        }
        out
    }

    #[test]
    fn csi_params_private_marker_and_defaults() {
        let actions = parse(b"\x1b[?1049h\x1b[;5H");
        let Action::Csi(first) = &actions[0] else {
            panic!("expected csi, got {actions:?}");
        };
        assert_eq!(first.private, Some(b'?'));
        assert_eq!(first.params, vec![1049]);
        assert_eq!(first.final_byte, b'h');
        let Action::Csi(second) = &actions[1] else {
            panic!("expected csi");
        };
        assert_eq!(second.param(0, 1), 1);
        assert_eq!(second.param(1, 1), 5);
        assert_eq!(second.raw, b"\x1b[;5H".to_vec());
    }

    #[test]
    fn split_sequences_and_utf8_survive_chunking() {
        let input = "a\u{1b}[31mé漢\u{1b}]0;title\u{7}".as_bytes();
        let whole = parse(input);
        let mut parser = VtParser::new();
        let mut chunked = Vec::new();
        for chunk in input.chunks(1) {
            for byte in chunk {
                parser.advance(*byte, &mut chunked);
            }
        }
        assert_eq!(whole, chunked);
        assert!(whole.contains(&Action::Print('é')));
        assert!(whole.contains(&Action::Print('漢')));
        assert!(!parser.is_mid_sequence());
    }

    #[test]
    fn osc_terminated_by_st_and_string_controls_are_unsupported() {
        let actions = parse(b"\x1b]2;hi\x1b\\\x1bPq#0\x1b\\x");
        let Action::Osc(osc) = &actions[0] else {
            panic!("expected osc");
        };
        assert_eq!(osc.payload, b"2;hi".to_vec());
        assert!(matches!(&actions[1], Action::Unsupported(raw) if raw.starts_with(b"\x1bP")));
        assert_eq!(actions[2], Action::Print('x'));
    }

    #[test]
    fn controls_inside_csi_execute_and_esc_restarts() {
        let actions = parse(b"\x1b[1\n2H\x1b[3\x1b[4m");
        assert_eq!(actions[0], Action::Execute(b'\n'));
        assert!(matches!(&actions[1], Action::Csi(csi) if csi.params == vec![12]));
        assert!(matches!(&actions[2], Action::Unsupported(raw) if raw == b"\x1b[3"));
        assert!(matches!(&actions[3], Action::Csi(csi) if csi.params == vec![4]));
    }

    #[test]
    fn invalid_utf8_becomes_replacement_character() {
        let actions = parse(&[0xc3, b'a', 0xff]);
        assert_eq!(
            actions,
            vec![
                Action::Print(char::REPLACEMENT_CHARACTER),
                Action::Print('a'),
                Action::Print(char::REPLACEMENT_CHARACTER),
            ]
        );
    }
}
