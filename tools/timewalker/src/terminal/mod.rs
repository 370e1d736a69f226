//! Terminal state machine: raw PTY bytes in, structured screen model out.
//!
//! The supported control sequence subset is an explicit [`CapabilitySet`].
//! Anything outside it is consumed without touching the grid and reported as
//! a [`TerminalNotice::UnknownSequence`].

pub mod machine;
pub mod parser;
pub mod state;

pub use machine::TerminalMachine;
pub use state::{AttrFlags, Cell, Color, Cursor, TerminalState};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// CUU CUD CUF CUB CNL CPL CHA CUP HVP VPA HPR VPR, IND NEL RI.
    CursorMovement,
    /// ED EL ECH and RIS.
    Erase,
    /// DECSTBM SU SD.
    ScrollRegion,
    /// SGR attributes, 16/256/truecolor.
    Sgr,
    /// Private modes 47, 1047, 1049.
    AlternateScreen,
    /// OSC 0, 1, 2.
    Title,
    /// Private mode 25.
    CursorVisibility,
    /// DECSC DECRC, SCOSC SCORC, private mode 1048.
    SaveRestoreCursor,
    /// ICH DCH IL DL.
    Edit,
    /// Private mode 7.
    Autowrap,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::CursorMovement,
        Capability::Erase,
        Capability::ScrollRegion,
        Capability::Sgr,
        Capability::AlternateScreen,
        Capability::Title,
        Capability::CursorVisibility,
        Capability::SaveRestoreCursor,
        Capability::Edit,
        Capability::Autowrap,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CursorMovement => "cursor_movement",
            Self::Erase => "erase",
            Self::ScrollRegion => "scroll_region",
            Self::Sgr => "sgr",
            Self::AlternateScreen => "alternate_screen",
            Self::Title => "title",
            Self::CursorVisibility => "cursor_visibility",
            Self::SaveRestoreCursor => "save_restore_cursor",
            Self::Edit => "edit",
            Self::Autowrap => "autowrap",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::all()
    }
}

impl CapabilitySet {
    pub fn all() -> Self {
        Self(Capability::ALL.into_iter().collect())
    }

    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn from_list(caps: &[Capability]) -> Self {
        Self(caps.iter().copied().collect())
    }

    pub fn without(mut self, cap: Capability) -> Self {
        self.0.remove(&cap);
        self
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    /// Not part of the recognised subset.
    Unsupported,
    /// Recognised but its capability is switched off.
    Disabled,
}

/// Side-channel events produced while decoding. `offset` is the count of
/// bytes fed to the machine when the notice was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum TerminalNotice {
    Bell {
        offset: u64,
    },
    TitleChanged {
        title: String,
        offset: u64,
    },
    UnknownSequence {
        sequence: String,
        reason: UnknownReason,
        offset: u64,
    },
}

/// Printable rendering of a control sequence, e.g. `\x1b[5n`.
pub fn escape_sequence_text(raw: &[u8]) -> String {
    raw.iter()
        .map(|byte| match byte {
            0x20..=0x7e => (*byte as char).to_string(),
            _ => format!("\\x{byte:02x}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_names_round_trip() {
        for cap in Capability::ALL {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse("sixel"), None);
        let set = CapabilitySet::all().without(Capability::Title);
        assert!(!set.contains(Capability::Title));
        assert!(set.contains(Capability::Sgr));
    }

    #[test]
    fn capability_set_serializes_as_sorted_names() {
        let set = CapabilitySet::from_list(&[Capability::Title, Capability::Sgr]);
        let json = serde_json::to_string(&set).expect("serialize");
        assert_eq!(json, r#"["sgr","title"]"#);
        let back: CapabilitySet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, set);
        assert!(serde_json::from_str::<CapabilitySet>(r#"["sixel"]"#).is_err());
    }

    #[test]
    fn escape_text_is_printable() {
        assert_eq!(escape_sequence_text(b"\x1b[5n"), "\\x1b[5n");
    }
}
