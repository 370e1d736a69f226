//! Wait predicates and the decoded transcript they are evaluated against.

use crate::session::scenario::Expectation;
use crate::session::template;
use crate::terminal::parser::{Action, VtParser};
use crate::terminal::state::TerminalState;
use regex::Regex;
use std::collections::BTreeMap;

const EVIDENCE_CHARS: usize = 120;

/// Named checks a scenario can wait on besides text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    PromptReady,
    ProcessExited,
    ScreenStable,
    AlternateScreen,
}

impl Condition {
    pub const ALL: [Condition; 4] = [
        Condition::PromptReady,
        Condition::ProcessExited,
        Condition::ScreenStable,
        Condition::AlternateScreen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptReady => "prompt_ready",
            Self::ProcessExited => "process_exited",
            Self::ScreenStable => "screen_stable",
            Self::AlternateScreen => "alternate_screen",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|condition| condition.as_str() == name)
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Contains(String),
    Regex(Regex),
    Condition(Condition),
}

/// What the controller knows at one poll.
pub struct Observation<'a> {
    /// Decoded output since the most recent input.
    pub recent: &'a str,
    pub screen: &'a TerminalState,
    pub prompt: &'a str,
    pub exited: bool,
    pub stable: bool,
}

impl Predicate {
    /// Renders templates and compiles the expectation.
    pub fn resolve(expect: &Expectation, vars: &BTreeMap<String, String>) -> Result<Self, String> {
        if let Some(needle) = &expect.contains {
            return Ok(Self::Contains(template::render(needle, vars)?));
        }
        if let Some(pattern) = &expect.regex {
            let pattern = template::render(pattern, vars)?;
            return Regex::new(&pattern)
                .map(Self::Regex)
                .map_err(|e| format!("expect.regex: {e}"));
        }
        if let Some(name) = &expect.condition {
            return Condition::parse(name)
                .map(Self::Condition)
                .ok_or_else(|| format!("unknown condition `{name}`"));
        }
        Err("expect has no predicate".to_string())
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Contains(needle) => format!("contains:{needle}"),
            Self::Regex(regex) => format!("regex:{}", regex.as_str()),
            Self::Condition(condition) => format!("condition:{}", condition.as_str()),
        }
    }

    /// Evidence of the match, or `None` while unmet.
    pub fn evaluate(&self, obs: &Observation<'_>) -> Option<String> {
        match self {
            Self::Contains(needle) => obs.recent.contains(needle.as_str()).then(|| needle.clone()),
            Self::Regex(regex) => regex
                .find(obs.recent)
                .map(|found| clip(found.as_str(), EVIDENCE_CHARS)),
            Self::Condition(Condition::PromptReady) => prompt_ready(obs),
            Self::Condition(Condition::ProcessExited) => obs.exited.then(|| "exited".to_string()),
            Self::Condition(Condition::ScreenStable) => obs.stable.then(|| "stable".to_string()),
            Self::Condition(Condition::AlternateScreen) => obs
                .screen
                .alternate_screen
                .then(|| "alternate screen active".to_string()),
        }
    }
}

/// The prompt must be the newest output and sit left of the cursor.
fn prompt_ready(obs: &Observation<'_>) -> Option<String> {
    let prompt = obs.prompt.trim_end();
    if prompt.is_empty() || !obs.recent.trim_end().ends_with(prompt) {
        return None;
    }
    let cursor = obs.screen.cursor;
    let line = obs.screen.range_text(cursor.row, 0, cursor.col);
    line.trim_end()
        .ends_with(prompt)
        .then(|| clip(line.trim_end(), EVIDENCE_CHARS))
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Escape-stripped text of everything the process printed.
///
/// Printable characters, newlines and tabs survive; every other control and
/// escape sequence is dropped. The window used for predicates starts at the
/// last [`Transcript::mark`].
#[derive(Debug, Default)]
pub struct Transcript {
    parser: VtParser,
    actions: Vec<Action>,
    text: String,
    mark: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        for byte in chunk {
            self.parser.advance(*byte, &mut self.actions);
            for action in self.actions.drain(..) {
                match action {
                    Action::Print(c) => self.text.push(c),
                    Action::Execute(b'\n') => self.text.push('\n'),
                    Action::Execute(b'\t') => self.text.push('\t'),
                    _ => {}
                }
            }
        }
    }

    /// Starts a new window at the current end of the text.
    pub fn mark(&mut self) {
        self.mark = self.text.len();
    }

    pub fn recent(&self) -> &str {
        &self.text[self.mark..]
    }

    pub fn all(&self) -> &str {
        &self.text
    }

    /// Last `max_chars` characters of the whole transcript.
    pub fn tail(&self, max_chars: usize) -> String {
        let count = self.text.chars().count();
        self.text.chars().skip(count.saturating_sub(max_chars)).collect()
    }
}
