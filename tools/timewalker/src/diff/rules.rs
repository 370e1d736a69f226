//! Ignore and severity rules applied to discrepancies.

use crate::diff::findings::Discrepancy;
use crate::errors::TimewalkerError;
use crate::terminal::Cell;
use crate::types::Severity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_width::UnicodeWidthChar;

fn unbounded() -> u16 {
    u16::MAX
}

/// Half-open rectangle of grid cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleRegion {
    #[serde(default)]
    pub row_start: u16,
    #[serde(default = "unbounded")]
    pub row_end: u16,
    #[serde(default)]
    pub col_start: u16,
    #[serde(default = "unbounded")]
    pub col_end: u16,
}

impl RuleRegion {
    fn covers(&self, row: u16, col_start: u16, col_end: u16) -> bool {
        row >= self.row_start
            && row < self.row_end
            && col_start >= self.col_start
            && col_end <= self.col_end
    }
}

/// Suppresses discrepancies from the verdict. Empty `labels` applies to every
/// label. When both `region` and `pattern` are set both must cover the
/// discrepancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IgnoreRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub region: Option<RuleRegion>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub pattern: String,
    pub severity: Severity,
}

fn applies_to(labels: &[String], label: &str) -> bool {
    labels.is_empty() || labels.iter().any(|candidate| candidate == label)
}

fn compile(pattern: &str, what: &str) -> Result<Regex, TimewalkerError> {
    Regex::new(pattern)
        .map_err(|e| TimewalkerError::InvalidConfig(format!("{what} pattern {pattern:?}: {e}")))
}

#[derive(Debug, Clone)]
pub struct CompiledIgnoreRule {
    pub rule: IgnoreRule,
    regex: Option<Regex>,
}

impl CompiledIgnoreRule {
    pub fn new(rule: IgnoreRule) -> Result<Self, TimewalkerError> {
        if rule.region.is_none() && rule.pattern.is_none() {
            return Err(TimewalkerError::InvalidConfig(format!(
                "ignore rule {} needs a region or a pattern",
                rule.display_name()
            )));
        }
        let regex = rule
            .pattern
            .as_deref()
            .map(|pattern| compile(pattern, "ignore"))
            .transpose()?;
        Ok(Self { rule, regex })
    }

    /// `expected_row`/`actual_row` are the full rows the discrepancy lies on.
    pub fn covers(
        &self,
        discrepancy: &Discrepancy,
        expected_row: Option<&[Cell]>,
        actual_row: Option<&[Cell]>,
    ) -> bool {
        if !applies_to(&self.rule.labels, &discrepancy.label) {
            return false;
        }
        let region = &discrepancy.region;
        if let Some(rule_region) = &self.rule.region {
            if !rule_region.covers(region.row, region.col_start, region.col_end) {
                return false;
            }
        }
        if let Some(regex) = &self.regex {
            let (Some(expected), Some(actual)) = (expected_row, actual_row) else {
                return false;
            };
            return pattern_covers(regex, expected, region.col_start, region.col_end)
                && pattern_covers(regex, actual, region.col_start, region.col_end);
        }
        true
    }
}

impl IgnoreRule {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.pattern.clone())
            .unwrap_or_else(|| "region".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CompiledSeverityRule {
    pub rule: SeverityRule,
    regex: Regex,
}

impl CompiledSeverityRule {
    pub fn new(rule: SeverityRule) -> Result<Self, TimewalkerError> {
        let regex = compile(&rule.pattern, "severity")?;
        Ok(Self { rule, regex })
    }

    pub fn matches(&self, discrepancy: &Discrepancy) -> bool {
        applies_to(&self.rule.labels, &discrepancy.label)
            && (self.regex.is_match(&discrepancy.expected) || self.regex.is_match(&discrepancy.actual))
    }

    pub fn display_name(&self) -> String {
        self.rule
            .name
            .clone()
            .unwrap_or_else(|| self.rule.pattern.clone())
    }
}

/// True when one match of `regex` on the row spans columns `[col_start, col_end)`.
fn pattern_covers(regex: &Regex, row: &[Cell], col_start: u16, col_end: u16) -> bool {
    let mut text = String::new();
    // (byte offset in `text`, first column, column past the glyph)
    let mut spans: Vec<(usize, u16, u16)> = Vec::new();
    for (col, cell) in row.iter().enumerate() {
        if cell.is_continuation() {
            continue;
        }
        let width = cell.ch.width().unwrap_or(1).max(1) as u16;
        spans.push((text.len(), col as u16, col as u16 + width));
        text.push(cell.ch);
    }
    let column_at = |byte: usize| spans.iter().find(|(offset, _, _)| *offset == byte);
    regex.find_iter(&text).any(|found| {
        if found.start() == found.end() {
            return false;
        }
        let Some((_, first, _)) = column_at(found.start()) else {
            return false;
        };
        let last_end = spans
            .iter()
            .filter(|(offset, _, _)| *offset < found.end())
            .map(|(_, _, end)| *end)
            .max()
            .unwrap_or(*first);
        *first <= col_start && last_end >= col_end
    })
}
