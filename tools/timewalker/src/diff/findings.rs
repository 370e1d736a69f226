//! The findings/verdict document handed to the reporting layer.

use crate::errors::TimewalkerError;
use crate::types::{Severity, Verdict};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const FINDINGS_FORMAT_VERSION: u32 = 1;
pub const FINDINGS_FILE: &str = "findings.json";

/// Cells `[col_start, col_end)` on one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub row: u16,
    pub col_start: u16,
    pub col_end: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    Cells,
    /// Screen size, or a row whose width disagrees with it.
    Dimensions,
    Cursor,
    Title,
    AlternateScreen,
    /// One scrollback line; `region.row` indexes the scrollback, oldest first.
    Scrollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeveritySource {
    Rule,
    Default,
    Attribute,
    Dimension,
    Classifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub label: String,
    pub kind: DiscrepancyKind,
    pub region: Region,
    pub expected: String,
    pub actual: String,
    /// Glyphs match; only colors or attributes differ.
    pub attribute_only: bool,
    pub severity: Severity,
    pub severity_source: SeveritySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_rule: Option<String>,
    pub ignored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
}

impl Discrepancy {
    pub fn new(
        label: &str,
        kind: DiscrepancyKind,
        region: Region,
        expected: String,
        actual: String,
    ) -> Self {
        Self {
            label: label.to_string(),
            kind,
            region,
            expected,
            actual,
            attribute_only: false,
            severity: Severity::Major,
            severity_source: SeveritySource::Default,
            severity_rule: None,
            ignored: false,
            ignored_by: None,
            annotation: None,
        }
    }

    pub fn blocks(&self, threshold: Severity) -> bool {
        !self.ignored && self.severity >= threshold
    }
}

/// Label-set differences. Never suppressed by ignore rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "finding", rename_all = "snake_case")]
pub enum StructuralFinding {
    /// In the baseline, absent from the candidate.
    MissingKeyframe { label: String },
    /// In the candidate, absent from the baseline.
    AddedKeyframe { label: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFindings {
    pub label: String,
    pub discrepancies: Vec<Discrepancy>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingCounts {
    pub structural: usize,
    pub discrepancies: usize,
    pub ignored: usize,
    pub blocking: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingsReport {
    pub format_version: u32,
    pub scenario: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_version: Option<u64>,
    pub verdict: Verdict,
    pub threshold: Severity,
    pub structural: Vec<StructuralFinding>,
    pub labels: Vec<LabelFindings>,
    pub warnings: Vec<String>,
    pub classifier_degraded: bool,
    pub counts: FindingCounts,
}

impl FindingsReport {
    pub fn discrepancies(&self) -> impl Iterator<Item = &Discrepancy> {
        self.labels.iter().flat_map(|label| label.discrepancies.iter())
    }

    pub fn write_to(&self, path: &Path) -> Result<(), TimewalkerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TimewalkerError::Io(e.to_string()))?;
        }
        let body =
            serde_json::to_string_pretty(self).map_err(|e| TimewalkerError::Io(e.to_string()))?;
        std::fs::write(path, body)
            .map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))
    }

    pub fn load(path: &Path) -> Result<Self, TimewalkerError> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&body).map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))
    }

    /// One line per finding, for the terminal.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "{} {} (threshold {}): {} structural, {} discrepancies, {} ignored, {} blocking",
            self.scenario,
            self.verdict.as_str(),
            self.threshold.as_str(),
            self.counts.structural,
            self.counts.discrepancies,
            self.counts.ignored,
            self.counts.blocking
        )];
        for finding in &self.structural {
            lines.push(match finding {
                StructuralFinding::MissingKeyframe { label } => {
                    format!("  missing keyframe `{label}`")
                }
                StructuralFinding::AddedKeyframe { label } => format!("  added keyframe `{label}`"),
            });
        }
        for d in self.discrepancies() {
            let marker = if d.ignored { "ignored" } else { d.severity.as_str() };
            lines.push(format!(
                "  [{marker}] {} row {} cols {}..{}: expected {:?}, actual {:?}",
                d.label, d.region.row, d.region.col_start, d.region.col_end, d.expected, d.actual
            ));
        }
        for warning in &self.warnings {
            lines.push(format!("  warning: {warning}"));
        }
        lines.join("\n")
    }
}
