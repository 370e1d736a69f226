//! Structural and cell-level comparison of two keyframe sets.

use crate::config::DiffConfig;
use crate::diff::classifier::DiscrepancyClassifier;
use crate::diff::findings::{
    Discrepancy, DiscrepancyKind, FindingCounts, LabelFindings, Region, SeveritySource,
    StructuralFinding,
};
use crate::diff::rules::{CompiledIgnoreRule, CompiledSeverityRule};
use crate::errors::TimewalkerError;
use crate::logging::append_run_log;
use crate::replay::Keyframe;
use crate::terminal::state::line_text;
use crate::terminal::TerminalState;
use crate::types::{Severity, Verdict};
use serde_json::json;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub threshold: Severity,
    pub default_severity: Severity,
    pub attribute_severity: Severity,
    pub dimension_severity: Severity,
    pub compare_cursor: bool,
    pub ignore: Vec<CompiledIgnoreRule>,
    pub severity: Vec<CompiledSeverityRule>,
}

impl DiffOptions {
    pub fn from_config(cfg: &DiffConfig) -> Result<Self, TimewalkerError> {
        Ok(Self {
            threshold: cfg.threshold,
            default_severity: cfg.default_severity,
            attribute_severity: cfg.attribute_severity,
            dimension_severity: cfg.dimension_severity,
            compare_cursor: cfg.compare_cursor,
            ignore: cfg
                .ignore
                .iter()
                .cloned()
                .map(CompiledIgnoreRule::new)
                .collect::<Result<_, _>>()?,
            severity: cfg
                .severity
                .iter()
                .cloned()
                .map(CompiledSeverityRule::new)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            threshold: Severity::Minor,
            default_severity: Severity::Major,
            attribute_severity: Severity::Minor,
            dimension_severity: Severity::Critical,
            compare_cursor: false,
            ignore: Vec::new(),
            severity: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    pub verdict: Verdict,
    pub structural: Vec<StructuralFinding>,
    pub labels: Vec<LabelFindings>,
    pub warnings: Vec<String>,
    pub classifier_degraded: bool,
    pub counts: FindingCounts,
}

pub struct DiffEngine<'a> {
    options: &'a DiffOptions,
    classifier: Option<&'a dyn DiscrepancyClassifier>,
}

impl<'a> DiffEngine<'a> {
    pub fn new(options: &'a DiffOptions) -> Self {
        Self {
            options,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: &'a dyn DiscrepancyClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn compare(&self, baseline: &[Keyframe], candidate: &[Keyframe]) -> DiffOutcome {
        let baseline_labels: BTreeSet<&str> = baseline.iter().map(|k| k.label.as_str()).collect();
        let candidate_labels: BTreeSet<&str> =
            candidate.iter().map(|k| k.label.as_str()).collect();

        let mut structural = Vec::new();
        for keyframe in baseline {
            if !candidate_labels.contains(keyframe.label.as_str()) {
                structural.push(StructuralFinding::MissingKeyframe {
                    label: keyframe.label.clone(),
                });
            }
        }
        for keyframe in candidate {
            if !baseline_labels.contains(keyframe.label.as_str()) {
                structural.push(StructuralFinding::AddedKeyframe {
                    label: keyframe.label.clone(),
                });
            }
        }

        let mut labels = Vec::new();
        for expected in baseline {
            let Some(actual) = candidate.iter().find(|k| k.label == expected.label) else {
                continue;
            };
            let mut discrepancies = compare_states(
                &expected.label,
                &expected.state,
                &actual.state,
                self.options.compare_cursor,
            );
            for discrepancy in &mut discrepancies {
                self.apply_rules(discrepancy, &expected.state, &actual.state);
            }
            labels.push(LabelFindings {
                label: expected.label.clone(),
                discrepancies,
            });
        }

        let mut warnings = Vec::new();
        let mut classifier_degraded = false;
        if let Some(classifier) = self.classifier {
            'outer: for findings in &mut labels {
                for discrepancy in &mut findings.discrepancies {
                    if discrepancy.ignored {
                        continue;
                    }
                    match classifier.classify(discrepancy) {
                        Ok(annotation) => {
                            let may_override = matches!(
                                discrepancy.severity_source,
                                SeveritySource::Default | SeveritySource::Attribute
                            );
                            if let (true, Some(severity)) = (may_override, annotation.severity) {
                                discrepancy.severity = severity;
                                discrepancy.severity_source = SeveritySource::Classifier;
                            }
                            discrepancy.annotation = Some(annotation);
                        }
                        Err(error) => {
                            classifier_degraded = true;
                            warnings.push(format!(
                                "classifier unavailable, using rule-based severities: {error}"
                            ));
                            append_run_log(
                                "warn",
                                "diff.classifier_degraded",
                                json!({ "error": error.to_string() }),
                            );
                            break 'outer;
                        }
                    }
                }
            }
        }

        let threshold = self.options.threshold;
        let all = labels.iter().flat_map(|l| l.discrepancies.iter());
        let counts = FindingCounts {
            structural: structural.len(),
            discrepancies: all.clone().count(),
            ignored: all.clone().filter(|d| d.ignored).count(),
            blocking: all.filter(|d| d.blocks(threshold)).count(),
        };
        let verdict = if counts.structural == 0 && counts.blocking == 0 {
            Verdict::Pass
        } else {
            Verdict::Fail
        };

        DiffOutcome {
            verdict,
            structural,
            labels,
            warnings,
            classifier_degraded,
            counts,
        }
    }

    fn apply_rules(
        &self,
        discrepancy: &mut Discrepancy,
        expected: &TerminalState,
        actual: &TerminalState,
    ) {
        let row = discrepancy.region.row as usize;
        let (expected_row, actual_row) = match discrepancy.kind {
            DiscrepancyKind::Cells => (
                expected.grid.get(row).map(Vec::as_slice),
                actual.grid.get(row).map(Vec::as_slice),
            ),
            DiscrepancyKind::Scrollback => (
                expected.scrollback.get(row).map(Vec::as_slice),
                actual.scrollback.get(row).map(Vec::as_slice),
            ),
            _ => (None, None),
        };
        if let Some(rule) = self
            .options
            .ignore
            .iter()
            .find(|rule| rule.covers(discrepancy, expected_row, actual_row))
        {
            discrepancy.ignored = true;
            discrepancy.ignored_by = Some(rule.rule.display_name());
        }

        if let Some(rule) = self.options.severity.iter().find(|rule| rule.matches(discrepancy)) {
            discrepancy.severity = rule.rule.severity;
            discrepancy.severity_source = SeveritySource::Rule;
            discrepancy.severity_rule = Some(rule.display_name());
        } else if discrepancy.kind == DiscrepancyKind::Dimensions {
            discrepancy.severity = self.options.dimension_severity;
            discrepancy.severity_source = SeveritySource::Dimension;
        } else if discrepancy.attribute_only {
            discrepancy.severity = self.options.attribute_severity;
            discrepancy.severity_source = SeveritySource::Attribute;
        } else {
            discrepancy.severity = self.options.default_severity;
            discrepancy.severity_source = SeveritySource::Default;
        }
    }
}

/// Raw differences between two screens, before any rule is applied. Each
/// cell discrepancy is one maximal run of differing cells on one row.
pub fn compare_states(
    label: &str,
    expected: &TerminalState,
    actual: &TerminalState,
    compare_cursor: bool,
) -> Vec<Discrepancy> {
    if (expected.rows, expected.cols) != (actual.rows, actual.cols) {
        return vec![Discrepancy::new(
            label,
            DiscrepancyKind::Dimensions,
            Region {
                row: 0,
                col_start: 0,
                col_end: expected.cols.max(actual.cols),
            },
            format!("{}x{}", expected.rows, expected.cols),
            format!("{}x{}", actual.rows, actual.cols),
        )];
    }

    let mut out = Vec::new();
    if expected.alternate_screen != actual.alternate_screen {
        let describe = |state: &TerminalState| {
            let screen = if state.alternate_screen { "alternate" } else { "primary" };
            screen.to_string()
        };
        out.push(Discrepancy::new(
            label,
            DiscrepancyKind::AlternateScreen,
            Region {
                row: 0,
                col_start: 0,
                col_end: expected.cols,
            },
            describe(expected),
            describe(actual),
        ));
    }
    if expected.title != actual.title {
        out.push(Discrepancy::new(
            label,
            DiscrepancyKind::Title,
            Region {
                row: 0,
                col_start: 0,
                col_end: 0,
            },
            expected.title.clone(),
            actual.title.clone(),
        ));
    }

    let rows = expected.grid.len().max(actual.grid.len());
    for row_idx in 0..rows {
        let left = expected.grid.get(row_idx).map(Vec::as_slice).unwrap_or_default();
        let right = actual.grid.get(row_idx).map(Vec::as_slice).unwrap_or_default();
        if left.len() != right.len() {
            out.push(Discrepancy::new(
                label,
                DiscrepancyKind::Dimensions,
                Region {
                    row: row_idx as u16,
                    col_start: 0,
                    col_end: left.len().max(right.len()) as u16,
                },
                format!("row {row_idx} has {} cells", left.len()),
                format!("row {row_idx} has {} cells", right.len()),
            ));
            continue;
        }
        let differs = |col: usize| !left[col].same_content(&right[col]);
        let mut col = 0;
        while col < left.len() {
            if !differs(col) {
                col += 1;
                continue;
            }
            let start = col;
            while col < left.len() && differs(col) {
                col += 1;
            }
            let attribute_only = (start..col).all(|c| {
                left[c].ch == right[c].ch && left[c].width == right[c].width
            });
            let mut discrepancy = Discrepancy::new(
                label,
                DiscrepancyKind::Cells,
                Region {
                    row: row_idx as u16,
                    col_start: start as u16,
                    col_end: col as u16,
                },
                line_text(&left[start..col]),
                line_text(&right[start..col]),
            );
            discrepancy.attribute_only = attribute_only;
            out.push(discrepancy);
        }
    }

    // Scrollback is compared by text only.
    let history = expected.scrollback.len().max(actual.scrollback.len());
    for line_idx in 0..history {
        let text = |state: &TerminalState| {
            state
                .scrollback
                .get(line_idx)
                .map(|line| line_text(line).trim_end().to_string())
        };
        let (left, right) = (text(expected), text(actual));
        if left == right {
            continue;
        }
        let width = |state: &TerminalState| {
            state.scrollback.get(line_idx).map_or(0, |line| {
                line.iter().rposition(|cell| cell.ch != ' ').map_or(0, |last| last + 1)
            })
        };
        out.push(Discrepancy::new(
            label,
            DiscrepancyKind::Scrollback,
            Region {
                row: line_idx as u16,
                col_start: 0,
                col_end: width(expected).max(width(actual)) as u16,
            },
            left.unwrap_or_default(),
            right.unwrap_or_default(),
        ));
    }

    if compare_cursor && expected.cursor != actual.cursor {
        let describe = |state: &TerminalState| {
            format!(
                "{},{}{}",
                state.cursor.row,
                state.cursor.col,
                if state.cursor.visible { "" } else { " hidden" }
            )
        };
        out.push(Discrepancy::new(
            label,
            DiscrepancyKind::Cursor,
            Region {
                row: actual.cursor.row,
                col_start: actual.cursor.col,
                col_end: actual.cursor.col.saturating_add(1),
            },
            describe(expected),
            describe(actual),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::classifier::ScriptedClassifier;
    use crate::diff::findings::Annotation;
    use crate::diff::rules::{IgnoreRule, SeverityRule};
    use crate::terminal::{CapabilitySet, TerminalMachine};

    fn keyframe(label: &str, bytes: &str) -> Keyframe {
        let mut machine = TerminalMachine::new(4, 20, CapabilitySet::all(), 10);
        machine.append_bytes(bytes.as_bytes());
        Keyframe::capture(label, None, machine.bytes_fed(), machine.current_grid())
    }

    #[test]
    fn identical_sets_pass_with_no_findings() {
        let set = vec![keyframe("a", "hello\r\nworld"), keyframe("b", "\x1b[1mbold")];
        let options = DiffOptions::default();
        let outcome = DiffEngine::new(&options).compare(&set, &set);
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(outcome.counts, FindingCounts::default());
    }

    #[test]
    fn one_changed_glyph_is_one_discrepancy() {
        let options = DiffOptions::default();
        let outcome = DiffEngine::new(&options).compare(
            &[keyframe("after_echo", "echo hello\r\nhallo")],
            &[keyframe("after_echo", "echo hello\r\nhello")],
        );
        assert_eq!(outcome.verdict, Verdict::Fail);
        let all: Vec<&Discrepancy> = outcome.labels.iter().flat_map(|l| &l.discrepancies).collect();
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[0].region,
            Region {
                row: 1,
                col_start: 1,
                col_end: 2
            }
        );
        assert_eq!((all[0].expected.as_str(), all[0].actual.as_str()), ("a", "e"));
        assert_eq!(all[0].severity, Severity::Major);
    }

    #[test]
    fn label_set_differences_are_structural_only() {
        let options = DiffOptions::default();
        let outcome = DiffEngine::new(&options).compare(
            &[keyframe("A", "same"), keyframe("B", "b")],
            &[keyframe("A", "same"), keyframe("C", "c")],
        );
        assert_eq!(
            outcome.structural,
            vec![
                StructuralFinding::MissingKeyframe {
                    label: "B".to_string()
                },
                StructuralFinding::AddedKeyframe {
                    label: "C".to_string()
                },
            ]
        );
        assert_eq!(outcome.counts.discrepancies, 0);
        assert_eq!(outcome.verdict, Verdict::Fail);
    }

    #[test]
    fn ignored_discrepancies_stay_in_the_output_but_not_the_verdict() {
        let options = DiffOptions {
            ignore: vec![CompiledIgnoreRule::new(IgnoreRule {
                name: Some("clock".to_string()),
                labels: Vec::new(),
                region: None,
                pattern: Some(r"\d\d:\d\d:\d\d".to_string()),
            })
            .expect("rule")],
            ..DiffOptions::default()
        };
        let outcome = DiffEngine::new(&options).compare(
            &[keyframe("t", "now 10:00:00")],
            &[keyframe("t", "now 10:00:09")],
        );
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(outcome.counts.ignored, 1);
        let d = &outcome.labels[0].discrepancies[0];
        assert!(d.ignored);
        assert_eq!(d.ignored_by.as_deref(), Some("clock"));
    }

    #[test]
    fn attribute_only_changes_use_attribute_severity() {
        let options = DiffOptions {
            threshold: Severity::Major,
            ..DiffOptions::default()
        };
        let outcome = DiffEngine::new(&options).compare(
            &[keyframe("x", "\x1b[31mred")],
            &[keyframe("x", "\x1b[32mred")],
        );
        let d = &outcome.labels[0].discrepancies[0];
        assert!(d.attribute_only);
        assert_eq!(d.severity, Severity::Minor);
        assert_eq!(outcome.verdict, Verdict::Pass);
    }

    #[test]
    fn dimension_mismatch_is_critical() {
        let mut machine = TerminalMachine::new(5, 20, CapabilitySet::all(), 10);
        machine.append_bytes(b"hi");
        let tall = Keyframe::capture("x", None, 2, machine.current_grid());
        let options = DiffOptions::default();
        let outcome = DiffEngine::new(&options).compare(&[keyframe("x", "hi")], &[tall]);
        let d = &outcome.labels[0].discrepancies[0];
        assert_eq!(d.kind, DiscrepancyKind::Dimensions);
        assert_eq!(d.severity, Severity::Critical);
        assert_eq!((d.expected.as_str(), d.actual.as_str()), ("4x20", "5x20"));
    }

    #[test]
    fn ragged_row_is_a_critical_finding_not_a_panic() {
        let expected = keyframe("x", "abc");
        let mut actual = keyframe("x", "abc");
        actual.state.grid[2].truncate(5);
        let options = DiffOptions::default();
        let outcome = DiffEngine::new(&options).compare(&[expected], &[actual]);
        let ds = &outcome.labels[0].discrepancies;
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].kind, DiscrepancyKind::Dimensions);
        assert_eq!(ds[0].region.row, 2);
        assert_eq!(ds[0].severity, Severity::Critical);
        assert_eq!(ds[0].actual, "row 2 has 5 cells");
        assert_eq!(outcome.verdict, Verdict::Fail);
    }

    #[test]
    fn title_and_alternate_screen_are_compared() {
        let options = DiffOptions::default();
        let outcome = DiffEngine::new(&options).compare(
            &[keyframe("x", "\x1b]0;editor\x07")],
            &[keyframe("x", "\x1b]0;shell\x07\x1b[?1049h")],
        );
        let ds = &outcome.labels[0].discrepancies;
        let kinds: Vec<_> = ds.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DiscrepancyKind::AlternateScreen, DiscrepancyKind::Title]);
        assert_eq!((ds[0].expected.as_str(), ds[0].actual.as_str()), ("primary", "alternate"));
        assert_eq!((ds[1].expected.as_str(), ds[1].actual.as_str()), ("editor", "shell"));
        assert_eq!(outcome.verdict, Verdict::Fail);
    }

    #[test]
    fn scrolled_off_lines_are_compared_by_text() {
        let options = DiffOptions::default();
        let outcome = DiffEngine::new(&options).compare(
            &[keyframe("x", "one\r\n2\r\n3\r\n4\r\n5")],
            &[keyframe("x", "ONE\r\n2\r\n3\r\n4\r\n5")],
        );
        let ds = &outcome.labels[0].discrepancies;
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].kind, DiscrepancyKind::Scrollback);
        assert_eq!(ds[0].region.row, 0);
        assert_eq!((ds[0].expected.as_str(), ds[0].actual.as_str()), ("one", "ONE"));

        let ignoring = DiffOptions {
            ignore: vec![CompiledIgnoreRule::new(IgnoreRule {
                name: None,
                labels: Vec::new(),
                region: None,
                pattern: Some("(?i)one".to_string()),
            })
            .expect("rule")],
            ..DiffOptions::default()
        };
        let outcome = DiffEngine::new(&ignoring).compare(
            &[keyframe("x", "one\r\n2\r\n3\r\n4\r\n5")],
            &[keyframe("x", "ONE\r\n2\r\n3\r\n4\r\n5")],
        );
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(outcome.counts.ignored, 1);
    }

    #[test]
    fn cursor_is_compared_only_when_enabled() {
        let a = keyframe("x", "ab\x1b[1;1H");
        let b = keyframe("x", "ab");
        let off = DiffOptions::default();
        assert_eq!(DiffEngine::new(&off).compare(&[a.clone()], &[b.clone()]).counts.discrepancies, 0);
        let on = DiffOptions {
            compare_cursor: true,
            ..DiffOptions::default()
        };
        let outcome = DiffEngine::new(&on).compare(&[a], &[b]);
        assert_eq!(outcome.labels[0].discrepancies[0].kind, DiscrepancyKind::Cursor);
    }

    #[test]
    fn classifier_cannot_downgrade_rule_severities() {
        let options = DiffOptions {
            severity: vec![CompiledSeverityRule::new(SeverityRule {
                name: None,
                labels: Vec::new(),
                pattern: "panic".to_string(),
                severity: Severity::Critical,
            })
            .expect("rule")],
            ..DiffOptions::default()
        };
        let classifier = ScriptedClassifier::answering(Annotation {
            severity: Some(Severity::Info),
            note: "cosmetic".to_string(),
        });
        let outcome = DiffEngine::new(&options).with_classifier(&classifier).compare(
            &[keyframe("x", "ok\r\nfine")],
            &[keyframe("x", "panic\r\nfane")],
        );
        let ds = &outcome.labels[0].discrepancies;
        assert_eq!(ds.len(), 2);
        assert_eq!(ds[0].severity, Severity::Critical);
        assert_eq!(ds[0].severity_source, SeveritySource::Rule);
        assert_eq!(ds[1].severity, Severity::Info);
        assert_eq!(ds[1].severity_source, SeveritySource::Classifier);
        assert_eq!(outcome.verdict, Verdict::Fail);
    }

    #[test]
    fn unavailable_classifier_degrades_to_rules() {
        let options = DiffOptions::default();
        let classifier = ScriptedClassifier::unavailable("connection refused");
        let outcome = DiffEngine::new(&options).with_classifier(&classifier).compare(
            &[keyframe("x", "a")],
            &[keyframe("x", "b")],
        );
        assert!(outcome.classifier_degraded);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.labels[0].discrepancies[0].severity, Severity::Major);
        assert_eq!(classifier.seen(), vec!["x".to_string()]);
    }
}
