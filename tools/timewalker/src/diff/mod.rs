//! Keyframe comparison, ignore rules, severities and the verdict.

pub mod classifier;
pub mod engine;
pub mod findings;
pub mod rules;

pub use classifier::{DiscrepancyClassifier, ScriptedClassifier};
pub use engine::{compare_states, DiffEngine, DiffOptions, DiffOutcome};
pub use findings::{
    Annotation, Discrepancy, DiscrepancyKind, FindingsReport, Region, StructuralFinding,
    FINDINGS_FILE,
};

use findings::FINDINGS_FORMAT_VERSION;

/// Wraps a comparison into the document handed to the reporting layer.
pub fn build_report(
    scenario: &str,
    run_id: Option<String>,
    baseline_version: Option<u64>,
    options: &DiffOptions,
    outcome: DiffOutcome,
    mut warnings: Vec<String>,
) -> FindingsReport {
    warnings.extend(outcome.warnings);
    FindingsReport {
        format_version: FINDINGS_FORMAT_VERSION,
        scenario: scenario.to_string(),
        run_id,
        baseline_version,
        verdict: outcome.verdict,
        threshold: options.threshold,
        structural: outcome.structural,
        labels: outcome.labels,
        warnings,
        classifier_degraded: outcome.classifier_degraded,
        counts: outcome.counts,
    }
}
