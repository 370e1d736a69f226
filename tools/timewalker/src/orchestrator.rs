//! The end-to-end flows behind the command surface: run, replay, analyze and
//! promote.

use crate::baseline::{BaselineManifest, BaselineStore, PromoteRequest};
use crate::config::AppConfig;
use crate::diff::{build_report, DiffEngine, DiffOptions, DiscrepancyClassifier, FindingsReport, FINDINGS_FILE};
use crate::errors::TimewalkerError;
use crate::logging::append_run_log;
use crate::replay::{replay_timeline, KeyframeSet, ReplayOptions, ReplayResult};
use crate::runtime::{Clock, PortablePtyBackend, ProductionClock, PtyBackend};
use crate::session::{keyframes_digest, RunRequest, Scenario, SessionController, SessionReport};
use crate::timeline::Timeline;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Analysis {
    pub report: FindingsReport,
    pub findings_path: PathBuf,
}

pub struct Orchestrator {
    config: AppConfig,
    backend: Arc<dyn PtyBackend>,
    clock: Arc<dyn Clock>,
    classifier: Option<Arc<dyn DiscrepancyClassifier>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, backend: Arc<dyn PtyBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            backend,
            clock,
            classifier: None,
        }
    }

    /// Real PTYs and the system clock.
    pub fn production(config: AppConfig) -> Self {
        Self::new(
            config,
            Arc::new(PortablePtyBackend),
            Arc::new(ProductionClock::new()),
        )
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn DiscrepancyClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn run_scenario(&self, scenario: &Scenario, request: RunRequest) -> Result<SessionReport, TimewalkerError> {
        let controller = SessionController::new(
            self.config.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
        );
        let report = controller.run(scenario, request)?;
        append_run_log(
            "info",
            "run.completed",
            json!({
                "scenario": scenario.name,
                "run_id": report.run_id,
                "bundle": report.bundle_dir.display().to_string(),
                "keyframes": report.keyframes.keyframes.len(),
                "keyframes_digest": keyframes_digest(&report.keyframes.keyframes),
            }),
        );
        Ok(report)
    }

    /// Rebuilds the keyframes of a bundle from its timeline alone.
    pub fn replay(&self, bundle: &Path, labels: Option<Vec<String>>) -> Result<ReplayResult, TimewalkerError> {
        let timeline = Timeline::load(bundle)?;
        replay_timeline(
            &timeline,
            &ReplayOptions {
                labels,
                checkpoint_interval: self.config.replay.checkpoint_interval_bytes,
            },
        )
    }

    /// Replays `bundle`, compares it against the current baseline of its
    /// scenario and writes the findings document.
    pub fn analyze(&self, bundle: &Path, findings_path: Option<&Path>) -> Result<Analysis, TimewalkerError> {
        let timeline = Timeline::load(bundle)?;
        let replayed = replay_timeline(
            &timeline,
            &ReplayOptions {
                labels: None,
                checkpoint_interval: self.config.replay.checkpoint_interval_bytes,
            },
        )?;

        let mut warnings = replayed.timeline_warnings.clone();
        if !replayed.parse_warnings.is_empty() {
            warnings.push(format!(
                "{} control sequences were not interpreted (first at byte {})",
                replayed.parse_warnings.len(),
                replayed.parse_warnings[0].offset
            ));
        }
        match timeline.outcome() {
            Some(outcome) if !outcome.succeeded() => warnings.push(format!(
                "session did not finish cleanly: {}",
                outcome.message.as_deref().unwrap_or(outcome.state.as_str())
            )),
            None => warnings.push("timeline has no final outcome".to_string()),
            Some(_) => {}
        }

        let scenario = timeline.metadata.scenario.name.clone();
        let store = BaselineStore::open(&self.config.baseline.root)?;
        let baseline = store.load_current(&scenario)?;

        let options = DiffOptions::from_config(&self.config.diff)?;
        let mut engine = DiffEngine::new(&options);
        if let Some(classifier) = &self.classifier {
            engine = engine.with_classifier(classifier.as_ref());
        }
        let outcome = engine.compare(&baseline.keyframes.keyframes, &replayed.keyframes);
        let report = build_report(
            &scenario,
            Some(timeline.metadata.run_id.clone()),
            Some(u64::from(baseline.version())),
            &options,
            outcome,
            warnings,
        );

        let findings_path = findings_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| bundle.join(FINDINGS_FILE));
        report.write_to(&findings_path)?;
        append_run_log(
            "info",
            "analysis.completed",
            json!({
                "scenario": scenario,
                "run_id": timeline.metadata.run_id,
                "baseline_version": baseline.version(),
                "verdict": report.verdict.as_str(),
                "blocking": report.counts.blocking,
                "findings": findings_path.display().to_string(),
            }),
        );
        Ok(Analysis {
            report,
            findings_path,
        })
    }

    pub fn run_and_analyze(
        &self,
        scenario: &Scenario,
        request: RunRequest,
        findings_path: Option<&Path>,
    ) -> Result<(SessionReport, Analysis), TimewalkerError> {
        let report = self.run_scenario(scenario, request)?;
        let analysis = self.analyze(&report.bundle_dir, findings_path)?;
        Ok((report, analysis))
    }

    /// Promotes the replayed keyframes of a successful run as the scenario's
    /// next baseline version.
    pub fn promote(&self, bundle: &Path, labels: Option<Vec<String>>) -> Result<BaselineManifest, TimewalkerError> {
        let timeline = Timeline::load(bundle)?;
        match timeline.outcome() {
            Some(outcome) if outcome.succeeded() => {}
            _ => {
                return Err(TimewalkerError::Cli(format!(
                    "{} did not finish successfully; refusing to promote it",
                    bundle.display()
                )))
            }
        }
        let replayed = replay_timeline(
            &timeline,
            &ReplayOptions {
                labels: None,
                checkpoint_interval: self.config.replay.checkpoint_interval_bytes,
            },
        )?;
        let scenario = timeline.metadata.scenario.name.clone();
        let keyframes = KeyframeSet {
            scenario: scenario.clone(),
            run_id: Some(timeline.metadata.run_id.clone()),
            keyframes: replayed.keyframes,
        };

        let store = BaselineStore::open(&self.config.baseline.root)?;
        let expected_current = store.current_version(&scenario)?;
        store.promote(PromoteRequest {
            scenario,
            keyframes,
            expected_current,
            labels,
            source_run_id: Some(timeline.metadata.run_id.clone()),
        })
    }
}

/// Loads and validates a scenario without running it.
pub fn validate_scenario(path: &Path) -> Result<Scenario, TimewalkerError> {
    let scenario = Scenario::load(path)?;
    append_run_log(
        "debug",
        "scenario.validated",
        json!({
            "path": path.display().to_string(),
            "name": scenario.name,
            "steps": scenario.steps.len(),
            "labels": scenario.labels(),
        }),
    );
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ScriptedClassifier;
    use crate::runtime::FakePtyBackend;
    use crate::types::{Severity, Verdict};

    fn orchestrator(dir: &Path, backend: FakePtyBackend) -> Orchestrator {
        let mut config = AppConfig::default();
        config.session.runs_dir = dir.join("runs");
        config.session.poll_interval_ms = 5;
        config.session.snapshot_settle_ms = 20;
        config.session.exit_grace_ms = 200;
        config.baseline.root = dir.join("baselines");
        Orchestrator::new(config, Arc::new(backend), Arc::new(ProductionClock::new()))
    }

    fn scenario() -> Scenario {
        Scenario::from_json(
            r#"{"name": "status", "steps": [
                {"type": "command", "run": "status", "expect": {"contains": "ready"}},
                {"type": "wait", "expect": {"condition": "prompt_ready"}},
                {"type": "snapshot", "label": "after_status"}
            ]}"#,
        )
        .expect("scenario")
    }

    fn request(dir: &Path, run_id: &str) -> RunRequest {
        RunRequest {
            cwd: dir.to_path_buf(),
            run_id: Some(run_id.to_string()),
            ..RunRequest::default()
        }
    }

    #[test]
    fn promote_then_analyze_same_behavior_passes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FakePtyBackend::new().respond("status", "service ready\n");
        let tw = orchestrator(dir.path(), backend);

        let first = tw.run_scenario(&scenario(), request(dir.path(), "r1")).expect("run");
        let manifest = tw.promote(&first.bundle_dir, None).expect("promote");
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.labels, vec!["after_status"]);

        let (_, analysis) = tw
            .run_and_analyze(&scenario(), request(dir.path(), "r2"), None)
            .expect("analyze");
        assert_eq!(analysis.report.verdict, Verdict::Pass);
        assert_eq!(analysis.report.counts.discrepancies, 0);
        assert_eq!(analysis.report.baseline_version, Some(1));
        assert!(analysis.findings_path.ends_with("r2/findings.json"));
        assert!(analysis.findings_path.exists());
    }

    #[test]
    fn changed_output_fails_with_one_discrepancy() {
        let echo = || {
            Scenario::from_json(
                r#"{"name": "echo", "steps": [
                    {"type": "command", "run": "echo hello"},
                    {"type": "wait", "expect": {"contains": "hello"}, "timeout": 5},
                    {"type": "snapshot", "label": "after_echo"}
                ]}"#,
            )
            .expect("scenario")
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let baseline = orchestrator(dir.path(), FakePtyBackend::new().respond("echo hello", "hallo\n"));
        let first = baseline.run_scenario(&echo(), request(dir.path(), "r1")).expect("run");
        baseline.promote(&first.bundle_dir, None).expect("promote");

        let candidate = orchestrator(dir.path(), FakePtyBackend::new().respond("echo hello", "hello\n"))
            .with_classifier(Arc::new(ScriptedClassifier::unavailable("offline")));
        let (_, analysis) = candidate
            .run_and_analyze(&echo(), request(dir.path(), "r2"), None)
            .expect("analyze");
        assert_eq!(analysis.report.verdict, Verdict::Fail);
        assert_eq!(analysis.report.counts.structural, 0);
        assert_eq!(analysis.report.counts.discrepancies, 1);
        let discrepancy = analysis.report.discrepancies().next().expect("discrepancy");
        assert_eq!(discrepancy.label, "after_echo");
        assert_eq!((discrepancy.expected.as_str(), discrepancy.actual.as_str()), ("a", "e"));
        assert_eq!(discrepancy.region.col_end - discrepancy.region.col_start, 1);
        assert_eq!(discrepancy.severity, Severity::Major);
        assert!(analysis.report.classifier_degraded);
    }

    #[test]
    fn analyze_without_baseline_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tw = orchestrator(dir.path(), FakePtyBackend::new().respond("status", "service ready\n"));
        let report = tw.run_scenario(&scenario(), request(dir.path(), "r1")).expect("run");
        assert!(matches!(
            tw.analyze(&report.bundle_dir, None),
            Err(TimewalkerError::BaselineNotFound(_))
        ));
    }

    #[test]
    fn replay_rebuilds_the_live_keyframes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tw = orchestrator(dir.path(), FakePtyBackend::new().respond("status", "service ready\n"));
        let report = tw.run_scenario(&scenario(), request(dir.path(), "r1")).expect("run");
        let replayed = tw.replay(&report.bundle_dir, None).expect("replay");
        assert_eq!(replayed.keyframes, report.keyframes.keyframes);
    }
}
