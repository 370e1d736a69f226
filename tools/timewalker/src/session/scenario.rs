//! Scenario documents: loading and pre-spawn validation.

use crate::digest::sha256_hex;
use crate::errors::TimewalkerError;
use crate::session::predicate::Condition;
use crate::session::template;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const DEFAULT_SESSION_TIMEOUT_SECS: f64 = 120.0;
pub const DEFAULT_EXPECT_TIMEOUT_SECS: f64 = 5.0;

fn yes() -> bool {
    true
}

fn default_session_timeout() -> f64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Defaults; callers may override any of them.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: ScenarioMeta,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PtyDimensions {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioMeta {
    /// argv; the configured shell when absent.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub pty: Option<PtyDimensions>,
    /// Whole-session budget in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    /// Wait for the process to exit on its own after the last step.
    #[serde(default)]
    pub await_exit: bool,
}

impl Default for ScenarioMeta {
    fn default() -> Self {
        Self {
            command: None,
            cwd: None,
            env: BTreeMap::new(),
            pty: None,
            timeout: DEFAULT_SESSION_TIMEOUT_SECS,
            output_dir: None,
            id: None,
            await_exit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Command(CommandStep),
    Wait(WaitStep),
    Snapshot(SnapshotStep),
    Resize(ResizeStep),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Command(_) => "command",
            Step::Wait(_) => "wait",
            Step::Snapshot(_) => "snapshot",
            Step::Resize(_) => "resize",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandStep {
    pub run: String,
    /// Snapshot label taken right after the input is written.
    #[serde(default)]
    pub mark: Option<String>,
    #[serde(default)]
    pub expect: Option<Expectation>,
    /// Seconds allowed for `expect`.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Seconds to pause before writing.
    #[serde(default)]
    pub delay: Option<f64>,
    #[serde(default = "yes")]
    pub send_newline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitStep {
    pub expect: Expectation,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotStep {
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResizeStep {
    pub rows: u16,
    pub cols: u16,
}

/// Exactly one of the three fields is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
}

fn invalid(message: impl Into<String>) -> TimewalkerError {
    TimewalkerError::ScenarioValidation(message.into())
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self, TimewalkerError> {
        let scenario: Scenario =
            serde_json::from_str(text).map_err(|e| invalid(format!("scenario json: {e}")))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_toml(text: &str) -> Result<Self, TimewalkerError> {
        let scenario: Scenario =
            toml::from_str(text).map_err(|e| invalid(format!("scenario toml: {e}")))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parses by extension: `.json`, or `.toml`.
    pub fn load(path: &Path) -> Result<Self, TimewalkerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&text),
            Some("toml") => Self::from_toml(&text),
            _ => Err(invalid(format!(
                "{}: scenario files must end in .json or .toml",
                path.display()
            ))),
        }
    }

    /// sha256 of the canonical JSON form.
    pub fn digest(&self) -> String {
        sha256_hex(&serde_json::to_vec(self).unwrap_or_default())
    }

    /// Snapshot labels in the order the steps will produce them.
    pub fn labels(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Snapshot(snapshot) => Some(snapshot.label.clone()),
                Step::Command(command) => command.mark.clone(),
                _ => None,
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), TimewalkerError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(invalid(format!(
                "name {:?} must be non-empty and use only letters, digits, `_`, `.` or `-`",
                self.name
            )));
        }
        if self.steps.is_empty() {
            return Err(invalid("scenario has no steps"));
        }
        if !(self.meta.timeout.is_finite() && self.meta.timeout > 0.0) {
            return Err(invalid("meta.timeout must be a positive number of seconds"));
        }
        if let Some(pty) = self.meta.pty {
            if pty.rows == 0 || pty.cols == 0 {
                return Err(invalid("meta.pty rows and cols must be greater than zero"));
            }
        }
        if let Some(command) = &self.meta.command {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(invalid("meta.command must name a program"));
            }
            for arg in command {
                check_templates(arg, "meta.command")?;
            }
        }
        if let Some(cwd) = &self.meta.cwd {
            check_templates(cwd, "meta.cwd")?;
        }
        for (key, value) in &self.meta.env {
            check_templates(value, &format!("meta.env.{key}"))?;
        }

        let mut labels = BTreeSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            let at = |message: String| invalid(format!("steps[{idx}] ({}): {message}", step.kind()));
            match step {
                Step::Command(command) => {
                    if command.run.trim().is_empty() {
                        return Err(at("`run` is empty".to_string()));
                    }
                    check_templates(&command.run, "run").map_err(|e| at(e.to_string()))?;
                    if let Some(label) = &command.mark {
                        check_label(label, &mut labels).map_err(at)?;
                    }
                    if let Some(expect) = &command.expect {
                        check_expectation(expect).map_err(at)?;
                    }
                    check_seconds(command.timeout, "timeout", false).map_err(at)?;
                    check_seconds(command.delay, "delay", true).map_err(at)?;
                }
                Step::Wait(wait) => {
                    check_expectation(&wait.expect).map_err(at)?;
                    check_seconds(wait.timeout, "timeout", false).map_err(at)?;
                }
                Step::Snapshot(snapshot) => {
                    check_label(&snapshot.label, &mut labels).map_err(at)?;
                }
                Step::Resize(resize) => {
                    if resize.rows == 0 || resize.cols == 0 {
                        return Err(at("rows and cols must be greater than zero".to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_templates(text: &str, what: &str) -> Result<(), TimewalkerError> {
    template::references(text)
        .map(|_| ())
        .map_err(|e| invalid(format!("{what}: {e}")))
}

fn check_label(label: &str, seen: &mut BTreeSet<String>) -> Result<(), String> {
    if label.trim().is_empty() {
        return Err("snapshot label is empty".to_string());
    }
    if !seen.insert(label.to_string()) {
        return Err(format!("duplicate snapshot label `{label}`"));
    }
    Ok(())
}

fn check_seconds(value: Option<f64>, field: &str, allow_zero: bool) -> Result<(), String> {
    match value {
        Some(secs) if !secs.is_finite() || secs < 0.0 || (secs == 0.0 && !allow_zero) => Err(
            format!("`{field}` must be a positive number of seconds, got {secs}"),
        ),
        _ => Ok(()),
    }
}

fn check_expectation(expect: &Expectation) -> Result<(), String> {
    let set = [&expect.contains, &expect.regex, &expect.condition]
        .iter()
        .filter(|field| field.is_some())
        .count();
    if set != 1 {
        return Err("expect needs exactly one of `contains`, `regex`, `condition`".to_string());
    }
    if let Some(contains) = &expect.contains {
        if contains.is_empty() {
            return Err("expect.contains is empty".to_string());
        }
        template::references(contains)?;
    }
    if let Some(pattern) = &expect.regex {
        template::references(pattern)?;
        // Patterns with templates are compiled once rendered.
        if !pattern.contains("{{") {
            Regex::new(pattern).map_err(|e| format!("expect.regex: {e}"))?;
        }
    }
    if let Some(name) = &expect.condition {
        if Condition::parse(name).is_none() {
            return Err(format!(
                "unknown condition `{name}`; known: {}",
                Condition::ALL.map(Condition::as_str).join(", ")
            ));
        }
    }
    Ok(())
}
