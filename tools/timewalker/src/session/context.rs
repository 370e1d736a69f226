use crate::errors::TimewalkerError;
use crate::logging::JsonlLogger;
use crate::session::scenario::Scenario;
use crate::session::template;
use crate::timeline::RUN_LOG_FILE;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-session bindings threaded through step execution.
///
/// Nothing here is process-wide, so independent sessions can run side by side.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub scenario: String,
    pub run_id: String,
    pub bundle_dir: PathBuf,
    pub vars: BTreeMap<String, String>,
    /// Prompt the controller installed in the shell, if it did.
    pub injected_prompt: Option<String>,
    pub log: JsonlLogger,
}

impl SessionContext {
    /// Scenario defaults, then caller values, then the built-ins
    /// `run_id`, `bundle_dir`, `scenario`, `cwd` and `home`.
    pub fn new(
        scenario: &Scenario,
        caller_vars: &BTreeMap<String, String>,
        run_id: String,
        bundle_dir: PathBuf,
        cwd: &Path,
        injected_prompt: Option<String>,
    ) -> Self {
        let mut vars = scenario.vars.clone();
        vars.extend(caller_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.insert("run_id".to_string(), run_id.clone());
        vars.insert("bundle_dir".to_string(), bundle_dir.display().to_string());
        vars.insert("scenario".to_string(), scenario.name.clone());
        vars.insert("cwd".to_string(), cwd.display().to_string());
        vars.insert(
            "home".to_string(),
            std::env::var("HOME").unwrap_or_default(),
        );
        let log = JsonlLogger::new(bundle_dir.join(RUN_LOG_FILE));
        Self {
            scenario: scenario.name.clone(),
            run_id,
            bundle_dir,
            vars,
            injected_prompt,
            log,
        }
    }

    pub fn render(&self, text: &str, step_index: Option<usize>) -> Result<String, TimewalkerError> {
        template::render(text, &self.vars).map_err(|message| self.error(step_index, message))
    }

    pub fn error(&self, step_index: Option<usize>, message: impl Into<String>) -> TimewalkerError {
        TimewalkerError::SessionExecution {
            step_index,
            bundle: self.bundle_dir.clone(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_win_over_caller_and_scenario_values() {
        let scenario = Scenario::from_json(
            r#"{"name": "ctx", "vars": {"who": "default", "run_id": "nope"},
                "steps": [{"type": "snapshot", "label": "s"}]}"#,
        )
        .expect("scenario");
        let caller = BTreeMap::from([("who".to_string(), "caller".to_string())]);
        let ctx = SessionContext::new(
            &scenario,
            &caller,
            "r-1".to_string(),
            PathBuf::from("/tmp/runs/r-1"),
            Path::new("/work"),
            None,
        );
        assert_eq!(ctx.render("{{who}} {{run_id}} {{scenario}}", None).expect("render"), "caller r-1 ctx");
        assert_eq!(ctx.vars["cwd"], "/work");

        match ctx.render("{{missing}}", Some(2)) {
            Err(TimewalkerError::SessionExecution {
                step_index, message, ..
            }) => {
                assert_eq!(step_index, Some(2));
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
