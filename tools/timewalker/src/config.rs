use crate::diff::rules::{CompiledIgnoreRule, CompiledSeverityRule, IgnoreRule, SeverityRule};
use crate::errors::TimewalkerError;
use crate::runtime::FileSystem;
use crate::terminal::{Capability, CapabilitySet};
use crate::types::Severity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "timewalker.toml";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub runs_dir: Option<PathBuf>,
    pub baseline_root: Option<PathBuf>,
    pub threshold: Option<Severity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub terminal: TerminalConfig,
    pub replay: ReplayConfig,
    pub diff: DiffConfig,
    pub baseline: BaselineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// argv used when a scenario does not name its own command.
    pub shell: Vec<String>,
    pub rows: u16,
    pub cols: u16,
    pub term: String,
    pub poll_interval_ms: u64,
    pub read_buffer_size: usize,
    pub inject_prompt: bool,
    pub prompt: String,
    pub aliases: BTreeMap<String, String>,
    pub line_terminator: String,
    pub exit_grace_ms: u64,
    pub default_wait_timeout_secs: u64,
    /// Quiet period a snapshot waits for before capturing.
    pub snapshot_settle_ms: u64,
    pub snapshot_settle_max_ms: u64,
    pub runs_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalConfig {
    pub scrollback_limit: usize,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayConfig {
    pub checkpoint_interval_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffConfig {
    pub threshold: Severity,
    pub default_severity: Severity,
    pub attribute_severity: Severity,
    pub dimension_severity: Severity,
    pub compare_cursor: bool,
    pub ignore: Vec<IgnoreRule>,
    pub severity: Vec<SeverityRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaselineConfig {
    pub root: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                shell: vec!["/bin/sh".to_string()],
                rows: 24,
                cols: 80,
                term: "xterm-256color".to_string(),
                poll_interval_ms: 50,
                read_buffer_size: 8192,
                inject_prompt: true,
                prompt: "tw$ ".to_string(),
                aliases: BTreeMap::new(),
                line_terminator: "\n".to_string(),
                exit_grace_ms: 1000,
                default_wait_timeout_secs: 10,
                snapshot_settle_ms: 100,
                snapshot_settle_max_ms: 2000,
                runs_dir: PathBuf::from("timewalker_runs"),
            },
            terminal: TerminalConfig {
                scrollback_limit: 1000,
                capabilities: Capability::ALL
                    .iter()
                    .map(|cap| cap.as_str().to_string())
                    .collect(),
            },
            replay: ReplayConfig {
                checkpoint_interval_bytes: 65_536,
            },
            diff: DiffConfig {
                threshold: Severity::Minor,
                default_severity: Severity::Major,
                attribute_severity: Severity::Minor,
                dimension_severity: Severity::Critical,
                compare_cursor: false,
                ignore: Vec::new(),
                severity: Vec::new(),
            },
            baseline: BaselineConfig {
                root: PathBuf::from("timewalker_baselines"),
            },
        }
    }
}

impl TerminalConfig {
    pub fn capability_set(&self) -> Result<CapabilitySet, TimewalkerError> {
        let caps = self
            .capabilities
            .iter()
            .map(|name| {
                Capability::parse(name).ok_or_else(|| {
                    TimewalkerError::InvalidConfig(format!("unknown terminal capability `{name}`"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CapabilitySet::from_list(&caps))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    session: Option<PartialSessionConfig>,
    terminal: Option<PartialTerminalConfig>,
    replay: Option<PartialReplayConfig>,
    diff: Option<PartialDiffConfig>,
    baseline: Option<PartialBaselineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialSessionConfig {
    shell: Option<Vec<String>>,
    rows: Option<u16>,
    cols: Option<u16>,
    term: Option<String>,
    poll_interval_ms: Option<u64>,
    read_buffer_size: Option<usize>,
    inject_prompt: Option<bool>,
    prompt: Option<String>,
    aliases: Option<BTreeMap<String, String>>,
    line_terminator: Option<String>,
    exit_grace_ms: Option<u64>,
    default_wait_timeout_secs: Option<u64>,
    snapshot_settle_ms: Option<u64>,
    snapshot_settle_max_ms: Option<u64>,
    runs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialTerminalConfig {
    scrollback_limit: Option<usize>,
    capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialReplayConfig {
    checkpoint_interval_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialDiffConfig {
    threshold: Option<Severity>,
    default_severity: Option<Severity>,
    attribute_severity: Option<Severity>,
    dimension_severity: Option<Severity>,
    compare_cursor: Option<bool>,
    ignore: Option<Vec<IgnoreRule>>,
    severity: Option<Vec<SeverityRule>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialBaselineConfig {
    root: Option<PathBuf>,
}

/// Defaults, then the config file (`--config` or `./timewalker.toml`), then CLI
/// overrides. Relative paths resolve against `process_cwd`.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, TimewalkerError> {
    let mut cfg = AppConfig::default();

    let config_path = match &overrides.config_path {
        Some(path) => Some(absolutize_path(process_cwd, path)),
        None => {
            let candidate = process_cwd.join(DEFAULT_CONFIG_FILE);
            fs.exists(&candidate).then_some(candidate)
        }
    };
    if let Some(path) = config_path {
        let file_contents = fs.read_to_string(&path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| TimewalkerError::ConfigParse(format!("{}: {e}", path.display())))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);

    cfg.session.runs_dir = absolutize_path(process_cwd, &cfg.session.runs_dir);
    cfg.baseline.root = absolutize_path(process_cwd, &cfg.baseline.root);

    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(session) = partial.session {
        let target = &mut cfg.session;
        if let Some(value) = session.shell {
            target.shell = value;
        }
        if let Some(value) = session.rows {
            target.rows = value;
        }
        if let Some(value) = session.cols {
            target.cols = value;
        }
        if let Some(value) = session.term {
            target.term = value;
        }
        if let Some(value) = session.poll_interval_ms {
            target.poll_interval_ms = value;
        }
        if let Some(value) = session.read_buffer_size {
            target.read_buffer_size = value;
        }
        if let Some(value) = session.inject_prompt {
            target.inject_prompt = value;
        }
        if let Some(value) = session.prompt {
            target.prompt = value;
        }
        if let Some(value) = session.aliases {
            target.aliases = value;
        }
        if let Some(value) = session.line_terminator {
            target.line_terminator = value;
        }
        if let Some(value) = session.exit_grace_ms {
            target.exit_grace_ms = value;
        }
        if let Some(value) = session.default_wait_timeout_secs {
            target.default_wait_timeout_secs = value;
        }
        if let Some(value) = session.snapshot_settle_ms {
            target.snapshot_settle_ms = value;
        }
        if let Some(value) = session.snapshot_settle_max_ms {
            target.snapshot_settle_max_ms = value;
        }
        if let Some(value) = session.runs_dir {
            target.runs_dir = value;
        }
    }

    if let Some(terminal) = partial.terminal {
        if let Some(value) = terminal.scrollback_limit {
            cfg.terminal.scrollback_limit = value;
        }
        if let Some(value) = terminal.capabilities {
            cfg.terminal.capabilities = value;
        }
    }

    if let Some(replay) = partial.replay {
        if let Some(value) = replay.checkpoint_interval_bytes {
            cfg.replay.checkpoint_interval_bytes = value;
        }
    }

    if let Some(diff) = partial.diff {
        let target = &mut cfg.diff;
        if let Some(value) = diff.threshold {
            target.threshold = value;
        }
        if let Some(value) = diff.default_severity {
            target.default_severity = value;
        }
        if let Some(value) = diff.attribute_severity {
            target.attribute_severity = value;
        }
        if let Some(value) = diff.dimension_severity {
            target.dimension_severity = value;
        }
        if let Some(value) = diff.compare_cursor {
            target.compare_cursor = value;
        }
        if let Some(value) = diff.ignore {
            target.ignore = value;
        }
        if let Some(value) = diff.severity {
            target.severity = value;
        }
    }

    if let Some(baseline) = partial.baseline {
        if let Some(value) = baseline.root {
            cfg.baseline.root = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(runs_dir) = &overrides.runs_dir {
        cfg.session.runs_dir = runs_dir.clone();
    }
    if let Some(root) = &overrides.baseline_root {
        cfg.baseline.root = root.clone();
    }
    if let Some(threshold) = overrides.threshold {
        cfg.diff.threshold = threshold;
    }
}

pub fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), TimewalkerError> {
    let session = &cfg.session;
    if session.shell.first().map_or(true, |program| program.trim().is_empty()) {
        return Err(TimewalkerError::InvalidConfig(
            "session.shell must name a program".to_string(),
        ));
    }
    if session.rows == 0 || session.cols == 0 {
        return Err(TimewalkerError::InvalidConfig(
            "session.rows and session.cols must be greater than zero".to_string(),
        ));
    }
    if session.poll_interval_ms == 0 {
        return Err(TimewalkerError::InvalidConfig(
            "session.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if session.read_buffer_size == 0 {
        return Err(TimewalkerError::InvalidConfig(
            "session.read_buffer_size must be greater than zero".to_string(),
        ));
    }
    if session.default_wait_timeout_secs == 0 {
        return Err(TimewalkerError::InvalidConfig(
            "session.default_wait_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if session.inject_prompt && session.prompt.trim().is_empty() {
        return Err(TimewalkerError::InvalidConfig(
            "session.prompt must not be blank when inject_prompt is set".to_string(),
        ));
    }
    for name in session.aliases.keys() {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(TimewalkerError::InvalidConfig(format!(
                "session.aliases: invalid alias name `{name}`"
            )));
        }
    }

    cfg.terminal.capability_set()?;

    if cfg.replay.checkpoint_interval_bytes == 0 {
        return Err(TimewalkerError::InvalidConfig(
            "replay.checkpoint_interval_bytes must be greater than zero".to_string(),
        ));
    }

    for rule in &cfg.diff.ignore {
        CompiledIgnoreRule::new(rule.clone())?;
    }
    for rule in &cfg.diff.severity {
        CompiledSeverityRule::new(rule.clone())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let fs = FakeFileSystem::default();
        let cfg = load_config(&CliOverrides::default(), Path::new("/work"), &fs).expect("config");
        assert_eq!(cfg.session.shell, vec!["/bin/sh".to_string()]);
        assert_eq!((cfg.session.rows, cfg.session.cols), (24, 80));
        assert_eq!(cfg.session.runs_dir, PathBuf::from("/work/timewalker_runs"));
        assert_eq!(cfg.baseline.root, PathBuf::from("/work/timewalker_baselines"));
        assert_eq!(cfg.diff.threshold, Severity::Minor);
        assert_eq!(
            cfg.terminal.capability_set().expect("caps"),
            CapabilitySet::all()
        );
    }

    #[test]
    fn file_then_cli_overrides_merge_in_order() {
        let fs = FakeFileSystem::with_file(
            "/work/timewalker.toml",
            r#"
[session]
rows = 30
prompt = "> "

[terminal]
capabilities = ["sgr", "erase"]

[diff]
threshold = "major"

[[diff.ignore]]
pattern = '\d\d:\d\d'
labels = ["clock"]
"#,
        );
        let overrides = CliOverrides {
            threshold: Some(Severity::Critical),
            runs_dir: Some(PathBuf::from("/tmp/runs")),
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, Path::new("/work"), &fs).expect("config");
        assert_eq!(cfg.session.rows, 30);
        assert_eq!(cfg.session.cols, 80);
        assert_eq!(cfg.session.prompt, "> ");
        assert_eq!(cfg.diff.threshold, Severity::Critical);
        assert_eq!(cfg.session.runs_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(cfg.diff.ignore.len(), 1);
        let caps = cfg.terminal.capability_set().expect("caps");
        assert!(caps.contains(Capability::Sgr));
        assert!(!caps.contains(Capability::Title));
    }

    #[test]
    fn explicit_config_path_must_exist() {
        let fs = FakeFileSystem::default();
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("missing.toml")),
            ..CliOverrides::default()
        };
        assert!(matches!(
            load_config(&overrides, Path::new("/work"), &fs),
            Err(TimewalkerError::Io(_))
        ));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let fs = FakeFileSystem::with_file("/c.toml", "[session]\nrowz = 3\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/c.toml")),
            ..CliOverrides::default()
        };
        assert!(matches!(
            load_config(&overrides, Path::new("/"), &fs),
            Err(TimewalkerError::ConfigParse(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        for body in [
            "[session]\nrows = 0\n",
            "[session]\npoll_interval_ms = 0\n",
            "[session]\nshell = []\n",
            "[terminal]\ncapabilities = [\"sixel\"]\n",
            "[[diff.ignore]]\npattern = \"(\"\n",
            "[[diff.severity]]\npattern = \"[\"\nseverity = \"critical\"\n",
            "[replay]\ncheckpoint_interval_bytes = 0\n",
        ] {
            let fs = FakeFileSystem::with_file("/work/timewalker.toml", body);
            let result = load_config(&CliOverrides::default(), Path::new("/work"), &fs);
            assert!(
                matches!(result, Err(TimewalkerError::InvalidConfig(_))),
                "{body} -> {result:?}"
            );
        }
    }
}
