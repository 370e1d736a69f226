pub mod baseline;
pub mod config;
pub mod diff;
pub mod digest;
pub mod errors;
pub mod fsm;
pub mod logging;
pub mod orchestrator;
pub mod replay;
pub mod runtime;
pub mod session;
pub mod terminal;
pub mod timeline;
pub mod types;

use clap::{error::ErrorKind, Args, Parser, Subcommand};
use config::{absolutize_path, load_config, CliOverrides};
use diff::FindingsReport;
use errors::{TimewalkerError, EXIT_FAIL_VERDICT, EXIT_PASS};
use logging::{clear_run_logger, init_run_logger};
use orchestrator::{validate_scenario, Orchestrator};
use runtime::ProductionFileSystem;
use session::{CancelToken, RunRequest, SessionReport};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use timeline::RUN_LOG_FILE;
use types::{Severity, Verdict};

#[derive(Debug, Clone, Parser)]
#[command(name = "timewalker")]
#[command(about = "Record, replay and diff scripted terminal sessions")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a scenario and write a result bundle.
    Run(RunArgs),
    /// Compare a bundle against the current baseline of its scenario.
    Analyze(AnalyzeArgs),
    /// Run a scenario, then analyze the bundle it produced.
    RunAndAnalyze {
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        diff: DiffArgs,
    },
    /// Promote a bundle's keyframes as the next baseline version.
    Promote {
        bundle: PathBuf,
        #[arg(long, value_delimiter = ',')]
        labels: Option<Vec<String>>,
        #[arg(long)]
        baseline_root: Option<PathBuf>,
    },
    /// Check a scenario file without running it.
    Validate { scenario: PathBuf },
    /// Rebuild and print the captured screens of a bundle.
    Replay {
        bundle: PathBuf,
        #[arg(long)]
        label: Option<String>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    pub scenario: PathBuf,
    /// Scenario variable binding, `name=value`. Repeatable.
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct DiffArgs {
    #[arg(long)]
    pub baseline_root: Option<PathBuf>,
    #[arg(long)]
    pub findings: Option<PathBuf>,
    /// Lowest severity that fails the verdict.
    #[arg(long, value_parser = parse_severity)]
    pub threshold: Option<Severity>,
}

#[derive(Debug, Clone, Args)]
pub struct AnalyzeArgs {
    pub bundle: PathBuf,
    #[command(flatten)]
    pub diff: DiffArgs,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got `{raw}`")),
    }
}

fn parse_severity(raw: &str) -> Result<Severity, String> {
    Severity::parse_cli(raw)
        .ok_or_else(|| format!("unknown severity `{raw}` (info, minor, major, critical)"))
}

pub fn run() -> Result<i32, TimewalkerError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| TimewalkerError::Io(e.to_string()))?;
    run_with_args(&args, &cwd)
}

pub fn run_with_args(args: &[OsString], cwd: &Path) -> Result<i32, TimewalkerError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(EXIT_PASS);
            }
            _ => return Err(TimewalkerError::Cli(error.to_string())),
        },
    };

    let mut overrides = CliOverrides {
        config_path: cli.config.clone(),
        ..CliOverrides::default()
    };
    match &cli.command {
        Command::Analyze(AnalyzeArgs { diff, .. }) | Command::RunAndAnalyze { diff, .. } => {
            overrides.baseline_root = diff.baseline_root.clone();
            overrides.threshold = diff.threshold;
        }
        Command::Promote { baseline_root, .. } => {
            overrides.baseline_root = baseline_root.clone();
        }
        _ => {}
    }

    if let Command::Validate { scenario } = &cli.command {
        let scenario = validate_scenario(&absolutize_path(cwd, scenario))?;
        println!(
            "scenario `{}` is valid: {} steps, snapshots [{}]",
            scenario.name,
            scenario.steps.len(),
            scenario.labels().join(", ")
        );
        return Ok(EXIT_PASS);
    }

    let cfg = load_config(&overrides, cwd, &ProductionFileSystem)?;
    let orchestrator = Orchestrator::production(cfg);

    match cli.command {
        Command::Run(args) => {
            let report = run_scenario_command(&orchestrator, &args, cwd)?;
            print_run(&report);
            Ok(EXIT_PASS)
        }
        Command::Analyze(args) => {
            let bundle = absolutize_path(cwd, &args.bundle);
            let findings = args.diff.findings.map(|path| absolutize_path(cwd, &path));
            let report = with_bundle_log(&bundle, || {
                orchestrator
                    .analyze(&bundle, findings.as_deref())
                    .map(|analysis| analysis.report)
            })?;
            Ok(print_verdict(&report))
        }
        Command::RunAndAnalyze { run, diff } => {
            let report = run_scenario_command(&orchestrator, &run, cwd)?;
            print_run(&report);
            let findings = diff.findings.map(|path| absolutize_path(cwd, &path));
            let findings = with_bundle_log(&report.bundle_dir, || {
                orchestrator
                    .analyze(&report.bundle_dir, findings.as_deref())
                    .map(|analysis| analysis.report)
            })?;
            Ok(print_verdict(&findings))
        }
        Command::Promote { bundle, labels, .. } => {
            let bundle = absolutize_path(cwd, &bundle);
            let manifest = with_bundle_log(&bundle, || orchestrator.promote(&bundle, labels))?;
            println!(
                "promoted `{}` v{} ({} keyframes: {})",
                manifest.scenario,
                manifest.version,
                manifest.labels.len(),
                manifest.labels.join(", ")
            );
            Ok(EXIT_PASS)
        }
        Command::Replay { bundle, label } => {
            let bundle = absolutize_path(cwd, &bundle);
            let result = orchestrator.replay(&bundle, label.map(|label| vec![label]))?;
            for keyframe in &result.keyframes {
                println!("── {} @ byte {} ──", keyframe.label, keyframe.raw_offset);
                println!("{}", keyframe.state.render_text());
            }
            for warning in &result.timeline_warnings {
                eprintln!("warning: {warning}");
            }
            if !result.parse_warnings.is_empty() {
                eprintln!(
                    "warning: {} control sequences were not interpreted",
                    result.parse_warnings.len()
                );
            }
            Ok(EXIT_PASS)
        }
        Command::Validate { .. } => Ok(EXIT_PASS),
    }
}

fn run_scenario_command(
    orchestrator: &Orchestrator,
    args: &RunArgs,
    cwd: &Path,
) -> Result<SessionReport, TimewalkerError> {
    let source = absolutize_path(cwd, &args.scenario);
    let scenario = validate_scenario(&source)?;
    let cancel = CancelToken::new();
    cancel_on_interrupt(&cancel);
    let request = RunRequest {
        vars: args.vars.iter().cloned().collect::<BTreeMap<_, _>>(),
        run_id: args.run_id.clone(),
        output_dir: args.output_dir.as_ref().map(|dir| absolutize_path(cwd, dir)),
        source: Some(source),
        cwd: cwd.to_path_buf(),
        cancel,
    };
    orchestrator.run_scenario(&scenario, request)
}

/// The token SIGINT/SIGTERM cancels. The handler is installed on first use
/// and outlives any single run.
fn interrupt_target() -> &'static Mutex<Option<CancelToken>> {
    static TARGET: OnceLock<Mutex<Option<CancelToken>>> = OnceLock::new();
    TARGET.get_or_init(|| {
        let installed = ctrlc::set_handler(|| {
            if let Ok(target) = interrupt_target().lock() {
                if let Some(token) = target.as_ref() {
                    token.cancel();
                }
            }
        });
        if let Err(error) = installed {
            tracing::warn!(%error, "interrupt handler not installed; runs cannot be cancelled");
        }
        Mutex::new(None)
    })
}

fn cancel_on_interrupt(token: &CancelToken) {
    if let Ok(mut target) = interrupt_target().lock() {
        *target = Some(token.clone());
    }
}

/// Routes the process-wide run log into `bundle` for the duration of `f`.
fn with_bundle_log<T>(
    bundle: &Path,
    f: impl FnOnce() -> Result<T, TimewalkerError>,
) -> Result<T, TimewalkerError> {
    if bundle.is_dir() {
        init_run_logger(bundle.join(RUN_LOG_FILE))?;
    }
    let result = f();
    clear_run_logger();
    result
}

fn print_run(report: &SessionReport) {
    println!(
        "run {} finished: {} keyframes, bundle {}",
        report.run_id,
        report.keyframes.keyframes.len(),
        report.bundle_dir.display()
    );
}

fn print_verdict(report: &FindingsReport) -> i32 {
    println!("{}", report.summary());
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    match report.verdict {
        Verdict::Pass => EXIT_PASS,
        Verdict::Fail => EXIT_FAIL_VERDICT,
    }
}
