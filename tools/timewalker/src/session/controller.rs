//! Drives one interactive process through a scenario.
//!
//! A background reader thread owns the process output: every chunk goes to
//! the recorder, the terminal machine and the transcript under one lock, so
//! the live screen and `raw.bin` never disagree about how many bytes were
//! seen. Steps run on the calling thread and only block on a condition
//! variable, never on the reader.

use crate::config::{absolutize_path, AppConfig, SessionConfig};
use crate::digest::sha256_hex;
use crate::errors::TimewalkerError;
use crate::fsm::ControllerFsm;
use crate::logging::unix_ms;
use crate::replay::{Keyframe, KeyframeSet};
use crate::runtime::{Clock, ProcessExit, PtyBackend, PtyControl, PtyRequest};
use crate::session::context::SessionContext;
use crate::session::predicate::{Condition, Observation, Predicate, Transcript};
use crate::session::scenario::{Expectation, Scenario, Step, DEFAULT_EXPECT_TIMEOUT_SECS};
use crate::terminal::{TerminalMachine, TerminalNotice};
use crate::timeline::event::{
    PlatformInfo, ScenarioIdentity, TerminalSettings, BUNDLE_FORMAT_VERSION,
};
use crate::timeline::{
    SessionMetadata, SessionOutcome, StateNotice, TimelineRecorder, KEYFRAMES_FILE, OUTCOME_FILE,
};
use crate::types::FailureKind;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Characters of output quoted in timeout errors.
pub const TIMEOUT_TAIL_CHARS: usize = 200;
const READER_JOIN_GRACE: Duration = Duration::from_millis(500);

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Cooperative cancellation, checked between polls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub vars: BTreeMap<String, String>,
    pub run_id: Option<String>,
    /// Exact bundle directory; wins over `meta.output_dir` and the runs dir.
    pub output_dir: Option<PathBuf>,
    /// Where the scenario was loaded from, for the metadata record.
    pub source: Option<PathBuf>,
    /// Base for relative paths and the `cwd` built-in.
    pub cwd: PathBuf,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub run_id: String,
    pub bundle_dir: PathBuf,
    pub outcome: SessionOutcome,
    pub keyframes: KeyframeSet,
}

pub struct SessionController {
    config: AppConfig,
    backend: Arc<dyn PtyBackend>,
    clock: Arc<dyn Clock>,
}

/// A step with templates rendered and predicates compiled.
#[derive(Debug)]
enum Planned {
    Input {
        text: String,
        send_newline: bool,
        mark: Option<String>,
        expect: Option<(Predicate, Duration)>,
        delay: Duration,
    },
    Wait {
        predicate: Predicate,
        timeout: Duration,
    },
    Snapshot {
        label: String,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
}

impl SessionController {
    pub fn new(config: AppConfig, backend: Arc<dyn PtyBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            backend,
            clock,
        }
    }

    /// Executes `scenario` and leaves a complete result bundle behind, also
    /// when a step fails. The returned error names that bundle.
    pub fn run(&self, scenario: &Scenario, request: RunRequest) -> Result<SessionReport, TimewalkerError> {
        scenario.validate()?;
        let session_cfg = &self.config.session;
        let capabilities = self.config.terminal.capability_set()?;

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| new_run_id(scenario.meta.id.as_deref().unwrap_or(&scenario.name)));
        let bundle_dir = match (&request.output_dir, &scenario.meta.output_dir) {
            (Some(dir), _) => absolutize_path(&request.cwd, dir),
            (None, Some(dir)) => absolutize_path(&request.cwd, Path::new(dir)),
            (None, None) => session_cfg.runs_dir.join(&run_id),
        };
        let uses_shell = scenario.meta.command.is_none();
        let injected_prompt =
            (uses_shell && session_cfg.inject_prompt).then(|| session_cfg.prompt.clone());
        let ctx = SessionContext::new(
            scenario,
            &request.vars,
            run_id.clone(),
            bundle_dir.clone(),
            &request.cwd,
            injected_prompt,
        );

        let launch = self.resolve_launch(scenario, &ctx, &request.cwd)?;
        let plan = self.plan(scenario, &ctx)?;

        let metadata = SessionMetadata {
            format_version: BUNDLE_FORMAT_VERSION,
            run_id: run_id.clone(),
            scenario: ScenarioIdentity {
                name: scenario.name.clone(),
                description: scenario.description.clone(),
                digest: scenario.digest(),
                source: request.source.as_ref().map(|p| p.display().to_string()),
            },
            vars: ctx.vars.clone(),
            command: std::iter::once(launch.program.clone())
                .chain(launch.args.iter().cloned())
                .collect(),
            cwd: launch.cwd.as_ref().map(|p| p.display().to_string()),
            env: launch.env.clone(),
            terminal: TerminalSettings {
                rows: launch.rows,
                cols: launch.cols,
                scrollback_limit: self.config.terminal.scrollback_limit,
                capabilities: capabilities.clone(),
            },
            platform: PlatformInfo::current(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            started_wall_ns: self.clock.wall_ns(),
        };
        let recorder = Arc::new(TimelineRecorder::create(
            &bundle_dir,
            &metadata,
            Arc::clone(&self.clock),
        )?);
        ctx.log.log(
            "info",
            "session.started",
            json!({
                "run_id": run_id,
                "scenario": scenario.name,
                "bundle": bundle_dir.display().to_string(),
                "command": metadata.command,
                "steps": plan.len(),
            }),
        );

        let machine = TerminalMachine::new(
            launch.rows,
            launch.cols,
            capabilities,
            self.config.terminal.scrollback_limit,
        );
        let session_budget = Duration::try_from_secs_f64(scenario.meta.timeout).unwrap_or(Duration::MAX);
        let mut run = SessionRun {
            config: session_cfg,
            clock: Arc::clone(&self.clock),
            ctx: &ctx,
            recorder: Arc::clone(&recorder),
            cancel: request.cancel.clone(),
            fsm: ControllerFsm::default(),
            keyframes: Vec::new(),
            labels: BTreeSet::new(),
            steps_completed: 0,
            current_step: None,
            exit: None,
            deadline_ns: self.clock.monotonic_ns().saturating_add(duration_ns(session_budget)),
            prompt: session_cfg.prompt.clone(),
            uses_shell,
            live: None,
        };

        let result = run
            .start(self.backend.as_ref(), &launch, machine)
            .and_then(|()| run.prepare_shell())
            .and_then(|()| run.run_steps(&plan))
            .and_then(|()| run.finish_process(scenario.meta.await_exit));
        run.shutdown();
        let outcome = run.conclude(&result);
        let keyframes = KeyframeSet {
            scenario: scenario.name.clone(),
            run_id: Some(run_id.clone()),
            keyframes: std::mem::take(&mut run.keyframes),
        };
        drop(run);

        let written = outcome.and_then(|outcome| {
            keyframes.write_to(&bundle_dir.join(KEYFRAMES_FILE))?;
            write_outcome(&bundle_dir, &outcome)?;
            Ok(outcome)
        });
        match (result, written) {
            (Err(error), written) => {
                if let Err(write_error) = written {
                    ctx.log.log("error", "session.bundle_incomplete", json!({ "error": write_error.to_string() }));
                }
                ctx.log.log("warn", "session.failed", json!({ "error": error.to_string() }));
                Err(error)
            }
            (Ok(()), Err(write_error)) => Err(ctx.error(None, write_error.to_string())),
            (Ok(()), Ok(outcome)) => {
                ctx.log.log(
                    "info",
                    "session.finished",
                    json!({ "keyframes": keyframes.keyframes.len(), "exit_code": outcome.exit_code }),
                );
                Ok(SessionReport {
                    run_id,
                    bundle_dir,
                    outcome,
                    keyframes,
                })
            }
        }
    }

    fn resolve_launch(
        &self,
        scenario: &Scenario,
        ctx: &SessionContext,
        base: &Path,
    ) -> Result<PtyRequest, TimewalkerError> {
        let session_cfg = &self.config.session;
        let argv = match &scenario.meta.command {
            Some(command) => command
                .iter()
                .map(|arg| ctx.render(arg, None))
                .collect::<Result<Vec<_>, _>>()?,
            None => session_cfg.shell.clone(),
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(ctx.error(None, "empty command"));
        };

        let cwd = match &scenario.meta.cwd {
            Some(cwd) => absolutize_path(base, Path::new(&ctx.render(cwd, None)?)),
            None => base.to_path_buf(),
        };

        let mut env = BTreeMap::from([("TERM".to_string(), session_cfg.term.clone())]);
        if let Some(prompt) = &ctx.injected_prompt {
            env.insert("PS1".to_string(), prompt.clone());
            env.insert("ENV".to_string(), String::new());
            env.insert("HISTFILE".to_string(), "/dev/null".to_string());
        }
        for (key, value) in &scenario.meta.env {
            env.insert(key.clone(), ctx.render(value, None)?);
        }

        let (rows, cols) = scenario
            .meta
            .pty
            .map(|pty| (pty.rows, pty.cols))
            .unwrap_or((session_cfg.rows, session_cfg.cols));
        Ok(PtyRequest {
            program: program.clone(),
            args: args.to_vec(),
            cwd: Some(cwd),
            env,
            rows,
            cols,
        })
    }

    fn plan(&self, scenario: &Scenario, ctx: &SessionContext) -> Result<Vec<Planned>, TimewalkerError> {
        let default_wait = Duration::from_secs(self.config.session.default_wait_timeout_secs);
        let predicate = |idx: usize, expect: &Expectation| {
            Predicate::resolve(expect, &ctx.vars).map_err(|message| ctx.error(Some(idx), message))
        };
        scenario
            .steps
            .iter()
            .enumerate()
            .map(|(idx, step)| -> Result<Planned, TimewalkerError> {
                Ok(match step {
                    Step::Command(command) => Planned::Input {
                        text: ctx.render(&command.run, Some(idx))?,
                        send_newline: command.send_newline,
                        mark: command.mark.clone(),
                        expect: match &command.expect {
                            Some(expect) => Some((
                                predicate(idx, expect)?,
                                seconds(command.timeout.unwrap_or(DEFAULT_EXPECT_TIMEOUT_SECS)),
                            )),
                            None => None,
                        },
                        delay: command.delay.map(seconds).unwrap_or(Duration::ZERO),
                    },
                    Step::Wait(wait) => Planned::Wait {
                        predicate: predicate(idx, &wait.expect)?,
                        timeout: wait.timeout.map(seconds).unwrap_or(default_wait),
                    },
                    Step::Snapshot(snapshot) => Planned::Snapshot {
                        label: snapshot.label.clone(),
                    },
                    Step::Resize(resize) => Planned::Resize {
                        rows: resize.rows,
                        cols: resize.cols,
                    },
                })
            })
            .collect()
    }
}

fn new_run_id(base: &str) -> String {
    format!(
        "{base}-{}-{}-{}",
        unix_ms(),
        std::process::id(),
        RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

fn write_outcome(bundle_dir: &Path, outcome: &SessionOutcome) -> Result<(), TimewalkerError> {
    let path = bundle_dir.join(OUTCOME_FILE);
    let body = serde_json::to_string_pretty(outcome).map_err(|e| TimewalkerError::Io(e.to_string()))?;
    std::fs::write(&path, body).map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))
}

// ── Live process ──────────────────────────────────────────────────────────────

struct Live {
    machine: TerminalMachine,
    transcript: Transcript,
    last_output_ns: u64,
    unknown_sequences: u64,
    reader_done: bool,
    reader_error: Option<String>,
}

struct Shared {
    live: Mutex<Live>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Live> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait(&self, guard: MutexGuard<'_, Live>, timeout: Duration) {
        let _ = self.changed.wait_timeout(guard, timeout);
    }
}

struct LiveProcess {
    shared: Arc<Shared>,
    writer: Box<dyn Write + Send>,
    control: Box<dyn PtyControl>,
    reader: Option<JoinHandle<()>>,
}

fn pump_output(
    mut reader: Box<dyn Read + Send>,
    shared: Arc<Shared>,
    recorder: Arc<TimelineRecorder>,
    clock: Arc<dyn Clock>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the child side of the PTY is gone.
            Err(_) => break,
        };
        let chunk = &buf[..n];
        let mut live = shared.lock();
        if let Err(error) = recorder.record_output(chunk) {
            if !recorder.is_closed() {
                live.reader_error = Some(error.to_string());
            }
            break;
        }
        let unknown = live
            .machine
            .append_bytes(chunk)
            .iter()
            .filter(|notice| matches!(notice, TerminalNotice::UnknownSequence { .. }))
            .count();
        live.unknown_sequences += unknown as u64;
        live.transcript.push(chunk);
        live.last_output_ns = clock.monotonic_ns();
        shared.changed.notify_all();
    }
    shared.lock().reader_done = true;
    shared.changed.notify_all();
}

// ── Session run ───────────────────────────────────────────────────────────────

struct SessionRun<'a> {
    config: &'a SessionConfig,
    clock: Arc<dyn Clock>,
    ctx: &'a SessionContext,
    recorder: Arc<TimelineRecorder>,
    cancel: CancelToken,
    fsm: ControllerFsm,
    keyframes: Vec<Keyframe>,
    labels: BTreeSet<String>,
    steps_completed: usize,
    current_step: Option<usize>,
    exit: Option<ProcessExit>,
    deadline_ns: u64,
    /// What `prompt_ready` looks for.
    prompt: String,
    uses_shell: bool,
    live: Option<LiveProcess>,
}

impl Drop for SessionRun<'_> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionRun<'_> {
    fn poll(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    fn shared(&self) -> Result<Arc<Shared>, TimewalkerError> {
        self.live
            .as_ref()
            .map(|live| Arc::clone(&live.shared))
            .ok_or_else(|| self.ctx.error(self.current_step, "process is not running"))
    }

    fn start(
        &mut self,
        backend: &dyn PtyBackend,
        launch: &PtyRequest,
        machine: TerminalMachine,
    ) -> Result<(), TimewalkerError> {
        let process = match backend.spawn(launch) {
            Ok(process) => process,
            Err(error) => {
                let message = format!("failed to spawn `{}`: {error}", launch.program);
                self.fsm.fail(FailureKind::SpawnFailed, None, message.clone());
                return Err(self.ctx.error(None, message));
            }
        };
        let shared = Arc::new(Shared {
            live: Mutex::new(Live {
                machine,
                transcript: Transcript::new(),
                last_output_ns: self.clock.monotonic_ns(),
                unknown_sequences: 0,
                reader_done: false,
                reader_error: None,
            }),
            changed: Condvar::new(),
        });
        let reader = {
            let shared = Arc::clone(&shared);
            let recorder = Arc::clone(&self.recorder);
            let clock = Arc::clone(&self.clock);
            let buffer_size = self.config.read_buffer_size;
            let source = process.reader;
            std::thread::Builder::new()
                .name("timewalker-reader".to_string())
                .spawn(move || pump_output(source, shared, recorder, clock, buffer_size))
                .map_err(|e| self.ctx.error(None, format!("reader thread: {e}")))?
        };
        self.live = Some(LiveProcess {
            shared,
            writer: process.writer,
            control: process.control,
            reader: Some(reader),
        });
        self.fsm
            .start()
            .map_err(|e| self.ctx.error(None, e.to_string()))?;
        self.ctx.log.log(
            "info",
            "session.spawned",
            json!({ "program": launch.program, "rows": launch.rows, "cols": launch.cols }),
        );
        Ok(())
    }

    /// Waits for the injected prompt, then defines the configured aliases.
    fn prepare_shell(&mut self) -> Result<(), TimewalkerError> {
        if self.ctx.injected_prompt.is_none() {
            return Ok(());
        }
        let ready = Predicate::Condition(Condition::PromptReady);
        let timeout = Duration::from_secs(self.config.default_wait_timeout_secs);
        self.wait_for(None, &ready, timeout)?;
        let aliases = self.config.aliases.clone();
        for (name, expansion) in &aliases {
            let line = format!("alias {name}='{}'", expansion.replace('\'', r"'\''"));
            self.send(None, &line, true, true)?;
            self.wait_for(None, &ready, timeout)?;
        }
        Ok(())
    }

    fn run_steps(&mut self, plan: &[Planned]) -> Result<(), TimewalkerError> {
        for (idx, step) in plan.iter().enumerate() {
            self.current_step = Some(idx);
            self.check_cancel()?;
            self.check_reader()?;
            self.ctx
                .log
                .log("debug", "session.step.started", json!({ "step_index": idx, "step": format!("{step:?}") }));
            match step {
                Planned::Input {
                    text,
                    send_newline,
                    mark,
                    expect,
                    delay,
                } => {
                    self.pause(*delay)?;
                    self.send(Some(idx), text, *send_newline, false)?;
                    if let Some(label) = mark {
                        self.capture(idx, label)?;
                    }
                    if let Some((predicate, timeout)) = expect {
                        self.wait_for(Some(idx), predicate, *timeout)?;
                    }
                }
                Planned::Wait { predicate, timeout } => {
                    self.wait_for(Some(idx), predicate, *timeout)?;
                }
                Planned::Snapshot { label } => self.capture(idx, label)?,
                Planned::Resize { rows, cols } => self.resize(idx, *rows, *cols)?,
            }
            self.steps_completed = idx + 1;
        }
        self.current_step = None;
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), TimewalkerError> {
        if self.cancel.is_cancelled() {
            return Err(TimewalkerError::Cancelled {
                bundle: self.ctx.bundle_dir.clone(),
            });
        }
        Ok(())
    }

    fn check_reader(&self) -> Result<(), TimewalkerError> {
        let shared = self.shared()?;
        let error = shared.lock().reader_error.clone();
        match error {
            Some(error) => Err(self
                .ctx
                .error(self.current_step, format!("recording output failed: {error}"))),
            None => Ok(()),
        }
    }

    fn pause(&mut self, duration: Duration) -> Result<(), TimewalkerError> {
        let until = self.clock.monotonic_ns().saturating_add(duration_ns(duration));
        loop {
            self.check_cancel()?;
            let now = self.clock.monotonic_ns();
            if now >= until {
                return Ok(());
            }
            self.clock
                .sleep(Duration::from_nanos(until - now).min(self.poll()));
        }
    }

    fn send(
        &mut self,
        step_index: Option<usize>,
        text: &str,
        newline: bool,
        injected: bool,
    ) -> Result<(), TimewalkerError> {
        let mut payload = text.to_string();
        if newline {
            payload.push_str(&self.config.line_terminator);
        }
        let ctx = self.ctx;
        let Some(live) = self.live.as_mut() else {
            return Err(ctx.error(step_index, "process is not running"));
        };
        {
            let mut guard = live.shared.lock();
            guard.transcript.mark();
            self.recorder.record_input(step_index, &payload, injected)?;
        }
        live.writer
            .write_all(payload.as_bytes())
            .and_then(|()| live.writer.flush())
            .map_err(|e| ctx.error(step_index, format!("write to process: {e}")))?;
        ctx.log.log(
            "debug",
            "session.input",
            json!({ "step_index": step_index, "text": payload, "injected": injected }),
        );
        Ok(())
    }

    fn poll_exit(&mut self) {
        if self.exit.is_some() {
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };
        match live.control.try_wait() {
            Ok(Some(exit)) => {
                self.exit = Some(exit);
                let notice = StateNotice::ProcessExited {
                    code: exit.code,
                    success: exit.success,
                };
                if let Err(error) = self.recorder.record_notice(notice) {
                    self.ctx
                        .log
                        .log("warn", "session.exit_not_recorded", json!({ "error": error.to_string() }));
                }
                self.ctx
                    .log
                    .log("info", "session.process_exited", json!({ "code": exit.code, "success": exit.success }));
            }
            Ok(None) => {}
            Err(error) => {
                self.ctx
                    .log
                    .log("warn", "session.wait_failed", json!({ "error": error.to_string() }));
            }
        }
    }

    /// Polls `predicate` until it matches or `timeout` (capped by the session
    /// budget) runs out. Output keeps flowing meanwhile.
    fn wait_for(
        &mut self,
        step_index: Option<usize>,
        predicate: &Predicate,
        timeout: Duration,
    ) -> Result<String, TimewalkerError> {
        let poll = self.poll();
        let stable_ns = duration_ns(poll).saturating_mul(2);
        let started = self.clock.monotonic_ns();
        let deadline = started.saturating_add(duration_ns(timeout)).min(self.deadline_ns);
        let shared = self.shared()?;
        self.fsm
            .begin_wait()
            .map_err(|e| self.ctx.error(step_index, e.to_string()))?;

        loop {
            self.check_cancel()?;
            self.poll_exit();
            let guard = shared.lock();
            let now = self.clock.monotonic_ns();
            let screen = guard.machine.current_grid();
            let evidence = predicate.evaluate(&Observation {
                recent: guard.transcript.recent(),
                screen: &screen,
                prompt: &self.prompt,
                exited: self.exit.is_some(),
                stable: now.saturating_sub(guard.last_output_ns) >= stable_ns,
            });

            if let Some(evidence) = evidence {
                let raw_offset = guard.machine.bytes_fed();
                if let Some(step_index) = step_index {
                    self.recorder.record_notice(StateNotice::WaitMatched {
                        step_index,
                        predicate: predicate.describe(),
                        evidence: evidence.clone(),
                        raw_offset,
                    })?;
                }
                drop(guard);
                self.fsm
                    .end_wait()
                    .map_err(|e| self.ctx.error(step_index, e.to_string()))?;
                self.ctx.log.log(
                    "debug",
                    "session.wait.matched",
                    json!({
                        "step_index": step_index,
                        "predicate": predicate.describe(),
                        "evidence": evidence,
                        "elapsed_ms": now.saturating_sub(started) / 1_000_000,
                    }),
                );
                return Ok(evidence);
            }

            if now >= deadline {
                let tail = guard.transcript.tail(TIMEOUT_TAIL_CHARS);
                drop(guard);
                let _ = self.fsm.end_wait();
                let timeout_ms = deadline.saturating_sub(started) / 1_000_000;
                self.ctx.log.log(
                    "warn",
                    "session.wait.timeout",
                    json!({ "step_index": step_index, "predicate": predicate.describe(), "timeout_ms": timeout_ms }),
                );
                return Err(match step_index {
                    Some(step_index) => TimewalkerError::StepTimeout {
                        step_index,
                        timeout_ms,
                        bundle: self.ctx.bundle_dir.clone(),
                        tail,
                    },
                    None => self.ctx.error(
                        None,
                        format!(
                            "{} not met within {timeout_ms}ms; output tail: {tail:?}",
                            predicate.describe()
                        ),
                    ),
                });
            }

            let remaining = Duration::from_nanos(deadline - now).min(poll);
            shared.wait(guard, remaining);
        }
    }

    /// Waits for output to go quiet, bounded by the settle limit.
    fn settle(&mut self) -> Result<(), TimewalkerError> {
        let quiet_ns = self.config.snapshot_settle_ms.saturating_mul(1_000_000);
        let limit = self
            .clock
            .monotonic_ns()
            .saturating_add(self.config.snapshot_settle_max_ms.saturating_mul(1_000_000));
        let shared = self.shared()?;
        loop {
            self.check_cancel()?;
            let guard = shared.lock();
            let now = self.clock.monotonic_ns();
            let quiet_for = now.saturating_sub(guard.last_output_ns);
            if quiet_for >= quiet_ns || now >= limit || guard.reader_done {
                return Ok(());
            }
            let remaining = (quiet_ns - quiet_for).min(limit - now);
            shared.wait(guard, Duration::from_nanos(remaining).min(self.poll()));
        }
    }

    fn capture(&mut self, step_index: usize, label: &str) -> Result<(), TimewalkerError> {
        if !self.labels.insert(label.to_string()) {
            return Err(self
                .ctx
                .error(Some(step_index), format!("duplicate snapshot label `{label}`")));
        }
        self.settle()?;
        let shared = self.shared()?;
        let guard = shared.lock();
        let raw_offset = guard.machine.bytes_fed();
        let keyframe = Keyframe::capture(label, Some(step_index), raw_offset, guard.machine.current_grid());
        self.recorder
            .record_snapshot(step_index, label, raw_offset, &keyframe.state_digest)?;
        drop(guard);
        self.ctx.log.log(
            "info",
            "session.snapshot",
            json!({ "step_index": step_index, "label": label, "raw_offset": raw_offset, "digest": keyframe.state_digest }),
        );
        self.keyframes.push(keyframe);
        Ok(())
    }

    fn resize(&mut self, step_index: usize, rows: u16, cols: u16) -> Result<(), TimewalkerError> {
        let ctx = self.ctx;
        let Some(live) = self.live.as_mut() else {
            return Err(ctx.error(Some(step_index), "process is not running"));
        };
        let mut guard = live.shared.lock();
        guard.machine.resize(rows, cols);
        live.control
            .resize(rows, cols)
            .map_err(|e| ctx.error(Some(step_index), e.to_string()))?;
        let raw_offset = guard.machine.bytes_fed();
        self.recorder.record_notice(StateNotice::Resize {
            step_index,
            rows,
            cols,
            raw_offset,
        })?;
        drop(guard);
        ctx.log.log(
            "info",
            "session.resize",
            json!({ "step_index": step_index, "rows": rows, "cols": cols, "raw_offset": raw_offset }),
        );
        Ok(())
    }

    /// End of the steps: let the process leave on its own terms.
    fn finish_process(&mut self, await_exit: bool) -> Result<(), TimewalkerError> {
        let exited = Predicate::Condition(Condition::ProcessExited);
        let grace = Duration::from_millis(self.config.exit_grace_ms);
        if await_exit {
            let remaining = self.deadline_ns.saturating_sub(self.clock.monotonic_ns());
            return match self.wait_for(None, &exited, Duration::from_nanos(remaining)) {
                Ok(_) => {
                    self.drain(grace);
                    Ok(())
                }
                Err(error @ TimewalkerError::Cancelled { .. }) => Err(error),
                Err(_) => Err(self
                    .ctx
                    .error(None, "process did not exit before the session timeout")),
            };
        }
        self.poll_exit();
        if self.exit.is_none() && self.uses_shell {
            // A shell that already went away is handled by shutdown.
            if self.send(None, "exit", true, true).is_ok() {
                let _ = self.wait_for(None, &exited, grace);
            }
        }
        if self.exit.is_some() {
            self.drain(grace);
        }
        Ok(())
    }

    /// Lets the reader collect output still buffered after the process exited.
    fn drain(&self, limit: Duration) {
        let Ok(shared) = self.shared() else {
            return;
        };
        let until = self.clock.monotonic_ns().saturating_add(duration_ns(limit));
        loop {
            let guard = shared.lock();
            let now = self.clock.monotonic_ns();
            if guard.reader_done || now >= until {
                return;
            }
            shared.wait(guard, Duration::from_nanos(until - now).min(self.poll()));
        }
    }

    /// Kills the process if it is still alive and releases the reader.
    fn shutdown(&mut self) {
        if self.exit.is_none() {
            self.poll_exit();
        }
        if self.exit.is_none() {
            if let Some(live) = self.live.as_mut() {
                if let Err(error) = live.control.kill() {
                    self.ctx
                        .log
                        .log("warn", "session.kill_failed", json!({ "error": error.to_string() }));
                }
            }
            self.poll_exit();
        }
        self.drain(READER_JOIN_GRACE);
        self.poll_exit();
        let Some(mut live) = self.live.take() else {
            return;
        };
        let finished = live.shared.lock().reader_done;
        if let Some(handle) = live.reader.take() {
            if finished {
                let _ = handle.join();
            } else {
                // A grandchild still holds the PTY open; leave the thread detached.
                self.ctx.log.log("warn", "session.reader_detached", json!({}));
            }
        }
        let unknown = live.shared.lock().unknown_sequences;
        if unknown > 0 {
            self.ctx
                .log
                .log("info", "session.unknown_sequences", json!({ "count": unknown }));
        }
    }

    /// Settles the controller state and closes the timeline.
    fn conclude(&mut self, result: &Result<(), TimewalkerError>) -> Result<SessionOutcome, TimewalkerError> {
        match result {
            Ok(()) => {
                if let Err(error) = self.fsm.succeed() {
                    self.fsm
                        .fail(FailureKind::SessionError, self.current_step, error.to_string());
                }
            }
            Err(error) => {
                let kind = match error {
                    TimewalkerError::StepTimeout { .. } => FailureKind::StepTimeout,
                    TimewalkerError::Cancelled { .. } => FailureKind::Cancelled,
                    _ => FailureKind::SessionError,
                };
                let step = match error {
                    TimewalkerError::StepTimeout { step_index, .. } => Some(*step_index),
                    TimewalkerError::SessionExecution { step_index, .. } => *step_index,
                    _ => self.current_step,
                };
                self.fsm.fail(kind, step, error.to_string());
                if kind == FailureKind::Cancelled {
                    if let Err(notice_error) = self.recorder.record_notice(StateNotice::Cancelled {
                        reason: "cancellation requested".to_string(),
                    }) {
                        self.ctx.log.log(
                            "warn",
                            "session.cancel_notice_failed",
                            json!({ "error": notice_error.to_string() }),
                        );
                    }
                }
            }
        }
        let outcome = SessionOutcome {
            state: self.fsm.state,
            step_index: self.fsm.failure_step,
            message: self.fsm.failure_reason.clone(),
            exit_code: self.exit.map(|exit| exit.code),
            steps_completed: self.steps_completed,
        };
        self.recorder.finish(StateNotice::Finished {
            outcome: outcome.clone(),
        })?;
        Ok(outcome)
    }
}

/// Digest of a session's keyframes, for quick equality checks between runs.
pub fn keyframes_digest(keyframes: &[Keyframe]) -> String {
    let joined = keyframes
        .iter()
        .map(|k| format!("{}={}", k.label, k.state_digest))
        .collect::<Vec<_>>()
        .join("\n");
    sha256_hex(joined.as_bytes())
}
