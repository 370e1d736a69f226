use assert_cmd::cargo::cargo_bin_cmd;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use timewalker::diff::FindingsReport;
use timewalker::types::Verdict;

fn fixture(path: &str) -> String {
    format!("{}/tests/fixtures/scenarios/{path}", env!("CARGO_MANIFEST_DIR"))
}

fn workspace() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        temp.path().join("timewalker.toml"),
        "[session]\nruns_dir = \"runs\"\npoll_interval_ms = 10\nsnapshot_settle_ms = 150\n\n[baseline]\nroot = \"baselines\"\n",
    )
    .expect("write config");
    temp
}

fn timewalker(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("timewalker");
    cmd.current_dir(dir);
    cmd
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8(output.stdout.clone()).expect("utf8")
}

#[test]
fn help_lists_subcommands() {
    let out = cargo_bin_cmd!("timewalker").arg("--help").assert().success();
    let stdout = stdout_of(out.get_output());
    for subcommand in ["run", "analyze", "run-and-analyze", "promote", "validate", "replay"] {
        assert!(stdout.contains(subcommand), "missing {subcommand}");
    }
}

#[test]
fn usage_errors_exit_64() {
    cargo_bin_cmd!("timewalker").arg("frobnicate").assert().code(64);
    cargo_bin_cmd!("timewalker")
        .args(["run", &fixture("greeting.toml"), "--var", "novalue"])
        .assert()
        .code(64);
}

#[test]
fn validate_distinguishes_valid_and_invalid_scenarios() {
    let out = cargo_bin_cmd!("timewalker")
        .args(["validate", &fixture("greeting.toml")])
        .assert()
        .success();
    assert!(stdout_of(out.get_output()).contains("greeted"));

    let out = cargo_bin_cmd!("timewalker")
        .args(["validate", &fixture("duplicate_label.toml")])
        .assert()
        .code(3);
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("duplicate snapshot label"));

    cargo_bin_cmd!("timewalker")
        .args(["run", &fixture("missing.toml")])
        .assert()
        .code(3);
}

#[test]
fn promoted_run_passes_and_changed_output_fails() {
    let temp = workspace();
    let dir = temp.path();

    timewalker(dir)
        .args(["run", &fixture("greeting.toml"), "--run-id", "first"])
        .assert()
        .success();
    assert!(dir.join("runs/first/keyframes.json").exists());

    let out = timewalker(dir)
        .args(["promote", "runs/first"])
        .assert()
        .success();
    assert!(stdout_of(out.get_output()).contains("v1"));

    let out = timewalker(dir)
        .args(["run-and-analyze", &fixture("greeting.toml"), "--run-id", "second"])
        .assert()
        .code(0);
    assert!(stdout_of(out.get_output()).contains("PASS"));
    let report = FindingsReport::load(&dir.join("runs/second/findings.json")).expect("findings");
    assert_eq!(report.verdict, Verdict::Pass);
    assert_eq!(report.baseline_version, Some(1));

    timewalker(dir)
        .args([
            "run-and-analyze",
            &fixture("greeting.toml"),
            "--run-id",
            "third",
            "--var",
            "who=there",
            "--findings",
            "third.json",
        ])
        .assert()
        .code(2);
    let report = FindingsReport::load(&dir.join("third.json")).expect("findings");
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report
        .discrepancies()
        .any(|d| d.label == "greeted" && d.actual.contains("there")));

    // Re-analyzing the earlier bundle still passes.
    timewalker(dir)
        .args(["analyze", "runs/second"])
        .assert()
        .code(0);
}

#[test]
fn analyze_without_a_baseline_is_an_execution_error() {
    let temp = workspace();
    let dir = temp.path();
    timewalker(dir)
        .args(["run", &fixture("greeting.toml"), "--run-id", "only"])
        .assert()
        .success();
    timewalker(dir)
        .args(["analyze", "runs/only"])
        .assert()
        .code(1);
}

#[test]
fn step_timeout_fails_fast_and_leaves_a_bundle() {
    let temp = workspace();
    let dir = temp.path();
    let started = Instant::now();
    let out = timewalker(dir)
        .args(["run", &fixture("stuck.toml"), "--run-id", "stuck"])
        .timeout(Duration::from_secs(25))
        .assert()
        .code(1);
    assert!(started.elapsed() < Duration::from_secs(20));
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("step 0 timed out after 500ms"));
    assert!(stderr.contains("almost"));
    assert!(dir.join("runs/stuck/timeline.jsonl").exists());
    assert!(dir.join("runs/stuck/outcome.json").exists());

    // A failed run is never promoted.
    timewalker(dir)
        .args(["promote", "runs/stuck"])
        .assert()
        .code(64);
}

#[test]
fn replay_prints_the_captured_screen() {
    let temp = workspace();
    let dir = temp.path();
    timewalker(dir)
        .args(["run", &fixture("greeting.toml"), "--run-id", "shown", "--var", "who=replay"])
        .assert()
        .success();
    let out = timewalker(dir)
        .args(["replay", "runs/shown", "--label", "greeted"])
        .assert()
        .success();
    let stdout = stdout_of(out.get_output());
    assert!(stdout.contains("greeted"));
    assert!(stdout.contains("hello replay"));
}

#[test]
fn interrupt_cancels_the_run_and_keeps_the_bundle() {
    let temp = workspace();
    let dir = temp.path();
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("timewalker"))
        .args(["run", &fixture("long_wait.toml"), "--run-id", "interrupted"])
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn");

    // Interrupt only once the session is inside the long wait.
    let timeline = dir.join("runs/interrupted/timeline.jsonl");
    let deadline = Instant::now() + Duration::from_secs(15);
    while !std::fs::read_to_string(&timeline).is_ok_and(|text| text.contains("wait_matched")) {
        assert!(Instant::now() < deadline, "session never reached the wait step");
        std::thread::sleep(Duration::from_millis(50));
    }
    let started = Instant::now();
    let signalled = std::process::Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .expect("kill");
    assert!(signalled.success());

    let output = child.wait_with_output().expect("wait");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(output.status.code(), Some(130));
    let stderr = String::from_utf8(output.stderr).expect("utf8");
    assert!(stderr.contains("session cancelled"));

    let text = std::fs::read_to_string(&timeline).expect("timeline");
    assert!(text.contains("\"notice\":\"cancelled\""));
    let last = text.lines().last().expect("lines");
    assert!(last.contains("\"notice\":\"finished\""));
    assert!(dir.join("runs/interrupted/outcome.json").exists());
}
