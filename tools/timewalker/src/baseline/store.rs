use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::baseline::{
    version_dir_name, Baseline, BaselineManifest, INDEX_FILE, MANIFEST_FILE,
    MANIFEST_FORMAT_VERSION,
};
use crate::digest::sha256_hex;
use crate::errors::TimewalkerError;
use crate::logging::{append_run_log, unix_ms};
use crate::replay::KeyframeSet;
use crate::timeline::KEYFRAMES_FILE;

const READ_POOL_SIZE: usize = 2;

type StoreResult<T> = Result<T, TimewalkerError>;

#[derive(Debug, Clone, PartialEq)]
pub struct PromoteRequest {
    pub scenario: String,
    pub keyframes: KeyframeSet,
    /// Version the caller last saw as current; `None` when there was none.
    pub expected_current: Option<u32>,
    /// Promote only these labels, keeping the rest of the current version.
    pub labels: Option<Vec<String>>,
    pub source_run_id: Option<String>,
}

#[derive(Debug)]
enum WriteCmd {
    Promote {
        request: PromoteRequest,
        now: i64,
        reply: oneshot::Sender<StoreResult<BaselineManifest>>,
    },
}

/// Baseline index plus version directories under one root.
///
/// All promotions go through a single writer thread; each one is a
/// compare-and-swap of the scenario's current version inside an immediate
/// transaction, so concurrent promoters (threads or processes) cannot lose
/// each other's updates.
pub struct BaselineStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    root: PathBuf,
}

impl Drop for BaselineStore {
    fn drop(&mut self) {
        // Close the sender first so the writer loop exits.
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl BaselineStore {
    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| TimewalkerError::Database("store is closed".to_string()))
    }

    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| TimewalkerError::Database(e.to_string()))?;
        let path = root.join(INDEX_FILE);
        let existed_before_open = path.exists();

        if existed_before_open {
            let meta = fs::metadata(&path).map_err(|e| TimewalkerError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(TimewalkerError::Database(format!(
                    "baseline index is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;
        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(TimewalkerError::Database(format!(
                    "baseline index failed integrity check: {integrity}"
                )));
            }
        }
        run_migrations(&mut write_conn)?;

        let writer_root = root.clone();
        let (write_tx, mut write_rx) = mpsc::channel(128);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::Promote {
                        request,
                        now,
                        reply,
                    } => {
                        let result = promote(&mut write_conn, &writer_root, &request, now);
                        let _ = reply.send(result);
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        append_run_log(
            "info",
            "baseline_store.opened",
            json!({ "root": root.display().to_string() }),
        );
        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_version(&self, scenario: &str) -> StoreResult<Option<u32>> {
        check_scenario_name(scenario)?;
        self.read_pool.with_conn(|conn| current_version(conn, scenario))
    }

    /// The published version, verified against its manifest digest.
    pub fn load_current(&self, scenario: &str) -> StoreResult<Baseline> {
        check_scenario_name(scenario)?;
        let row = self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT b.current_version, v.keyframes_sha256
                 FROM baselines b
                 JOIN baseline_versions v
                   ON v.scenario = b.scenario AND v.version = b.current_version
                 WHERE b.scenario = ?1",
                [scenario],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(db_err)
        })?;
        let Some((version, indexed_sha)) = row else {
            return Err(TimewalkerError::BaselineNotFound(format!(
                "no baseline promoted for scenario `{scenario}` under {}",
                self.root.display()
            )));
        };
        let baseline = read_version(&self.root, scenario, version)?;
        if baseline.manifest.keyframes_sha256 != indexed_sha {
            return Err(TimewalkerError::Database(format!(
                "baseline `{scenario}` {}: manifest digest disagrees with the index",
                version_dir_name(version)
            )));
        }
        Ok(baseline)
    }

    /// Publishes `request.keyframes` as the next version if the current
    /// version still equals `request.expected_current`.
    pub fn promote(&self, request: PromoteRequest) -> StoreResult<BaselineManifest> {
        check_scenario_name(&request.scenario)?;
        if let Some(labels) = &request.labels {
            if labels.is_empty() {
                return Err(TimewalkerError::Cli("empty label list".to_string()));
            }
            for label in labels {
                if request.keyframes.get(label).is_none() {
                    return Err(TimewalkerError::Cli(format!(
                        "label `{label}` is not in the promoted keyframes"
                    )));
                }
            }
        }
        append_run_log(
            "debug",
            "baseline.promote_requested",
            json!({
                "scenario": request.scenario,
                "expected_current": request.expected_current,
                "labels": request.labels,
            }),
        );
        let scenario = request.scenario.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(WriteCmd::Promote {
                request,
                now: unix_ms() as i64,
                reply: reply_tx,
            })
            .map_err(|e| TimewalkerError::Database(e.to_string()))?;
        let result = reply_rx
            .blocking_recv()
            .map_err(|e| TimewalkerError::Database(e.to_string()))?;
        match &result {
            Ok(manifest) => append_run_log(
                "info",
                "baseline.promoted",
                json!({
                    "scenario": scenario,
                    "version": manifest.version,
                    "labels": manifest.labels,
                    "merged_from": manifest.merged_from,
                }),
            ),
            Err(error) => append_run_log(
                "warn",
                "baseline.promote_failed",
                json!({ "scenario": scenario, "error": error.to_string() }),
            ),
        }
        result
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| TimewalkerError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL").map_err(db_err)?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../../migrations/0001_baselines.sql"))];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, unix_ms() as i64],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "baseline_store.migration.applied",
            json!({ "version": version }),
        );
    }
    Ok(())
}

fn current_version(conn: &Connection, scenario: &str) -> StoreResult<Option<u32>> {
    conn.query_row(
        "SELECT current_version FROM baselines WHERE scenario = ?1",
        [scenario],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)
}

fn describe(version: Option<u32>) -> String {
    version.map_or_else(|| "none".to_string(), version_dir_name)
}

fn promote(
    conn: &mut Connection,
    root: &Path,
    request: &PromoteRequest,
    now: i64,
) -> StoreResult<BaselineManifest> {
    let scenario = request.scenario.as_str();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err)?;

    let current = current_version(&tx, scenario)?;
    if current != request.expected_current {
        return Err(TimewalkerError::BaselineConflict(format!(
            "scenario `{scenario}`: expected current baseline {}, found {}",
            describe(request.expected_current),
            describe(current)
        )));
    }

    let (keyframes, merged_from) = match (&request.labels, current) {
        (Some(labels), Some(version)) => {
            let base = read_version(root, scenario, version)?;
            (merge_labels(&base.keyframes, &request.keyframes, labels), Some(version))
        }
        (Some(labels), None) => (merge_labels(&empty_set(scenario), &request.keyframes, labels), None),
        (None, _) => (request.keyframes.clone(), None),
    };
    let keyframes = KeyframeSet {
        scenario: scenario.to_string(),
        run_id: request.source_run_id.clone().or(keyframes.run_id),
        keyframes: keyframes.keyframes,
    };

    let latest: Option<u32> = tx
        .query_row(
            "SELECT MAX(version) FROM baseline_versions WHERE scenario = ?1",
            [scenario],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    let version = latest.unwrap_or(0) + 1;

    let body = keyframes.to_json()?;
    let manifest = BaselineManifest {
        format_version: MANIFEST_FORMAT_VERSION,
        scenario: scenario.to_string(),
        version,
        keyframes_sha256: sha256_hex(body.as_bytes()),
        source_run_id: request.source_run_id.clone(),
        created_unix_ms: now,
        labels: keyframes.labels(),
        merged_from,
    };
    let labels_json = serde_json::to_string(&manifest.labels)
        .map_err(|e| TimewalkerError::Database(e.to_string()))?;
    let published = publish_version(root, &manifest, &body)?;

    let recorded = tx
        .execute(
            "INSERT INTO baseline_versions (scenario, version, keyframes_sha256, source_run_id, labels, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scenario,
                version,
                manifest.keyframes_sha256,
                manifest.source_run_id,
                labels_json,
                now
            ],
        )
        .and_then(|_| {
            tx.execute(
                "INSERT INTO baselines (scenario, current_version, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(scenario) DO UPDATE SET current_version = excluded.current_version, updated_at = excluded.updated_at",
                params![scenario, version, now],
            )
        })
        .and_then(|_| tx.commit());
    if let Err(error) = recorded {
        // The directory was never visible through the index.
        let _ = fs::remove_dir_all(&published);
        return Err(db_err(error));
    }
    Ok(manifest)
}

fn empty_set(scenario: &str) -> KeyframeSet {
    KeyframeSet {
        scenario: scenario.to_string(),
        run_id: None,
        keyframes: Vec::new(),
    }
}

/// `base` with every label in `labels` replaced by (or added from) `candidate`,
/// keeping the base order and appending new labels in candidate order.
fn merge_labels(base: &KeyframeSet, candidate: &KeyframeSet, labels: &[String]) -> KeyframeSet {
    let mut keyframes = base.keyframes.clone();
    for keyframe in candidate
        .keyframes
        .iter()
        .filter(|k| labels.contains(&k.label))
    {
        match keyframes.iter_mut().find(|k| k.label == keyframe.label) {
            Some(slot) => *slot = keyframe.clone(),
            None => keyframes.push(keyframe.clone()),
        }
    }
    KeyframeSet {
        scenario: base.scenario.clone(),
        run_id: candidate.run_id.clone(),
        keyframes,
    }
}

/// Writes into a staging directory and renames it into place.
fn publish_version(root: &Path, manifest: &BaselineManifest, keyframes_body: &str) -> StoreResult<PathBuf> {
    let scenario_dir = root.join(&manifest.scenario);
    let target = scenario_dir.join(version_dir_name(manifest.version));
    let staging = scenario_dir.join(format!(
        ".staging-{}-{}",
        version_dir_name(manifest.version),
        std::process::id()
    ));
    let io = |e: std::io::Error| TimewalkerError::Io(e.to_string());

    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io)?;
    }
    fs::create_dir_all(&staging).map_err(io)?;
    write_synced(&staging.join(KEYFRAMES_FILE), keyframes_body.as_bytes())?;
    let manifest_body =
        serde_json::to_string_pretty(manifest).map_err(|e| TimewalkerError::Io(e.to_string()))?;
    write_synced(&staging.join(MANIFEST_FILE), manifest_body.as_bytes())?;

    // Left over by a promotion whose transaction never committed.
    if target.exists() {
        fs::remove_dir_all(&target).map_err(io)?;
    }
    fs::rename(&staging, &target).map_err(io)?;
    Ok(target)
}

fn write_synced(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut file = fs::File::create(path).map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))
}

fn read_version(root: &Path, scenario: &str, version: u32) -> StoreResult<Baseline> {
    let dir = root.join(scenario).join(version_dir_name(version));
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest: BaselineManifest = serde_json::from_str(
        &fs::read_to_string(&manifest_path)
            .map_err(|e| TimewalkerError::Io(format!("{}: {e}", manifest_path.display())))?,
    )
    .map_err(|e| TimewalkerError::Database(format!("{}: {e}", manifest_path.display())))?;

    let keyframes_path = dir.join(KEYFRAMES_FILE);
    let body = fs::read(&keyframes_path)
        .map_err(|e| TimewalkerError::Io(format!("{}: {e}", keyframes_path.display())))?;
    let actual = sha256_hex(&body);
    if actual != manifest.keyframes_sha256 {
        return Err(TimewalkerError::Database(format!(
            "{}: sha256 {actual} does not match manifest {}",
            keyframes_path.display(),
            manifest.keyframes_sha256
        )));
    }
    let keyframes: KeyframeSet = serde_json::from_slice(&body)
        .map_err(|e| TimewalkerError::Database(format!("{}: {e}", keyframes_path.display())))?;
    Ok(Baseline { manifest, keyframes })
}

fn check_scenario_name(scenario: &str) -> StoreResult<()> {
    let valid = !scenario.is_empty()
        && !scenario.starts_with('.')
        && scenario
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(TimewalkerError::Cli(format!(
            "`{scenario}` cannot name a baseline directory"
        )));
    }
    Ok(())
}

fn db_err(error: rusqlite::Error) -> TimewalkerError {
    TimewalkerError::Database(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::Keyframe;
    use crate::terminal::{CapabilitySet, TerminalMachine};

    fn temp_store() -> (BaselineStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BaselineStore::open(dir.path().join("baselines")).expect("open store");
        (store, dir)
    }

    fn keyframe(label: &str, text: &str) -> Keyframe {
        let mut machine = TerminalMachine::new(3, 20, CapabilitySet::all(), 0);
        machine.append_bytes(text.as_bytes());
        Keyframe::capture(label, Some(0), text.len() as u64, machine.current_grid())
    }

    fn set(run: &str, frames: &[(&str, &str)]) -> KeyframeSet {
        KeyframeSet {
            scenario: "demo".to_string(),
            run_id: Some(run.to_string()),
            keyframes: frames.iter().map(|(l, t)| keyframe(l, t)).collect(),
        }
    }

    fn request(keyframes: KeyframeSet, expected: Option<u32>) -> PromoteRequest {
        PromoteRequest {
            scenario: "demo".to_string(),
            source_run_id: keyframes.run_id.clone(),
            keyframes,
            expected_current: expected,
            labels: None,
        }
    }

    #[test]
    fn promote_then_load_current_round_trip() {
        let (store, _dir) = temp_store();
        assert!(matches!(
            store.load_current("demo"),
            Err(TimewalkerError::BaselineNotFound(_))
        ));
        let manifest = store
            .promote(request(set("r1", &[("a", "hello")]), None))
            .expect("promote");
        assert_eq!(manifest.version, 1);
        assert_eq!(store.current_version("demo").expect("current"), Some(1));

        let baseline = store.load_current("demo").expect("load");
        assert_eq!(baseline.version(), 1);
        assert_eq!(baseline.keyframes.labels(), vec!["a".to_string()]);
        assert_eq!(baseline.manifest.source_run_id.as_deref(), Some("r1"));
        assert!(store.root().join("demo").join("v000001").join(MANIFEST_FILE).exists());
    }

    #[test]
    fn stale_expected_version_is_a_conflict_and_changes_nothing() {
        let (store, _dir) = temp_store();
        store
            .promote(request(set("r1", &[("a", "one")]), None))
            .expect("first");
        let err = store
            .promote(request(set("r2", &[("a", "two")]), None))
            .expect_err("conflict");
        assert!(matches!(err, TimewalkerError::BaselineConflict(_)));
        assert_eq!(store.current_version("demo").expect("current"), Some(1));
        assert_eq!(
            store.load_current("demo").expect("load").manifest.source_run_id.as_deref(),
            Some("r1")
        );

        let second = store
            .promote(request(set("r2", &[("a", "two")]), Some(1)))
            .expect("second");
        assert_eq!(second.version, 2);
    }

    #[test]
    fn concurrent_promotions_from_the_same_version_have_one_winner() {
        let (store, _dir) = temp_store();
        let store = Arc::new(store);
        let handles = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.promote(request(set(&format!("r{i}"), &[("a", "x")]), None)))
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect::<Vec<_>>();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, TimewalkerError::BaselineConflict(_))));
        assert_eq!(store.current_version("demo").expect("current"), Some(1));
    }

    #[test]
    fn label_subset_merges_over_current_version() {
        let (store, _dir) = temp_store();
        store
            .promote(request(set("r1", &[("a", "old a"), ("b", "old b")]), None))
            .expect("first");
        let mut partial = request(set("r2", &[("a", "new a"), ("b", "new b"), ("c", "new c")]), Some(1));
        partial.labels = Some(vec!["b".to_string(), "c".to_string()]);
        let manifest = store.promote(partial).expect("partial");
        assert_eq!(manifest.merged_from, Some(1));
        assert_eq!(manifest.labels, vec!["a", "b", "c"]);

        let baseline = store.load_current("demo").expect("load");
        let text = |label: &str| baseline.keyframes.get(label).expect("label").text[0].clone();
        assert_eq!(text("a"), "old a");
        assert_eq!(text("b"), "new b");
        assert_eq!(text("c"), "new c");

        let mut unknown = request(set("r3", &[("a", "x")]), Some(2));
        unknown.labels = Some(vec!["zzz".to_string()]);
        assert!(matches!(store.promote(unknown), Err(TimewalkerError::Cli(_))));
    }

    #[test]
    fn tampered_keyframes_fail_digest_verification() {
        let (store, _dir) = temp_store();
        store
            .promote(request(set("r1", &[("a", "hello")]), None))
            .expect("promote");
        let path = store.root().join("demo").join("v000001").join(KEYFRAMES_FILE);
        let body = fs::read_to_string(&path).expect("read").replace("hello", "hallo");
        fs::write(&path, body).expect("write");
        assert!(matches!(
            store.load_current("demo"),
            Err(TimewalkerError::Database(message)) if message.contains("does not match")
        ));
    }

    #[test]
    fn reopening_keeps_history_and_rejects_bad_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = BaselineStore::open(dir.path()).expect("open");
            store
                .promote(request(set("r1", &[("a", "x")]), None))
                .expect("promote");
        }
        let store = BaselineStore::open(dir.path()).expect("reopen");
        assert_eq!(store.current_version("demo").expect("current"), Some(1));
        assert!(matches!(store.current_version(".."), Err(TimewalkerError::Cli(_))));
    }
}
