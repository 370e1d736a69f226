pub mod fake_pty;

pub use fake_pty::{FakePtyBackend, FakePtyLog};

use crate::errors::TimewalkerError;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Nanoseconds on a clock that never goes backwards. Only differences are meaningful.
    fn monotonic_ns(&self) -> u64;
    /// Nanoseconds since the unix epoch, for humans.
    fn wall_ns(&self) -> u64;
    fn sleep(&self, duration: Duration);
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, TimewalkerError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TimewalkerError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), TimewalkerError>;
    fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: u32,
    pub success: bool,
}

/// Handle on a child running inside a PTY.
pub trait PtyControl: Send {
    fn resize(&mut self, rows: u16, cols: u16) -> Result<(), TimewalkerError>;
    fn try_wait(&mut self) -> Result<Option<ProcessExit>, TimewalkerError>;
    fn kill(&mut self) -> Result<(), TimewalkerError>;
    fn process_id(&self) -> Option<u32>;
}

pub struct PtyProcess {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn PtyControl>,
}

pub trait PtyBackend: Send + Sync {
    fn spawn(&self, request: &PtyRequest) -> Result<PtyProcess, TimewalkerError>;
}

pub struct ProductionClock {
    origin: Instant,
}

impl ProductionClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ProductionClock {
    fn monotonic_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn wall_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, TimewalkerError> {
        std::fs::read_to_string(path)
            .map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TimewalkerError> {
        std::fs::write(path, contents)
            .map_err(|e| TimewalkerError::Io(format!("{}: {e}", path.display())))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), TimewalkerError> {
        std::fs::create_dir_all(path).map_err(|e| TimewalkerError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct PortablePtyBackend;

struct PortablePtyControl {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyControl for PortablePtyControl {
    fn resize(&mut self, rows: u16, cols: u16) -> Result<(), TimewalkerError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TimewalkerError::Io(format!("pty resize: {e}")))
    }

    fn try_wait(&mut self) -> Result<Option<ProcessExit>, TimewalkerError> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| TimewalkerError::Io(format!("pty wait: {e}")))?;
        Ok(status.map(|status| ProcessExit {
            code: status.exit_code(),
            success: status.success(),
        }))
    }

    fn kill(&mut self) -> Result<(), TimewalkerError> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| TimewalkerError::Io(format!("pty kill: {e}")))
    }

    fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }
}

impl PtyBackend for PortablePtyBackend {
    fn spawn(&self, request: &PtyRequest) -> Result<PtyProcess, TimewalkerError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TimewalkerError::Io(format!("openpty: {e}")))?;

        let mut command = CommandBuilder::new(&request.program);
        command.args(&request.args);
        if let Some(cwd) = &request.cwd {
            command.cwd(cwd);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| TimewalkerError::Io(format!("spawn {}: {e}", request.program)))?;
        // The child holds its own slave handle; ours would keep the reader from seeing EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TimewalkerError::Io(format!("pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TimewalkerError::Io(format!("pty writer: {e}")))?;

        Ok(PtyProcess {
            reader,
            writer,
            control: Box::new(PortablePtyControl {
                master: pair.master,
                child,
            }),
        })
    }
}

#[derive(Clone)]
pub struct FakeClock {
    mono_ns: Arc<Mutex<u64>>,
    wall_ns: Arc<Mutex<u64>>,
    step_ns: u64,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl FakeClock {
    /// Every reading of the monotonic clock advances it by `step_ns`.
    pub fn new(wall_ns: u64, step_ns: u64) -> Self {
        Self {
            mono_ns: Arc::new(Mutex::new(0)),
            wall_ns: Arc::new(Mutex::new(wall_ns)),
            step_ns,
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    pub fn set_wall_ns(&self, wall_ns: u64) {
        *self.wall_ns.lock().expect("wall lock") = wall_ns;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000_000_000, 1_000)
    }
}

impl Clock for FakeClock {
    fn monotonic_ns(&self) -> u64 {
        let mut now = self.mono_ns.lock().expect("clock lock");
        *now += self.step_ns;
        *now
    }

    fn wall_ns(&self) -> u64 {
        *self.wall_ns.lock().expect("wall lock")
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleep lock").push(duration);
        *self.mono_ns.lock().expect("clock lock") += duration.as_nanos() as u64;
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<TimewalkerError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: TimewalkerError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    fn maybe_fail(&self) -> Result<(), TimewalkerError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, TimewalkerError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| TimewalkerError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TimewalkerError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), TimewalkerError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_is_strictly_increasing_and_sleep_advances_time() {
        let clock = FakeClock::new(42, 10);
        let a = clock.monotonic_ns();
        let b = clock.monotonic_ns();
        assert!(b > a);
        clock.sleep(Duration::from_millis(1));
        assert!(clock.monotonic_ns() >= b + 1_000_000);
        assert_eq!(clock.wall_ns(), 42);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1)]);
    }

    #[test]
    fn fake_file_system_round_trips_and_injects_failures() {
        let fs = FakeFileSystem::with_file("/a.toml", "x = 1");
        assert!(fs.exists(Path::new("/a.toml")));
        assert_eq!(fs.read_to_string(Path::new("/a.toml")).expect("read"), "x = 1");
        fs.set_fail_next(TimewalkerError::Io("boom".to_string()));
        assert!(fs.read_to_string(Path::new("/a.toml")).is_err());
        fs.write_string(Path::new("/b"), "y").expect("write");
        assert_eq!(fs.read_to_string(Path::new("/b")).expect("read"), "y");
    }

    #[test]
    fn production_clock_monotonic_never_decreases() {
        let clock = ProductionClock::new();
        let mut last = clock.monotonic_ns();
        for _ in 0..100 {
            let now = clock.monotonic_ns();
            assert!(now >= last);
            last = now;
        }
        assert!(clock.wall_ns() > 0);
    }
}
