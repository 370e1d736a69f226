//! In-memory PTY that behaves like a tiny line-oriented shell.
//!
//! Input is echoed back the way a cooked-mode terminal would, each complete
//! line is answered from a script, and the current prompt is printed after
//! every answer. Used to drive the session controller without a real process.

use super::{ProcessExit, PtyBackend, PtyControl, PtyProcess, PtyRequest};
use crate::errors::TimewalkerError;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FakePtyLog {
    pub requests: Vec<PtyRequest>,
    pub written: Vec<u8>,
    pub resizes: Vec<(u16, u16)>,
    pub kills: usize,
}

#[derive(Clone)]
pub struct FakePtyBackend {
    banner: String,
    responses: BTreeMap<String, String>,
    fail_spawn: Option<String>,
    log: Arc<Mutex<FakePtyLog>>,
}

impl Default for FakePtyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePtyBackend {
    pub fn new() -> Self {
        Self {
            banner: String::new(),
            responses: BTreeMap::new(),
            fail_spawn: None,
            log: Arc::new(Mutex::new(FakePtyLog::default())),
        }
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    /// Canned output for an exact command line.
    pub fn respond(mut self, line: impl Into<String>, output: impl Into<String>) -> Self {
        self.responses.insert(line.into(), output.into());
        self
    }

    pub fn failing_spawn(mut self, message: impl Into<String>) -> Self {
        self.fail_spawn = Some(message.into());
        self
    }

    pub fn log(&self) -> FakePtyLog {
        self.log.lock().expect("fake pty log lock").clone()
    }
}

struct FakeShell {
    prompt: String,
    line: Vec<u8>,
    responses: BTreeMap<String, String>,
    output: Option<Sender<Vec<u8>>>,
    exit: Option<ProcessExit>,
    log: Arc<Mutex<FakePtyLog>>,
}

impl FakeShell {
    fn emit(&self, text: &str) {
        if let Some(tx) = &self.output {
            let _ = tx.send(text.replace('\n', "\r\n").into_bytes());
        }
    }

    fn close(&mut self, code: u32) {
        self.output = None;
        if self.exit.is_none() {
            self.exit = Some(ProcessExit {
                code,
                success: code == 0,
            });
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        for byte in bytes {
            match byte {
                b'\r' | b'\n' => {
                    self.emit("\n");
                    let line = String::from_utf8_lossy(&self.line).to_string();
                    self.line.clear();
                    self.run_line(line.trim());
                }
                _ => {
                    self.line.push(*byte);
                    if let Some(tx) = &self.output {
                        let _ = tx.send(vec![*byte]);
                    }
                }
            }
            if self.output.is_none() {
                return;
            }
        }
    }

    fn run_line(&mut self, line: &str) {
        if let Some(reply) = self.responses.get(line) {
            let reply = reply.clone();
            self.emit(&reply);
        } else if line == "exit" {
            self.close(0);
            return;
        } else if let Some(value) = line
            .strip_prefix("export PS1=")
            .or_else(|| line.strip_prefix("PS1="))
        {
            self.prompt = unquote(value);
        } else if let Some(text) = line.strip_prefix("echo ") {
            self.emit(&format!("{}\n", unquote(text)));
        } else if !is_silent_builtin(line) {
            let name = line.split_whitespace().next().unwrap_or(line);
            self.emit(&format!("sh: {name}: not found\n"));
        }
        let prompt = self.prompt.clone();
        self.emit(&prompt);
    }
}

fn is_silent_builtin(line: &str) -> bool {
    line.is_empty()
        || ["alias ", "unalias ", "unset ", "export "]
            .iter()
            .any(|prefix| line.starts_with(prefix))
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

struct FakeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct FakeWriter {
    shell: Arc<Mutex<FakeShell>>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shell = self
            .shell
            .lock()
            .map_err(|_| io::Error::other("fake shell lock poisoned"))?;
        if shell.output.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake shell exited"));
        }
        shell
            .log
            .lock()
            .map_err(|_| io::Error::other("fake pty log lock poisoned"))?
            .written
            .extend_from_slice(buf);
        shell.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakeControl {
    shell: Arc<Mutex<FakeShell>>,
    log: Arc<Mutex<FakePtyLog>>,
}

impl PtyControl for FakeControl {
    fn resize(&mut self, rows: u16, cols: u16) -> Result<(), TimewalkerError> {
        self.log
            .lock()
            .map_err(|_| TimewalkerError::Io("fake pty log lock poisoned".to_string()))?
            .resizes
            .push((rows, cols));
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<ProcessExit>, TimewalkerError> {
        let shell = self
            .shell
            .lock()
            .map_err(|_| TimewalkerError::Io("fake shell lock poisoned".to_string()))?;
        Ok(shell.exit)
    }

    fn kill(&mut self) -> Result<(), TimewalkerError> {
        self.log
            .lock()
            .map_err(|_| TimewalkerError::Io("fake pty log lock poisoned".to_string()))?
            .kills += 1;
        self.shell
            .lock()
            .map_err(|_| TimewalkerError::Io("fake shell lock poisoned".to_string()))?
            .close(137);
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        None
    }
}

impl PtyBackend for FakePtyBackend {
    fn spawn(&self, request: &PtyRequest) -> Result<PtyProcess, TimewalkerError> {
        self.log
            .lock()
            .map_err(|_| TimewalkerError::Io("fake pty log lock poisoned".to_string()))?
            .requests
            .push(request.clone());
        if let Some(message) = &self.fail_spawn {
            return Err(TimewalkerError::Io(message.clone()));
        }

        let (tx, rx) = channel();
        let prompt = request.env.get("PS1").cloned().unwrap_or_else(|| "$ ".to_string());
        let shell = FakeShell {
            prompt: prompt.clone(),
            line: Vec::new(),
            responses: self.responses.clone(),
            output: Some(tx),
            exit: None,
            log: Arc::clone(&self.log),
        };
        shell.emit(&self.banner);
        shell.emit(&prompt);
        let shell = Arc::new(Mutex::new(shell));

        Ok(PtyProcess {
            reader: Box::new(FakeReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Box::new(FakeWriter {
                shell: Arc::clone(&shell),
            }),
            control: Box::new(FakeControl {
                shell,
                log: Arc::clone(&self.log),
            }),
        })
    }
}
