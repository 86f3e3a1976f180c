//! Plugin process supervision.
//!
//! Spawns plugin executables with the handshake cookie, relays their output
//! to the host's own streams, and guarantees they are killed when the host
//! goes away.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::handshake::{HandshakeConfig, HandshakeError, HandshakeLine, PROTOCOL_VERSIONS_ENV};
use super::{PluginError, PluginResult};

/// How long to wait for relay threads to flush after the child is gone.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type SharedChild = Arc<Mutex<Child>>;

/// Tracks every live plugin child so they can be killed from any exit path,
/// including a signal handler.
#[derive(Clone, Default)]
pub struct Reaper {
    children: Arc<Mutex<Vec<(u32, SharedChild)>>>,
}

impl Reaper {
    /// Create an empty reaper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `cmd` and track the child under one lock, so `terminate_all`
    /// never runs between the two.
    fn spawn_tracked(&self, cmd: &mut Command) -> io::Result<(u32, SharedChild)> {
        let mut children = self.children.lock();
        let child = cmd.spawn()?;
        let pid = child.id();

        let shared = Arc::new(Mutex::new(child));
        children.push((pid, Arc::clone(&shared)));
        Ok((pid, shared))
    }

    fn forget(&self, pid: u32) {
        self.children.lock().retain(|(id, _)| *id != pid);
    }

    /// Number of children still tracked.
    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    /// Whether no children are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill and reap every tracked child.
    pub fn terminate_all(&self) {
        let children: Vec<_> = self.children.lock().drain(..).collect();
        for (pid, child) in children {
            tracing::debug!(pid, "Terminating plugin process");
            kill_and_wait(&child);
        }
    }
}

fn kill_and_wait(child: &SharedChild) {
    let mut child = child.lock();
    if matches!(child.try_wait(), Ok(None)) {
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// A running plugin child process.
pub struct PluginProcess {
    path: PathBuf,
    pid: u32,
    child: SharedChild,
    reaper: Reaper,
    handshake_rx: Receiver<Vec<u8>>,
    relays_done: Receiver<()>,
    relay_count: usize,
    terminated: bool,
}

impl PluginProcess {
    /// Start `path` with the cookie injected and `args` forwarded.
    ///
    /// Stderr is relayed to the host's stderr immediately. Stdout is held
    /// back until the first line (the handshake) has been read, then relayed.
    pub fn spawn(
        path: &Path,
        args: &[OsString],
        handshake: &HandshakeConfig,
        reaper: &Reaper,
    ) -> PluginResult<Self> {
        let mut cmd = Command::new(path);
        cmd.args(args)
            .env(handshake.cookie_key, handshake.cookie_value)
            .env(PROTOCOL_VERSIONS_ENV, handshake.versions_env_value())
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (pid, child) = reaper
            .spawn_tracked(&mut cmd)
            .map_err(|e| PluginError::from_spawn(path.to_path_buf(), e))?;
        tracing::debug!(pid, path = %path.display(), "Spawned plugin process");

        let (stdout, stderr) = {
            let mut child = child.lock();
            (child.stdout.take(), child.stderr.take())
        };

        let (handshake_tx, handshake_rx) = mpsc::sync_channel(1);
        let (done_tx, relays_done) = mpsc::channel();
        let mut relay_count = 0;

        if let Some(stdout) = stdout {
            let done = done_tx.clone();
            relay_count += 1;
            thread::spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut first = Vec::new();
                if matches!(reader.read_until(b'\n', &mut first), Ok(n) if n > 0) {
                    let _ = handshake_tx.send(first);
                }
                drop(handshake_tx);
                relay(reader, io::stdout());
                let _ = done.send(());
            });
        }

        if let Some(stderr) = stderr {
            let done = done_tx;
            relay_count += 1;
            thread::spawn(move || {
                relay(stderr, io::stderr());
                let _ = done.send(());
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            pid,
            child,
            reaper: reaper.clone(),
            handshake_rx,
            relays_done,
            relay_count,
            terminated: false,
        })
    }

    /// Path of the executable.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the handshake line and validate it.
    pub fn await_handshake(
        &self,
        timeout: Duration,
        handshake: &HandshakeConfig,
    ) -> PluginResult<HandshakeLine> {
        let raw = match self.handshake_rx.recv_timeout(timeout) {
            Ok(raw) => raw,
            Err(RecvTimeoutError::Timeout) => return Err(PluginError::HandshakeTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => return Err(PluginError::ExitedEarly),
        };
        let line = String::from_utf8(raw).map_err(|e| {
            HandshakeError::Malformed(String::from_utf8_lossy(e.as_bytes()).trim().to_string())
        })?;
        tracing::trace!(pid = self.pid, line = line.trim(), "Handshake line received");
        Ok(handshake.parse_line(&line)?)
    }

    /// Whether the child is still running.
    pub fn is_alive(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    /// Kill the child and wait for its output to drain. Idempotent.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        kill_and_wait(&self.child);
        self.reaper.forget(self.pid);

        for _ in 0..self.relay_count {
            if self.relays_done.recv_timeout(RELAY_DRAIN_TIMEOUT).is_err() {
                break;
            }
        }
        tracing::debug!(pid = self.pid, "Plugin process terminated");
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .field("terminated", &self.terminated)
            .finish()
    }
}

fn relay(mut from: impl Read, mut to: impl Write) {
    let mut buf = [0u8; 8192];
    loop {
        match from.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if to.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = to.flush();
            }
        }
    }
}
