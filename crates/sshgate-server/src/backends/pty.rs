//! PTY-backed child process using portable-pty.
//!
//! Opens a pseudo-terminal with a given command and size and hands the
//! master's reader/writer to the gateway as the program's streams.

use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};
use sshgate_core::{GateError, GateResult, ShellOrSubsystem, Signal};
use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;
use tracing::{debug, info};

/// A program running on the slave side of a PTY.
pub struct PtyProcess {
    /// Mutex because MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawn `argv` on a fresh PTY of the given size.
    pub fn spawn(
        argv: &[String],
        env: &BTreeMap<String, String>,
        term: &str,
        cols: u16,
        rows: u16,
    ) -> GateResult<(Self, ShellOrSubsystem)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| GateError::BackendFailure("empty command".into()))?;

        let pair = native_pty_system()
            .openpty(size(cols, rows))
            .map_err(|e| GateError::BackendFailure(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", term);
        // Staged variables win over TERM.
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| GateError::BackendFailure(format!("failed to spawn command: {e}")))?;
        // The child holds its own slave handle; ours would keep the reader from seeing EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| GateError::BackendFailure(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| GateError::BackendFailure(format!("failed to take PTY writer: {e}")))?;

        let pid = child.process_id();
        info!(cols, rows, pid, program = %program, "PTY spawned");

        let process = Self {
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            pid,
        };
        // stderr is merged into the terminal.
        let streams = ShellOrSubsystem::new(writer, reader, Box::new(io::empty()));
        Ok((process, streams))
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> GateResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| GateError::BackendFailure("PTY master lock poisoned".into()))?;
        master
            .resize(size(cols, rows))
            .map_err(|e| GateError::BackendFailure(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Exit code if the child has terminated. Never blocks.
    pub fn try_wait(&self) -> GateResult<Option<i32>> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| GateError::BackendFailure("child lock poisoned".into()))?;
        let status = child
            .try_wait()
            .map_err(|e| GateError::BackendFailure(format!("wait error: {e}")))?;
        Ok(status.as_ref().map(exit_code))
    }

    /// Block until the child exits. Returns the exit code.
    pub fn wait(&self) -> GateResult<i32> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| GateError::BackendFailure("child lock poisoned".into()))?;
        let status = child
            .wait()
            .map_err(|e| GateError::BackendFailure(format!("wait error: {e}")))?;
        Ok(exit_code(&status))
    }

    /// Kill the child process.
    pub fn kill(&self) -> GateResult<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| GateError::BackendFailure("child lock poisoned".into()))?;
        child
            .kill()
            .map_err(|e| GateError::BackendFailure(format!("kill failed: {e}")))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// portable-pty reports a signal death as code 1 plus the signal's
/// description; map it to `128 + signal` like the pipe path does.
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(number) = status.signal().and_then(signal_number) {
        return 128 + number;
    }
    i32::try_from(status.exit_code()).unwrap_or(i32::MAX)
}

/// Signal number for a bare name (`KILL`, `SIGTERM`), a `Signal N` string, or
/// the platform's `strsignal` description (`Killed`).
fn signal_number(description: &str) -> Option<i32> {
    if let Ok(signal) = description.parse::<Signal>() {
        return Some(signal.number());
    }
    if let Some(number) = description.strip_prefix("Signal ") {
        return number.trim().parse().ok();
    }
    described_signal(description)
}

#[cfg(unix)]
fn described_signal(description: &str) -> Option<i32> {
    (1..65).find(|&number| {
        // SAFETY: strsignal returns a NUL-terminated string (or null) that is
        // copied before the next call.
        let text = unsafe { libc::strsignal(number) };
        !text.is_null()
            && unsafe { std::ffi::CStr::from_ptr(text) }.to_string_lossy() == description
    })
}

#[cfg(not(unix))]
fn described_signal(_description: &str) -> Option<i32> {
    None
}

fn size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
