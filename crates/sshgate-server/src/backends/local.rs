//! `local` backend: runs the shell or subsystem as a child of the gateway.
//!
//! With a PTY the program runs on a portable-pty terminal; without one it
//! gets plain pipes via `std::process`. Every session runs as the gateway's
//! own OS user; the SSH username is only recorded.

use super::pty::PtyProcess;
use crate::config::LocalConfig;
use sshgate_core::backend::SessionLifecycle;
use sshgate_core::{
    Backend, GateError, GateResult, Session, ShellOrSubsystem, Signal, EXIT_CODE_UNAVAILABLE,
};
use std::collections::BTreeMap;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const BACKEND_NAME: &str = "local";

/// Backend descriptor for registration.
pub fn backend(config: LocalConfig) -> Backend {
    let config = Arc::new(config);
    Backend::new(BACKEND_NAME, move |session_id, username| {
        if username.is_empty() {
            return Err(GateError::SessionCreationFailed("empty username".into()));
        }
        Ok(Box::new(LocalSession::new(session_id, username, config.clone())) as Box<dyn Session>)
    })
}

/// Child spawned with plain pipes.
struct PipeProcess {
    child: Mutex<Child>,
    pid: u32,
}

impl PipeProcess {
    fn spawn(
        argv: &[String],
        env: &BTreeMap<String, String>,
    ) -> GateResult<(Self, ShellOrSubsystem)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| GateError::BackendFailure("empty command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GateError::BackendFailure(format!("failed to spawn {program}: {e}")))?;

        let missing = || GateError::BackendFailure("child stdio not captured".into());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;
        let pid = child.id();
        info!(pid, program = %program, "process spawned");

        let streams = ShellOrSubsystem::new(Box::new(stdin), Box::new(stdout), Box::new(stderr));
        Ok((
            Self {
                child: Mutex::new(child),
                pid,
            },
            streams,
        ))
    }

    fn try_wait(&self) -> GateResult<Option<i32>> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| GateError::BackendFailure("child lock poisoned".into()))?;
        Ok(child.try_wait()?.map(exit_code))
    }

    fn wait(&self) -> GateResult<i32> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| GateError::BackendFailure("child lock poisoned".into()))?;
        Ok(exit_code(child.wait()?))
    }

    fn kill(&self) -> GateResult<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| GateError::BackendFailure("child lock poisoned".into()))?;
        Ok(child.kill()?)
    }
}

/// Shell convention: a signal death reports `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    EXIT_CODE_UNAVAILABLE
}

enum Process {
    Pty(PtyProcess),
    Pipe(PipeProcess),
}

impl Process {
    fn pid(&self) -> Option<u32> {
        match self {
            Process::Pty(p) => p.pid(),
            Process::Pipe(p) => Some(p.pid),
        }
    }

    fn try_wait(&self) -> GateResult<Option<i32>> {
        match self {
            Process::Pty(p) => p.try_wait(),
            Process::Pipe(p) => p.try_wait(),
        }
    }

    fn wait(&self) -> GateResult<i32> {
        match self {
            Process::Pty(p) => p.wait(),
            Process::Pipe(p) => p.wait(),
        }
    }

    fn kill(&self) -> GateResult<()> {
        match self {
            Process::Pty(p) => p.kill(),
            Process::Pipe(p) => p.kill(),
        }
    }
}

pub struct LocalSession {
    session_id: String,
    username: String,
    config: Arc<LocalConfig>,
    lifecycle: SessionLifecycle,
    env: BTreeMap<String, String>,
    process: Option<Process>,
    exit_code: AtomicI32,
}

impl LocalSession {
    pub fn new(session_id: &str, username: &str, config: Arc<LocalConfig>) -> Self {
        Self {
            session_id: session_id.to_string(),
            username: username.to_string(),
            config,
            lifecycle: SessionLifecycle::new(),
            env: BTreeMap::new(),
            process: None,
            exit_code: AtomicI32::new(EXIT_CODE_UNAVAILABLE),
        }
    }

    fn launch(&mut self, argv: Vec<String>) -> GateResult<ShellOrSubsystem> {
        let (process, streams) = if self.lifecycle.has_pty() {
            let (p, s) = PtyProcess::spawn(
                &argv,
                &self.env,
                &self.config.term,
                self.config.cols,
                self.config.rows,
            )?;
            (Process::Pty(p), s)
        } else {
            let (p, s) = PipeProcess::spawn(&argv, &self.env)?;
            (Process::Pipe(p), s)
        };
        info!(
            session_id = %self.session_id,
            username = %self.username,
            pid = process.pid(),
            pty = self.lifecycle.has_pty(),
            "program launched"
        );
        self.process = Some(process);
        self.lifecycle.launched();
        Ok(streams)
    }

    fn record_exit(&self, code: i32) {
        if self
            .exit_code
            .compare_exchange(EXIT_CODE_UNAVAILABLE, code, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(session_id = %self.session_id, code, "program exited");
        }
    }
}

impl Session for LocalSession {
    fn set_env(&mut self, name: &str, value: &str) -> GateResult<()> {
        self.lifecycle.on_set_env()?;
        self.env.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn set_pty(&mut self) -> GateResult<()> {
        self.lifecycle.on_set_pty()
    }

    fn resize(&self, cols: u16, rows: u16) -> GateResult<()> {
        self.lifecycle.check_resize()?;
        match &self.process {
            Some(Process::Pty(p)) => p.resize(cols, rows),
            _ => Err(GateError::NoPty),
        }
    }

    fn request_shell(&mut self) -> GateResult<ShellOrSubsystem> {
        self.lifecycle.check_launch()?;
        let shell = self.config.shell.to_string_lossy().into_owned();
        self.launch(vec![shell])
    }

    fn request_subsystem(&mut self, subsystem: &str) -> GateResult<ShellOrSubsystem> {
        self.lifecycle.check_launch()?;
        let argv = self
            .config
            .subsystems
            .get(subsystem)
            .ok_or_else(|| GateError::UnknownSubsystem(subsystem.to_string()))?
            .clone();
        self.launch(argv)
    }

    fn send_signal(&self, signal: &str) -> GateResult<()> {
        self.lifecycle.check_running("send_signal")?;
        let signal: Signal = signal.parse()?;
        if self.exit_code() != EXIT_CODE_UNAVAILABLE {
            return Err(GateError::BackendFailure("program already exited".into()));
        }
        let pid = self
            .process
            .as_ref()
            .and_then(Process::pid)
            .ok_or_else(|| GateError::BackendFailure("no process id".into()))?;
        debug!(session_id = %self.session_id, pid, signal = %signal, "delivering signal");
        deliver(pid, signal, self.process.as_ref())
    }

    fn exit_code(&self) -> i32 {
        let code = self.exit_code.load(Ordering::SeqCst);
        if code != EXIT_CODE_UNAVAILABLE {
            return code;
        }
        if let Some(process) = &self.process {
            match process.try_wait() {
                Ok(Some(code)) => self.record_exit(code),
                Ok(None) => {}
                Err(e) => {
                    debug!(session_id = %self.session_id, error = %e, "exit code poll failed")
                }
            }
        }
        self.exit_code.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if !self.lifecycle.close() {
            return;
        }
        if let Some(process) = self.process.take() {
            match process.try_wait() {
                Ok(Some(code)) => self.record_exit(code),
                _ => {
                    if let Err(e) = process.kill() {
                        warn!(session_id = %self.session_id, error = %e, "failed to kill program");
                    }
                    match process.wait() {
                        Ok(code) => self.record_exit(code),
                        Err(e) => warn!(
                            session_id = %self.session_id,
                            error = %e,
                            "failed to reap program"
                        ),
                    }
                }
            }
        }
        debug!(session_id = %self.session_id, "local session closed");
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
fn deliver(pid: u32, signal: Signal, _process: Option<&Process>) -> GateResult<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| GateError::BackendFailure(format!("invalid pid {pid}")))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal_number(signal)) };
    if rc != 0 {
        return Err(GateError::BackendFailure(format!(
            "kill({pid}, {signal}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn deliver(_pid: u32, signal: Signal, process: Option<&Process>) -> GateResult<()> {
    match (signal, process) {
        (Signal::Kill | Signal::Term, Some(process)) => process.kill(),
        _ => Err(GateError::BackendFailure(format!("signal {signal} not supported"))),
    }
}

#[cfg(unix)]
fn signal_number(signal: Signal) -> libc::c_int {
    match signal {
        Signal::Abrt => libc::SIGABRT,
        Signal::Alrm => libc::SIGALRM,
        Signal::Fpe => libc::SIGFPE,
        Signal::Hup => libc::SIGHUP,
        Signal::Ill => libc::SIGILL,
        Signal::Int => libc::SIGINT,
        Signal::Kill => libc::SIGKILL,
        Signal::Pipe => libc::SIGPIPE,
        Signal::Quit => libc::SIGQUIT,
        Signal::Segv => libc::SIGSEGV,
        Signal::Term => libc::SIGTERM,
        Signal::Usr1 => libc::SIGUSR1,
        Signal::Usr2 => libc::SIGUSR2,
    }
}
