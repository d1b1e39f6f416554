//! In-process `echo` backend.
//!
//! The shell copies stdin to stdout until stdin closes, then exits 0. Two
//! subsystems exist: `echo` (same as the shell) and `env`, which prints the
//! staged environment sorted by name and exits. Terminating signals end the
//! program with exit code `128 + signal`. Handy for exercising a gateway
//! without spawning processes.

use super::pipe::{pipe, PipeCloser};
use super::{Backend, Session, SessionLifecycle, ShellOrSubsystem, EXIT_CODE_UNAVAILABLE};
use crate::error::{GateError, GateResult};
use crate::signal::Signal;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

pub const BACKEND_NAME: &str = "echo";

/// Backend descriptor for registration.
pub fn backend() -> Backend {
    Backend::new(BACKEND_NAME, |session_id, username| {
        if username.is_empty() {
            return Err(GateError::SessionCreationFailed("empty username".into()));
        }
        Ok(Box::new(EchoSession::new(session_id, username)) as Box<dyn Session>)
    })
}

#[derive(Default)]
struct Shared {
    exit_code: AtomicI32,
    size: Mutex<Option<(u16, u16)>>,
    signals: Mutex<Vec<Signal>>,
    closers: Mutex<Vec<PipeCloser>>,
}

impl Shared {
    /// First terminal code wins.
    fn finish(&self, code: i32) -> bool {
        self.exit_code
            .compare_exchange(EXIT_CODE_UNAVAILABLE, code, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn close_pipes(&self) {
        let closers = self.closers.lock().unwrap_or_else(|p| p.into_inner());
        for closer in closers.iter() {
            closer.close();
        }
    }
}

pub struct EchoSession {
    session_id: String,
    username: String,
    lifecycle: SessionLifecycle,
    env: BTreeMap<String, String>,
    shared: Arc<Shared>,
}

impl EchoSession {
    pub fn new(session_id: &str, username: &str) -> Self {
        let shared = Shared {
            exit_code: AtomicI32::new(EXIT_CODE_UNAVAILABLE),
            ..Default::default()
        };
        Self {
            session_id: session_id.to_string(),
            username: username.to_string(),
            lifecycle: SessionLifecycle::new(),
            env: BTreeMap::new(),
            shared: Arc::new(shared),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Last size set through `resize`.
    pub fn size(&self) -> Option<(u16, u16)> {
        *self.shared.size.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Signals delivered so far.
    pub fn signals(&self) -> Vec<Signal> {
        self.shared
            .signals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn launch_echo(&mut self) -> ShellOrSubsystem {
        let (stdin_w, mut stdin_r) = pipe();
        let (mut stdout_w, stdout_r) = pipe();
        {
            let mut closers = self.shared.closers.lock().unwrap_or_else(|p| p.into_inner());
            closers.push(stdin_r.closer());
            closers.push(stdout_r.closer());
        }

        let shared = self.shared.clone();
        let session_id = self.session_id.clone();
        thread::spawn(move || {
            match io::copy(&mut stdin_r, &mut stdout_w) {
                Ok(n) => debug!(session_id = %session_id, bytes = n, "echo input closed"),
                Err(e) => debug!(session_id = %session_id, error = %e, "echo copy stopped"),
            }
            shared.finish(0);
        });

        ShellOrSubsystem::new(Box::new(stdin_w), Box::new(stdout_r), Box::new(io::empty()))
    }

    fn launch_env(&mut self) -> GateResult<ShellOrSubsystem> {
        let (stdin_w, stdin_r) = pipe();
        let (mut stdout_w, stdout_r) = pipe();
        for (name, value) in &self.env {
            writeln!(stdout_w, "{name}={value}")?;
        }
        drop(stdout_w);
        drop(stdin_r);
        self.shared.finish(0);
        Ok(ShellOrSubsystem::new(
            Box::new(stdin_w),
            Box::new(stdout_r),
            Box::new(io::empty()),
        ))
    }
}

impl Session for EchoSession {
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
        if self.exit_code() != EXIT_CODE_UNAVAILABLE {
            return Err(GateError::InvalidState("resize after the program exited".into()));
        }
        *self.shared.size.lock().unwrap_or_else(|p| p.into_inner()) = Some((cols, rows));
        Ok(())
    }

    fn request_shell(&mut self) -> GateResult<ShellOrSubsystem> {
        self.lifecycle.check_launch()?;
        let streams = self.launch_echo();
        self.lifecycle.launched();
        Ok(streams)
    }

    fn request_subsystem(&mut self, subsystem: &str) -> GateResult<ShellOrSubsystem> {
        self.lifecycle.check_launch()?;
        let streams = match subsystem {
            "echo" => self.launch_echo(),
            "env" => self.launch_env()?,
            other => return Err(GateError::UnknownSubsystem(other.to_string())),
        };
        self.lifecycle.launched();
        Ok(streams)
    }

    fn send_signal(&self, signal: &str) -> GateResult<()> {
        self.lifecycle.check_running("send_signal")?;
        let signal: Signal = signal.parse()?;
        if self.exit_code() != EXIT_CODE_UNAVAILABLE {
            return Err(GateError::BackendFailure("program already exited".into()));
        }
        self.shared
            .signals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(signal);
        if signal.terminates() && self.shared.finish(128 + signal.number()) {
            self.shared.close_pipes();
        }
        Ok(())
    }

    fn exit_code(&self) -> i32 {
        self.shared.exit_code.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if !self.lifecycle.close() {
            return;
        }
        self.shared.close_pipes();
        debug!(session_id = %self.session_id, exit_code = self.exit_code(), "echo session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn wait_exit(session: &dyn Session) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.exit_code() == EXIT_CODE_UNAVAILABLE && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        session.exit_code()
    }

    #[test]
    fn shell_echoes_until_stdin_closes() {
        let mut session = EchoSession::new("s1", "alice");
        assert!(session.exit_code() < 0);
        let mut streams = session.request_shell().unwrap();
        streams.stdin.write_all(b"ping\n").unwrap();
        drop(streams.stdin);

        let mut out = String::new();
        streams.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping\n");
        assert_eq!(wait_exit(&session), 0);
        session.close();
        session.close();
    }

    #[test]
    fn shell_is_single_shot() {
        let mut session = EchoSession::new("s1", "alice");
        let _streams = session.request_shell().unwrap();
        assert!(matches!(session.request_shell(), Err(GateError::AlreadyLaunched)));
        assert!(matches!(
            session.request_subsystem("echo"),
            Err(GateError::AlreadyLaunched)
        ));
        assert!(matches!(session.set_env("A", "1"), Err(GateError::InvalidState(_))));
        session.close();
    }

    #[test]
    fn env_subsystem_prints_staged_env() {
        let mut session = EchoSession::new("s1", "alice");
        session.set_env("B", "2").unwrap();
        session.set_env("A", "1").unwrap();
        let mut streams = session.request_subsystem("env").unwrap();
        let mut out = String::new();
        streams.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "A=1\nB=2\n");
        assert_eq!(session.exit_code(), 0);
        session.close();
    }

    #[test]
    fn unknown_subsystem() {
        let mut session = EchoSession::new("s1", "alice");
        assert!(matches!(
            session.request_subsystem("sftp"),
            Err(GateError::UnknownSubsystem(name)) if name == "sftp"
        ));
        // Still launchable after a rejected request.
        assert!(session.request_shell().is_ok());
        session.close();
    }

    #[test]
    fn resize_requires_pty_and_running() {
        let mut session = EchoSession::new("s1", "alice");
        assert!(matches!(session.resize(80, 25), Err(GateError::NoPty)));
        session.set_pty().unwrap();
        assert!(matches!(session.resize(80, 25), Err(GateError::InvalidState(_))));
        let _streams = session.request_shell().unwrap();
        session.resize(120, 40).unwrap();
        assert_eq!(session.size(), Some((120, 40)));
        session.close();
    }

    #[test]
    fn terminating_signal_ends_program() {
        let mut session = EchoSession::new("s1", "alice");
        assert!(matches!(session.send_signal("TERM"), Err(GateError::InvalidState(_))));
        let mut streams = session.request_shell().unwrap();
        session.send_signal("USR1").unwrap();
        assert_eq!(session.exit_code(), EXIT_CODE_UNAVAILABLE);
        session.send_signal("SIGTERM").unwrap();
        assert_eq!(session.exit_code(), 128 + 15);

        let mut out = Vec::new();
        streams.stdout.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(session.signals(), vec![Signal::Usr1, Signal::Term]);
        assert!(matches!(
            session.send_signal("KILL"),
            Err(GateError::BackendFailure(_))
        ));
        session.close();
    }

    #[test]
    fn close_unblocks_reader() {
        let mut session = EchoSession::new("s1", "alice");
        let streams = session.request_shell().unwrap();
        let mut stdout = streams.stdout;
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf.len())
        });
        session.close();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn backend_rejects_empty_username() {
        let backend = backend();
        assert!(matches!(
            backend.create_session("s1", ""),
            Err(GateError::SessionCreationFailed(_))
        ));
        assert!(backend.create_session("s1", "bob").is_ok());
    }
}
