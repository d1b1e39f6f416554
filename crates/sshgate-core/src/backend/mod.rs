//! Backend session contract.
//!
//! A [`Backend`] is a named factory for [`Session`]s. The gateway drives one
//! session per connection through this lifecycle:
//!
//! ```text
//! Created -> EnvConfigured* -> PtyRequested* -> Running -> Exited -> Closed
//! ```
//!
//! Steps marked `*` are optional. `set_env`/`set_pty` are only allowed before
//! launch, `request_shell`/`request_subsystem` launch at most one program, and
//! `close` is always allowed and idempotent. [`SessionLifecycle`] implements
//! these rules so backends don't each reinvent them.

pub mod echo;
pub mod pipe;
pub mod registry;

pub use registry::Registry;

use crate::error::{GateError, GateResult};
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

/// Exit code reported while the program has not terminated (or never started).
pub const EXIT_CODE_UNAVAILABLE: i32 = -1;

/// Standard streams of a launched shell or subsystem.
///
/// The caller drains `stdout`/`stderr` until EOF and must call
/// [`Session::close`] afterwards. Sessions do not close themselves on EOF so
/// the exit code can still be read.
pub struct ShellOrSubsystem {
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
    /// With a PTY, stderr is merged into stdout and this reads EOF immediately.
    pub stderr: Box<dyn Read + Send>,
}

impl ShellOrSubsystem {
    pub fn new(
        stdin: Box<dyn Write + Send>,
        stdout: Box<dyn Read + Send>,
        stderr: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }
}

impl fmt::Debug for ShellOrSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellOrSubsystem").finish_non_exhaustive()
    }
}

/// One connection's command-execution context inside a backend.
///
/// Lifecycle-changing calls take `&mut self`, so the owning handler
/// serializes them. `resize`, `send_signal` and `exit_code` take `&self` and
/// must be safe alongside I/O on the returned streams; `exit_code` must not
/// block.
pub trait Session: Send + Sync {
    /// Stage an environment variable for the program launched later.
    fn set_env(&mut self, name: &str, value: &str) -> GateResult<()>;

    /// Allocate a pseudoterminal for the program launched later.
    fn set_pty(&mut self) -> GateResult<()>;

    /// Resize the live terminal. Requires a PTY and a running program.
    fn resize(&self, cols: u16, rows: u16) -> GateResult<()>;

    /// Launch the interactive shell.
    fn request_shell(&mut self) -> GateResult<ShellOrSubsystem>;

    /// Launch the named subsystem instead of a shell.
    fn request_subsystem(&mut self, subsystem: &str) -> GateResult<ShellOrSubsystem>;

    /// Best-effort delivery of a signal (`TERM` or `SIGTERM`) to the program.
    fn send_signal(&self, signal: &str) -> GateResult<()>;

    /// Exit code, or [`EXIT_CODE_UNAVAILABLE`] while none is known.
    fn exit_code(&self) -> i32;

    /// Release every resource tied to the session. Never fails; safe to repeat.
    fn close(&mut self);
}

/// Constructor a backend registers: `(session_id, username) -> Session`.
pub type SessionFactory = dyn Fn(&str, &str) -> GateResult<Box<dyn Session>> + Send + Sync;

/// A named provider of sessions.
#[derive(Clone)]
pub struct Backend {
    name: String,
    create_session: Arc<SessionFactory>,
}

impl Backend {
    pub fn new<F>(name: impl Into<String>, create_session: F) -> Self
    where
        F: Fn(&str, &str) -> GateResult<Box<dyn Session>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            create_session: Arc::new(create_session),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a session. Fails with `SessionCreationFailed` when the backend
    /// cannot provision it.
    pub fn create_session(&self, session_id: &str, username: &str) -> GateResult<Box<dyn Session>> {
        (self.create_session)(session_id, username)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").field("name", &self.name).finish()
    }
}

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    EnvConfigured,
    PtyRequested,
    Running,
    Exited,
    Closed,
}

/// Lifecycle bookkeeping shared by backend implementations.
#[derive(Debug, Clone)]
pub struct SessionLifecycle {
    state: SessionState,
    pty: bool,
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLifecycle {
    pub fn new() -> Self {
        Self {
            state: SessionState::Created,
            pty: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_pty(&self) -> bool {
        self.pty
    }

    pub fn is_launched(&self) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Exited)
    }

    fn check_configurable(&self, op: &str) -> GateResult<()> {
        match self.state {
            SessionState::Created | SessionState::EnvConfigured | SessionState::PtyRequested => {
                Ok(())
            }
            SessionState::Closed => {
                Err(GateError::InvalidState(format!("{op} on a closed session")))
            }
            _ => Err(GateError::InvalidState(format!("{op} after the program was launched"))),
        }
    }

    /// Record an environment variable being staged.
    pub fn on_set_env(&mut self) -> GateResult<()> {
        self.check_configurable("set_env")?;
        if self.state == SessionState::Created {
            self.state = SessionState::EnvConfigured;
        }
        Ok(())
    }

    /// Record a PTY request.
    pub fn on_set_pty(&mut self) -> GateResult<()> {
        self.check_configurable("set_pty")?;
        self.pty = true;
        self.state = SessionState::PtyRequested;
        Ok(())
    }

    /// Check that a program may be launched now. Call [`Self::launched`] once it is.
    pub fn check_launch(&self) -> GateResult<()> {
        match self.state {
            SessionState::Running | SessionState::Exited => Err(GateError::AlreadyLaunched),
            SessionState::Closed => {
                Err(GateError::InvalidState("launch on a closed session".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn launched(&mut self) {
        self.state = SessionState::Running;
    }

    /// Resize needs a PTY first, then a running program.
    pub fn check_resize(&self) -> GateResult<()> {
        if !self.pty {
            return Err(GateError::NoPty);
        }
        self.check_running("resize")
    }

    pub fn check_running(&self, op: &str) -> GateResult<()> {
        match self.state {
            SessionState::Running => Ok(()),
            state => Err(GateError::InvalidState(format!("{op} while session is {state:?}"))),
        }
    }

    pub fn exited(&mut self) {
        if self.state == SessionState::Running {
            self.state = SessionState::Exited;
        }
    }

    /// Returns true the first time only.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_then_launch() {
        let mut lc = SessionLifecycle::new();
        lc.on_set_env().unwrap();
        assert_eq!(lc.state(), SessionState::EnvConfigured);
        lc.on_set_pty().unwrap();
        lc.on_set_env().unwrap();
        assert_eq!(lc.state(), SessionState::PtyRequested);
        lc.check_launch().unwrap();
        lc.launched();
        assert!(lc.has_pty());
        lc.check_resize().unwrap();
    }

    #[test]
    fn configuration_after_launch_is_invalid() {
        let mut lc = SessionLifecycle::new();
        lc.launched();
        assert!(matches!(lc.on_set_env(), Err(GateError::InvalidState(_))));
        assert!(matches!(lc.on_set_pty(), Err(GateError::InvalidState(_))));
        assert!(matches!(lc.check_launch(), Err(GateError::AlreadyLaunched)));
        lc.exited();
        assert!(matches!(lc.check_launch(), Err(GateError::AlreadyLaunched)));
    }

    #[test]
    fn resize_without_pty() {
        let mut lc = SessionLifecycle::new();
        assert!(matches!(lc.check_resize(), Err(GateError::NoPty)));
        lc.on_set_pty().unwrap();
        assert!(matches!(lc.check_resize(), Err(GateError::InvalidState(_))));
    }

    #[test]
    fn close_is_idempotent() {
        let mut lc = SessionLifecycle::new();
        assert!(lc.close());
        assert!(!lc.close());
        assert!(matches!(lc.check_launch(), Err(GateError::InvalidState(_))));
    }

    #[test]
    fn backend_debug_shows_name() {
        let backend = Backend::new("null", |_, _| {
            Err(GateError::SessionCreationFailed("none".into()))
        });
        assert_eq!(format!("{backend:?}"), "Backend { name: \"null\" }");
        assert!(matches!(
            backend.create_session("id", "alice"),
            Err(GateError::SessionCreationFailed(_))
        ));
    }
}
