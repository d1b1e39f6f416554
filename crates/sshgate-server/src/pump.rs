//! Moves bytes between a launched program's streams and the client side.
//!
//! Backend streams are blocking, so every direction runs on the blocking pool.

use sshgate_core::{GateError, GateResult, ShellOrSubsystem};
use std::io::{self, Read, Write};
use tokio::task::JoinHandle;
use tracing::debug;

/// Bytes copied in each output direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub stdout: u64,
    pub stderr: u64,
}

/// Relay `input` into the program and its output into `output`/`errors`.
///
/// Resolves once the program's stdout and stderr reach EOF. The input side
/// keeps running detached: a client that never closes its input must not
/// hold the session open after the program is gone. Reaching EOF on `input`
/// closes the program's stdin.
pub async fn pump<I, O, E>(
    streams: ShellOrSubsystem,
    input: I,
    output: O,
    errors: E,
) -> GateResult<PumpStats>
where
    I: Read + Send + 'static,
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    let ShellOrSubsystem {
        stdin,
        stdout,
        stderr,
    } = streams;

    let _stdin_task = copy_blocking("stdin", input, stdin);
    let stdout_task = copy_blocking("stdout", stdout, output);
    let stderr_task = copy_blocking("stderr", stderr, errors);

    Ok(PumpStats {
        stdout: join(stdout_task).await?,
        stderr: join(stderr_task).await?,
    })
}

fn copy_blocking<R, W>(
    direction: &'static str,
    mut from: R,
    mut to: W,
) -> JoinHandle<io::Result<u64>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let copied = io::copy(&mut from, &mut to)?;
        to.flush()?;
        debug!(direction, bytes = copied, "stream reached EOF");
        Ok(copied)
    })
}

async fn join(task: JoinHandle<io::Result<u64>>) -> GateResult<u64> {
    task.await
        .map_err(|e| GateError::Other(format!("join error: {e}")))?
        .map_err(GateError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshgate_core::backend::echo::EchoSession;
    use sshgate_core::Session;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Writer that can be inspected after being moved into a task.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn relays_echo_shell() {
        let mut session = EchoSession::new("s1", "alice");
        let streams = session.request_shell().unwrap();
        let out = SharedBuf::default();
        let err = SharedBuf::default();

        let stats = pump(streams, Cursor::new(b"hello\n".to_vec()), out.clone(), err.clone())
            .await
            .unwrap();
        assert_eq!(out.contents(), "hello\n");
        assert_eq!(err.contents(), "");
        assert_eq!(stats, PumpStats { stdout: 6, stderr: 0 });
        assert_eq!(session.exit_code(), 0);
        session.close();
    }

    #[tokio::test]
    async fn finishes_without_input_eof() {
        let mut session = EchoSession::new("s1", "alice");
        session.set_env("A", "1").unwrap();
        let streams = session.request_subsystem("env").unwrap();
        let (_keep_open, reader) = sshgate_core::backend::pipe::pipe();
        let out = SharedBuf::default();

        pump(streams, reader, out.clone(), io::sink()).await.unwrap();
        assert_eq!(out.contents(), "A=1\n");
        session.close();
    }
}
