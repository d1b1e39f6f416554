//! In-memory blocking byte pipe for in-process backends.
//!
//! Reads block until data arrives or the write side is gone. Dropping the
//! writer gives the reader EOF; dropping the reader makes writes fail with
//! `BrokenPipe`. A [`PipeCloser`] lets a session tear both ends down from
//! outside, which unblocks any pending read.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Default)]
struct State {
    buffer: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close_writer(&self) {
        self.lock().writer_closed = true;
        self.ready.notify_all();
    }
}

/// Create a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared::default());
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        if state.reader_closed || state.writer_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buffer.extend(buf);
        drop(state);
        self.shared.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.close_writer();
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.lock();
        while state.buffer.is_empty() && !state.writer_closed && !state.reader_closed {
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        let n = buf.len().min(state.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(state.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.lock().reader_closed = true;
        self.shared.ready.notify_all();
    }
}

/// Closes both ends of a pipe from outside.
#[derive(Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
}

impl PipeCloser {
    /// Pending and future reads return what is buffered, then EOF.
    pub fn close_write(&self) {
        self.shared.close_writer();
    }

    /// Drop buffered data and make both ends see the pipe as gone.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.buffer.clear();
        state.writer_closed = true;
        state.reader_closed = true;
        drop(state);
        self.shared.ready.notify_all();
    }
}
