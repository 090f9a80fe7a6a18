//! File-backed tail reading for job logs.
//!
//! A `TailReader` owns its file handle and offset, so any number of readers
//! can tail the same log independently. In follow mode a read that hits
//! end-of-file parks on the poll interval until new bytes land, an I/O
//! error occurs, or the reader is closed; in no-follow mode end-of-file is
//! the end of the stream.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Whether a read at end-of-file waits for more output or returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Follow,
    NoFollow,
}

/// Closable handle to a `TailReader`, safe to share across tasks.
///
/// The job's reader list stores these; `close` is idempotent, so the reaper
/// and the caller may both close the same reader.
#[derive(Clone)]
pub struct TailHandle {
    closed: CancellationToken,
}

impl TailHandle {
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Readable byte stream over a log file.
pub struct TailReader {
    file: File,
    mode: OutputMode,
    poll_interval: Duration,
    closed: CancellationToken,
}

impl TailReader {
    /// Open a reader over `path` at offset zero: new readers see the full
    /// log from the beginning.
    pub fn open(
        path: impl AsRef<Path>,
        mode: OutputMode,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            mode,
            poll_interval,
            closed: CancellationToken::new(),
        })
    }

    /// Handle for closing this reader from another task.
    pub fn handle(&self) -> TailHandle {
        TailHandle {
            closed: self.closed.clone(),
        }
    }

    /// Read available bytes into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream: end-of-file in no-follow mode, or
    /// end-of-file on a closed reader. A close racing a polling read wakes
    /// it immediately, but bytes already in the file are always delivered
    /// first: closing marks the end of the stream, it does not discard the
    /// tail.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.file.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if self.mode == OutputMode::NoFollow || self.closed.is_cancelled() {
                return Ok(0);
            }
            tokio::select! {
                _ = self.closed.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Read the remainder of the stream to a vector. Follow-mode readers
    /// return once closed.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

impl Drop for TailReader {
    fn drop(&mut self) {
        // A dropped reader counts as closed by the caller.
        self.closed.cancel();
    }
}
