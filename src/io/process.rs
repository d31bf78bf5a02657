//! Child-process execution with deadlines and multiplexed output capture.
//!
//! Output is read concurrently while the child runs so pipes never deadlock.
//! Each chunk of stdout/stderr is teed into an optional log file, a bounded
//! in-memory combined buffer, and (when echoing) the parent's stdout.

use std::fs::File;
use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::warn;
use wait_timeout::ChildExt;

/// Bound on the combined output kept in memory. Log files receive everything.
pub const CAPTURE_LIMIT_BYTES: usize = 1_000_000;

/// Destination for multiplexed child output.
pub struct Sink {
    log: Option<File>,
    echo: bool,
    limit: usize,
    buf: Vec<u8>,
    dropped: usize,
    log_failed: bool,
}

impl Sink {
    pub fn new(log: Option<File>, echo: bool, limit: usize) -> Self {
        Self {
            log,
            echo,
            limit,
            buf: Vec::new(),
            dropped: 0,
            log_failed: false,
        }
    }

    fn write_chunk(&mut self, chunk: &[u8]) {
        if let Some(log) = self.log.as_mut() {
            if let Err(err) = log.write_all(chunk) {
                if !self.log_failed {
                    warn!(error = %err, "agent log write failed; continuing with capture only");
                    self.log_failed = true;
                }
            }
        }
        let remaining = self.limit.saturating_sub(self.buf.len());
        if remaining > 0 {
            let keep = chunk.len().min(remaining);
            self.buf.extend_from_slice(&chunk[..keep]);
            self.dropped += chunk.len() - keep;
        } else {
            self.dropped += chunk.len();
        }
        if self.echo {
            let _ = std::io::stdout().write_all(chunk);
        }
    }
}

/// Captured outcome of a child process run.
#[derive(Debug)]
pub struct ProcOutput {
    pub status: ExitStatus,
    /// Combined stdout+stderr, bounded by the sink limit.
    pub combined: String,
    /// Bytes discarded from the in-memory buffer once the limit was reached.
    pub dropped_bytes: usize,
    pub timed_out: bool,
}

/// Run a command under a deadline, teeing output through `sink`.
///
/// On deadline expiry the child is killed and `timed_out` is set; the exit
/// status then reflects the kill.
pub fn run_with_deadline(mut cmd: Command, timeout: Duration, sink: Sink) -> Result<ProcOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let sink = Arc::new(Mutex::new(sink));
    let out_handle = {
        let sink = Arc::clone(&sink);
        thread::spawn(move || drain(stdout, &sink))
    };
    let err_handle = {
        let sink = Arc::clone(&sink);
        thread::spawn(move || drain(stderr, &sink))
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    join_reader(out_handle).context("join stdout reader")?;
    join_reader(err_handle).context("join stderr reader")?;

    let sink = Arc::try_unwrap(sink)
        .map_err(|_| anyhow!("output sink still shared"))?
        .into_inner()
        .map_err(|_| anyhow!("output sink poisoned"))?;

    Ok(ProcOutput {
        status,
        combined: String::from_utf8_lossy(&sink.buf).into_owned(),
        dropped_bytes: sink.dropped,
        timed_out,
    })
}

fn drain<R: Read>(mut reader: R, sink: &Mutex<Sink>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            return Ok(());
        }
        let mut sink = sink.lock().map_err(|_| anyhow!("output sink poisoned"))?;
        sink.write_chunk(&chunk[..n]);
    }
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}
