//! Spawning and controlling the supervised child process.
//!
//! Each output pipe is drained by its own reader thread which forwards raw
//! chunks, exactly as the OS delivers them, over a channel. All decisions are
//! made by the single thread that receives from that channel.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, trace};

use crate::core::types::OutputStream;

const READ_CHUNK_BYTES: usize = 8192;

/// The external program could not be launched.
#[derive(Debug)]
pub struct SpawnError {
    pub program: String,
    pub source: io::Error,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to launch {}: {}", self.program, self.source)
    }
}

impl Error for SpawnError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Something observed on the child's output pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Output(OutputStream, Vec<u8>),
    /// The pipe reached end-of-file (or failed).
    Closed(OutputStream),
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// `None` when the child was terminated by a signal.
    pub code: Option<i32>,
}

/// Control surface of a running child, as used by the supervisor.
pub trait ChildControl {
    /// Ask the child to exit (SIGTERM on Unix).
    fn terminate(&mut self) -> Result<()>;
    /// Force the child to exit (SIGKILL on Unix).
    fn kill(&mut self) -> Result<()>;
    /// Write one line to the child's stdin.
    fn write_line(&mut self, line: &str) -> Result<()>;
    /// Reap the child if it has exited.
    fn try_wait(&mut self) -> Result<Option<ChildExit>>;
}

/// A spawned OS process with piped stdio.
#[derive(Debug)]
pub struct ProcessChild {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ChildControl for ProcessChild {
    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = i32::try_from(self.child.id())
            .map_err(|_| anyhow!("pid {} exceeds i32::MAX", self.child.id()))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            // Already gone.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(anyhow!("send SIGTERM to {pid}: {err}")),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.child.kill().context("terminate child")
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("kill child")
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("child stdin is closed"))?;
        stdin
            .write_all(format!("{line}\n").as_bytes())
            .context("write child stdin")?;
        stdin.flush().context("flush child stdin")
    }

    fn try_wait(&mut self) -> Result<Option<ChildExit>> {
        let status = self.child.try_wait().context("poll child status")?;
        Ok(status.map(|status| ChildExit {
            code: status.code(),
        }))
    }
}

/// A freshly spawned child and the channel carrying its output.
#[derive(Debug)]
pub struct SpawnedChild {
    pub child: ProcessChild,
    pub events: Receiver<ChildEvent>,
}

/// Spawn `argv[0]` with the remaining arguments in `workdir`.
///
/// stdin, stdout and stderr are piped. Launch failures are reported as
/// [`SpawnError`] and never retried.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or_default()))]
pub fn spawn_child(
    argv: &[String],
    env: &BTreeMap<String, String>,
    workdir: &Path,
) -> Result<SpawnedChild> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty argument vector"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(args = ?args, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn child");
            return Err(SpawnError {
                program: program.clone(),
                source: e,
            }
            .into());
        }
    };
    info!(pid = child.id(), "child spawned");

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, events) = mpsc::channel();
    let stdout_tx = tx.clone();
    thread::spawn(move || forward_stream(stdout, OutputStream::Stdout, stdout_tx));
    thread::spawn(move || forward_stream(stderr, OutputStream::Stderr, tx));

    Ok(SpawnedChild {
        child: ProcessChild { child, stdin },
        events,
    })
}

/// Forward every chunk read from `reader` until EOF or until nobody listens.
fn forward_stream<R: Read>(mut reader: R, stream: OutputStream, tx: Sender<ChildEvent>) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                trace!(?stream, bytes = n, "chunk read");
                if tx.send(ChildEvent::Output(stream, buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(?stream, err = %err, "read failed, closing stream");
                break;
            }
        }
    }
    let _ = tx.send(ChildEvent::Closed(stream));
}
