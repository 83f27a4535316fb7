use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use tokio::sync::mpsc;

use crate::log::*;

pub mod simple;
pub mod ssh;

pub type Logs = Vec<String>;

/// One frame of a live log stream.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PartialLogStream {
    Next(Logs),
    /// The producer finished cleanly.
    End,
    /// The producer died; the stream is over and did not complete.
    Abort(String),
}

#[async_trait]
pub trait LogSink: std::fmt::Debug + Send {
    async fn sink(&mut self, logs: PartialLogStream) -> Result<usize>;
}

/// A single-pass source of log lines. Once `End` or `Abort` has been returned
/// the source is exhausted.
#[async_trait]
pub trait LogSource: std::fmt::Debug + Send {
    async fn source(&mut self) -> Result<PartialLogStream>;
}

pub type ChannelLogTx = mpsc::Sender<PartialLogStream>;
pub type ChannelLogRx = mpsc::Receiver<PartialLogStream>;

/// Create a connected sink/source pair.
pub fn log_channel(capacity: usize) -> (ChannelLogSink, ChannelLogSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelLogSink::new(tx), ChannelLogSource::new(rx))
}

#[derive(Debug, Clone)]
pub struct ChannelLogSink {
    tx: ChannelLogTx,
}

impl ChannelLogSink {
    pub fn new(tx: ChannelLogTx) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl LogSink for ChannelLogSink {
    async fn sink(&mut self, logs: PartialLogStream) -> Result<usize> {
        let out = match logs {
            PartialLogStream::Next(ref logs) => logs.len(),
            PartialLogStream::End | PartialLogStream::Abort(_) => 0,
        };
        self.tx.send(logs).await.wrap_err("Failed sending logs")?;
        Ok(out)
    }
}

#[derive(Debug)]
pub struct ChannelLogSource {
    rx: ChannelLogRx,
    ended: bool,
}

impl ChannelLogSource {
    pub fn new(rx: ChannelLogRx) -> Self {
        Self { rx, ended: false }
    }

    /// A source that yields the given lines and then ends cleanly.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_frames(vec![
            PartialLogStream::Next(lines.into_iter().map(Into::into).collect()),
            PartialLogStream::End,
        ])
    }

    /// A source that replays the given frames verbatim.
    pub fn from_frames(frames: Vec<PartialLogStream>) -> Self {
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            if let Err(e) = tx.try_send(frame) {
                warn!("dropped replayed log frame: {}", e);
            }
        }
        Self::new(rx)
    }
}

#[async_trait]
impl LogSource for ChannelLogSource {
    async fn source(&mut self) -> Result<PartialLogStream> {
        if self.ended {
            color_eyre::eyre::bail!("Log source already ended");
        }
        match self.rx.recv().await {
            Some(PartialLogStream::Next(logs)) => Ok(PartialLogStream::Next(logs)),
            Some(frame) => {
                self.ended = true;
                Ok(frame)
            }
            None => {
                self.ended = true;
                Err(color_eyre::eyre::eyre!("sink lost"))
            }
        }
    }
}

/// Re-assembles arbitrary byte chunks into lines. Terminal `\r` (pty output)
/// is stripped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Logs {
        self.pending.extend_from_slice(chunk);
        let mut lines = vec![];
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// The unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let rest = std::mem::take(&mut self.pending);
            Some(decode_line(&rest))
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs a command to completion on some shell and captures its output. One
/// call is one round trip.
#[async_trait]
pub trait RemoteExec: Send {
    async fn exec_capture(&mut self, command: &str) -> Result<CommandOutput>;

    /// Like [`RemoteExec::exec_capture`], with `input` written to the
    /// command's stdin and stdin closed afterwards.
    async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<CommandOutput>;
}

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("no command given")]
    EmptyCommand,
    #[error("spawning command '{command}' failed: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("waiting on command '{command}' failed: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Full output of a foreground process. A non-zero `returncode` is an
/// ordinary outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a local argv in the foreground.
#[async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    async fn execute(&self, argv: &[String]) -> Result<ExecutionOutput, LaunchError>;
}
