use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use derive_getters::Getters;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, FramedRead};

use super::{ExecutionOutput, Executor, LaunchError, LineBuffer};
use crate::log::*;

/// Runs commands as local child processes, capturing stdout/stderr in full
/// while optionally echoing every line as it arrives. Echoing matters when
/// this process is itself being watched over SSH: the engine's progress
/// lines have to reach the remote terminal.
#[derive(Getters, Debug, Clone, Default)]
pub struct SimpleExecutor {
    echo: bool,
    cwd: Option<PathBuf>,
}

impl SimpleExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn in_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

#[async_trait]
impl Executor for SimpleExecutor {
    #[tracing::instrument(skip(self))]
    async fn execute(&self, argv: &[String]) -> Result<ExecutionOutput, LaunchError> {
        let (cmd, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;
        info!("executing: {}", shell_words::join(argv));

        let mut builder = Command::new(cmd);
        builder
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            builder.current_dir(dir);
        }

        let mut child = builder.spawn().map_err(|source| LaunchError::Spawn {
            command: cmd.clone(),
            source,
        })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                return Err(LaunchError::Wait {
                    command: cmd.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "missing stdio pipes"),
                })
            }
        };
        let mut stdout = FramedRead::new(stdout, BytesCodec::new());
        let mut stderr = FramedRead::new(stderr, BytesCodec::new());

        let mut out = Captured::default();
        let mut err = Captured::default();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                next = stdout.next(), if !out_done => match next {
                    Some(Ok(bytes)) => out.push(&bytes, self.echo, false),
                    Some(Err(e)) => {
                        warn!("error reading stdout of '{}': {}", cmd, e);
                        out_done = true;
                    }
                    None => out_done = true,
                },
                next = stderr.next(), if !err_done => match next {
                    Some(Ok(bytes)) => err.push(&bytes, self.echo, true),
                    Some(Err(e)) => {
                        warn!("error reading stderr of '{}': {}", cmd, e);
                        err_done = true;
                    }
                    None => err_done = true,
                },
            }
        }

        let status = child.wait().await.map_err(|source| LaunchError::Wait {
            command: cmd.clone(),
            source,
        })?;
        let returncode = status.code().unwrap_or(-1);
        info!("'{}' exited with {}", cmd, returncode);

        Ok(ExecutionOutput {
            returncode,
            stdout: out.finish(self.echo, false),
            stderr: err.finish(self.echo, true),
        })
    }
}

#[derive(Default)]
struct Captured {
    lines: LineBuffer,
    text: String,
}

impl Captured {
    fn push(&mut self, bytes: &[u8], echo: bool, to_stderr: bool) {
        for line in self.lines.push(bytes) {
            self.line(line, echo, to_stderr);
        }
    }

    fn line(&mut self, line: String, echo: bool, to_stderr: bool) {
        if echo {
            if to_stderr {
                eprintln!("{}", line);
            } else {
                println!("{}", line);
            }
        }
        self.text.push_str(&line);
        self.text.push('\n');
    }

    fn finish(mut self, echo: bool, to_stderr: bool) -> String {
        if let Some(rest) = self.lines.finish() {
            self.line(rest, echo, to_stderr);
        }
        self.text
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() -> color_eyre::eyre::Result<()> {
        let executor = SimpleExecutor::new();
        let output = executor
            .execute(&argv(&["sh", "-c", "echo hello; echo '1 of 2 steps (50%) done' 1>&2; exit 3"]))
            .await?;
        assert_eq!(3, output.returncode);
        assert_eq!("hello\n", output.stdout);
        assert_eq!("1 of 2 steps (50%) done\n", output.stderr);
        Ok(())
    }

    #[tokio::test]
    async fn test_unterminated_output_is_kept() -> color_eyre::eyre::Result<()> {
        let output = SimpleExecutor::new()
            .execute(&argv(&["printf", "no newline"]))
            .await?;
        assert_eq!(0, output.returncode);
        assert_eq!("no newline\n", output.stdout);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_launch_error() {
        let err = SimpleExecutor::new()
            .execute(&argv(&["definitely-not-a-real-engine-binary"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_runs_in_given_dir() -> color_eyre::eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let output = SimpleExecutor::new()
            .in_dir(dir.path())
            .execute(&argv(&["pwd"]))
            .await?;
        let expected = dir.path().canonicalize()?;
        assert_eq!(expected.display().to_string(), output.stdout.trim());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_argv() {
        let err = SimpleExecutor::new().execute(&[]).await.unwrap_err();
        assert!(matches!(err, LaunchError::EmptyCommand));
    }
}
