//! Command execution over an established [`Session`].

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};

use super::{
    log_channel, ChannelLogSink, ChannelLogSource, CommandOutput, LineBuffer, LogSink,
    PartialLogStream, RemoteExec,
};
use crate::log::*;
use crate::remote::Session;

const PTY_TERM: &str = "xterm";
const PTY_COLUMNS: u32 = 200;
const PTY_ROWS: u32 = 50;

/// Exit status reported when the remote side never sent one (killed by a
/// signal, or the channel closed early).
pub const UNKNOWN_EXIT_STATUS: u32 = 255;

/// Run `command` under a pseudo-terminal and stream its output line by line
/// as it arrives. Takes ownership of the session; it is closed once the
/// command's output is exhausted or the consumer goes away.
///
/// The stream ends with [`PartialLogStream::End`] only when the command
/// exited with status 0. Anything else (non-zero exit, signal, transport
/// drop) ends it with [`PartialLogStream::Abort`].
#[tracing::instrument(skip(session), fields(host = %session.host()))]
pub async fn run_command(mut session: Session, command: &str) -> Result<ChannelLogSource> {
    let mut channel = session.open_channel().await?;
    channel
        .request_pty(false, PTY_TERM, PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
        .await
        .wrap_err("requesting pty")?;
    channel
        .exec(true, command)
        .await
        .wrap_err_with(|| format!("executing remote command: {}", command))?;
    info!("remote command started: {}", command);

    let (mut sink, source) = log_channel(1024);
    tokio::task::spawn(async move {
        let last = match pump(&mut channel, &mut sink).await {
            Ok(Some(0)) => PartialLogStream::End,
            // A non-zero exit aborts the stream, so the job ends failed
            // instead of completed even though every line was delivered.
            Ok(Some(status)) => {
                PartialLogStream::Abort(format!("remote command exited with status {}", status))
            }
            Ok(None) => PartialLogStream::Abort(
                "connection closed before the remote command reported an exit status".into(),
            ),
            Err(e) => PartialLogStream::Abort(format!("remote stream failed: {}", e)),
        };
        info!("remote command finished: {:?}", last);
        if let Err(e) = sink.sink(last).await {
            debug!("log consumer went away before the end: {}", e);
        }
        session.close().await;
    });

    Ok(source)
}

/// Forward channel data into `sink` until the channel closes. Returns the
/// exit status if one was reported.
async fn pump(
    channel: &mut thrussh::client::Channel,
    sink: &mut ChannelLogSink,
) -> Result<Option<u32>> {
    let mut buffer = LineBuffer::new();
    let mut exit_status = None;

    while let Some(frame) = channel.wait().await {
        match frame {
            thrussh::ChannelMsg::Data { data } => {
                forward(sink, buffer.push(&data[..])).await?;
            }
            thrussh::ChannelMsg::ExtendedData { data, ext: _ } => {
                forward(sink, buffer.push(&data[..])).await?;
            }
            thrussh::ChannelMsg::ExitStatus { exit_status: status } => {
                exit_status = Some(status);
            }
            thrussh::ChannelMsg::Close => break,
            _ => {}
        }
    }

    if let Some(rest) = buffer.finish() {
        forward(sink, vec![rest]).await?;
    }
    Ok(exit_status)
}

async fn forward(sink: &mut ChannelLogSink, lines: Vec<String>) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    for line in &lines {
        trace!("[remote] {}", line);
    }
    sink.sink(PartialLogStream::Next(lines)).await?;
    Ok(())
}

/// Drain a channel until it closes, keeping stdout and stderr apart.
async fn collect(channel: &mut thrussh::client::Channel) -> CommandOutput {
    let mut output = CommandOutput {
        exit_status: UNKNOWN_EXIT_STATUS,
        ..Default::default()
    };
    while let Some(frame) = channel.wait().await {
        match frame {
            thrussh::ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data[..]),
            thrussh::ChannelMsg::ExtendedData { data, ext: _ } => {
                output.stderr.extend_from_slice(&data[..])
            }
            thrussh::ChannelMsg::ExitStatus { exit_status } => output.exit_status = exit_status,
            thrussh::ChannelMsg::Close => break,
            _ => {}
        }
    }
    output
}

#[async_trait]
impl RemoteExec for Session {
    /// Run `command` without a pty and collect stdout and stderr separately.
    #[tracing::instrument(skip(self))]
    async fn exec_capture(&mut self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .wrap_err_with(|| format!("executing remote command: {}", command))?;

        let output = collect(&mut channel).await;
        debug!("'{}' exited with {}", command, output.exit_status);
        Ok(output)
    }

    #[tracing::instrument(skip(self, input), fields(bytes = input.len()))]
    async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<CommandOutput> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .wrap_err_with(|| format!("executing remote command: {}", command))?;
        channel
            .data(input)
            .await
            .wrap_err_with(|| format!("sending {} bytes to: {}", input.len(), command))?;
        channel.eof().await.wrap_err("closing remote stdin")?;

        let output = collect(&mut channel).await;
        debug!("'{}' exited with {}", command, output.exit_status);
        Ok(output)
    }
}
