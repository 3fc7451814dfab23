use crate::pipeline::{Pipeline, TransferPlan};
use crate::process::classify;
use crate::{Error, Result};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exit code a shell reports for a stage killed by SIGPIPE.
const BROKEN_PIPE_EXIT: i32 = 128 + 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Destination => f.write_str("destination"),
        }
    }
}

/// Diagnostics collected from a finished transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    pub source_stderr: String,
    pub destination_stderr: String,
}

/// A running send/receive pair.
///
/// The source's stdout feeds the destination's stdin. Both stderr streams
/// are drained in background tasks while data flows. Each side runs in its
/// own process group, identified by [`process_ids`](Self::process_ids).
/// Dropping a transfer that has not finished terminates both groups, so
/// every stage of both pipelines stops with it.
pub struct Transfer {
    source: Child,
    destination: Child,
    groups: (Option<u32>, Option<u32>),
    source_stderr: JoinHandle<Vec<u8>>,
    destination_stderr: JoinHandle<Vec<u8>>,
    finished: bool,
}

fn spawn(pipeline: &Pipeline, stdin: Stdio, stdout: Stdio) -> Result<Child> {
    let argv = pipeline.argv();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidArgument("empty shell prefix".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    Ok(cmd.spawn()?)
}

fn drain<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            // A read error only truncates diagnostics.
            let _ = stream.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn collect(handle: &mut JoinHandle<Vec<u8>>) -> String {
    match handle.await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}

#[cfg(unix)]
fn terminate_group(side: Side, group: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(group) = i32::try_from(group) else {
        return;
    };
    match killpg(Pid::from_raw(group), Signal::SIGTERM) {
        Ok(()) => debug!(%side, group, "Terminated transfer side"),
        // ESRCH: the group already exited
        Err(e) => debug!(%side, group, error = %e, "Could not signal transfer side"),
    }
}

#[cfg(not(unix))]
fn terminate_group(_side: Side, _group: u32) {}

/// True when the side died because its reader went away rather than failing
/// on its own.
fn cut_short(status: &ExitStatus) -> bool {
    match status.code() {
        None => true,
        Some(code) => code == BROKEN_PIPE_EXIT,
    }
}

impl TransferPlan {
    /// Starts the source side, then the destination side reading from it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(&self) -> Result<Transfer> {
        let mut source = spawn(&self.source, Stdio::null(), Stdio::piped())?;
        let source_stderr = drain(source.stderr.take());

        let stdout = source
            .stdout
            .take()
            .ok_or_else(|| Error::InvalidArgument("source stdout is not piped".to_string()))?;
        let stdin: Stdio = stdout.try_into()?;

        let mut destination = match spawn(&self.destination, stdin, Stdio::null()) {
            Ok(child) => child,
            Err(e) => {
                if let Some(group) = source.id() {
                    terminate_group(Side::Source, group);
                }
                let _ = source.start_kill();
                return Err(e);
            }
        };
        let destination_stderr = drain(destination.stderr.take());

        info!(
            source = %self.source.command_line(),
            destination = %self.destination.command_line(),
            "Launched transfer"
        );

        Ok(Transfer {
            groups: (source.id(), destination.id()),
            source,
            destination,
            source_stderr,
            destination_stderr,
            finished: false,
        })
    }
}

impl Transfer {
    /// Process ids (and process group ids) of the source and destination.
    pub fn process_ids(&self) -> (Option<u32>, Option<u32>) {
        self.groups
    }

    /// Waits for both sides and fails if either exited unsuccessfully.
    ///
    /// A source that failed on its own is reported ahead of the destination,
    /// since a receive usually fails because its input stream was cut short.
    /// A source that died of a broken pipe (the receiver quit first) is
    /// reported only when the destination succeeded.
    pub async fn wait(mut self) -> Result<TransferReport> {
        let (source_status, destination_status) =
            tokio::try_join!(self.source.wait(), self.destination.wait())?;
        self.finished = true;

        let report = TransferReport {
            source_stderr: collect(&mut self.source_stderr).await,
            destination_stderr: collect(&mut self.destination_stderr).await,
        };

        if !source_status.success() && !cut_short(&source_status) {
            return Err(failure(Side::Source, source_status, &report.source_stderr));
        }
        if !destination_status.success() {
            return Err(failure(
                Side::Destination,
                destination_status,
                &report.destination_stderr,
            ));
        }
        if !source_status.success() {
            return Err(failure(Side::Source, source_status, &report.source_stderr));
        }

        info!("Transfer finished");
        Ok(report)
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let (source, destination) = self.groups;
        if let Some(group) = source {
            terminate_group(Side::Source, group);
        }
        if let Some(group) = destination {
            terminate_group(Side::Destination, group);
        }
    }
}

fn failure(side: Side, status: ExitStatus, stderr: &str) -> Error {
    warn!(%side, code = status.code(), stderr = stderr.trim(), "Transfer side failed");
    classify(status.code(), stderr)
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (source, destination) = self.process_ids();
        f.debug_struct("Transfer")
            .field("source", &source)
            .field("destination", &destination)
            .field("finished", &self.finished)
            .finish()
    }
}
