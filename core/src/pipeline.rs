//! Composition of the send and receive sides of a replication.
//!
//! A side is an ordered list of [`Stage`]s. Stages are only turned into a
//! shell command line in [`Pipeline::command_line`], which quotes every
//! argument exactly once.
//!
//! Source side, left to right:
//!
//! ```text
//! zfs send | pv (metering) | mbuffer (buffering) | compress
//! ```
//!
//! Destination side:
//!
//! ```text
//! decompress | mbuffer (remote only) | zfs receive
//! ```
//!
//! Metering and buffering need an estimated stream of at least [`MIB`] and
//! the tool on the relevant endpoint. Compression needs a remote transfer, a
//! non-raw stream, and both endpoints agreeing on the same command; a
//! disagreement silently disables it.

use crate::endpoint::Endpoint;
use crate::process::{self, shell_quote};
use crate::zfs;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const MIB: u64 = 1024 * 1024;
pub const LOCAL_BUFFER_CAP_MIB: u64 = 512;
pub const REMOTE_BUFFER_CAP_MIB: u64 = 256;

const PROGRESS_TOOL: &str = "pv";
const BUFFER_TOOL: &str = "mbuffer";
/// Update interval of the meter, in seconds, when nobody watches it.
const QUIET_PROGRESS_INTERVAL: &str = "60";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub program: String,
    pub args: Vec<String>,
}

impl Stage {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits a command vector into program and arguments.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program, args.iter().cloned()))
    }

    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Non-empty chain of stages run through one endpoint's shell.
#[derive(Clone)]
pub struct Pipeline {
    endpoint: Arc<dyn Endpoint>,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(endpoint: Arc<dyn Endpoint>, stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(Error::InvalidArgument("a pipeline needs at least one stage".to_string()));
        }
        Ok(Self { endpoint, stages })
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn programs(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.program.as_str()).collect()
    }

    pub fn stage(&self, program: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.program == program)
    }

    pub fn command_line(&self) -> String {
        self.stages
            .iter()
            .map(Stage::command_line)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Script handed to the endpoint's shell.
    ///
    /// A chain exits with the last stage's status when that is non-zero,
    /// otherwise with the status of the first upstream stage that failed.
    /// Upstream statuses travel over fd 4 so plain POSIX `sh` is enough.
    pub fn script(&self) -> String {
        let Some((last, upstream)) = self.stages.split_last() else {
            return String::new();
        };
        if upstream.is_empty() {
            return last.command_line();
        }
        let chain = upstream
            .iter()
            .map(|stage| format!("{{ {} || echo $? >&4; }}", stage.command_line()))
            .chain(std::iter::once(last.command_line()))
            .collect::<Vec<_>>()
            .join(" | ");
        format!(
            "exec 3>&1; failed=$({{ {chain}; }} 4>&1 >&3); rc=$?; exec 3>&-; \
             [ \"$rc\" -ne 0 ] && exit \"$rc\"; set -- $failed; exit \"${{1:-0}}\""
        )
    }

    /// Argument vector that runs the whole chain as one process.
    pub fn argv(&self) -> Vec<String> {
        self.endpoint.wrap(self.script())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("endpoint", &self.endpoint.label().unwrap_or_else(|| "local".to_string()))
            .field("command", &self.command_line())
            .finish()
    }
}

/// How `zfs receive` derives the final dataset name from the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceivePath {
    /// Receive exactly into the target.
    #[default]
    Exact,
    /// Append the last element of the sent name (`-e`).
    AppendName,
    /// Append the sent name minus its pool (`-d`).
    AppendPath,
}

#[derive(Debug, Clone, Default)]
pub struct TransferFlags {
    pub replicate: bool,
    pub properties: bool,
    pub deduplicate: bool,
    pub raw: bool,
    /// Send every snapshot between base and target (`-I`) instead of just
    /// the delta between the two (`-i`).
    pub intermediates: bool,
    pub receive_path: ReceivePath,
    pub force_rollback: bool,
    pub no_mount: bool,
}

/// Everything needed to lay out both sides of a transfer.
#[derive(Debug)]
pub struct TransferRequest<'a> {
    pub snapshot: &'a str,
    pub base: Option<&'a str>,
    pub source: &'a Arc<dyn Endpoint>,
    pub destination: &'a Arc<dyn Endpoint>,
    pub target: &'a str,
    pub flags: &'a TransferFlags,
    pub estimated_bytes: u64,
    /// Whether a person is watching the progress meter.
    pub interactive: bool,
}

#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub source: Pipeline,
    pub destination: Pipeline,
    pub estimated_bytes: u64,
    pub remote: bool,
    pub compressed: bool,
}

/// Buffer memory in MiB: the stream size clamped to `[1, cap]`.
pub fn buffer_size_mib(estimated_bytes: u64, remote: bool) -> u64 {
    let cap = if remote {
        REMOTE_BUFFER_CAP_MIB
    } else {
        LOCAL_BUFFER_CAP_MIB
    };
    (estimated_bytes / MIB).clamp(1, cap)
}

fn buffer_stage(size_mib: u64) -> Stage {
    Stage::new(
        BUFFER_TOOL,
        [
            "-q".to_string(),
            "-s".to_string(),
            "128K".to_string(),
            "-m".to_string(),
            format!("{size_mib}M"),
        ],
    )
}

fn progress_stage(estimated_bytes: u64, interactive: bool) -> Stage {
    let mut args = vec![
        "-f".to_string(),
        "-w".to_string(),
        "100".to_string(),
        "-s".to_string(),
        estimated_bytes.to_string(),
    ];
    if !interactive {
        args.extend(
            ["-D", QUIET_PROGRESS_INTERVAL, "-i", QUIET_PROGRESS_INTERVAL].map(str::to_string),
        );
    }
    Stage::new(PROGRESS_TOOL, args)
}

fn usable(command: Option<Vec<String>>) -> Option<Vec<String>> {
    command.filter(|command| !command.is_empty())
}

impl TransferRequest<'_> {
    pub fn is_remote(&self) -> bool {
        !self.source.is_local() || !self.destination.is_local()
    }

    /// Compress/decompress pair when both endpoints negotiated the same
    /// compressor.
    fn compression(&self) -> Option<(Vec<String>, Vec<String>)> {
        if !self.is_remote() || self.flags.raw {
            return None;
        }
        let source = usable(self.source.compress_command())?;
        let destination = usable(self.destination.compress_command())?;
        if source != destination {
            debug!(
                source = %source.join(" "),
                destination = %destination.join(" "),
                "Endpoints disagree on compression, sending uncompressed"
            );
            return None;
        }
        let decompress = usable(self.destination.decompress_command())
            .or_else(|| usable(self.source.decompress_command()))?;
        Some((source, decompress))
    }

    fn send_stage(&self) -> Stage {
        let flags = self.flags;
        let mut args = vec!["send".to_string()];
        if flags.replicate {
            args.push("-R".to_string());
        }
        if flags.properties {
            args.push("-p".to_string());
        }
        if flags.deduplicate {
            args.push("-D".to_string());
        }
        if flags.raw {
            args.push("-w".to_string());
        }
        if let Some(base) = self.base {
            args.push(if flags.intermediates { "-I" } else { "-i" }.to_string());
            args.push(base.to_string());
        }
        args.push(self.snapshot.to_string());
        Stage::new(zfs::TOOL, args)
    }

    fn receive_stage(&self) -> Stage {
        let flags = self.flags;
        let mut args = vec!["receive".to_string()];
        match flags.receive_path {
            ReceivePath::Exact => {}
            ReceivePath::AppendName => args.push("-e".to_string()),
            ReceivePath::AppendPath => args.push("-d".to_string()),
        }
        if flags.force_rollback {
            args.push("-F".to_string());
        }
        if flags.no_mount {
            args.push("-u".to_string());
        }
        args.push(self.target.to_string());
        Stage::new(zfs::TOOL, args)
    }

    /// Lays out both pipelines.
    pub fn plan(&self) -> Result<TransferPlan> {
        let remote = self.is_remote();
        let size = self.estimated_bytes;
        let large = size >= MIB;
        let compression = self.compression();

        let mut source = vec![self.send_stage()];
        if large && self.source.has_progress_tool() {
            let stage = progress_stage(size, self.interactive);
            debug!(command = %stage.command_line(), "Using progress meter on source");
            source.push(stage);
        }
        if large && self.source.has_buffering_tool() {
            let stage = buffer_stage(buffer_size_mib(size, remote));
            debug!(command = %stage.command_line(), "Using buffer on source");
            source.push(stage);
        }

        let mut destination = Vec::new();
        if let Some((compress, decompress)) = &compression {
            debug!(compress = %compress.join(" "), decompress = %decompress.join(" "), "Using compression");
            source.extend(Stage::from_command(compress));
            destination.extend(Stage::from_command(decompress));
        }
        if remote && large && self.destination.has_buffering_tool() {
            let stage = buffer_stage(buffer_size_mib(size, true));
            debug!(command = %stage.command_line(), "Using buffer on destination");
            destination.push(stage);
        }
        destination.push(self.receive_stage());

        Ok(TransferPlan {
            source: Pipeline::new(Arc::clone(self.source), source)?,
            destination: Pipeline::new(Arc::clone(self.destination), destination)?,
            estimated_bytes: size,
            remote,
            compressed: compression.is_some(),
        })
    }
}

impl TransferPlan {
    /// Both sides as readable shell commands, for logging and dry runs.
    pub fn describe(&self) -> String {
        format!(
            "{} => {}",
            process::command_line(&self.source.endpoint().wrap(self.source.command_line())),
            process::command_line(
                &self.destination.endpoint().wrap(self.destination.command_line())
            )
        )
    }
}
