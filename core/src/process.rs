use crate::endpoint::Endpoint;
use crate::{Error, Result};
use std::borrow::Cow;
use std::process::Stdio;
use tokio::process::Command;

/// Field separator of the tool's scripted (`-H`) output.
pub const FIELD_DELIMITER: char = '\t';

const NOT_FOUND_PATTERNS: &[&str] = &[
    "does not exist",
    "no such pool",
    "no such dataset",
    "could not find any snapshots",
];

const BUSY_PATTERNS: &[&str] = &[
    "busy",
    "in use",
    "has dependent clones",
    "has children",
    "more recent snapshots",
    "clones of previous snapshots",
];

pub type Record = Vec<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs `argv` on `endpoint` and splits its stdout into tab-delimited records.
///
/// Output carries no header line. A non-zero exit is classified from stderr.
pub async fn invoke(endpoint: &dyn Endpoint, argv: &[String]) -> Result<Vec<Record>> {
    let output = endpoint.execute(argv).await?;
    if !output.success() {
        return Err(classify(output.code, &output.stderr));
    }
    Ok(parse_records(&output.stdout))
}

pub fn parse_records(text: &str) -> Vec<Record> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split(FIELD_DELIMITER).map(str::to_string).collect())
        .collect()
}

/// Maps a failed command to the error taxonomy by matching its stderr.
pub fn classify(code: Option<i32>, stderr: &str) -> Error {
    let lowered = stderr.to_lowercase();
    let message = stderr.trim().to_string();

    if NOT_FOUND_PATTERNS.iter().any(|p| lowered.contains(p)) {
        Error::NotFound(message)
    } else if BUSY_PATTERNS.iter().any(|p| lowered.contains(p)) {
        Error::Busy(message)
    } else {
        Error::ToolFailure {
            code,
            stderr: stderr.to_string(),
        }
    }
}

/// Spawns `argv` locally and waits for it, capturing stdout and stderr.
pub async fn run(argv: &[String]) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidArgument("empty command".to_string()))?;

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quotes `arg` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty()
        && arg.chars().all(|ch| {
            ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '/' | '.' | ':' | '=' | '@' | ',' | '+' | '%')
        })
    {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', "'\\''")))
}

pub fn command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
