use tracing::debug;
use zferry_core::process;

/// Stream tools whose stages are included only when present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tools {
    pub buffering: bool,
    pub progress: bool,
}

pub const BUFFERING_TOOL: &str = "mbuffer";
pub const PROGRESS_TOOL: &str = "pv";

/// Whether `tool` resolves in the shell reached through `shell_prefix`.
///
/// A shell that cannot be started at all counts as "absent".
pub async fn tool_exists(shell_prefix: &[String], tool: &str) -> bool {
    let mut argv = shell_prefix.to_vec();
    argv.push(format!("command -v {}", process::shell_quote(tool)));

    match process::run(&argv).await {
        Ok(output) => {
            debug!(tool, present = output.success(), "Probed tool");
            output.success()
        }
        Err(e) => {
            debug!(tool, error = %e, "Could not probe tool");
            false
        }
    }
}

impl Tools {
    pub async fn probe(shell_prefix: &[String]) -> Self {
        let (buffering, progress) = tokio::join!(
            tool_exists(shell_prefix, BUFFERING_TOOL),
            tool_exists(shell_prefix, PROGRESS_TOOL)
        );
        Self {
            buffering,
            progress,
        }
    }
}
