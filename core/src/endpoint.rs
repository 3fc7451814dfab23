use crate::process::{self, CommandOutput};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use tracing::debug;

/// A host context that commands run in.
///
/// Every command is rendered to a single shell command line and appended to
/// [`shell_prefix`](Endpoint::shell_prefix), so the same code path serves a
/// local `sh -c` and a remote shell wrapper. Implementations report which
/// optional stream tools the host provides; the transfer pipeline only
/// includes a stage whose tool is reported present.
#[async_trait]
pub trait Endpoint: Send + Sync + fmt::Debug {
    fn shell_prefix(&self) -> Vec<String>;

    fn is_local(&self) -> bool;

    fn compress_command(&self) -> Option<Vec<String>> {
        None
    }

    fn decompress_command(&self) -> Option<Vec<String>> {
        None
    }

    fn has_buffering_tool(&self) -> bool {
        false
    }

    fn has_progress_tool(&self) -> bool {
        false
    }

    /// `user@host` for remote endpoints.
    fn label(&self) -> Option<String> {
        None
    }

    /// Full argument vector that runs `command_line` on this endpoint.
    fn wrap(&self, command_line: String) -> Vec<String> {
        let mut argv = self.shell_prefix();
        argv.push(command_line);
        argv
    }

    /// Runs `argv` to completion and captures its output.
    ///
    /// The default quotes `argv` once, wraps it with the shell prefix and
    /// spawns it locally. Test doubles override this to interpret `argv`
    /// directly.
    async fn execute(&self, argv: &[String]) -> Result<CommandOutput> {
        let command_line = process::command_line(argv);
        debug!(
            endpoint = %self.label().unwrap_or_else(|| "local".to_string()),
            command = %command_line,
            "Running command"
        );
        process::run(&self.wrap(command_line)).await
    }
}
