use crate::compression::{self, Compression};
use crate::probe::{self, Tools};
use async_trait::async_trait;
use tracing::{debug, warn};
use zferry_core::Endpoint;

/// Runs commands through `sh -c` on this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalEndpoint {
    tools: Tools,
    compression: Compression,
}

pub(crate) fn local_shell() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string()]
}

impl LocalEndpoint {
    /// An endpoint that assumes no optional tools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes the optional stream tools once.
    pub async fn detect() -> Self {
        let tools = Tools::probe(&local_shell()).await;
        debug!(?tools, "Detected local tools");
        Self {
            tools,
            compression: Compression::None,
        }
    }

    pub fn with_tools(mut self, tools: Tools) -> Self {
        self.tools = tools;
        self
    }

    /// Offers `compression` for transfers with a remote peer, if the tool is
    /// installed here. Compression only applies when the peer negotiated the
    /// same algorithm.
    pub async fn with_compression(mut self, requested: Compression) -> Self {
        let present = match requested.tool() {
            Some(tool) => probe::tool_exists(&local_shell(), tool).await,
            None => true,
        };
        self.compression = compression::negotiate(requested, &[present]);
        if self.compression != requested {
            warn!(%requested, "Compression tool not installed locally, sending uncompressed");
        }
        self
    }

    pub fn tools(&self) -> Tools {
        self.tools
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn shell_prefix(&self) -> Vec<String> {
        local_shell()
    }

    fn is_local(&self) -> bool {
        true
    }

    fn compress_command(&self) -> Option<Vec<String>> {
        self.compression.compress_command()
    }

    fn decompress_command(&self) -> Option<Vec<String>> {
        self.compression.decompress_command()
    }

    fn has_buffering_tool(&self) -> bool {
        self.tools.buffering
    }

    fn has_progress_tool(&self) -> bool {
        self.tools.progress
    }
}
