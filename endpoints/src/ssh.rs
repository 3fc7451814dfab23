use crate::compression::{self, Compression};
use crate::local::local_shell;
use crate::probe::{self, Tools};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use zferry_core::process::{self, classify};
use zferry_core::{Endpoint, Result};

pub const DEFAULT_PORT: u16 = 22;

const KEEPALIVE_OPTIONS: &[&str] = &[
    "-o",
    "ServerAliveInterval=30",
    "-o",
    "ServerAliveCountMax=3",
];

/// Connection parameters for a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Identity file passed with `-i`.
    pub key: Option<PathBuf>,
    /// Socket for connection sharing; enables `ControlMaster=auto`.
    pub control_path: Option<PathBuf>,
    /// Seconds a shared master connection lingers after the last session.
    pub control_persist: Option<u64>,
    pub compression: Compression,
}

impl SshConfig {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            key: None,
            control_path: None,
            control_persist: None,
            compression: Compression::None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key(mut self, key: impl Into<PathBuf>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn control(mut self, path: impl Into<PathBuf>, persist_secs: Option<u64>) -> Self {
        self.control_path = Some(path.into());
        self.control_persist = persist_secs;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// The `ssh` invocation every remote command line is appended to.
    pub fn command(&self) -> Vec<String> {
        let mut cmd = vec!["ssh".to_string()];
        cmd.extend(KEEPALIVE_OPTIONS.iter().map(|s| s.to_string()));

        if let Some(path) = &self.control_path {
            cmd.push("-o".to_string());
            cmd.push("ControlMaster=auto".to_string());
            cmd.push("-o".to_string());
            cmd.push(format!("ControlPath={}", path.display()));
            if let Some(persist) = self.control_persist {
                cmd.push("-o".to_string());
                cmd.push(format!("ControlPersist={persist}"));
            }
        }
        if let Some(key) = &self.key {
            cmd.push("-i".to_string());
            cmd.push(key.display().to_string());
        }
        cmd.push("-p".to_string());
        cmd.push(self.port.to_string());
        cmd.push(self.destination());
        cmd
    }
}

/// Runs commands on a remote host through `ssh`.
#[derive(Debug, Clone)]
pub struct SshEndpoint {
    config: SshConfig,
    tools: Tools,
    compression: Compression,
}

impl SshEndpoint {
    /// Checks that the host answers, then probes its tools and settles on a
    /// compressor both hosts have.
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let prefix = config.command();

        let mut check = prefix.clone();
        check.push("true".to_string());
        let output = process::run(&check).await?;
        if !output.success() {
            warn!(host = %config.destination(), stderr = %output.stderr.trim(), "Could not reach host");
            return Err(classify(output.code, &output.stderr));
        }

        let tools = Tools::probe(&prefix).await;
        let compression = match config.compression.tool() {
            Some(tool) => {
                let local_prefix = local_shell();
                let (local, remote) = tokio::join!(
                    probe::tool_exists(&local_prefix, tool),
                    probe::tool_exists(&prefix, tool)
                );
                let negotiated = compression::negotiate(config.compression, &[local, remote]);
                if negotiated != config.compression {
                    warn!(
                        host = %config.destination(),
                        requested = %config.compression,
                        local,
                        remote,
                        "Compression tool missing, sending uncompressed"
                    );
                }
                negotiated
            }
            None => Compression::None,
        };

        info!(host = %config.destination(), port = config.port, %compression, "Connected");
        debug!(?tools, "Detected remote tools");
        Ok(Self::from_parts(config, tools, compression))
    }

    /// Builds an endpoint from already known capabilities without contacting
    /// the host.
    pub fn from_parts(config: SshConfig, tools: Tools, compression: Compression) -> Self {
        Self {
            config,
            tools,
            compression,
        }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn tools(&self) -> Tools {
        self.tools
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

#[async_trait]
impl Endpoint for SshEndpoint {
    fn shell_prefix(&self) -> Vec<String> {
        self.config.command()
    }

    fn is_local(&self) -> bool {
        false
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

    fn label(&self) -> Option<String> {
        Some(self.config.destination())
    }
}
