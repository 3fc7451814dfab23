pub mod list;
pub mod send;

use crate::location::Location;
use crate::settings::Settings;
use anyhow::Result;
use std::sync::Arc;
use zferry_core::Endpoint;
use zferry_endpoints::{Compression, LocalEndpoint, SshConfig, SshEndpoint};

/// Opens the endpoint a location refers to, probing its tools.
pub async fn connect(
    location: &Location,
    settings: &Settings,
    compression: Compression,
) -> Result<Arc<dyn Endpoint>> {
    let endpoint: Arc<dyn Endpoint> = match location {
        Location::Local { .. } => Arc::new(
            LocalEndpoint::detect()
                .await
                .with_compression(compression)
                .await,
        ),
        Location::Remote {
            port, user, host, ..
        } => {
            let ssh = &settings.ssh;
            let mut config = SshConfig::new(user.as_str(), host.as_str())
                .port(port.unwrap_or(ssh.port))
                .compression(compression);
            if let Some(key) = &ssh.key {
                config = config.key(key);
            }
            if let Some(path) = &ssh.control_path {
                config = config.control(path, ssh.control_persist);
            }
            Arc::new(SshEndpoint::connect(config).await?)
        }
    };
    Ok(endpoint)
}
