use std::fmt;
use std::str::FromStr;

/// Where a dataset lives: a local path or `ssh:port:user@host:path`.
///
/// The port may be left empty (`ssh::user@host:path`) to use the configured
/// default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local {
        path: String,
    },
    Remote {
        port: Option<u16>,
        user: String,
        host: String,
        path: String,
    },
}

impl Location {
    pub fn path(&self) -> &str {
        match self {
            Location::Local { path } | Location::Remote { path, .. } => path,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }
}

impl FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix("ssh:") else {
            if s.is_empty() {
                return Err("empty dataset path".to_string());
            }
            return Ok(Location::Local {
                path: s.to_string(),
            });
        };

        let (port, rest) = rest
            .split_once(':')
            .ok_or_else(|| format!("expected ssh:port:user@host:path, got '{s}'"))?;
        let port = match port {
            "" => None,
            port => Some(
                port.parse::<u16>()
                    .map_err(|_| format!("invalid port '{port}' in '{s}'"))?,
            ),
        };
        let (login, path) = rest
            .split_once(':')
            .ok_or_else(|| format!("missing dataset path in '{s}'"))?;
        let (user, host) = login
            .split_once('@')
            .ok_or_else(|| format!("expected user@host in '{s}'"))?;

        if user.is_empty() || host.is_empty() || path.is_empty() {
            return Err(format!("expected ssh:port:user@host:path, got '{s}'"));
        }

        Ok(Location::Remote {
            port,
            user: user.to_string(),
            host: host.to_string(),
            path: path.to_string(),
        })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local { path } => f.write_str(path),
            Location::Remote {
                user, host, path, ..
            } => write!(f, "{user}@{host}:{path}"),
        }
    }
}
