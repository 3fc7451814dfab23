use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Value printed by the storage tool for "not applicable" or "unset".
pub const UNSET: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Filesystem,
    Volume,
    Snapshot,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Filesystem => "filesystem",
            DatasetKind::Volume => "volume",
            DatasetKind::Snapshot => "snapshot",
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, DatasetKind::Snapshot)
    }
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "filesystem" => Ok(DatasetKind::Filesystem),
            "volume" => Ok(DatasetKind::Volume),
            "snapshot" => Ok(DatasetKind::Snapshot),
            other => Err(Error::InvalidArgument(format!("invalid dataset type {other}"))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a property value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertySource {
    Default,
    Local,
    Inherited { from: String },
    Temporary,
    Received,
    None,
}

impl PropertySource {
    /// Name accepted by the `-s` filter of the property query command.
    pub fn filter_name(&self) -> &'static str {
        match self {
            PropertySource::Default => "default",
            PropertySource::Local => "local",
            PropertySource::Inherited { .. } => "inherited",
            PropertySource::Temporary => "temporary",
            PropertySource::Received => "received",
            PropertySource::None => "none",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "default" => PropertySource::Default,
            "local" => PropertySource::Local,
            "temporary" => PropertySource::Temporary,
            "received" => PropertySource::Received,
            _ => match raw.strip_prefix("inherited from ") {
                Some(from) => PropertySource::Inherited {
                    from: from.to_string(),
                },
                None => PropertySource::None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// `None` when the tool reported the unset sentinel.
    pub value: Option<String>,
    pub source: PropertySource,
}

impl Property {
    pub fn from_raw(value: &str, source: &str) -> Self {
        Self {
            value: (value != UNSET).then(|| value.to_string()),
            source: PropertySource::parse(source),
        }
    }

    pub fn value_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.value.as_deref().unwrap_or(default)
    }
}

pub type PropertyMap = BTreeMap<String, Property>;
