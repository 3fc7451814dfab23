use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zferry_core::Error;

/// Stream compressor used between the two hosts of a remote transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lzop,
    Lz4,
    Gzip,
    Pigz,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    pub const ALL: &'static [Compression] = &[
        Compression::None,
        Compression::Lzop,
        Compression::Lz4,
        Compression::Gzip,
        Compression::Pigz,
        Compression::Bzip2,
        Compression::Xz,
        Compression::Zstd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lzop => "lzop",
            Compression::Lz4 => "lz4",
            Compression::Gzip => "gzip",
            Compression::Pigz => "pigz",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }

    /// Executable that has to exist on both hosts.
    pub fn tool(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            other => Some(other.as_str()),
        }
    }

    pub fn compress_command(&self) -> Option<Vec<String>> {
        let argv: &[&str] = match self {
            Compression::None => return None,
            Compression::Lzop => &["lzop"],
            Compression::Lz4 => &["lz4"],
            Compression::Gzip => &["gzip", "-3"],
            Compression::Pigz => &["pigz"],
            Compression::Bzip2 => &["bzip2"],
            Compression::Xz => &["xz"],
            Compression::Zstd => &["zstd"],
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }

    pub fn decompress_command(&self) -> Option<Vec<String>> {
        let argv: &[&str] = match self {
            Compression::None => return None,
            Compression::Lzop => &["lzop", "-dfc"],
            Compression::Lz4 => &["lz4", "-dc"],
            Compression::Gzip => &["gzip", "-dc"],
            Compression::Pigz => &["pigz", "-dc"],
            Compression::Bzip2 => &["bzip2", "-dc"],
            Compression::Xz => &["xz", "-d"],
            Compression::Zstd => &["zstd", "-dc"],
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Compression::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown compression '{s}'")))
    }
}

/// Keeps `requested` only if its tool is present on every host involved.
pub fn negotiate(requested: Compression, available: &[bool]) -> Compression {
    if requested.tool().is_some() && available.iter().all(|present| *present) {
        requested
    } else {
        Compression::None
    }
}
