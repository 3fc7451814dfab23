use crate::process::Record;
use crate::zfs::{self, Zfs};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Dry-run sizes computed for one snapshot, keyed by incremental base name.
///
/// The `None` key holds the size of a full send. Entries are never evicted;
/// a fresh entity starts with an empty cache.
#[derive(Debug, Default)]
pub struct StreamSizes {
    sizes: HashMap<Option<String>, u64>,
}

impl StreamSizes {
    pub fn get(&self, base: Option<&str>) -> Option<u64> {
        self.sizes.get(&base.map(str::to_string)).copied()
    }

    pub fn insert(&mut self, base: Option<&str>, size: u64) {
        self.sizes.insert(base.map(str::to_string), size);
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

pub fn dry_run_command(snapshot: &str, base: Option<&str>) -> Vec<String> {
    let mut cmd = zfs::command("send");
    cmd.push("-nvP".to_string());
    if let Some(base) = base {
        cmd.push("-I".to_string());
        cmd.push(base.to_string());
    }
    cmd.push(snapshot.to_string());
    cmd
}

/// Reads the byte count from the trailing field of the last output line.
pub fn parse_dry_run(records: &[Record]) -> Option<u64> {
    records
        .last()?
        .last()?
        .split_whitespace()
        .last()?
        .parse()
        .ok()
}

/// Asks the tool how many bytes a send would produce.
///
/// Never fails: any tool error or unparseable output yields 0, which callers
/// treat as "unknown".
pub async fn estimate(zfs: &Zfs, snapshot: &str, base: Option<&str>) -> u64 {
    let records = match zfs.run(&dry_run_command(snapshot, base)).await {
        Ok(records) => records,
        Err(e) => {
            warn!(snapshot, base, error = %e, "Could not estimate stream size");
            return 0;
        }
    };

    match parse_dry_run(&records) {
        Some(size) => {
            debug!(snapshot, base, size, "Estimated stream size");
            size
        }
        None => {
            warn!(snapshot, base, "Unrecognised dry-run output");
            0
        }
    }
}
