use crate::location::Location;
use crate::settings::Settings;
use anyhow::{Result, anyhow};
use clap::Args;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use zferry_core::{Dataset, TransferFlags, Zfs};
use zferry_endpoints::Compression;

#[derive(Args)]
pub struct SendCommand {
    #[arg(help = "Source filesystem or volume (local path or ssh:port:user@host:path)")]
    source: Location,

    #[arg(help = "Destination dataset (local path or ssh:port:user@host:path)")]
    destination: Location,

    #[arg(short, long, env = "ZFERRY_COMPRESSION", help = "Compression over ssh (none, lzop, lz4, gzip, pigz, bzip2, xz, zstd)")]
    compression: Option<Compression>,

    #[arg(short = 'i', long, env = "ZFERRY_SSH_KEY", help = "Identity file for ssh (overrides the settings file)")]
    key: Option<PathBuf>,

    #[arg(short = 'w', long, help = "Send the raw on-disk stream (keeps encryption, disables compression)")]
    raw: bool,

    #[arg(short = 'F', long, help = "Roll the destination back to the common snapshot before receiving")]
    force: bool,

    #[arg(short, long, help = "Include dataset properties in the stream")]
    properties: bool,

    #[arg(short = 'u', long, help = "Do not mount the received filesystem")]
    no_mount: bool,

    #[arg(short = 'n', long, help = "Print the pipelines without running them")]
    dry_run: bool,
}

/// What has to move for the destination to catch up.
#[derive(Debug, PartialEq, Eq)]
enum Delta {
    UpToDate,
    Full,
    /// Index into the source snapshots of the newest common one.
    Incremental(usize),
}

/// Picks the newest source snapshot whose guid the destination also has.
///
/// `source` is ordered oldest first and must not be empty.
fn delta(source: &[String], destination: Option<&HashSet<String>>) -> Result<Delta> {
    let Some(destination) = destination else {
        return Ok(Delta::Full);
    };
    let newest = source.len() - 1;
    if destination.contains(&source[newest]) {
        return Ok(Delta::UpToDate);
    }
    source[..newest]
        .iter()
        .rposition(|guid| destination.contains(guid))
        .map(Delta::Incremental)
        .ok_or_else(|| anyhow!("No common snapshot; destroy the destination or roll it back first"))
}

async fn guids(snapshots: &[Dataset]) -> Result<Vec<String>> {
    let mut guids = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        guids.push(snapshot.guid().await?.to_string());
    }
    Ok(guids)
}

impl SendCommand {
    /// Settings with command-line overrides applied.
    fn settings<'a>(&self, settings: &'a Settings) -> Cow<'a, Settings> {
        match &self.key {
            Some(key) => {
                let mut settings = settings.clone();
                settings.ssh.key = Some(key.clone());
                Cow::Owned(settings)
            }
            None => Cow::Borrowed(settings),
        }
    }

    fn flags(&self, settings: &Settings, incremental: bool) -> TransferFlags {
        let defaults = &settings.send;
        TransferFlags {
            raw: self.raw || defaults.raw,
            properties: self.properties || defaults.properties,
            intermediates: incremental,
            force_rollback: self.force || defaults.force,
            no_mount: self.no_mount || defaults.no_mount,
            ..Default::default()
        }
    }

    pub async fn run(&self, settings: &Settings) -> Result<()> {
        let settings = self.settings(settings);
        let settings: &Settings = &settings;
        let compression = self.compression.unwrap_or(settings.ssh.compression);
        let source_endpoint = super::connect(&self.source, settings, compression).await?;
        let destination_endpoint =
            super::connect(&self.destination, settings, compression).await?;

        let source = Zfs::new(source_endpoint)
            .open(self.source.path(), None)
            .await?;
        if source.kind().is_snapshot() {
            return Err(anyhow!("Source {} must be a filesystem or volume", source));
        }

        let mut snapshots = source.snapshots(1).await?;
        if snapshots.is_empty() {
            return Err(anyhow!("No snapshots on {}", source));
        }
        let source_guids = guids(&snapshots).await?;

        let destination_zfs = Zfs::new(destination_endpoint.clone());
        let existing = match destination_zfs.open(self.destination.path(), None).await {
            Ok(destination) => {
                let snapshots = destination.snapshots(1).await?;
                Some(guids(&snapshots).await?.into_iter().collect::<HashSet<_>>())
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let mut newest = snapshots
            .pop()
            .ok_or_else(|| anyhow!("No snapshots on {}", source))?;
        let (base, incremental) = match delta(&source_guids, existing.as_ref())? {
            Delta::UpToDate => {
                println!("{} is up to date", self.destination);
                return Ok(());
            }
            Delta::Full => (None, false),
            Delta::Incremental(index) => (snapshots.get(index), true),
        };

        let flags = self.flags(settings, incremental);
        let plan = newest
            .plan_send(base, &destination_endpoint, self.destination.path(), &flags)
            .await?;

        if self.dry_run {
            println!("{}", plan.describe());
            return Ok(());
        }

        let what = match base {
            Some(base) => format!("{} (from {})", newest, base.snapshot_label()?),
            None => newest.to_string(),
        };
        info!(snapshot = %newest, destination = %self.destination, "Sending");

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!(
            "Sending {} to {} (~{})",
            what,
            self.destination,
            HumanBytes(plan.estimated_bytes)
        ));

        let result = plan.launch()?.wait().await;
        match result {
            Ok(report) => {
                debug!(
                    source = %report.source_stderr,
                    destination = %report.destination_stderr,
                    "Transfer diagnostics"
                );
                pb.finish_with_message(format!("Sent {} to {}", what, self.destination));
                Ok(())
            }
            Err(e) => {
                pb.abandon_with_message(format!("Failed to send {}", what));
                Err(e.into())
            }
        }
    }
}
