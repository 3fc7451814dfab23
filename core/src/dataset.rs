use crate::endpoint::Endpoint;
use crate::pipeline::{TransferFlags, TransferPlan, TransferRequest};
use crate::stream::{self, StreamSizes};
use crate::transfer::Transfer;
use crate::zfs::{self, ALL_KINDS, Zfs};
use crate::{DatasetKind, Error, Property, PropertyMap, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

const FILESYSTEM: &[DatasetKind] = &[DatasetKind::Filesystem];
const FILESYSTEM_OR_VOLUME: &[DatasetKind] = &[DatasetKind::Filesystem, DatasetKind::Volume];
const SNAPSHOT: &[DatasetKind] = &[DatasetKind::Snapshot];

#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Snapshots only: mark for deletion once holds and clones are gone.
    pub defer: bool,
    /// Destroy descendants first.
    pub children: bool,
    /// Also destroy dependent clones.
    pub dependents: bool,
    /// Non-snapshots only: unmount a mounted filesystem.
    pub force_unmount: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackOptions {
    pub destroy_newer: bool,
    pub destroy_clones: bool,
    pub force_unmount: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenameOptions {
    /// Snapshots only: rename the label on every descendant too.
    pub recursive: bool,
    pub force_parent: bool,
    pub force_unmount: bool,
}

/// A filesystem, volume or snapshot addressed by path on one endpoint.
///
/// Which operations are legal depends on the kind; illegal ones fail with
/// [`Error::OperationNotAllowed`] before any command runs. Identity is the
/// `guid` property, fetched on first use and cached, so a handle still
/// compares equal to the same dataset after a rename.
#[derive(Debug)]
pub struct Dataset {
    zfs: Zfs,
    name: String,
    kind: DatasetKind,
    guid: OnceCell<String>,
    stream_sizes: StreamSizes,
}

impl Dataset {
    pub(crate) fn new(zfs: Zfs, name: String, kind: DatasetKind) -> Self {
        Self {
            zfs,
            name,
            kind,
            guid: OnceCell::new(),
            stream_sizes: StreamSizes::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn zfs(&self) -> &Zfs {
        &self.zfs
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        self.zfs.endpoint()
    }

    fn require(&self, operation: &'static str, allowed: &[DatasetKind]) -> Result<()> {
        if allowed.contains(&self.kind) {
            Ok(())
        } else {
            Err(Error::OperationNotAllowed {
                operation,
                kind: self.kind,
            })
        }
    }

    /// Path without the `@label` suffix.
    pub fn dataset_name(&self) -> &str {
        self.name.split_once('@').map_or(&self.name, |(dataset, _)| dataset)
    }

    pub fn snapshot_label(&self) -> Result<&str> {
        self.require("snapshot_label", SNAPSHOT)?;
        self.name
            .split_once('@')
            .map(|(_, label)| label)
            .ok_or_else(|| Error::InvalidArgument(format!("'{}' has no snapshot label", self.name)))
    }

    pub async fn parent(&self) -> Result<Option<Dataset>> {
        let parent = if self.kind.is_snapshot() {
            Some(self.dataset_name())
        } else {
            self.name.rsplit_once('/').map(|(parent, _)| parent)
        };
        match parent {
            Some(parent) => Ok(Some(self.zfs.open(parent, None).await?)),
            None => Ok(None),
        }
    }

    pub async fn guid(&self) -> Result<&str> {
        self.guid
            .get_or_try_init(|| async {
                self.zfs
                    .get_property_value(&self.name, "guid", None)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("{} has no guid", self.name)))
            })
            .await
            .map(String::as_str)
    }

    /// True when both handles refer to the same underlying dataset.
    pub async fn is_same(&self, other: &Dataset) -> Result<bool> {
        Ok(self.guid().await? == other.guid().await?)
    }

    async fn descendants(&self, depth: u32, kinds: &[DatasetKind]) -> Result<Vec<Dataset>> {
        let mut found = self.zfs.find(Some(&self.name), Some(depth), kinds).await?;
        found.retain(|dataset| dataset.name != self.name);
        Ok(found)
    }

    pub async fn filesystems(&self, depth: u32) -> Result<Vec<Dataset>> {
        self.require("filesystems", FILESYSTEM)?;
        self.descendants(depth, FILESYSTEM).await
    }

    pub async fn volumes(&self, depth: u32) -> Result<Vec<Dataset>> {
        self.require("volumes", FILESYSTEM)?;
        self.descendants(depth, &[DatasetKind::Volume]).await
    }

    pub async fn snapshots(&self, depth: u32) -> Result<Vec<Dataset>> {
        self.require("snapshots", FILESYSTEM_OR_VOLUME)?;
        self.descendants(depth, SNAPSHOT).await
    }

    pub async fn children(&self, depth: u32) -> Result<Vec<Dataset>> {
        self.require("children", FILESYSTEM_OR_VOLUME)?;
        self.descendants(depth, ALL_KINDS).await
    }

    /// Datasets cloned from any snapshot within `depth` of this dataset.
    pub async fn clones(&self, depth: u32) -> Result<Vec<Dataset>> {
        self.require("clones", FILESYSTEM_OR_VOLUME)?;
        let props = self
            .zfs
            .get_properties(Some(&self.name), Some(depth), &["clones"], &[], SNAPSHOT)
            .await?;
        let mut clones = Vec::new();
        for snapshot_props in props.values() {
            clones.extend(self.open_clone_list(snapshot_props.get("clones")).await?);
        }
        Ok(clones)
    }

    /// Datasets cloned from this snapshot.
    pub async fn dependents(&self) -> Result<Vec<Dataset>> {
        self.require("dependents", SNAPSHOT)?;
        let property = self.property("clones").await?;
        self.open_clone_list(property.as_ref()).await
    }

    async fn open_clone_list(&self, property: Option<&Property>) -> Result<Vec<Dataset>> {
        let mut clones = Vec::new();
        let names = property.and_then(|p| p.value.as_deref()).unwrap_or_default();
        for name in names.split(',').filter(|name| !name.is_empty()) {
            clones.push(self.zfs.open(name, None).await?);
        }
        Ok(clones)
    }

    pub async fn destroy(&self, options: &DestroyOptions) -> Result<()> {
        let mut cmd = zfs::command("destroy");

        if self.kind.is_snapshot() {
            if options.defer {
                cmd.push("-d".to_string());
            }
        } else if options.force_unmount {
            cmd.push("-f".to_string());
        }
        if options.children {
            cmd.push("-r".to_string());
        }
        if options.dependents {
            cmd.push("-R".to_string());
        }
        cmd.push(self.name.clone());

        self.zfs.run(&cmd).await?;
        info!(dataset = %self, "Destroyed dataset");
        Ok(())
    }

    /// Takes a snapshot named `label`, atomically across descendants when
    /// `recursive`.
    pub async fn snapshot(
        &self,
        label: &str,
        recursive: bool,
        props: &BTreeMap<String, String>,
    ) -> Result<Dataset> {
        self.require("snapshot", FILESYSTEM_OR_VOLUME)?;
        validate_label(label)?;

        let mut cmd = zfs::command("snapshot");
        if recursive {
            cmd.push("-r".to_string());
        }
        zfs::push_props(&mut cmd, props);
        let name = format!("{}@{}", self.name, label);
        cmd.push(name.clone());

        self.zfs.run(&cmd).await?;
        info!(snapshot = %name, recursive, "Took snapshot");
        Ok(Dataset::new(self.zfs.clone(), name, DatasetKind::Snapshot))
    }

    /// Rolls back to `target`, either a bare label of this dataset or a full
    /// `dataset@label` reference.
    pub async fn rollback(&self, target: &str, options: &RollbackOptions) -> Result<()> {
        self.require("rollback", FILESYSTEM_OR_VOLUME)?;

        let snapshot = match target.split_once('@') {
            Some((dataset, label)) => {
                if !dataset.is_empty() && dataset != self.name {
                    return Err(Error::InvalidArgument(format!(
                        "'{target}' is not a snapshot of {}",
                        self.name
                    )));
                }
                validate_label(label)?;
                format!("{}@{}", self.name, label)
            }
            None => {
                validate_label(target)?;
                format!("{}@{}", self.name, target)
            }
        };

        let mut cmd = zfs::command("rollback");
        if options.destroy_newer {
            cmd.push("-r".to_string());
        }
        if options.destroy_clones {
            cmd.push("-R".to_string());
        }
        if options.force_unmount {
            cmd.push("-f".to_string());
        }
        cmd.push(snapshot.clone());

        self.zfs.run(&cmd).await?;
        info!(dataset = %self, snapshot = %snapshot, "Rolled back");
        Ok(())
    }

    /// The snapshot this dataset was cloned from, if any.
    pub async fn origin(&self) -> Result<Option<Dataset>> {
        match self.zfs.get_property_value(&self.name, "origin", None).await? {
            Some(origin) => Ok(Some(
                self.zfs.open(&origin, Some(DatasetKind::Snapshot)).await?,
            )),
            None => Ok(None),
        }
    }

    /// Takes over the snapshot history of the origin dataset. A dataset that
    /// is not a clone is left alone.
    pub async fn promote(&self) -> Result<()> {
        self.require("promote", FILESYSTEM_OR_VOLUME)?;
        if self.origin().await?.is_none() {
            return Ok(());
        }

        let mut cmd = zfs::command("promote");
        cmd.push(self.name.clone());
        self.zfs.run(&cmd).await?;
        info!(dataset = %self, "Promoted clone");
        Ok(())
    }

    /// Renames the dataset. For a snapshot `name` is the new label only.
    pub async fn rename(&self, name: &str, options: &RenameOptions) -> Result<Dataset> {
        let mut cmd = zfs::command("rename");

        let target = if self.kind.is_snapshot() {
            let label = name.strip_prefix('@').unwrap_or(name);
            validate_label(label)?;
            if options.recursive {
                cmd.push("-r".to_string());
            }
            format!("{}@{}", self.dataset_name(), label)
        } else {
            if options.recursive {
                return Err(Error::InvalidArgument(
                    "recursive rename applies only to snapshots".to_string(),
                ));
            }
            if name.is_empty() || name.contains('@') {
                return Err(Error::InvalidArgument(format!("invalid dataset name '{name}'")));
            }
            if options.force_parent {
                cmd.push("-p".to_string());
            }
            if options.force_unmount {
                cmd.push("-f".to_string());
            }
            name.to_string()
        };

        cmd.push(self.name.clone());
        cmd.push(target.clone());

        self.zfs.run(&cmd).await?;
        info!(from = %self.name, to = %target, "Renamed dataset");
        Ok(Dataset::new(self.zfs.clone(), target, self.kind))
    }

    pub async fn properties(&self) -> Result<PropertyMap> {
        Ok(self
            .zfs
            .get_properties(Some(&self.name), Some(0), &[], &[], &[])
            .await?
            .remove(&self.name)
            .unwrap_or_default())
    }

    pub async fn property(&self, name: &str) -> Result<Option<Property>> {
        self.zfs.get_property(&self.name, name).await
    }

    pub async fn property_value(&self, name: &str, default: Option<&str>) -> Result<Option<String>> {
        self.zfs.get_property_value(&self.name, name, default).await
    }

    pub async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.zfs.set_property(&self.name, name, value).await
    }

    pub async fn clear_property(&self, name: &str, recursive: bool) -> Result<()> {
        self.zfs.clear_property(&self.name, name, recursive).await
    }

    /// Creates a writable dataset at `name` whose origin is this snapshot.
    pub async fn clone(
        &self,
        name: &str,
        props: &BTreeMap<String, String>,
        force_parent: bool,
    ) -> Result<Dataset> {
        self.require("clone", SNAPSHOT)?;

        let mut cmd = zfs::command("clone");
        if force_parent {
            cmd.push("-p".to_string());
        }
        zfs::push_props(&mut cmd, props);
        cmd.push(self.name.clone());
        cmd.push(name.to_string());

        self.zfs.run(&cmd).await?;
        info!(snapshot = %self.name, clone = name, "Cloned snapshot");
        self.zfs.open(name, None).await
    }

    pub async fn hold(&self, tag: &str, recursive: bool) -> Result<()> {
        self.require("hold", SNAPSHOT)?;
        self.run_hold("hold", tag, recursive).await
    }

    pub async fn release(&self, tag: &str, recursive: bool) -> Result<()> {
        self.require("release", SNAPSHOT)?;
        self.run_hold("release", tag, recursive).await
    }

    async fn run_hold(&self, subcommand: &str, tag: &str, recursive: bool) -> Result<()> {
        let mut cmd = zfs::command(subcommand);
        if recursive {
            cmd.push("-r".to_string());
        }
        cmd.push(tag.to_string());
        cmd.push(self.name.clone());
        self.zfs.run(&cmd).await?;
        Ok(())
    }

    /// Tags of the holds currently placed on this snapshot.
    pub async fn holds(&self) -> Result<BTreeSet<String>> {
        self.require("holds", SNAPSHOT)?;
        let mut cmd = zfs::command("holds");
        cmd.push("-H".to_string());
        cmd.push(self.name.clone());

        Ok(self
            .zfs
            .run(&cmd)
            .await?
            .into_iter()
            .filter_map(|record| record.into_iter().nth(1))
            .collect())
    }

    /// Estimated size in bytes of sending this snapshot, incrementally from
    /// `base` when given. Cached per base for the lifetime of this handle.
    /// Returns 0 when the size cannot be determined.
    pub async fn estimate_bytes(&mut self, base: Option<&Dataset>) -> Result<u64> {
        self.require("estimate_bytes", SNAPSHOT)?;
        let base = base.map(Dataset::name);
        if let Some(size) = self.stream_sizes.get(base) {
            return Ok(size);
        }
        let size = stream::estimate(&self.zfs, &self.name, base).await;
        self.stream_sizes.insert(base, size);
        Ok(size)
    }

    /// Builds the source and destination pipelines that replicate this
    /// snapshot to `target` on `destination`.
    pub async fn plan_send(
        &mut self,
        base: Option<&Dataset>,
        destination: &Arc<dyn Endpoint>,
        target: &str,
        flags: &TransferFlags,
    ) -> Result<TransferPlan> {
        self.require("send", SNAPSHOT)?;
        if let Some(base) = base {
            if !base.kind.is_snapshot() {
                return Err(Error::InvalidArgument(format!(
                    "incremental base {} is not a snapshot",
                    base.name
                )));
            }
        }

        let estimated_bytes = self.estimate_bytes(base).await?;
        TransferRequest {
            snapshot: &self.name,
            base: base.map(Dataset::name),
            source: self.zfs.endpoint(),
            destination,
            target,
            flags,
            estimated_bytes,
            interactive: std::io::stdout().is_terminal(),
        }
        .plan()
    }

    /// Plans and launches the transfer; the caller waits on the result.
    pub async fn send(
        &mut self,
        base: Option<&Dataset>,
        destination: &Arc<dyn Endpoint>,
        target: &str,
        flags: &TransferFlags,
    ) -> Result<Transfer> {
        let plan = self.plan_send(base, destination, target, flags).await?;
        info!(
            snapshot = %self,
            base = base.map(Dataset::name),
            target,
            estimated_bytes = plan.estimated_bytes,
            "Starting transfer"
        );
        plan.launch()
    }
}

fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() || label.contains(['@', '/']) {
        return Err(Error::InvalidArgument(format!("invalid snapshot label '{label}'")));
    }
    Ok(())
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint().label() {
            Some(label) => write!(f, "{}:{}", label, self.name),
            None => f.write_str(&self.name),
        }
    }
}
