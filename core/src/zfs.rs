use crate::dataset::Dataset;
use crate::endpoint::Endpoint;
use crate::process::{self, Record};
use crate::{DatasetKind, Error, Property, PropertyMap, PropertySource, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub(crate) const TOOL: &str = "zfs";

/// Kinds passed when a caller asks for "everything" below a dataset.
pub const ALL_KINDS: &[DatasetKind] = &[
    DatasetKind::Filesystem,
    DatasetKind::Volume,
    DatasetKind::Snapshot,
];

/// Entry point to the storage tool on one endpoint.
///
/// Cloning is cheap; dataset entities keep a clone to issue their own
/// commands.
#[derive(Debug, Clone)]
pub struct Zfs {
    endpoint: Arc<dyn Endpoint>,
}

/// Options for [`Zfs::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Required for volumes, e.g. `10G`.
    pub volsize: Option<String>,
    pub sparse: bool,
    pub volblocksize: Option<String>,
    pub recordsize: Option<String>,
    pub props: BTreeMap<String, String>,
    /// Create missing parent filesystems.
    pub force_parent: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            volsize: None,
            sparse: true,
            volblocksize: Some("8k".to_string()),
            recordsize: Some("128k".to_string()),
            props: BTreeMap::new(),
            force_parent: false,
        }
    }
}

/// Strips trailing separators so `tank/data/` and `tank/data` name the same
/// dataset.
pub fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        path
    } else {
        trimmed
    }
}

pub(crate) fn command(subcommand: &str) -> Vec<String> {
    vec![TOOL.to_string(), subcommand.to_string()]
}

pub(crate) fn push_props(cmd: &mut Vec<String>, props: &BTreeMap<String, String>) {
    for (prop, value) in props {
        cmd.push("-o".to_string());
        cmd.push(format!("{prop}={value}"));
    }
}

fn push_depth(cmd: &mut Vec<String>, depth: Option<u32>) {
    match depth {
        None => cmd.push("-r".to_string()),
        Some(depth) => {
            cmd.push("-d".to_string());
            cmd.push(depth.to_string());
        }
    }
}

fn push_kinds(cmd: &mut Vec<String>, kinds: &[DatasetKind]) {
    if !kinds.is_empty() {
        cmd.push("-t".to_string());
        cmd.push(
            kinds
                .iter()
                .map(DatasetKind::as_str)
                .collect::<Vec<_>>()
                .join(","),
        );
    }
}

impl Zfs {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub(crate) async fn run(&self, argv: &[String]) -> Result<Vec<Record>> {
        process::invoke(self.endpoint.as_ref(), argv).await
    }

    /// Lists `(name, kind)` pairs below `path` in parent-before-child order.
    ///
    /// `depth` of `None` recurses without limit, `Some(0)` lists only `path`.
    pub async fn list(
        &self,
        path: Option<&str>,
        depth: Option<u32>,
        kinds: &[DatasetKind],
    ) -> Result<Vec<(String, DatasetKind)>> {
        let mut cmd = command("list");
        cmd.push("-H".to_string());
        push_depth(&mut cmd, depth);
        push_kinds(&mut cmd, kinds);
        cmd.push("-o".to_string());
        cmd.push("name,type".to_string());
        if let Some(path) = path {
            cmd.push(normalize(path).to_string());
        }

        self.run(&cmd)
            .await?
            .into_iter()
            .map(|record| match record.as_slice() {
                [name, kind, ..] => Ok((name.clone(), kind.parse()?)),
                _ => Err(Error::InvalidArgument(format!(
                    "malformed list output: {record:?}"
                ))),
            })
            .collect()
    }

    /// Like [`list`](Self::list) but returns opened entities.
    pub async fn find(
        &self,
        path: Option<&str>,
        depth: Option<u32>,
        kinds: &[DatasetKind],
    ) -> Result<Vec<Dataset>> {
        Ok(self
            .list(path, depth, kinds)
            .await?
            .into_iter()
            .map(|(name, kind)| Dataset::new(self.clone(), name, kind))
            .collect())
    }

    /// Queries properties, grouped by dataset name.
    ///
    /// An empty `names` slice requests every property.
    pub async fn get_properties(
        &self,
        path: Option<&str>,
        depth: Option<u32>,
        names: &[&str],
        sources: &[PropertySource],
        kinds: &[DatasetKind],
    ) -> Result<BTreeMap<String, PropertyMap>> {
        let mut cmd = command("get");
        cmd.push("-H".to_string());
        cmd.push("-p".to_string());
        push_depth(&mut cmd, depth);
        push_kinds(&mut cmd, kinds);
        if !sources.is_empty() {
            cmd.push("-s".to_string());
            cmd.push(
                sources
                    .iter()
                    .map(PropertySource::filter_name)
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        cmd.push(if names.is_empty() {
            "all".to_string()
        } else {
            names.join(",")
        });
        if let Some(path) = path {
            cmd.push(normalize(path).to_string());
        }

        let mut datasets: BTreeMap<String, PropertyMap> = BTreeMap::new();
        for record in self.run(&cmd).await? {
            match record.as_slice() {
                [name, property, value, source, ..] => {
                    datasets
                        .entry(name.clone())
                        .or_default()
                        .insert(property.clone(), Property::from_raw(value, source));
                }
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "malformed property output: {record:?}"
                    )));
                }
            }
        }
        Ok(datasets)
    }

    pub async fn get_property(&self, path: &str, name: &str) -> Result<Option<Property>> {
        let path = normalize(path);
        let mut datasets = self
            .get_properties(Some(path), Some(0), &[name], &[], &[])
            .await?;
        Ok(datasets
            .remove(path)
            .and_then(|mut props| props.remove(name)))
    }

    /// Returns `default` when the tool reports the property as unset.
    pub async fn get_property_value(
        &self,
        path: &str,
        name: &str,
        default: Option<&str>,
    ) -> Result<Option<String>> {
        let property = self.get_property(path, name).await?;
        Ok(property
            .and_then(|p| p.value)
            .or_else(|| default.map(str::to_string)))
    }

    pub async fn set_property(&self, path: &str, name: &str, value: &str) -> Result<()> {
        let mut cmd = command("set");
        cmd.push(format!("{name}={value}"));
        cmd.push(path.to_string());
        self.run(&cmd).await?;
        Ok(())
    }

    /// Reverts `name` to the value inherited from the parent.
    pub async fn clear_property(&self, path: &str, name: &str, recursive: bool) -> Result<()> {
        let mut cmd = command("inherit");
        if recursive {
            cmd.push("-r".to_string());
        }
        cmd.push(name.to_string());
        cmd.push(path.to_string());
        self.run(&cmd).await?;
        Ok(())
    }

    /// Opens a dataset, querying its kind when not supplied.
    pub async fn open(&self, name: &str, kind: Option<DatasetKind>) -> Result<Dataset> {
        let name = normalize(name);
        let kind = match kind {
            Some(kind) => kind,
            None => {
                let value = self
                    .get_property_value(name, "type", None)
                    .await?
                    .ok_or_else(|| Error::NotFound(name.to_string()))?;
                value.parse()?
            }
        };
        Ok(Dataset::new(self.clone(), name.to_string(), kind))
    }

    /// Top-level datasets (pools).
    pub async fn roots(&self) -> Result<Vec<Dataset>> {
        self.find(None, Some(0), &[]).await
    }

    pub async fn create(
        &self,
        name: &str,
        kind: DatasetKind,
        options: &CreateOptions,
    ) -> Result<Dataset> {
        let mut cmd = command("create");

        match kind {
            DatasetKind::Volume => {
                let volsize = options.volsize.as_ref().ok_or_else(|| {
                    Error::InvalidArgument("a volume requires a size".to_string())
                })?;
                cmd.push("-V".to_string());
                cmd.push(volsize.clone());
                if options.sparse {
                    cmd.push("-s".to_string());
                }
            }
            DatasetKind::Filesystem => {}
            DatasetKind::Snapshot => {
                return Err(Error::InvalidArgument(
                    "snapshots are taken, not created".to_string(),
                ));
            }
        }

        if options.force_parent {
            cmd.push("-p".to_string());
        }

        let mut props = options.props.clone();
        let (key, default) = match kind {
            DatasetKind::Volume => ("volblocksize", &options.volblocksize),
            _ => ("recordsize", &options.recordsize),
        };
        if let Some(default) = default {
            props
                .entry(key.to_string())
                .or_insert_with(|| default.clone());
        }
        push_props(&mut cmd, &props);

        cmd.push(name.to_string());
        self.run(&cmd).await?;
        info!(dataset = name, kind = %kind, "Created dataset");

        Ok(Dataset::new(self.clone(), name.to_string(), kind))
    }
}
