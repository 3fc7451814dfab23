use crate::location::Location;
use crate::settings::Settings;
use anyhow::{Result, anyhow};
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;
use zferry_core::{DatasetKind, PropertyMap, Zfs};
use zferry_endpoints::Compression;

#[derive(Args)]
pub struct ListCommand {
    #[arg(help = "Dataset to list (local path or ssh:port:user@host:path); all pools when omitted")]
    location: Option<Location>,

    #[arg(short, long, help = "Maximum depth below the dataset (unlimited when omitted)")]
    depth: Option<u32>,

    #[arg(
        short = 't',
        long = "type",
        value_delimiter = ',',
        help = "Dataset types to include (filesystem, volume, snapshot)"
    )]
    kinds: Vec<DatasetKind>,

    #[arg(short = 'o', long, value_delimiter = ',', help = "Properties to show")]
    properties: Vec<String>,

    #[arg(long, default_value = "table", help = "Output format (table, json)")]
    format: String,
}

#[derive(Debug, Serialize)]
struct Row {
    name: String,
    kind: DatasetKind,
    properties: BTreeMap<String, Option<String>>,
}

impl ListCommand {
    pub async fn run(&self, settings: &Settings) -> Result<()> {
        let location = self.location.clone().unwrap_or(Location::Local {
            path: String::new(),
        });
        let endpoint = super::connect(&location, settings, Compression::None).await?;
        let zfs = Zfs::new(endpoint);

        let path = Some(location.path()).filter(|p| !p.is_empty());
        info!(location = %location, "Listing datasets");

        let datasets = zfs.list(path, self.depth, &self.kinds).await?;
        let mut properties = if self.properties.is_empty() {
            BTreeMap::new()
        } else {
            let names: Vec<&str> = self.properties.iter().map(String::as_str).collect();
            zfs.get_properties(path, self.depth, &names, &[], &self.kinds)
                .await?
        };

        let rows: Vec<Row> = datasets
            .into_iter()
            .map(|(name, kind)| {
                let props = properties.remove(&name).unwrap_or_default();
                Row {
                    properties: self.values(&props),
                    name,
                    kind,
                }
            })
            .collect();

        match self.format.as_str() {
            "table" => print!("{}", self.table(&rows)),
            "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
            other => return Err(anyhow!("Unsupported format: {}", other)),
        }
        Ok(())
    }

    fn values(&self, props: &PropertyMap) -> BTreeMap<String, Option<String>> {
        self.properties
            .iter()
            .map(|name| {
                let value = props.get(name).and_then(|p| p.value.clone());
                (name.clone(), value)
            })
            .collect()
    }

    fn table(&self, rows: &[Row]) -> String {
        let name_width = rows
            .iter()
            .map(|row| row.name.len())
            .max()
            .unwrap_or(0)
            .max("NAME".len());

        let mut out = format!("{:<name_width$}  {:<10}", "NAME", "TYPE");
        for property in &self.properties {
            out.push_str(&format!("  {:<12}", property.to_uppercase()));
        }
        out = out.trim_end().to_string();
        out.push('\n');

        for row in rows {
            let mut line = format!("{:<name_width$}  {:<10}", row.name, row.kind.as_str());
            for property in &self.properties {
                let value = row
                    .properties
                    .get(property)
                    .and_then(Option::as_deref)
                    .unwrap_or("-");
                line.push_str(&format!("  {value:<12}"));
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}
