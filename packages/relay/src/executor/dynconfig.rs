// packages/relay/src/executor/dynconfig.rs
//! Per-bundle dynamic configuration
//!
//! Layout: `<root>/<bundle>/config.yml`, a flat YAML mapping whose entries
//! become environment variables for every command in the bundle. Updates
//! arrive over the bus and are written to a temp file, synced, then renamed
//! into place, so a reader never sees a half-written file.

use crate::utils::errors::{RelayError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.yml";

/// Dynamic configuration update pushed by the upstream broker
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DynamicConfigUpdate {
    pub bundle_name: String,
    pub config: Map<String, Value>,
}

/// Read/write access to the dynamic configuration tree
#[derive(Debug, Clone, Default)]
pub struct DynamicConfigStore {
    root: Option<PathBuf>,
}

impl DynamicConfigStore {
    /// `root` unset disables dynamic configuration
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    fn path_for(&self, bundle: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(bundle).join(CONFIG_FILE))
    }

    /// Configuration entries for `bundle`, as environment key/value pairs.
    ///
    /// A missing file means no configuration.
    pub async fn load(&self, bundle: &str) -> Result<Vec<(String, String)>> {
        let Some(path) = self.path_for(bundle) else {
            return Ok(Vec::new());
        };

        let source = match fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if source.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entries: Map<String, Value> = serde_yaml::from_str(&source)?;
        debug!("Loaded {} dynamic config entries for {}", entries.len(), bundle);
        Ok(flatten(&entries))
    }

    /// Atomically replace the configuration for a bundle
    pub async fn store(&self, update: &DynamicConfigUpdate) -> Result<()> {
        let Some(path) = self.path_for(&update.bundle_name) else {
            return Err(RelayError::Config("dynamic configuration is disabled".into()));
        };
        if update.bundle_name.is_empty()
            || update.bundle_name.contains('/')
            || update.bundle_name.starts_with('.')
        {
            return Err(RelayError::InvalidRequest(format!(
                "invalid bundle name '{}' in dynamic config update",
                update.bundle_name
            )));
        }

        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).await?;

        let contents = serde_yaml::to_string(&update.config)?;
        let staging = path.with_extension("yml.tmp");
        let mut file = fs::File::create(&staging).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&staging, &path).await?;

        info!(
            "Stored {} dynamic config entries for {}",
            update.config.len(),
            update.bundle_name
        );
        Ok(())
    }
}

/// Render a JSON map as environment pairs; non-string values are JSON-encoded
pub fn flatten(entries: &Map<String, Value>) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}
