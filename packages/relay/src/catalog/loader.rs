// packages/relay/src/catalog/loader.rs
//! Bundle directory loader
//!
//! Reads every `*.yml`, `*.yaml` and `*.json` file in a directory as one bundle
//! definition. Files that cannot be read or parsed are logged and skipped so
//! one bad bundle does not hide the rest.

use crate::catalog::bundle::Bundle;
use crate::utils::errors::{RelayError, Result};
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

/// Load all valid bundle definitions from `dir`
pub async fn load_bundles(dir: &Path) -> Result<Vec<Bundle>> {
    let mut entries = fs::read_dir(dir).await.map_err(|e| {
        RelayError::Config(format!("cannot read bundle directory {}: {}", dir.display(), e))
    })?;

    let mut bundles = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let parse: fn(&str) -> Result<Bundle> = match extension.as_deref() {
            Some("yml") | Some("yaml") => Bundle::from_yaml,
            Some("json") => Bundle::from_json,
            _ => continue,
        };

        let parsed = match fs::read_to_string(&path).await {
            Ok(source) => parse(&source),
            Err(e) => Err(e.into()),
        };

        match parsed {
            Ok(bundle) => {
                debug!("Loaded bundle {} {} from {}", bundle.name, bundle.version, path.display());
                bundles.push(bundle);
            }
            Err(e) => warn!("Skipping bundle definition {}: {}", path.display(), e),
        }
    }

    bundles.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(bundles)
}
