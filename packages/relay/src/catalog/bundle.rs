// packages/relay/src/catalog/bundle.rs
//! Bundle definitions
//!
//! A bundle is a named, versioned set of commands. Bundles that declare a
//! Docker image run inside containers; the rest run as native processes.

use crate::utils::errors::{RelayError, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// An installed command bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    /// Bundle name, unique per relay
    pub name: String,

    /// Semantic version
    pub version: Version,

    /// Permissions the bundle's commands may require
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Image to run commands in; absent for native bundles
    #[serde(default)]
    pub docker: Option<DockerImage>,

    /// Commands by name
    #[serde(default)]
    pub commands: BTreeMap<String, BundleCommand>,

    /// Rendering templates by name
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
}

/// Container image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerImage {
    pub image: String,

    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl DockerImage {
    /// `image:tag` form understood by the container engine
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// A single command within a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleCommand {
    /// Executable path (inside the image for containerized bundles)
    pub executable: String,

    /// Declared options by name
    #[serde(default)]
    pub options: BTreeMap<String, CommandOption>,

    /// Authorization rules, passed through untouched
    #[serde(default)]
    pub rules: Vec<String>,
}

/// Declared command option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOption {
    #[serde(rename = "type", default = "default_option_type")]
    pub kind: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub short_flag: Option<String>,
}

fn default_option_type() -> String {
    "string".to_string()
}

/// Name/version reference used in announcements
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BundleRef {
    pub name: String,
    pub version: String,
}

impl Bundle {
    /// Parse and validate a YAML bundle definition
    pub fn from_yaml(source: &str) -> Result<Self> {
        let bundle: Bundle = serde_yaml::from_str(source)?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Parse and validate a JSON bundle definition
    pub fn from_json(source: &str) -> Result<Self> {
        let bundle: Bundle = serde_json::from_str(source)?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Check structural constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(':') || self.name.contains('/') {
            return Err(RelayError::Config(format!(
                "invalid bundle name '{}'",
                self.name
            )));
        }
        if self.commands.is_empty() {
            return Err(RelayError::Config(format!(
                "bundle '{}' declares no commands",
                self.name
            )));
        }
        for (name, command) in &self.commands {
            if command.executable.is_empty() {
                return Err(RelayError::Config(format!(
                    "command '{}:{}' has no executable",
                    self.name, name
                )));
            }
            if !self.is_containerized() && !Path::new(&command.executable).is_absolute() {
                return Err(RelayError::Config(format!(
                    "native command '{}:{}' must use an absolute executable path",
                    self.name, name
                )));
            }
        }
        if let Some(docker) = &self.docker {
            if docker.image.is_empty() {
                return Err(RelayError::Config(format!(
                    "bundle '{}' declares an empty image",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Whether commands run inside a container
    pub fn is_containerized(&self) -> bool {
        self.docker.is_some()
    }

    /// Image reference for containerized bundles
    pub fn image_ref(&self) -> Option<String> {
        self.docker.as_ref().map(DockerImage::reference)
    }

    pub fn command(&self, name: &str) -> Option<&BundleCommand> {
        self.commands.get(name)
    }

    pub fn bundle_ref(&self) -> BundleRef {
        BundleRef {
            name: self.name.clone(),
            version: self.version.to_string(),
        }
    }

    /// Identity check: same name and exactly the same version
    pub fn same_identity(&self, other: &Bundle) -> bool {
        self.name == other.name && self.version == other.version
    }
}
