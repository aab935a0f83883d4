// packages/relay/src/catalog/mod.rs
//! Bundle catalog
//!
//! - **Bundle**: parsed, validated bundle definitions
//! - **Registry**: the epoch-versioned catalog shared by workers and the announcer
//! - **Loader**: reads bundle definitions from a directory
//!
//! The catalog is built once at startup and handed to every component that
//! needs it; there is no global instance.

pub mod bundle;
pub mod loader;
pub mod registry;

// Re-export commonly used types
pub use bundle::{Bundle, BundleCommand, BundleRef, CommandOption, DockerImage};
pub use loader::load_bundles;
pub use registry::{BundleCatalog, CatalogSnapshot};

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Bundle, BundleCommand, DockerImage};
    use semver::Version;
    use std::collections::BTreeMap;

    /// Native bundle with a single `run` command
    pub fn bundle(name: &str, version: &str) -> Bundle {
        let mut commands = BTreeMap::new();
        commands.insert(
            "run".to_string(),
            BundleCommand {
                executable: format!("/opt/{}/run", name),
                options: BTreeMap::new(),
                rules: vec![],
            },
        );
        Bundle {
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
            permissions: vec![],
            docker: None,
            commands,
            templates: BTreeMap::new(),
        }
    }

    /// Containerized variant of [`bundle`]
    pub fn container_bundle(name: &str, version: &str) -> Bundle {
        Bundle {
            docker: Some(DockerImage {
                image: format!("operable/{}", name),
                tag: version.to_string(),
            }),
            ..bundle(name, version)
        }
    }
}
