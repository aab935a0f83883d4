// packages/relay/src/catalog/registry.rs
//! Versioned bundle catalog
//!
//! The catalog maps bundle names to the installed bundle and carries two
//! counters:
//!
//! - `epoch` grows by one for every change to membership, explicit removal,
//!   or transport reconnect
//! - `last_acked` is the newest epoch the upstream broker acknowledged
//!
//! The catalog needs announcing while `last_acked < epoch`. `last_acked`
//! never passes `epoch`.

use crate::catalog::bundle::{Bundle, BundleRef};
use parking_lot::RwLock;
use semver::Version;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time view of catalog membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub epoch: u64,
    pub bundles: Vec<BundleRef>,
}

#[derive(Debug, Default)]
struct CatalogState {
    bundles: HashMap<String, Arc<Bundle>>,
    epoch: u64,
    last_acked: u64,
}

/// Concurrent registry of installed bundles
#[derive(Debug, Default)]
pub struct BundleCatalog {
    state: RwLock<CatalogState>,
}

impl BundleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace catalog contents with `bundles`, applying only the difference.
    ///
    /// Returns true when at least one bundle was added or removed, in which
    /// case the epoch advanced by exactly one.
    pub fn replace(&self, bundles: Vec<Bundle>) -> bool {
        let incoming: HashMap<String, Bundle> = bundles
            .into_iter()
            .map(|bundle| (bundle.name.clone(), bundle))
            .collect();

        let mut state = self.state.write();

        let removed: Vec<String> = state
            .bundles
            .iter()
            .filter(|(name, current)| match incoming.get(*name) {
                Some(candidate) => !current.same_identity(candidate),
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect();

        let added: Vec<Bundle> = incoming
            .into_values()
            .filter(|candidate| match state.bundles.get(&candidate.name) {
                Some(current) => !current.same_identity(candidate),
                None => true,
            })
            .collect();

        if removed.is_empty() && added.is_empty() {
            return false;
        }

        for name in &removed {
            state.bundles.remove(name);
        }
        for bundle in added.iter() {
            state
                .bundles
                .insert(bundle.name.clone(), Arc::new(bundle.clone()));
        }
        state.epoch += 1;

        info!(
            "Catalog epoch {}: {} removed, {} added, {} installed",
            state.epoch,
            removed.len(),
            added.len(),
            state.bundles.len()
        );
        true
    }

    /// Remove one bundle; always advances the epoch.
    ///
    /// Returns whether the bundle was installed.
    pub fn remove(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let existed = state.bundles.remove(name).is_some();
        state.epoch += 1;
        debug!("Removed bundle {} (present: {}), epoch {}", name, existed, state.epoch);
        existed
    }

    /// Record an upstream acknowledgment.
    ///
    /// Acks from the future are ignored; returns whether the ack was applied.
    pub fn epoch_acked(&self, acked: u64) -> bool {
        let mut state = self.state.write();
        if acked > state.epoch {
            warn!(
                "Ignoring ack for epoch {} beyond current epoch {}",
                acked, state.epoch
            );
            return false;
        }
        state.last_acked = acked;
        true
    }

    /// Force a fresh announcement after a transport reconnect
    pub fn reconnected(&self) -> u64 {
        let mut state = self.state.write();
        state.epoch += 1;
        debug!("Reconnected, catalog epoch now {}", state.epoch);
        state.epoch
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Bundle>> {
        self.state.read().bundles.get(name).cloned()
    }

    /// Epoch and bundle refs read under one lock, sorted by name
    pub fn snapshot(&self) -> CatalogSnapshot {
        let state = self.state.read();
        let mut bundles: Vec<BundleRef> = state.bundles.values().map(|b| b.bundle_ref()).collect();
        bundles.sort();
        CatalogSnapshot {
            epoch: state.epoch,
            bundles,
        }
    }

    /// Installed version of every bundle
    pub fn versions(&self) -> HashMap<String, Version> {
        self.state
            .read()
            .bundles
            .iter()
            .map(|(name, bundle)| (name.clone(), bundle.version.clone()))
            .collect()
    }

    /// Whether the current epoch still needs acknowledging
    pub fn changed(&self) -> bool {
        let state = self.state.read();
        state.last_acked < state.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    pub fn last_acked(&self) -> u64 {
        self.state.read().last_acked
    }

    pub fn len(&self) -> usize {
        self.state.read().bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().bundles.is_empty()
    }
}
