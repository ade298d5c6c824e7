//! Inter-plugin dependency resolver.
//!
//! Plugins declare the interfaces they export and import. When a plugin
//! initializes, its imports are matched against the exports of every peer
//! that is already initialized (and vice versa). Each match becomes a
//! [`Route`], which is the only thing that authorizes a `CallPlugin` on that
//! path. Routes are removed as soon as either end starts shutting down.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::manifest::{PluginId, PluginManifest};

/// Authorizes `source` to call `interface` exported by `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Route {
    pub source: PluginId,
    pub target: PluginId,
    pub interface: String,
}

impl Route {
    pub fn capability(&self) -> Capability {
        Capability::InterPlugin {
            target: self.target.clone(),
            interface: self.interface.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct InterPluginResolver {
    routes: RwLock<BTreeSet<Route>>,
}

impl InterPluginResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create every route between `manifest` and the given peers, in both
    /// directions. Returns the routes that were added.
    pub fn resolve<'a>(
        &self,
        manifest: &PluginManifest,
        peers: impl IntoIterator<Item = &'a PluginManifest>,
    ) -> Vec<Route> {
        let id = manifest.id();
        let mut found = Vec::new();
        for peer in peers {
            let peer_id = peer.id();
            if peer_id == id {
                continue;
            }
            found.extend(matching_routes(manifest, peer));
            found.extend(matching_routes(peer, manifest));
        }

        let mut routes = self.write();
        found.retain(|route| routes.insert(route.clone()));
        for route in &found {
            tracing::info!(
                source = %route.source,
                target = %route.target,
                interface = %route.interface,
                "inter-plugin route established"
            );
        }
        found
    }

    /// Drop every route into or out of `plugin`.
    pub fn remove(&self, plugin: &PluginId) -> usize {
        let mut routes = self.write();
        let before = routes.len();
        routes.retain(|r| &r.source != plugin && &r.target != plugin);
        let removed = before - routes.len();
        if removed > 0 {
            tracing::debug!(plugin = %plugin, removed, "inter-plugin routes removed");
        }
        removed
    }

    pub fn route(&self, source: &PluginId, target: &PluginId, interface: &str) -> Option<Route> {
        self.read()
            .iter()
            .find(|r| &r.source == source && &r.target == target && r.interface == interface)
            .cloned()
    }

    pub fn has_route(&self, source: &PluginId, target: &PluginId, interface: &str) -> bool {
        self.route(source, target, interface).is_some()
    }

    pub fn routes_from(&self, source: &PluginId) -> Vec<Route> {
        self.read()
            .iter()
            .filter(|r| &r.source == source)
            .cloned()
            .collect()
    }

    pub fn routes_to(&self, target: &PluginId) -> Vec<Route> {
        self.read()
            .iter()
            .filter(|r| &r.target == target)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeSet<Route>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeSet<Route>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes from `importer` to `exporter`.
fn matching_routes(importer: &PluginManifest, exporter: &PluginManifest) -> Vec<Route> {
    let source = importer.id();
    let target = exporter.id();
    importer
        .imports
        .iter()
        .filter(|import| import.plugin.as_deref().is_none_or(|p| p == target.as_str()))
        .filter_map(|import| {
            let export = exporter.export(&import.interface)?;
            version_satisfies(import.version.as_deref(), &export.version).then(|| Route {
                source: source.clone(),
                target: target.clone(),
                interface: import.interface.clone(),
            })
        })
        .collect()
}

fn version_satisfies(requirement: Option<&str>, exported: &str) -> bool {
    let Some(requirement) = requirement else {
        return true;
    };
    match (VersionReq::parse(requirement), Version::parse(exported)) {
        (Ok(req), Ok(version)) => req.matches(&version),
        _ => false,
    }
}
