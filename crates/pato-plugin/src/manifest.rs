//! Plugin manifest parsing and validation.
//!
//! Parses `plugin.toml` files that declare plugin identity, capabilities,
//! initial event subscriptions, and optional inter-plugin imports/exports.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::{Capability, CapabilitySet, ServiceAction};
use crate::error::PluginError;
use crate::events::EventPattern;

/// Export names the host calls directly; interfaces may not shadow them.
pub const RESERVED_EXPORTS: &[&str] = &["init", "shutdown", "handle_event", "get_ui_config"];

/// Stable identity of a loaded plugin (its manifest name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(String);

impl PluginId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Plugin manifest parsed from `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMeta,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub capabilities: CapabilityDecl,
    #[serde(default)]
    pub events: EventsDecl,
    #[serde(default)]
    pub imports: Vec<ImportDecl>,
    #[serde(default)]
    pub exports: Vec<ExportDecl>,
}

/// Plugin metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub min_host_version: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
}

/// Build configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_wasm")]
    pub wasm: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            wasm: default_wasm(),
        }
    }
}

fn default_wasm() -> String {
    "plugin.wasm".to_string()
}

/// Declared capability grants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityDecl {
    #[serde(default)]
    pub network: Vec<String>,
    #[serde(default)]
    pub filesystem: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
    #[serde(default)]
    pub emit: Vec<String>,
    #[serde(default)]
    pub services: Vec<ServiceGrant>,
}

/// Credential-scoped access to one external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceGrant {
    pub service: String,
    pub actions: BTreeSet<ServiceAction>,
}

/// Subscriptions created when the plugin reaches `Initialized`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsDecl {
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// An optional dependency on an interface exported by another plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDecl {
    pub interface: String,
    /// Restrict the match to one exporting plugin.
    #[serde(default)]
    pub plugin: Option<String>,
    /// Semver requirement on the exported interface version.
    #[serde(default)]
    pub version: Option<String>,
}

/// An interface this plugin serves to other plugins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDecl {
    pub interface: String,
    #[serde(default = "default_interface_version")]
    pub version: String,
}

fn default_interface_version() -> String {
    "1.0.0".to_string()
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a plugin name against `^[a-z][a-z0-9-]{1,63}$`.
fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    let len = name.len();
    if !(2..=64).contains(&len) {
        return Err(PluginError::InvalidManifest(format!(
            "plugin name must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = name.chars();

    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(PluginError::InvalidManifest(format!(
                "plugin name must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(PluginError::InvalidManifest(format!(
                "plugin name contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

/// Interface names become export names, so they follow `^[a-z][a-z0-9_]{0,63}$`.
fn validate_interface_name(name: &str) -> Result<(), PluginError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(PluginError::InvalidManifest(format!(
            "interface name '{name}' must match [a-z][a-z0-9_]{{0,63}}"
        )));
    }
    if RESERVED_EXPORTS.contains(&name) {
        return Err(PluginError::InvalidManifest(format!(
            "interface name '{name}' is reserved"
        )));
    }
    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<(), PluginError> {
    semver::Version::parse(value).map_err(|_| {
        PluginError::InvalidManifest(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), PluginError> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(PluginError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    for component in p.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(PluginError::InvalidManifest(format!(
                "{field_name} must not contain '..': '{path}'"
            )));
        }
    }
    Ok(())
}

/// Validate a network scope entry.
///
/// Must be non-empty, contain no spaces, and either be `"*"`, `"localhost"`,
/// or contain at least one dot.
fn validate_network_scope(host: &str) -> Result<(), PluginError> {
    if host.is_empty() {
        return Err(PluginError::InvalidManifest(
            "capabilities.network entry must not be empty".into(),
        ));
    }
    if host.contains(' ') {
        return Err(PluginError::InvalidManifest(format!(
            "capabilities.network entry must not contain spaces: '{host}'"
        )));
    }
    if host != "*" && host != "localhost" && !host.contains('.') {
        return Err(PluginError::InvalidManifest(format!(
            "capabilities.network entry is not a valid domain: '{host}'"
        )));
    }
    Ok(())
}

fn parse_patterns(values: &[String], field_name: &str) -> Result<Vec<EventPattern>, PluginError> {
    values
        .iter()
        .map(|v| {
            EventPattern::parse(v)
                .map_err(|e| PluginError::InvalidManifest(format!("{field_name}: {e}")))
        })
        .collect()
}

impl PluginManifest {
    /// Parse a plugin manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    /// Validate all fields of a parsed manifest.
    pub fn validate(&self) -> Result<(), PluginError> {
        // ── Plugin metadata ─────────────────────────────────────────
        validate_plugin_name(&self.plugin.name)?;
        validate_semver(&self.plugin.version, "plugin.version")?;

        if let Some(ref desc) = self.plugin.description {
            if desc.len() > 500 {
                return Err(PluginError::InvalidManifest(format!(
                    "plugin.description must be at most 500 characters, got {}",
                    desc.len()
                )));
            }
        }

        if let Some(ref author) = self.plugin.author {
            let len = author.len();
            if len == 0 || len > 255 {
                return Err(PluginError::InvalidManifest(format!(
                    "plugin.author must be 1-255 characters, got {len}"
                )));
            }
        }

        if let Some(ref min_ver) = self.plugin.min_host_version {
            validate_semver(min_ver, "plugin.min_host_version")?;
        }

        // ── Build config ────────────────────────────────────────────
        validate_path_safety(&self.build.wasm, "build.wasm")?;
        if !self.build.wasm.ends_with(".wasm") {
            return Err(PluginError::InvalidManifest(format!(
                "build.wasm must end with '.wasm', got '{}'",
                self.build.wasm
            )));
        }

        // ── Capabilities ────────────────────────────────────────────
        for host in &self.capabilities.network {
            validate_network_scope(host)?;
        }
        for scope in &self.capabilities.filesystem {
            if scope.is_empty() {
                return Err(PluginError::InvalidManifest(
                    "capabilities.filesystem entry must not be empty".into(),
                ));
            }
            validate_path_safety(scope, "capabilities.filesystem")?;
        }
        for grant in &self.capabilities.services {
            if grant.service.trim().is_empty() {
                return Err(PluginError::InvalidManifest(
                    "capabilities.services entry has an empty service name".into(),
                ));
            }
            if grant.actions.is_empty() {
                return Err(PluginError::InvalidManifest(format!(
                    "capabilities.services entry for '{}' grants no actions",
                    grant.service
                )));
            }
        }
        let subscribe_grants = parse_patterns(&self.capabilities.subscribe, "capabilities.subscribe")?;
        parse_patterns(&self.capabilities.emit, "capabilities.emit")?;

        // ── Initial subscriptions must be covered by a grant ────────
        for pattern in parse_patterns(&self.events.subscribe, "events.subscribe")? {
            if !subscribe_grants.iter().any(|g| g.covers(&pattern)) {
                return Err(PluginError::InvalidManifest(format!(
                    "events.subscribe '{pattern}' is not covered by capabilities.subscribe"
                )));
            }
        }

        // ── Imports / exports ───────────────────────────────────────
        for import in &self.imports {
            validate_interface_name(&import.interface)?;
            if let Some(ref plugin) = import.plugin {
                validate_plugin_name(plugin)?;
                if plugin == &self.plugin.name {
                    return Err(PluginError::InvalidManifest(format!(
                        "import '{}' targets the plugin itself",
                        import.interface
                    )));
                }
            }
            if let Some(ref req) = import.version {
                semver::VersionReq::parse(req).map_err(|_| {
                    PluginError::InvalidManifest(format!(
                        "import '{}' has an invalid version requirement: '{req}'",
                        import.interface
                    ))
                })?;
            }
        }

        let mut seen = BTreeSet::new();
        for export in &self.exports {
            validate_interface_name(&export.interface)?;
            validate_semver(&export.version, "exports.version")?;
            if !seen.insert(export.interface.as_str()) {
                return Err(PluginError::InvalidManifest(format!(
                    "interface '{}' is exported twice",
                    export.interface
                )));
            }
        }

        Ok(())
    }

    /// Parse and validate a plugin manifest from a TOML string.
    pub fn parse_and_validate(toml_str: &str) -> Result<Self, PluginError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject manifests that need a newer host than `host_version`.
    pub fn check_host_compatibility(&self, host_version: &str) -> Result<(), PluginError> {
        let Some(ref min) = self.plugin.min_host_version else {
            return Ok(());
        };
        let min = semver::Version::parse(min)?;
        let host = semver::Version::parse(host_version)?;
        if host < min {
            return Err(PluginError::InvalidManifest(format!(
                "plugin {} requires host >= {min}, running {host}",
                self.plugin.name
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> PluginId {
        PluginId::new(&self.plugin.name)
    }

    /// Grants declared by the manifest. `InterPlugin` grants are never
    /// declared here; the resolver creates them.
    pub fn declared_capabilities(&self) -> Result<CapabilitySet, PluginError> {
        let decl = &self.capabilities;
        let mut grants = Vec::new();
        grants.extend(decl.network.iter().map(|scope| Capability::Network {
            scope: scope.clone(),
        }));
        grants.extend(decl.filesystem.iter().map(|scope| Capability::Filesystem {
            scope: scope.clone(),
        }));
        grants.extend(decl.services.iter().map(|g| Capability::ServiceApi {
            service: g.service.clone(),
            actions: g.actions.clone(),
        }));
        grants.extend(
            parse_patterns(&decl.subscribe, "capabilities.subscribe")?
                .into_iter()
                .map(|pattern| Capability::EventSubscribe { pattern }),
        );
        grants.extend(
            parse_patterns(&decl.emit, "capabilities.emit")?
                .into_iter()
                .map(|pattern| Capability::EventEmit { pattern }),
        );
        Ok(CapabilitySet::new(grants))
    }

    pub fn initial_subscriptions(&self) -> Result<Vec<EventPattern>, PluginError> {
        parse_patterns(&self.events.subscribe, "events.subscribe")
    }

    /// Whether this plugin declares an import that may be served by `target`.
    pub fn imports_from(&self, target: &PluginId, interface: &str) -> bool {
        self.imports.iter().any(|i| {
            i.interface == interface && i.plugin.as_deref().map_or(true, |p| p == target.as_str())
        })
    }

    pub fn export(&self, interface: &str) -> Option<&ExportDecl> {
        self.exports.iter().find(|e| e.interface == interface)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
