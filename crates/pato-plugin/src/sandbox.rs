//! WASM plugin sandbox using Extism (wasmtime).
//!
//! The lifecycle manager only sees [`Component`]: an opaque, already
//! verified instance exposing named exports. [`WasmSource`] produces Extism
//! backed components with memory limits, fuel-based execution limits, and
//! the `pato_*` host functions bound to the plugin's [`HostHandle`].

use std::path::{Path, PathBuf};

use extism::{host_fn, UserData, PTR};
use thiserror::Error;

use crate::capability::CapabilitySet;
use crate::error::PluginError;
use crate::gateway::HostHandle;
use crate::manifest::{PluginId, PluginManifest};

/// Host function import names and the gateway function each one invokes.
pub const HOST_FUNCTIONS: &[(&str, &str)] = &[
    ("pato_subscribe", "subscribe-to-event"),
    ("pato_send_message", "send-message"),
    ("pato_set_status", "set-status"),
    ("pato_emit_event", "emit-event"),
    ("pato_call_plugin", "call-plugin"),
    ("pato_http_get", "http-get"),
    ("pato_log", "log"),
];

// ─── Component abstraction ──────────────────────────────────────────────

/// Why a call into a component did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComponentFault {
    #[error("trap: {0}")]
    Trap(String),
    #[error("fuel exhausted")]
    FuelExhausted,
    #[error("memory limit exceeded")]
    MemoryExceeded,
    #[error("missing export '{0}'")]
    MissingExport(String),
}

/// A live plugin instance. Single-threaded: the owner serializes calls.
pub trait Component: Send + 'static {
    fn call(&mut self, export: &str, input: &[u8]) -> Result<Vec<u8>, ComponentFault>;

    fn has_export(&self, export: &str) -> bool;
}

/// Creates a component bound to its plugin's host handle.
pub trait ComponentSource: Send + Sync {
    fn instantiate(&self, host: HostHandle) -> Result<Box<dyn Component>, PluginError>;
}

impl<F> ComponentSource for F
where
    F: Fn(HostHandle) -> Result<Box<dyn Component>, PluginError> + Send + Sync,
{
    fn instantiate(&self, host: HostHandle) -> Result<Box<dyn Component>, PluginError> {
        self(host)
    }
}

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per execution (default: 1_000_000).
    pub fuel_limit: u64,
    /// Whether to enable WASI (default: false).
    /// Filesystem grants are only reachable with WASI enabled.
    pub wasi_enabled: bool,
    /// Root of per-plugin data directories backing filesystem grants.
    pub data_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            wasi_enabled: false,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            wasi_enabled: std::env::var("PLUGIN_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
            data_dir: std::env::var("PATO_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
        }
    }

    /// Host directory backing filesystem scope `scope` of `plugin`.
    pub fn scope_dir(&self, plugin: &PluginId, scope: &str) -> PathBuf {
        self.data_dir.join(plugin.as_str()).join(scope)
    }
}

// ─── Extism-backed components ───────────────────────────────────────────

struct HostBinding {
    host: HostHandle,
    function: &'static str,
}

host_fn!(pato_host_call(binding: HostBinding; request: String) -> String {
    let binding = binding.get()?;
    let (host, function) = {
        let binding = binding
            .lock()
            .map_err(|_| extism::Error::msg("host binding lock poisoned"))?;
        (binding.host.clone(), binding.function)
    };
    Ok(host.invoke_json(function, &request))
});

/// A verified WASM module plus the grants that shape its sandbox.
pub struct WasmSource {
    wasm: Vec<u8>,
    plugin: PluginId,
    capabilities: CapabilitySet,
    config: SandboxConfig,
}

impl std::fmt::Debug for WasmSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmSource")
            .field("plugin", &self.plugin)
            .field("wasm_bytes", &self.wasm.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WasmSource {
    pub fn new(
        wasm: Vec<u8>,
        manifest: &PluginManifest,
        config: SandboxConfig,
    ) -> Result<Self, PluginError> {
        Ok(Self {
            wasm,
            plugin: manifest.id(),
            capabilities: manifest.declared_capabilities()?,
            config,
        })
    }

    /// Read the module named by `[build] wasm` relative to `plugin_dir`.
    pub fn from_dir(
        plugin_dir: &Path,
        manifest: &PluginManifest,
        config: SandboxConfig,
    ) -> Result<Self, PluginError> {
        let wasm = std::fs::read(plugin_dir.join(&manifest.build.wasm))?;
        Self::new(wasm, manifest, config)
    }

    fn build_plugin(&self, host: Option<&HostHandle>) -> Result<extism::Plugin, PluginError> {
        let mut manifest = extism::Manifest::new([extism::Wasm::data(self.wasm.clone())])
            .with_memory_max((self.config.memory_limit / 65536) as u32)
            .with_allowed_hosts(self.capabilities.network_scopes().into_iter());

        let scopes = self.capabilities.filesystem_scopes();
        if !scopes.is_empty() && !self.config.wasi_enabled {
            tracing::warn!(
                plugin = %self.plugin,
                "filesystem grants declared but WASI is disabled; paths are unreachable"
            );
        }
        for scope in scopes {
            let dir = self.config.scope_dir(&self.plugin, &scope);
            std::fs::create_dir_all(&dir)?;
            manifest = manifest.with_allowed_path(dir.to_string_lossy().into_owned(), format!("/{scope}"));
        }

        let mut builder = extism::PluginBuilder::new(manifest)
            .with_wasi(self.config.wasi_enabled)
            .with_fuel_limit(self.config.fuel_limit);

        if self.config.wasi_enabled {
            tracing::warn!(
                plugin = %self.plugin,
                "WASI enabled for plugin; it can read environment variables"
            );
        }

        if let Some(host) = host {
            for &(import, function) in HOST_FUNCTIONS {
                builder = builder.with_function(
                    import,
                    [PTR],
                    [PTR],
                    UserData::new(HostBinding {
                        host: host.clone(),
                        function,
                    }),
                    pato_host_call,
                );
            }
        }

        builder
            .build()
            .map_err(|e| PluginError::Sandbox(e.to_string()))
    }
}

impl ComponentSource for WasmSource {
    fn instantiate(&self, host: HostHandle) -> Result<Box<dyn Component>, PluginError> {
        let plugin = self.build_plugin(Some(&host))?;
        tracing::debug!(plugin = %self.plugin, "wasm component instantiated");
        Ok(Box::new(WasmComponent { plugin }))
    }
}

/// Extism plugin instance. Each call gets a fresh fuel budget.
pub struct WasmComponent {
    plugin: extism::Plugin,
}

impl Component for WasmComponent {
    fn call(&mut self, export: &str, input: &[u8]) -> Result<Vec<u8>, ComponentFault> {
        if !self.plugin.function_exists(export) {
            return Err(ComponentFault::MissingExport(export.to_string()));
        }
        self.plugin
            .call::<&[u8], Vec<u8>>(export, input)
            .map_err(|e| classify_fault(&e.to_string()))
    }

    fn has_export(&self, export: &str) -> bool {
        self.plugin.function_exists(export)
    }
}

fn classify_fault(message: &str) -> ComponentFault {
    if message.contains("fuel") {
        ComponentFault::FuelExhausted
    } else if ["out of memory", "memory limit", "maximum memory"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        ComponentFault::MemoryExceeded
    } else {
        ComponentFault::Trap(message.to_string())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
