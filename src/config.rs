//! Engine configuration
//!
//! Loaded from a TOML file. Every field has a default so a partial file (or no
//! file at all) is valid:
//!
//! ```toml
//! [cache]
//! max_cached_layers = 16
//! max_buffers_per_layer = 32
//!
//! [vsync]
//! default_transient_duration = 2
//!
//! [debug]
//! atomic_dump_interval_ms = 30000
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable holding the path of the config file
pub const CONFIG_ENV: &str = "DRM_ENGINE_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheLimits,
    #[serde(default)]
    pub vsync: VsyncConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Framebuffer cache caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Owners tracked in the non-secure cache before a shrink is scheduled
    #[serde(default = "default_max_cached_layers")]
    pub max_cached_layers: usize,
    /// Owners tracked in the secure cache before a shrink is scheduled
    #[serde(default = "default_max_cached_secure_layers")]
    pub max_cached_secure_layers: usize,
    /// Framebuffers kept per owner before the owner's bucket is dropped
    #[serde(default = "default_max_buffers_per_layer")]
    pub max_buffers_per_layer: usize,
    #[serde(default = "default_max_secure_buffers_per_layer")]
    pub max_secure_buffers_per_layer: usize,
}

fn default_max_cached_layers() -> usize { 16 }
fn default_max_cached_secure_layers() -> usize { 1 }
fn default_max_buffers_per_layer() -> usize { 32 }
fn default_max_secure_buffers_per_layer() -> usize { 3 }

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_cached_layers: default_max_cached_layers(),
            max_cached_secure_layers: default_max_cached_secure_layers(),
            max_buffers_per_layer: default_max_buffers_per_layer(),
            max_secure_buffers_per_layer: default_max_secure_buffers_per_layer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsyncConfig {
    /// Vsync periods a refresh-rate switch may take to settle, used when the
    /// connector does not expose `rr_switch_duration`
    #[serde(default = "default_transient_duration")]
    pub default_transient_duration: u32,
}

fn default_transient_duration() -> u32 { 2 }

impl Default for VsyncConfig {
    fn default() -> Self {
        Self {
            default_transient_duration: default_transient_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Minimum time between two verbose re-tests of a rejected commit
    #[serde(default = "default_dump_interval")]
    pub atomic_dump_interval_ms: u64,
    /// Kernel module parameter toggled around the verbose re-test.
    /// `None` disables the re-test entirely.
    #[serde(default = "default_debug_node")]
    pub drm_debug_node: Option<PathBuf>,
    #[serde(default = "default_debug_enable_value")]
    pub drm_debug_enable_value: u32,
}

fn default_dump_interval() -> u64 { 30_000 }
fn default_debug_node() -> Option<PathBuf> {
    Some(PathBuf::from("/sys/module/drm/parameters/debug"))
}
fn default_debug_enable_value() -> u32 { 0x10 } // DRM_UT_ATOMIC

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            atomic_dump_interval_ms: default_dump_interval(),
            drm_debug_node: default_debug_node(),
            drm_debug_enable_value: default_debug_enable_value(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    /// Load the file named by `DRM_ENGINE_CONFIG`, or fall back to defaults
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            match Self::load(Path::new(&path)) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("Ignoring engine config {}: {}", path, e),
            }
        }
        tracing::info!("No engine config found, using defaults");
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.cache.max_buffers_per_layer == 0 || self.cache.max_secure_buffers_per_layer == 0 {
            return Err(Error::Config("per-layer buffer caps must be at least 1".into()));
        }
        if self.vsync.default_transient_duration == 0 {
            return Err(Error::Config("default_transient_duration must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [cache]
            max_cached_layers = 4

            [debug]
            atomic_dump_interval_ms = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.max_cached_layers, 4);
        assert_eq!(config.cache.max_buffers_per_layer, 32);
        assert_eq!(config.vsync.default_transient_duration, 2);
        assert_eq!(config.debug.atomic_dump_interval_ms, 10);
        assert!(config.debug.drm_debug_node.is_some());
    }

    #[test]
    fn test_zero_buffer_cap_rejected() {
        let err = EngineConfig::from_toml("[cache]\nmax_buffers_per_layer = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(EngineConfig::from_toml("[cache\n").is_err());
    }
}
