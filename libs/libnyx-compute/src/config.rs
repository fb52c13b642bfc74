//! Runtime configuration

use crate::computer::ExecMode;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default platform listing bound
pub const DEFAULT_MAX_PLATFORMS: usize = 32;
/// Default per-kind device listing bound
pub const DEFAULT_MAX_DEVICES: usize = 32;
/// Default number of distinct contexts a single resource may be cached for
pub const DEFAULT_CACHE_CAPACITY: usize = 16;
/// Default upper bound on kernel source length, in bytes
pub const DEFAULT_MAX_SOURCE_LEN: usize = 1024 * 1024;

/// Compute runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Platforms kept by a directory listing
    pub max_platforms: usize,
    /// Devices of each kind kept per platform
    pub max_devices: usize,
    /// Distinct contexts per program, kernel or buffer
    pub cache_capacity: usize,
    /// Longest kernel source the loader accepts
    pub max_source_len: usize,
    /// Options handed to the device compiler on every build
    pub build_options: String,
    /// Mode used when the caller does not pick one
    pub default_exec_mode: ExecMode,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            max_platforms: DEFAULT_MAX_PLATFORMS,
            max_devices: DEFAULT_MAX_DEVICES,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_source_len: DEFAULT_MAX_SOURCE_LEN,
            build_options: String::new(),
            default_exec_mode: ExecMode::Sync,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<ComputeConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    } else {
        Ok(ComputeConfig::default())
    }
}
