// Soft updates mount configuration
// Serializable so it can be stored alongside the mount options

use crate::error::SoftdepError;
use crate::layout::{Geometry, DINODE_SIZE, NDADDR, NIADDR};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftdepConfig {
    /// Filesystem block size in bytes
    pub block_size: u32,
    /// Fragment size in bytes; block numbers are counted in fragments
    pub frag_size: u32,
    /// Live inodedep/dirrem count above which cleanup is requested
    pub max_dependencies: usize,
    /// Flush and worklist passes `drain_all` makes before giving up
    pub drain_passes: usize,
    /// Interval between background worklist runs
    pub syncer_interval_ms: u64,
}

impl Default for SoftdepConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            frag_size: 1024,
            max_dependencies: 10_000,
            drain_passes: 32,
            syncer_interval_ms: 1000,
        }
    }
}

impl SoftdepConfig {
    pub fn validate(&self) -> Result<(), SoftdepError> {
        if !self.block_size.is_power_of_two() || !self.frag_size.is_power_of_two() {
            return Err(SoftdepError::Configuration(format!(
                "block size {} and fragment size {} must be powers of two",
                self.block_size, self.frag_size
            )));
        }
        if self.frag_size > self.block_size || self.block_size / self.frag_size > 8 {
            return Err(SoftdepError::Configuration(format!(
                "a block must hold between 1 and 8 fragments (block {}, fragment {})",
                self.block_size, self.frag_size
            )));
        }
        if (self.block_size as usize) < DINODE_SIZE || (self.block_size as usize) < 8 * (NDADDR + NIADDR) {
            return Err(SoftdepError::Configuration(format!(
                "block size {} is too small",
                self.block_size
            )));
        }
        if self.drain_passes == 0 {
            return Err(SoftdepError::Configuration("drain_passes must be at least 1".to_string()));
        }
        if self.max_dependencies == 0 {
            return Err(SoftdepError::Configuration("max_dependencies must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.block_size, self.frag_size)
    }

    pub fn from_json(text: &str) -> Result<Self, SoftdepError> {
        let config: SoftdepConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SoftdepError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, SoftdepError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
