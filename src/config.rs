//! Engine configuration.
//!
//! Every field has a default so an empty JSON object (or no file at all) is a
//! valid configuration. Keys are camelCase to match the node catalog.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    HighPerformance,
    LowPower,
}

impl PowerPreference {
    pub fn to_wgpu(self) -> wgpu::PowerPreference {
        match self {
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Upper bound for targets evaluated by the interactive context.
    pub interactive_resolution: [u32; 2],
    /// Size given to a stage's target when it is created.
    pub default_target_size: [u32; 2],
    /// Resolution of the batch context used for forced animation runs.
    pub batch_resolution: [u32; 2],
    pub shader_dir: Option<PathBuf>,
    pub node_types: Option<PathBuf>,
    pub environment_map: Option<PathBuf>,
    pub power_preference: PowerPreference,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interactive_resolution: [1024, 1024],
            default_target_size: [256, 256],
            batch_resolution: [1024, 1024],
            shader_dir: None,
            node_types: None,
            environment_map: None,
            power_preference: PowerPreference::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|e| anyhow!("invalid engine config json: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        for (key, [w, h]) in [
            ("interactiveResolution", self.interactive_resolution),
            ("defaultTargetSize", self.default_target_size),
            ("batchResolution", self.batch_resolution),
        ] {
            if w == 0 || h == 0 {
                bail!("{key} must be non-zero, got {w}x{h}");
            }
        }
        Ok(())
    }

    /// Default target size clamped to the interactive bound.
    pub fn initial_target_size(&self) -> [u32; 2] {
        [
            self.default_target_size[0].min(self.interactive_resolution[0]),
            self.default_target_size[1].min(self.interactive_resolution[1]),
        ]
    }
}
