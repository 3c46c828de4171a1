//! Configuration types for rlpack.

use crate::{Result, RlPackError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sequence packing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackingConfig {
    /// Width of every packed row.
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,

    /// Token id written into padding positions.
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: i64,

    /// Clip rows to `seq_len` instead of dropping results longer than a row.
    #[serde(default = "default_true")]
    pub truncate_long_results: bool,

    /// Seed for group id draws. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            seq_len: default_seq_len(),
            pad_token_id: default_pad_token_id(),
            truncate_long_results: true,
            seed: None,
        }
    }
}

impl PackingConfig {
    /// Create a config with the given row width.
    pub fn with_seq_len(seq_len: usize) -> Self {
        Self {
            seq_len,
            ..Default::default()
        }
    }

    /// Set the padding token id.
    pub fn pad_token_id(mut self, pad_token_id: i64) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    /// Set whether over-long results are truncated (true) or dropped (false).
    pub fn truncate_long_results(mut self, truncate: bool) -> Self {
        self.truncate_long_results = truncate;
        self
    }

    /// Fix the random seed used for id draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check the configuration for values the packer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.seq_len == 0 {
            return Err(RlPackError::Config("seq_len must be positive".into()));
        }
        Ok(())
    }
}

/// How advantages are derived from rewards when grouping overwrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdvantageNormalization {
    /// Reward minus the sibling-group mean.
    #[default]
    Group,
    /// Raw rewards.
    None,
}

/// Prompt grouping configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Shuffle siblings before assigning ids.
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Recompute advantages from rewards instead of keeping supplied ones.
    #[serde(default)]
    pub overwrite_advantages: bool,

    /// Baseline used when recomputing advantages.
    #[serde(default)]
    pub advantage_norm: AdvantageNormalization,

    /// Divide group-relative advantages by the group standard deviation.
    #[serde(default)]
    pub whiten_advantages: bool,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            shuffle: true,
            overwrite_advantages: false,
            advantage_norm: AdvantageNormalization::default(),
            whiten_advantages: false,
        }
    }
}

impl GroupingConfig {
    /// Keep siblings in their given order.
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self
    }

    /// Recompute advantages from rewards with the given baseline.
    pub fn with_advantages(mut self, norm: AdvantageNormalization, whiten: bool) -> Self {
        self.overwrite_advantages = true;
        self.advantage_norm = norm;
        self.whiten_advantages = whiten;
        self
    }
}

/// Top-level configuration file for the `rlpack` tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RlPackConfig {
    /// Packing settings.
    #[serde(default)]
    pub packing: PackingConfig,

    /// Grouping settings.
    #[serde(default)]
    pub grouping: GroupingConfig,

    /// Directory packed tensors are written to.
    #[serde(default)]
    pub output_dir: Option<String>,
}

impl RlPackConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.packing.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RlPackError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config {}: {}", path.as_ref().display(), e),
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

// Default value functions
fn default_seq_len() -> usize {
    2048
}
fn default_pad_token_id() -> i64 {
    -100
}
fn default_true() -> bool {
    true
}
