//! Common type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a packed channel as laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 64-bit signed integer.
    Int64,
    /// 32-bit floating point.
    Float32,
    /// Boolean, one byte holding 0 or 1.
    Bool,
}

impl Dtype {
    /// Size of the dtype in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        match self {
            Self::Int64 => 8,
            Self::Float32 => 4,
            Self::Bool => 1,
        }
    }
}

/// One of the nine aligned per-token channels produced by packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Token ids.
    Tokens,
    /// Per-candidate group ids used for attention segregation.
    GroupIds,
    /// Prompt ids the candidate additionally attends to.
    ParentIds,
    /// Position indices.
    InputPos,
    /// Supervised-position flags.
    AssistantMask,
    /// Sampling log-probabilities.
    Logprobs,
    /// Per-token advantages.
    Advantages,
    /// Normalized per-token loss weights.
    Weights,
    /// Deferred-loss flags.
    Deferred,
}

impl Channel {
    /// All channels in canonical order.
    pub const ALL: [Channel; 9] = [
        Channel::Tokens,
        Channel::GroupIds,
        Channel::ParentIds,
        Channel::InputPos,
        Channel::AssistantMask,
        Channel::Logprobs,
        Channel::Advantages,
        Channel::Weights,
        Channel::Deferred,
    ];

    /// Channel name as used in file names and row mappings.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::GroupIds => "group_ids",
            Self::ParentIds => "parent_ids",
            Self::InputPos => "input_pos",
            Self::AssistantMask => "assistant_mask",
            Self::Logprobs => "logprobs",
            Self::Advantages => "advantages",
            Self::Weights => "weights",
            Self::Deferred => "deferred",
        }
    }

    /// On-disk element type.
    #[must_use]
    pub const fn dtype(&self) -> Dtype {
        match self {
            Self::Tokens | Self::GroupIds | Self::ParentIds | Self::InputPos => Dtype::Int64,
            Self::Logprobs | Self::Advantages | Self::Weights => Dtype::Float32,
            Self::AssistantMask | Self::Deferred => Dtype::Bool,
        }
    }

    /// Buffer file name inside a storage directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.pt", self.name())
    }

    /// Look a channel up by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
