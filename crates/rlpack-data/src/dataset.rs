//! Row-indexed view over packed tensors on disk.

use std::path::Path;

use ndarray::Array2;
use rlpack_core::{Channel, Dtype, Result, RlPackError};

use crate::{DiskPackedTensors, MappedPackedTensors};

/// One channel of one row, typed by its element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelSlice<'a> {
    /// `i64` channel.
    Int64(&'a [i64]),
    /// `f32` channel.
    Float32(&'a [f32]),
    /// Boolean channel as 0/1 bytes.
    Bool(&'a [u8]),
}

impl ChannelSlice<'_> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::Int64(values) => values.len(),
            Self::Float32(values) => values.len(),
            Self::Bool(values) => values.len(),
        }
    }

    /// Whether the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One training sample: all nine channels sliced at one row index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedRow<'a> {
    /// Token ids.
    pub tokens: &'a [i64],
    /// Group ids.
    pub group_ids: &'a [i64],
    /// Parent (prompt) ids.
    pub parent_ids: &'a [i64],
    /// Position indices.
    pub input_pos: &'a [i64],
    /// Supervised positions (0/1).
    pub assistant_mask: &'a [u8],
    /// Sampling log-probabilities.
    pub logprobs: &'a [f32],
    /// Per-token advantages.
    pub advantages: &'a [f32],
    /// Loss weights.
    pub weights: &'a [f32],
    /// Deferred-loss flags (0/1).
    pub deferred: &'a [u8],
}

impl<'a> PackedRow<'a> {
    /// Look up a channel by name.
    pub fn channel(&self, channel: Channel) -> ChannelSlice<'a> {
        match channel {
            Channel::Tokens => ChannelSlice::Int64(self.tokens),
            Channel::GroupIds => ChannelSlice::Int64(self.group_ids),
            Channel::ParentIds => ChannelSlice::Int64(self.parent_ids),
            Channel::InputPos => ChannelSlice::Int64(self.input_pos),
            Channel::AssistantMask => ChannelSlice::Bool(self.assistant_mask),
            Channel::Logprobs => ChannelSlice::Float32(self.logprobs),
            Channel::Advantages => ChannelSlice::Float32(self.advantages),
            Channel::Weights => ChannelSlice::Float32(self.weights),
            Channel::Deferred => ChannelSlice::Bool(self.deferred),
        }
    }

    /// Row width.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the row has zero width.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of supervised positions.
    pub fn num_assistant_tokens(&self) -> usize {
        self.assistant_mask.iter().filter(|&&m| m != 0).count()
    }

    /// Grouped causal attention mask for this row.
    pub fn attention_mask(&self) -> Array2<bool> {
        crate::grouped_causal_mask(self.group_ids, self.parent_ids)
    }
}

/// Random-access dataset over a packed tensor directory.
///
/// Rows borrow straight from the memory maps. The dataset is `Sync`, so many
/// reader threads may share one instance.
#[derive(Debug)]
pub struct PackedDataset {
    tensors: MappedPackedTensors,
}

impl PackedDataset {
    /// Map the buffers described by `disk`.
    pub fn open(disk: &DiskPackedTensors) -> Result<Self> {
        let tensors = MappedPackedTensors::open(disk)?;
        // Fail on misaligned buffers here, not on first row access.
        for channel in Channel::ALL {
            match channel.dtype() {
                Dtype::Int64 => {
                    tensors.int64(channel)?;
                }
                Dtype::Float32 => {
                    tensors.float32(channel)?;
                }
                Dtype::Bool => {
                    tensors.flags(channel)?;
                }
            }
        }
        Ok(Self { tensors })
    }

    /// Open a directory through its descriptor file.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open(&DiskPackedTensors::load(dir)?)
    }

    /// Descriptor the dataset was opened with.
    pub fn descriptor(&self) -> &DiskPackedTensors {
        self.tensors.descriptor()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.tensors.num_sequences()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row width.
    pub fn sequence_length(&self) -> usize {
        self.tensors.sequence_length()
    }

    /// Borrow row `index`.
    pub fn get(&self, index: usize) -> Result<PackedRow<'_>> {
        if index >= self.len() {
            return Err(RlPackError::IndexOutOfBounds {
                index,
                len: self.len(),
            });
        }
        let width = self.sequence_length();
        let range = index * width..(index + 1) * width;
        let t = &self.tensors;

        Ok(PackedRow {
            tokens: &t.int64(Channel::Tokens)?[range.clone()],
            group_ids: &t.int64(Channel::GroupIds)?[range.clone()],
            parent_ids: &t.int64(Channel::ParentIds)?[range.clone()],
            input_pos: &t.int64(Channel::InputPos)?[range.clone()],
            assistant_mask: &t.flags(Channel::AssistantMask)?[range.clone()],
            logprobs: &t.float32(Channel::Logprobs)?[range.clone()],
            advantages: &t.float32(Channel::Advantages)?[range.clone()],
            weights: &t.float32(Channel::Weights)?[range.clone()],
            deferred: &t.flags(Channel::Deferred)?[range],
        })
    }

    /// Iterate over every row in order.
    pub fn iter(&self) -> impl Iterator<Item = Result<PackedRow<'_>>> + '_ {
        (0..self.len()).map(move |index| self.get(index))
    }
}
