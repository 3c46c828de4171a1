//! Prompt grouping, sequence packing, and packed tensor storage for RL
//! fine-tuning.
//!
//! The pipeline runs in three steps:
//!
//! 1. [`PromptGrouper`] stamps sibling completions of one prompt with a shared
//!    prompt id and prompt length.
//! 2. [`SequencePacker`] concatenates results into fixed-width rows, writing
//!    each shared prompt once per row, and emits nine aligned channels as
//!    [`PackedTensors`].
//! 3. [`packed_tensors_to_dir`] persists the channels as flat memory-mappable
//!    buffers; [`PackedDataset`] serves rows back without copying.

#![warn(missing_docs)]

pub mod attention;
pub mod dataset;
pub mod grouping;
pub mod packing;
pub mod storage;
pub mod tokenized;

pub use attention::*;
pub use dataset::*;
pub use grouping::*;
pub use packing::*;
pub use storage::*;
pub use tokenized::*;
