//! Core types, configuration, and errors for rlpack.
//!
//! This crate provides the foundational pieces shared by the packer and the
//! command line tool:
//!
//! - Error handling infrastructure
//! - Configuration types for grouping, packing, and output
//! - Channel descriptors for packed tensors (name, element type, file name)

#![warn(missing_docs)]

mod config;
mod error;
mod types;

pub use config::*;
pub use error::*;
pub use types::*;
