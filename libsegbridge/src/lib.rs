#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! segbridge - a bridge between an embedded runtime's arrays and native image matrices
//!
//! This library converts host arrays into native image matrices (and back) without
//! copying pixel data when the memory layout allows it, keeping the two reference
//! counting schemes in step so a buffer is released exactly once. On top of the
//! converter it drives a segmentation collaborator that lives inside the runtime.

pub mod builtin;
pub mod converter;
pub mod depth;
pub mod error;
pub mod foreign;
pub mod gil;
pub mod imageio;
pub mod layout;
pub mod matrix;
pub mod runtime;
pub mod segmentation;
pub mod settings;
pub mod storage;

mod scalar;

pub use converter::{Converter, ForeignAllocator};
pub use depth::{Depth, ElementType, MatType};
pub use error::{BridgeError, Result};
pub use foreign::{ForeignArray, ForeignObject};
pub use matrix::NativeMatrix;
pub use runtime::Runtime;
pub use segmentation::{SegmentationInput, SemanticSegmenter};
pub use settings::SegmentationSettings;

/// Maximum rank of an array accepted by the converter
pub const MAX_DIMS: usize = 32;

/// Maximum number of channels folded into a matrix element
pub const CN_MAX: usize = 512;
