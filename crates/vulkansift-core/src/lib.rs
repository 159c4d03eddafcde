//! Core types and configuration for VulkanSift.
//!
//! This crate provides the foundational types used throughout the library:
//! - User configuration and its enumerated options
//! - SIFT feature and match records, with their GPU buffer mirrors
//! - Result codes and log levels

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    DescriptorFormat, ErrorCallback, ImageSize, PyramidPrecision, SiftConfig,
};
pub use error::{LogLevel, SiftError, SiftResult};
pub use types::{Descriptor, Feature, Match2NN, RawFeatureF32, RawFeatureU8};

/// Library-wide constants
pub mod constants {
    /// Length of a SIFT descriptor in elements
    pub const DESCRIPTOR_SIZE: usize = 128;
    /// Descriptor length in packed 32-bit words (UBC1 byte format)
    pub const DESCRIPTOR_WORDS: usize = DESCRIPTOR_SIZE / 4;
    /// Number of bins in the orientation histogram
    pub const ORIENTATION_HISTOGRAM_BINS: usize = 36;
    /// Descriptor spatial grid width (4x4 cells)
    pub const DESCRIPTOR_GRID_SIZE: usize = 4;
    /// Orientation bins per descriptor cell
    pub const DESCRIPTOR_CELL_BINS: usize = 8;
    /// Maximum one-sided Gaussian kernel radius in taps
    pub const MAX_GAUSSIAN_KERNEL_SIZE: usize = 20;
    /// Upper bound on pyramid octaves, also the descriptor-array size bound
    /// for kernels indexing octaves at runtime
    pub const MAX_OCTAVES: u32 = 16;
    /// Byte offset of the first feature record in a slot buffer
    /// (count header plus padding, std430)
    pub const FEATURE_BUFFER_HEADER_SIZE: u64 = 16;
}
