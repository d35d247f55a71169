//! Hardware-accelerated merge of per-group film sample buffers.
//!
//! Combines a film's per-light-group radiance channels into its framebuffer
//! channel on a compute device, keeping the reduction off the render thread.
//!
//! # Architecture
//!
//! ```text
//! MergeEngine
//!     ├── DeviceContext ──> Box<dyn HardwareDevice>
//!     │                        ├── CudaDevice     (feature "cuda")
//!     │                        └── SoftwareDevice (test-suite / reference)
//!     ├── MergeBuffers  ──> framebuffer, alpha, object-id, scratch
//!     └── MergeKernels  ──> initialize, accumulate x2, finalize
//! ```
//!
//! When no hardware device is available the engine stays inert: buffer
//! allocation, kernel compilation, and merging all become no-ops and the
//! caller keeps merging on the host.
//!
//! # Example
//!
//! ```ignore
//! use ember_merge::{MergeConfig, MergeEngine};
//!
//! let mut engine = MergeEngine::build(&MergeConfig::from_env())?;
//! engine.allocate_buffers(&film)?;
//! engine.compile_kernels(&film)?;
//!
//! engine.merge(&mut film, 0)?;
//! ```

pub mod device;

mod buffers;
mod context;
mod kernels;
mod merge;

pub use buffers::MergeBuffers;
pub use context::DeviceContext;
pub use device::{HardwareDevice, MergeConfig, SoftwareDevice};
pub use kernels::MergeKernels;
pub use merge::MergeEngine;

use thiserror::Error;

/// Merge core errors.
///
/// Absence of a hardware device is not an error: construction yields an inert
/// engine instead. Allocation and compilation failures on a present device
/// abort initialization with no retry.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("failed to open device: {0}")]
    DeviceCreation(String),

    #[error("failed to allocate device buffer {label}: {reason}")]
    BufferAllocation { label: String, reason: String },

    #[error("failed to compile merge kernels: {0}")]
    KernelCompilation(String),

    #[error("no kernel named {0} in the merge program")]
    UnknownKernel(String),

    #[error("stale or foreign device handle: {0}")]
    InvalidHandle(&'static str),

    #[error("output target {index} out of range ({count} framebuffers)")]
    InvalidTarget { index: usize, count: usize },

    #[error("device failure: {0}")]
    Device(String),
}

pub type MergeResult<T> = Result<T, MergeError>;
