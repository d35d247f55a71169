//! Film channel storage for the ember renderer.
//!
//! A [`Film`] holds the host-side pixel channels a render accumulates into:
//! one RGBA framebuffer per output target, optional alpha and object-id
//! channels, and per-light-group radiance channels in two normalization
//! conventions. Per-target weighting of the light groups is carried by
//! [`TargetPipeline`] records.
//!
//! The merge engine (`ember-merge`) reads these channels, combines them on a
//! compute device, and writes the result back into the framebuffer channel.

pub mod channel;
pub mod film;

pub use channel::{ChannelKind, PixelBuffer};
pub use channel::{
    ALPHA_COMPONENTS, IMAGE_PIPELINE_COMPONENTS, RADIANCE_PER_PIXEL_COMPONENTS,
    RADIANCE_PER_SCREEN_COMPONENTS,
};
pub use film::{Film, GroupScale, SampleCounts, TargetPipeline};

use thiserror::Error;

/// Film buffer errors.
#[derive(Debug, Error)]
pub enum FilmError {
    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },
}

pub type FilmResult<T> = Result<T, FilmError>;
