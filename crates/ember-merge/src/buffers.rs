//! Device-resident buffer set for the merge.

use ember_film::Film;

use crate::context::DeviceContext;
use crate::device::{BufferAccess, BufferHandle, HardwareDevice};
use crate::{MergeError, MergeResult};

/// The fixed buffer set one merge drives.
///
/// The scratch buffer is reused across light groups and sized to the larger
/// of the two per-group channel layouts; it exists only when at least one
/// radiance channel does.
pub struct MergeBuffers {
    pub(crate) image_pipeline: BufferHandle,
    pub(crate) alpha: Option<BufferHandle>,
    pub(crate) object_id: Option<BufferHandle>,
    pub(crate) scratch: Option<BufferHandle>,
}

impl MergeBuffers {
    /// Allocate the buffer set, seeding from the film's current channels.
    ///
    /// Allocation diagnostics are verbose for the duration of this call only.
    pub fn allocate(ctx: &mut DeviceContext, film: &Film) -> MergeResult<Self> {
        let device = ctx.device_mut();
        device.set_verbose(true);
        let result = Self::allocate_inner(device, film);
        device.set_verbose(false);
        result
    }

    fn allocate_inner(device: &mut dyn HardwareDevice, film: &Film) -> MergeResult<Self> {
        let framebuffer = film.image_pipeline(0).ok_or(MergeError::InvalidTarget {
            index: 0,
            count: 0,
        })?;
        let image_pipeline = device.alloc_buffer(
            BufferAccess::ReadWrite,
            Some(framebuffer.pixels()),
            framebuffer.word_len(),
            "IMAGEPIPELINE",
        )?;

        let alpha = match film.alpha() {
            Some(channel) => Some(device.alloc_buffer(
                BufferAccess::ReadOnly,
                Some(channel.pixels()),
                channel.word_len(),
                "ALPHA",
            )?),
            None => None,
        };

        let object_id = match film.object_id_words() {
            Some(words) => Some(device.alloc_buffer(
                BufferAccess::ReadOnly,
                Some(words),
                words.len(),
                "OBJECT_ID",
            )?),
            None => None,
        };

        let scratch_words = std::cmp::max(
            film.radiance_per_pixel(0).map_or(0, |c| c.word_len()),
            film.radiance_per_screen(0).map_or(0, |c| c.word_len()),
        );
        let scratch = if scratch_words > 0 {
            Some(device.alloc_buffer(BufferAccess::ReadOnly, None, scratch_words, "MERGE")?)
        } else {
            None
        };

        Ok(Self {
            image_pipeline,
            alpha,
            object_id,
            scratch,
        })
    }

    /// Re-upload the read-only channels the kernels treat as static (async).
    pub fn write_static_channels(&self, ctx: &mut DeviceContext, film: &Film) -> MergeResult<()> {
        let device = ctx.device_mut();
        if let (Some(handle), Some(channel)) = (self.alpha, film.alpha()) {
            device.enqueue_write_buffer(handle, channel.pixels())?;
        }
        if let (Some(handle), Some(words)) = (self.object_id, film.object_id_words()) {
            device.enqueue_write_buffer(handle, words)?;
        }
        Ok(())
    }

    /// Free every buffer in the set.
    pub(crate) fn release(self, device: &mut dyn HardwareDevice) {
        device.free_buffer(self.image_pipeline);
        if let Some(handle) = self.alpha {
            device.free_buffer(handle);
        }
        if let Some(handle) = self.object_id {
            device.free_buffer(handle);
        }
        if let Some(handle) = self.scratch {
            device.free_buffer(handle);
        }
    }
}
