//! Merge orchestration: one output target per call.

use tracing::info;

use ember_film::{ChannelKind, Film};

use crate::buffers::MergeBuffers;
use crate::context::DeviceContext;
use crate::device::{HardwareDevice, KernelArg, KernelHandle, MergeConfig};
use crate::kernels::MergeKernels;
use crate::{MergeError, MergeResult};

/// Fixed 1-D workgroup granularity for every merge dispatch.
const WORKGROUP_SIZE: u32 = 256;

fn round_up(value: u32, granularity: u32) -> u32 {
    value.div_ceil(granularity) * granularity
}

/// Per-group scale for a target, `None` when the group is disabled.
///
/// A target without a configured pipeline behaves as all groups enabled at
/// unit scale.
fn group_scale(film: &Film, target: usize, group: usize) -> Option<[f32; 3]> {
    match film.target(target) {
        Some(pipeline) => {
            let scale = pipeline.group_scale(group)?;
            scale.enabled.then_some(scale.rgb)
        }
        None => Some([1.0, 1.0, 1.0]),
    }
}

/// Rebind the three scale slots; never reuse a binding across groups.
fn bind_scale(
    device: &mut dyn HardwareDevice,
    kernel: KernelHandle,
    rgb: [f32; 3],
) -> MergeResult<()> {
    device.set_kernel_arg(kernel, 4, KernelArg::F32(rgb[0]))?;
    device.set_kernel_arg(kernel, 5, KernelArg::F32(rgb[1]))?;
    device.set_kernel_arg(kernel, 6, KernelArg::F32(rgb[2]))
}

/// Owner of the hardware merge path for one film.
///
/// Holds the device context, the buffer set, and the compiled kernels.
/// Without a device every operation is a safe no-op and host channels are
/// never touched.
pub struct MergeEngine {
    ctx: Option<DeviceContext>,
    buffers: Option<MergeBuffers>,
    kernels: Option<MergeKernels>,
}

impl MergeEngine {
    /// Select and start a hardware device per `config`, or stay inert.
    pub fn build(config: &MergeConfig) -> MergeResult<Self> {
        Ok(Self {
            ctx: DeviceContext::build(config)?,
            buffers: None,
            kernels: None,
        })
    }

    /// Build around an already-open device.
    pub fn with_device(device: Box<dyn HardwareDevice>) -> MergeResult<Self> {
        Ok(Self {
            ctx: Some(DeviceContext::from_device(device)?),
            buffers: None,
            kernels: None,
        })
    }

    /// An engine with no device at all.
    pub fn inert() -> Self {
        Self {
            ctx: None,
            buffers: None,
            kernels: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ctx.is_some()
    }

    /// Allocate the device buffer set from the film's current channels.
    ///
    /// Reallocation frees the previous set first. No-op without a device;
    /// allocation failure on a present device is fatal.
    pub fn allocate_buffers(&mut self, film: &Film) -> MergeResult<()> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Ok(());
        };
        if let Some(kernels) = self.kernels.take() {
            kernels.release(ctx.device_mut());
        }
        if let Some(old) = self.buffers.take() {
            old.release(ctx.device_mut());
        }
        self.buffers = Some(MergeBuffers::allocate(ctx, film)?);
        Ok(())
    }

    /// Compile the merge program and bind the invariant arguments.
    ///
    /// No-op without a device; compilation failure on a present device is
    /// fatal.
    pub fn compile_kernels(&mut self, film: &Film) -> MergeResult<()> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Ok(());
        };
        let Some(buffers) = self.buffers.as_ref() else {
            return Err(MergeError::Device(
                "buffers must be allocated before kernel compilation".to_string(),
            ));
        };
        if let Some(old) = self.kernels.take() {
            old.release(ctx.device_mut());
        }
        self.kernels = Some(MergeKernels::compile(ctx, film, buffers)?);
        Ok(())
    }

    /// Push the current alpha and object-id channel contents (async).
    pub fn sync_static_channels(&mut self, film: &Film) -> MergeResult<()> {
        let (Some(ctx), Some(buffers)) = (self.ctx.as_mut(), self.buffers.as_ref()) else {
            return Ok(());
        };
        buffers.write_static_channels(ctx, film)
    }

    /// Push one framebuffer channel to the device (async).
    pub fn upload_target(&mut self, film: &Film, target: usize) -> MergeResult<()> {
        let (Some(ctx), Some(buffers)) = (self.ctx.as_mut(), self.buffers.as_ref()) else {
            return Ok(());
        };
        let channel = film
            .image_pipeline(target)
            .ok_or(MergeError::InvalidTarget {
                index: target,
                count: film.image_pipeline_count(),
            })?;
        ctx.device_mut()
            .enqueue_write_buffer(buffers.image_pipeline, channel.pixels())
    }

    /// Pull the device framebuffer back into one host channel (async).
    pub fn download_target(&mut self, film: &mut Film, target: usize) -> MergeResult<()> {
        let (Some(ctx), Some(buffers)) = (self.ctx.as_mut(), self.buffers.as_ref()) else {
            return Ok(());
        };
        let count = film.image_pipeline_count();
        let channel = film
            .image_pipeline_mut(target)
            .ok_or(MergeError::InvalidTarget {
                index: target,
                count,
            })?;
        ctx.device_mut()
            .enqueue_read_buffer(buffers.image_pipeline, channel.pixels_mut())
    }

    /// Merge every enabled light group into the framebuffer for `target`,
    /// blocking until the updated channel is back on the host.
    ///
    /// Group iterations are strictly sequential: each one rewrites the
    /// scratch buffer and the scale bindings its own dispatch consumes.
    pub fn merge(&mut self, film: &mut Film, target: usize) -> MergeResult<()> {
        let (Some(ctx), Some(buffers), Some(kernels)) = (
            self.ctx.as_mut(),
            self.buffers.as_ref(),
            self.kernels.as_ref(),
        ) else {
            return Ok(());
        };
        let device = ctx.device_mut();

        let pixel_count = film.pixel_count() as u32;
        let global_size = round_up(pixel_count, WORKGROUP_SIZE);

        let channel = film
            .image_pipeline(target)
            .ok_or(MergeError::InvalidTarget {
                index: target,
                count: film.image_pipeline_count(),
            })?;
        device.enqueue_write_buffer(buffers.image_pipeline, channel.pixels())?;

        device.enqueue_kernel(kernels.initialize, global_size, WORKGROUP_SIZE)?;

        if film.has_channel(ChannelKind::RadiancePerPixel) {
            let scratch = buffers
                .scratch
                .ok_or(MergeError::InvalidHandle("merge scratch buffer"))?;
            for group in 0..film.light_group_count() {
                let Some(scale) = group_scale(film, target, group) else {
                    continue;
                };
                let channel = film
                    .radiance_per_pixel(group)
                    .ok_or(MergeError::InvalidHandle("per-pixel radiance channel"))?;
                device.enqueue_write_buffer(scratch, channel.pixels())?;
                bind_scale(device, kernels.per_pixel, scale)?;
                device.enqueue_kernel(kernels.per_pixel, global_size, WORKGROUP_SIZE)?;
            }
        }

        if film.has_channel(ChannelKind::RadiancePerScreen) {
            let scratch = buffers
                .scratch
                .ok_or(MergeError::InvalidHandle("merge scratch buffer"))?;
            let samples = film.sample_counts().per_screen_normalized;
            let factor = if samples > 0.0 {
                (pixel_count as f64 / samples) as f32
            } else {
                1.0
            };
            for group in 0..film.light_group_count() {
                let Some(scale) = group_scale(film, target, group) else {
                    continue;
                };
                let channel = film
                    .radiance_per_screen(group)
                    .ok_or(MergeError::InvalidHandle("per-screen radiance channel"))?;
                device.enqueue_write_buffer(scratch, channel.pixels())?;
                let scale = [scale[0] * factor, scale[1] * factor, scale[2] * factor];
                bind_scale(device, kernels.per_screen, scale)?;
                device.enqueue_kernel(kernels.per_screen, global_size, WORKGROUP_SIZE)?;
            }
        }

        device.enqueue_kernel(kernels.finalize, global_size, WORKGROUP_SIZE)?;

        let count = film.image_pipeline_count();
        let channel = film
            .image_pipeline_mut(target)
            .ok_or(MergeError::InvalidTarget {
                index: target,
                count,
            })?;
        device.enqueue_read_buffer(buffers.image_pipeline, channel.pixels_mut())?;

        device.finish()
    }

    /// Release kernels and buffers, report device memory, drop the context.
    ///
    /// Safe to call repeatedly and on an engine that never had a device.
    pub fn shutdown(&mut self) {
        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        let device = ctx.device_mut();

        let used = device.used_memory();
        let (amount, unit) = if used < 10_000 {
            (used, "bytes")
        } else {
            (used / 1024, "Kbytes")
        };
        info!(
            "[{}] memory used for hardware sample merging: {amount}{unit}",
            device.descriptor().name
        );

        // Kernels first, buffers second, the context itself last.
        if let Some(kernels) = self.kernels.take() {
            kernels.release(device);
        }
        if let Some(buffers) = self.buffers.take() {
            buffers.release(device);
        }
    }
}

impl Drop for MergeEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 256), 0);
        assert_eq!(round_up(1, 256), 256);
        assert_eq!(round_up(256, 256), 256);
        assert_eq!(round_up(257, 256), 512);
    }

    #[test]
    fn test_group_scale_neutral_without_target() {
        let film = Film::new(2, 2, 2);
        assert_eq!(group_scale(&film, 7, 1), Some([1.0, 1.0, 1.0]));
    }
}
