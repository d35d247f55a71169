//! Merge kernel program: embedded source, compilation, argument binding.

use std::time::Instant;

use tracing::{debug, info};

use ember_film::Film;

use crate::buffers::MergeBuffers;
use crate::context::DeviceContext;
use crate::device::{HardwareDevice, KernelArg, KernelHandle};
use crate::MergeResult;

/// Build defines identifying the kernel dialect to the device compiler.
pub(crate) const MERGE_BUILD_OPTIONS: &str = "-D EMBER_CUDA_KERNEL -D EMBER_FILM_MERGE";

pub(crate) const KERNEL_INITIALIZE: &str = "merge_initialize";
pub(crate) const KERNEL_PER_PIXEL: &str = "merge_per_pixel_normalized";
pub(crate) const KERNEL_PER_SCREEN: &str = "merge_per_screen_normalized";
pub(crate) const KERNEL_FINALIZE: &str = "merge_finalize";

/// Merge kernel source, compiled at runtime on the selected device.
///
/// The framebuffer is RGBA; the kernels accumulate into RGB and carry the
/// alpha word through untouched. Per-pixel-normalized samples are
/// (r, g, b, weight); per-screen-normalized samples are (r, g, b) with the
/// screen-wide normalization folded into the scale by the host.
pub(crate) const MERGE_KERNEL_SOURCE: &str = r#"
#if defined(EMBER_CUDA_KERNEL)

extern "C" {

__global__ void merge_initialize(
    const unsigned int width, const unsigned int height,
    float *framebuffer
) {
    const unsigned int gid = blockIdx.x * blockDim.x + threadIdx.x;
    if (gid >= width * height)
        return;

    float *pixel = &framebuffer[gid * 4];
    pixel[0] = 0.f;
    pixel[1] = 0.f;
    pixel[2] = 0.f;
}

__global__ void merge_per_pixel_normalized(
    const unsigned int width, const unsigned int height,
    float *framebuffer, const float *samples,
    const float scale_r, const float scale_g, const float scale_b
) {
    const unsigned int gid = blockIdx.x * blockDim.x + threadIdx.x;
    if (gid >= width * height)
        return;

    const float *sample = &samples[gid * 4];
    const float weight = sample[3];
    if (weight > 0.f) {
        float *pixel = &framebuffer[gid * 4];
        pixel[0] += scale_r * sample[0] / weight;
        pixel[1] += scale_g * sample[1] / weight;
        pixel[2] += scale_b * sample[2] / weight;
    }
}

__global__ void merge_per_screen_normalized(
    const unsigned int width, const unsigned int height,
    float *framebuffer, const float *samples,
    const float scale_r, const float scale_g, const float scale_b
) {
    const unsigned int gid = blockIdx.x * blockDim.x + threadIdx.x;
    if (gid >= width * height)
        return;

    const float *sample = &samples[gid * 3];
    float *pixel = &framebuffer[gid * 4];
    pixel[0] += scale_r * sample[0];
    pixel[1] += scale_g * sample[1];
    pixel[2] += scale_b * sample[2];
}

// Hook for the final radiance-to-pixel conversion; the image pipeline
// stages that run afterwards own it, so merged values pass through.
__global__ void merge_finalize(
    const unsigned int width, const unsigned int height,
    float *framebuffer
) {
    const unsigned int gid = blockIdx.x * blockDim.x + threadIdx.x;
    if (gid >= width * height)
        return;

    (void)framebuffer;
}

} // extern "C"

#endif
"#;

/// The four resolved merge kernels with their invariant arguments bound.
///
/// Scale slots 4..6 on the two accumulate kernels stay unbound here; they
/// vary per light group and are rebound immediately before each dispatch.
pub struct MergeKernels {
    pub(crate) initialize: KernelHandle,
    pub(crate) per_pixel: KernelHandle,
    pub(crate) per_screen: KernelHandle,
    pub(crate) finalize: KernelHandle,
}

impl MergeKernels {
    /// Compile the merge program and bind the invariant arguments.
    ///
    /// Fatal on any compilation or resolution failure.
    pub fn compile(
        ctx: &mut DeviceContext,
        film: &Film,
        buffers: &MergeBuffers,
    ) -> MergeResult<Self> {
        let device = ctx.device_mut();
        device.set_verbose(true);
        let result = Self::compile_inner(device, film, buffers);
        device.set_verbose(false);
        result
    }

    fn compile_inner(
        device: &mut dyn HardwareDevice,
        film: &Film,
        buffers: &MergeBuffers,
    ) -> MergeResult<Self> {
        let compile_start = Instant::now();

        let program = device.compile_program(MERGE_BUILD_OPTIONS, MERGE_KERNEL_SOURCE, "merge")?;

        let width = KernelArg::U32(film.width());
        let height = KernelArg::U32(film.height());
        let framebuffer = KernelArg::Buffer(buffers.image_pipeline);

        debug!("compiling {KERNEL_INITIALIZE} kernel");
        let initialize = device.get_kernel(program, KERNEL_INITIALIZE)?;
        device.set_kernel_arg(initialize, 0, width)?;
        device.set_kernel_arg(initialize, 1, height)?;
        device.set_kernel_arg(initialize, 2, framebuffer)?;

        debug!("compiling {KERNEL_PER_PIXEL} kernel");
        let per_pixel = device.get_kernel(program, KERNEL_PER_PIXEL)?;
        device.set_kernel_arg(per_pixel, 0, width)?;
        device.set_kernel_arg(per_pixel, 1, height)?;
        device.set_kernel_arg(per_pixel, 2, framebuffer)?;
        if let Some(scratch) = buffers.scratch {
            device.set_kernel_arg(per_pixel, 3, KernelArg::Buffer(scratch))?;
        }
        // Scale arguments are bound at dispatch time.

        debug!("compiling {KERNEL_PER_SCREEN} kernel");
        let per_screen = device.get_kernel(program, KERNEL_PER_SCREEN)?;
        device.set_kernel_arg(per_screen, 0, width)?;
        device.set_kernel_arg(per_screen, 1, height)?;
        device.set_kernel_arg(per_screen, 2, framebuffer)?;
        if let Some(scratch) = buffers.scratch {
            device.set_kernel_arg(per_screen, 3, KernelArg::Buffer(scratch))?;
        }
        // Scale arguments are bound at dispatch time.

        debug!("compiling {KERNEL_FINALIZE} kernel");
        let finalize = device.get_kernel(program, KERNEL_FINALIZE)?;
        device.set_kernel_arg(finalize, 0, width)?;
        device.set_kernel_arg(finalize, 1, height)?;
        device.set_kernel_arg(finalize, 2, framebuffer)?;

        // The program is not needed once the entry points are resolved.
        device.release_program(program);

        info!(
            "merge kernels compilation time: {}ms",
            compile_start.elapsed().as_millis()
        );

        Ok(Self {
            initialize,
            per_pixel,
            per_screen,
            finalize,
        })
    }

    /// Release the four kernel handles.
    pub(crate) fn release(self, device: &mut dyn HardwareDevice) {
        device.release_kernel(self.initialize);
        device.release_kernel(self.per_pixel);
        device.release_kernel(self.per_screen);
        device.release_kernel(self.finalize);
    }
}
