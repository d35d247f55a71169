//! In-process implementation of the device surface.
//!
//! Used by the test-suite and as a reference for the merge semantics. The
//! in-order queue degenerates to immediate execution on the calling thread,
//! which trivially preserves submission order; kernel bodies parallelize
//! internally with rayon. The descriptor is not hardware-class, so device
//! selection never picks this device: callers inject it explicitly.

use rayon::prelude::*;
use tracing::debug;

use super::{
    BufferAccess, BufferHandle, DeviceDescriptor, DeviceKind, EmptyDataset, HardwareDevice,
    KernelArg, KernelHandle, ProgramHandle,
};
use crate::kernels::{KERNEL_FINALIZE, KERNEL_INITIALIZE, KERNEL_PER_PIXEL, KERNEL_PER_SCREEN};
use crate::{MergeError, MergeResult};

/// The merge entry points this device can execute natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeEntry {
    Initialize,
    AccumulatePerPixel,
    AccumulatePerScreen,
    Finalize,
}

impl MergeEntry {
    fn resolve(name: &str) -> Option<Self> {
        match name {
            KERNEL_INITIALIZE => Some(Self::Initialize),
            KERNEL_PER_PIXEL => Some(Self::AccumulatePerPixel),
            KERNEL_PER_SCREEN => Some(Self::AccumulatePerScreen),
            KERNEL_FINALIZE => Some(Self::Finalize),
            _ => None,
        }
    }
}

struct KernelState {
    entry: MergeEntry,
    args: Vec<Option<KernelArg>>,
}

/// Software device: the full [`HardwareDevice`] contract on the host.
pub struct SoftwareDevice {
    descriptor: DeviceDescriptor,
    buffers: Vec<Option<Vec<f32>>>,
    programs: Vec<bool>,
    kernels: Vec<Option<KernelState>>,
    used: u64,
    verbose: bool,
    started: bool,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self {
            descriptor: DeviceDescriptor {
                kind: DeviceKind::Cpu,
                name: "software".to_string(),
                compute_capability: None,
                ordinal: 0,
            },
            buffers: Vec::new(),
            programs: Vec::new(),
            kernels: Vec::new(),
            used: 0,
            verbose: false,
            started: false,
        }
    }

    fn ensure_started(&self) -> MergeResult<()> {
        if self.started {
            Ok(())
        } else {
            Err(MergeError::Device("device was never started".to_string()))
        }
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> MergeResult<&mut Vec<f32>> {
        self.buffers
            .get_mut(handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(MergeError::InvalidHandle("buffer"))
    }

    /// Mutable framebuffer plus shared sample buffer, which must not alias.
    fn framebuffer_and_samples(
        &mut self,
        framebuffer: BufferHandle,
        samples: BufferHandle,
    ) -> MergeResult<(&mut [f32], &[f32])> {
        let a = framebuffer.0 as usize;
        let b = samples.0 as usize;
        if a == b {
            return Err(MergeError::InvalidHandle("framebuffer aliases sample buffer"));
        }
        if a.max(b) >= self.buffers.len() {
            return Err(MergeError::InvalidHandle("buffer"));
        }
        let (fb_slot, sm_slot) = if a < b {
            let (head, tail) = self.buffers.split_at_mut(b);
            (&mut head[a], &tail[0])
        } else {
            let (head, tail) = self.buffers.split_at_mut(a);
            (&mut tail[0], &head[b])
        };
        let fb = fb_slot
            .as_deref_mut()
            .ok_or(MergeError::InvalidHandle("framebuffer"))?;
        let sm = sm_slot
            .as_deref()
            .ok_or(MergeError::InvalidHandle("sample buffer"))?;
        Ok((fb, sm))
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn arg_at(args: &[Option<KernelArg>], index: usize) -> MergeResult<KernelArg> {
    args.get(index)
        .copied()
        .flatten()
        .ok_or(MergeError::InvalidHandle("unbound kernel argument"))
}

fn arg_u32(args: &[Option<KernelArg>], index: usize) -> MergeResult<u32> {
    match arg_at(args, index)? {
        KernelArg::U32(v) => Ok(v),
        _ => Err(MergeError::InvalidHandle("kernel argument type")),
    }
}

fn arg_f32(args: &[Option<KernelArg>], index: usize) -> MergeResult<f32> {
    match arg_at(args, index)? {
        KernelArg::F32(v) => Ok(v),
        _ => Err(MergeError::InvalidHandle("kernel argument type")),
    }
}

fn arg_buffer(args: &[Option<KernelArg>], index: usize) -> MergeResult<BufferHandle> {
    match arg_at(args, index)? {
        KernelArg::Buffer(h) => Ok(h),
        _ => Err(MergeError::InvalidHandle("kernel argument type")),
    }
}

fn bounded<'a>(data: &'a mut [f32], words: usize, what: &str) -> MergeResult<&'a mut [f32]> {
    data.get_mut(..words)
        .ok_or_else(|| MergeError::Device(format!("{what} shorter than the dispatch range")))
}

impl HardwareDevice for SoftwareDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn start(&mut self, dataset: EmptyDataset) -> MergeResult<()> {
        dataset.ensure_preprocessed()?;
        self.started = true;
        Ok(())
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    fn used_memory(&self) -> u64 {
        self.used
    }

    fn alloc_buffer(
        &mut self,
        _access: BufferAccess,
        init: Option<&[f32]>,
        words: usize,
        label: &str,
    ) -> MergeResult<BufferHandle> {
        self.ensure_started()?;
        let data = match init {
            Some(init) => {
                if init.len() != words {
                    return Err(MergeError::BufferAllocation {
                        label: label.to_string(),
                        reason: format!("init data of {} words, buffer of {words}", init.len()),
                    });
                }
                init.to_vec()
            }
            None => vec![0.0f32; words],
        };
        if self.verbose {
            debug!("[software] buffer {label}: {} bytes", words * 4);
        }
        self.used += (words * 4) as u64;
        self.buffers.push(Some(data));
        Ok(BufferHandle((self.buffers.len() - 1) as u32))
    }

    fn free_buffer(&mut self, buffer: BufferHandle) {
        if let Some(slot) = self.buffers.get_mut(buffer.0 as usize) {
            if let Some(data) = slot.take() {
                self.used -= (data.len() * 4) as u64;
            }
        }
    }

    fn compile_program(
        &mut self,
        _options: &str,
        _source: &str,
        label: &str,
    ) -> MergeResult<ProgramHandle> {
        self.ensure_started()?;
        // The source is a device-compiler artifact; this device executes the
        // entry points natively and only tracks program lifetime.
        if self.verbose {
            debug!("[software] program {label} registered");
        }
        self.programs.push(true);
        Ok(ProgramHandle((self.programs.len() - 1) as u32))
    }

    fn get_kernel(&mut self, program: ProgramHandle, name: &str) -> MergeResult<KernelHandle> {
        if !self
            .programs
            .get(program.0 as usize)
            .copied()
            .unwrap_or(false)
        {
            return Err(MergeError::InvalidHandle("program"));
        }
        let entry =
            MergeEntry::resolve(name).ok_or_else(|| MergeError::UnknownKernel(name.to_string()))?;
        self.kernels.push(Some(KernelState {
            entry,
            args: Vec::new(),
        }));
        Ok(KernelHandle((self.kernels.len() - 1) as u32))
    }

    fn release_program(&mut self, program: ProgramHandle) {
        if let Some(alive) = self.programs.get_mut(program.0 as usize) {
            *alive = false;
        }
    }

    fn release_kernel(&mut self, kernel: KernelHandle) {
        if let Some(slot) = self.kernels.get_mut(kernel.0 as usize) {
            *slot = None;
        }
    }

    fn set_kernel_arg(
        &mut self,
        kernel: KernelHandle,
        index: usize,
        arg: KernelArg,
    ) -> MergeResult<()> {
        let state = self
            .kernels
            .get_mut(kernel.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(MergeError::InvalidHandle("kernel"))?;
        if state.args.len() <= index {
            state.args.resize(index + 1, None);
        }
        state.args[index] = Some(arg);
        Ok(())
    }

    fn enqueue_write_buffer(&mut self, buffer: BufferHandle, data: &[f32]) -> MergeResult<()> {
        let dst = self.buffer_mut(buffer)?;
        let Some(front) = dst.get_mut(..data.len()) else {
            return Err(MergeError::Device(format!(
                "write of {} words past the end of a device buffer",
                data.len()
            )));
        };
        front.copy_from_slice(data);
        Ok(())
    }

    fn enqueue_read_buffer(&mut self, buffer: BufferHandle, out: &mut [f32]) -> MergeResult<()> {
        let src = self.buffer_mut(buffer)?;
        let Some(front) = src.get(..out.len()) else {
            return Err(MergeError::Device(
                "read past the end of a device buffer".to_string(),
            ));
        };
        out.copy_from_slice(front);
        Ok(())
    }

    fn enqueue_kernel(
        &mut self,
        kernel: KernelHandle,
        global_size: u32,
        _local_size: u32,
    ) -> MergeResult<()> {
        let state = self
            .kernels
            .get(kernel.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(MergeError::InvalidHandle("kernel"))?;
        let entry = state.entry;
        let width = arg_u32(&state.args, 0)?;
        let height = arg_u32(&state.args, 1)?;
        let framebuffer = arg_buffer(&state.args, 2)?;
        let (samples, scale) = match entry {
            MergeEntry::AccumulatePerPixel | MergeEntry::AccumulatePerScreen => (
                Some(arg_buffer(&state.args, 3)?),
                [
                    arg_f32(&state.args, 4)?,
                    arg_f32(&state.args, 5)?,
                    arg_f32(&state.args, 6)?,
                ],
            ),
            _ => (None, [0.0; 3]),
        };

        // Same bound the device kernels apply per instance.
        let pixel_count = ((width as usize) * (height as usize)).min(global_size as usize);

        match entry {
            MergeEntry::Initialize => {
                let fb = self.buffer_mut(framebuffer)?;
                bounded(fb, pixel_count * 4, "framebuffer")?
                    .par_chunks_mut(4)
                    .for_each(|pixel| {
                        pixel[0] = 0.0;
                        pixel[1] = 0.0;
                        pixel[2] = 0.0;
                    });
            }
            MergeEntry::AccumulatePerPixel => {
                let samples = samples.ok_or(MergeError::InvalidHandle("sample buffer"))?;
                let (fb, sm) = self.framebuffer_and_samples(framebuffer, samples)?;
                if sm.len() < pixel_count * 4 {
                    return Err(MergeError::Device(
                        "sample buffer shorter than the dispatch range".to_string(),
                    ));
                }
                bounded(fb, pixel_count * 4, "framebuffer")?
                    .par_chunks_mut(4)
                    .zip(sm[..pixel_count * 4].par_chunks(4))
                    .for_each(|(pixel, sample)| {
                        let weight = sample[3];
                        if weight > 0.0 {
                            pixel[0] += scale[0] * sample[0] / weight;
                            pixel[1] += scale[1] * sample[1] / weight;
                            pixel[2] += scale[2] * sample[2] / weight;
                        }
                    });
            }
            MergeEntry::AccumulatePerScreen => {
                let samples = samples.ok_or(MergeError::InvalidHandle("sample buffer"))?;
                let (fb, sm) = self.framebuffer_and_samples(framebuffer, samples)?;
                if sm.len() < pixel_count * 3 {
                    return Err(MergeError::Device(
                        "sample buffer shorter than the dispatch range".to_string(),
                    ));
                }
                bounded(fb, pixel_count * 4, "framebuffer")?
                    .par_chunks_mut(4)
                    .zip(sm[..pixel_count * 3].par_chunks(3))
                    .for_each(|(pixel, sample)| {
                        pixel[0] += scale[0] * sample[0];
                        pixel[1] += scale[1] * sample[1];
                        pixel[2] += scale[2] * sample[2];
                    });
            }
            MergeEntry::Finalize => {
                // Identity hook; the bounds check is the whole body.
                let fb = self.buffer_mut(framebuffer)?;
                bounded(fb, pixel_count * 4, "framebuffer")?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> MergeResult<()> {
        // Enqueues execute eagerly, the queue is always drained.
        Ok(())
    }
}
