//! CUDA device backend.
//!
//! Drives one NVIDIA GPU through the driver API: the merge program is
//! compiled at runtime with NVRTC and dispatched on the context default
//! stream, which is in-order and so provides the queue semantics the
//! [`HardwareDevice`] contract requires.

use std::sync::Arc;

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{
    CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};
use tracing::debug;

use super::{
    BufferAccess, BufferHandle, DeviceDescriptor, DeviceKind, EmptyDataset, HardwareDevice,
    KernelArg, KernelHandle, ProgramHandle,
};
use crate::{MergeError, MergeResult};

struct KernelState {
    func: CudaFunction,
    args: Vec<Option<KernelArg>>,
}

/// One CUDA GPU behind the [`HardwareDevice`] surface.
pub struct CudaDevice {
    #[allow(dead_code)]
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    descriptor: DeviceDescriptor,
    buffers: Vec<Option<CudaSlice<f32>>>,
    modules: Vec<Option<Arc<CudaModule>>>,
    // Released programs parked here: function handles need their module
    // resident until the device goes away.
    #[allow(dead_code)]
    retired_modules: Vec<Arc<CudaModule>>,
    kernels: Vec<Option<KernelState>>,
    used: u64,
    verbose: bool,
    started: bool,
}

impl CudaDevice {
    /// Describe every CUDA device the driver reports.
    pub fn enumerate() -> Vec<DeviceDescriptor> {
        let count = CudaContext::device_count().unwrap_or(0);
        (0..count)
            .filter_map(|ordinal| {
                let ctx = CudaContext::new(ordinal as usize).ok()?;
                let major = ctx
                    .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
                    .unwrap_or(0);
                let minor = ctx
                    .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
                    .unwrap_or(0);
                Some(DeviceDescriptor {
                    kind: DeviceKind::CudaGpu,
                    name: ctx
                        .name()
                        .unwrap_or_else(|_| format!("CUDA device {ordinal}")),
                    compute_capability: Some((major as u32, minor as u32)),
                    ordinal: ordinal as usize,
                })
            })
            .collect()
    }

    /// Open one device by driver ordinal.
    pub fn open(ordinal: usize) -> MergeResult<Self> {
        let ctx = CudaContext::new(ordinal)
            .map_err(|e| MergeError::DeviceCreation(format!("CUDA init failed: {e:?}")))?;
        let stream = ctx.default_stream();
        let major = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(0);
        let minor = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(0);
        let descriptor = DeviceDescriptor {
            kind: DeviceKind::CudaGpu,
            name: ctx
                .name()
                .unwrap_or_else(|_| format!("CUDA device {ordinal}")),
            compute_capability: Some((major as u32, minor as u32)),
            ordinal,
        };
        Ok(Self {
            ctx,
            stream,
            descriptor,
            buffers: Vec::new(),
            modules: Vec::new(),
            retired_modules: Vec::new(),
            kernels: Vec::new(),
            used: 0,
            verbose: false,
            started: false,
        })
    }

    /// Check if any CUDA device is usable.
    pub fn is_available() -> bool {
        CudaContext::new(0).is_ok()
    }

    fn ensure_started(&self) -> MergeResult<()> {
        if self.started {
            Ok(())
        } else {
            Err(MergeError::Device("device was never started".to_string()))
        }
    }

    fn slice(&self, handle: BufferHandle) -> MergeResult<&CudaSlice<f32>> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(MergeError::InvalidHandle("buffer"))
    }

    fn slice_mut(&mut self, handle: BufferHandle) -> MergeResult<&mut CudaSlice<f32>> {
        self.buffers
            .get_mut(handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(MergeError::InvalidHandle("buffer"))
    }
}

/// Expand `-D NAME[=VALUE]` build options into an NVRTC source preamble.
fn define_preamble(options: &str) -> String {
    let mut preamble = String::new();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        let define = if token == "-D" {
            tokens.next()
        } else {
            token.strip_prefix("-D")
        };
        if let Some(define) = define {
            match define.split_once('=') {
                Some((name, value)) => preamble.push_str(&format!("#define {name} {value}\n")),
                None => preamble.push_str(&format!("#define {define}\n")),
            }
        }
    }
    preamble
}

impl HardwareDevice for CudaDevice {
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
        let buffer = match init {
            Some(init) => {
                if init.len() != words {
                    return Err(MergeError::BufferAllocation {
                        label: label.to_string(),
                        reason: format!("init data of {} words, buffer of {words}", init.len()),
                    });
                }
                self.stream
                    .clone_htod(init)
                    .map_err(|e| MergeError::BufferAllocation {
                        label: label.to_string(),
                        reason: format!("{e:?}"),
                    })?
            }
            None => {
                self.stream
                    .alloc_zeros(words)
                    .map_err(|e| MergeError::BufferAllocation {
                        label: label.to_string(),
                        reason: format!("{e:?}"),
                    })?
            }
        };
        if self.verbose {
            debug!("[{}] buffer {label}: {} bytes", self.descriptor.name, words * 4);
        }
        self.used += (words * 4) as u64;
        self.buffers.push(Some(buffer));
        Ok(BufferHandle((self.buffers.len() - 1) as u32))
    }

    fn free_buffer(&mut self, buffer: BufferHandle) {
        if let Some(slot) = self.buffers.get_mut(buffer.0 as usize) {
            if let Some(slice) = slot.take() {
                self.used -= (slice.len() * 4) as u64;
            }
        }
    }

    fn compile_program(
        &mut self,
        options: &str,
        source: &str,
        label: &str,
    ) -> MergeResult<ProgramHandle> {
        self.ensure_started()?;
        // Build defines travel as a source preamble, NVRTC's side of -D.
        let source = format!("{}{}", define_preamble(options), source);
        let ptx = cudarc::nvrtc::compile_ptx(source)
            .map_err(|e| MergeError::KernelCompilation(format!("{label}: {e:?}")))?;
        let module = self
            .ctx
            .load_module(ptx)
            .map_err(|e| MergeError::KernelCompilation(format!("{label}: {e:?}")))?;
        if self.verbose {
            debug!("[{}] program {label} compiled", self.descriptor.name);
        }
        self.modules.push(Some(module));
        Ok(ProgramHandle((self.modules.len() - 1) as u32))
    }

    fn get_kernel(&mut self, program: ProgramHandle, name: &str) -> MergeResult<KernelHandle> {
        let module = self
            .modules
            .get(program.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(MergeError::InvalidHandle("program"))?;
        let func = module
            .load_function(name)
            .map_err(|_| MergeError::UnknownKernel(name.to_string()))?;
        self.kernels.push(Some(KernelState {
            func,
            args: Vec::new(),
        }));
        Ok(KernelHandle((self.kernels.len() - 1) as u32))
    }

    fn release_program(&mut self, program: ProgramHandle) {
        if let Some(slot) = self.modules.get_mut(program.0 as usize) {
            if let Some(module) = slot.take() {
                self.retired_modules.push(module);
            }
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
        let stream = self.stream.clone();
        let slice = self.slice_mut(buffer)?;
        stream
            .memcpy_htod(data, slice)
            .map_err(|e| MergeError::Device(format!("upload failed: {e:?}")))
    }

    fn enqueue_read_buffer(&mut self, buffer: BufferHandle, out: &mut [f32]) -> MergeResult<()> {
        let slice = self.slice(buffer)?;
        // The copy cannot outlive the host borrow, so it completes before
        // returning; in-order queueing still runs all prior work first.
        self.stream
            .memcpy_dtoh(slice, out)
            .map_err(|e| MergeError::Device(format!("download failed: {e:?}")))?;
        self.stream
            .synchronize()
            .map_err(|e| MergeError::Device(format!("download sync failed: {e:?}")))
    }

    fn enqueue_kernel(
        &mut self,
        kernel: KernelHandle,
        global_size: u32,
        local_size: u32,
    ) -> MergeResult<()> {
        let state = self
            .kernels
            .get(kernel.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(MergeError::InvalidHandle("kernel"))?;

        enum Resolved<'a> {
            U32(u32),
            F32(f32),
            Buffer(&'a CudaSlice<f32>),
        }

        let mut resolved = Vec::with_capacity(state.args.len());
        for arg in &state.args {
            let arg = arg.ok_or(MergeError::InvalidHandle("unbound kernel argument"))?;
            resolved.push(match arg {
                KernelArg::U32(v) => Resolved::U32(v),
                KernelArg::F32(v) => Resolved::F32(v),
                KernelArg::Buffer(handle) => Resolved::Buffer(
                    self.buffers
                        .get(handle.0 as usize)
                        .and_then(|slot| slot.as_ref())
                        .ok_or(MergeError::InvalidHandle("buffer"))?,
                ),
            });
        }

        let cfg = LaunchConfig {
            grid_dim: (global_size.div_ceil(local_size), 1, 1),
            block_dim: (local_size, 1, 1),
            shared_mem_bytes: 0,
        };
        let mut builder = self.stream.launch_builder(&state.func);
        for arg in &resolved {
            match arg {
                Resolved::U32(v) => {
                    builder.arg(v);
                }
                Resolved::F32(v) => {
                    builder.arg(v);
                }
                Resolved::Buffer(slice) => {
                    builder.arg(*slice);
                }
            }
        }

        #[allow(unsafe_code)]
        unsafe { builder.launch(cfg) }
            .map_err(|e| MergeError::Device(format!("dispatch failed: {e:?}")))?;
        Ok(())
    }

    fn finish(&mut self) -> MergeResult<()> {
        self.stream
            .synchronize()
            .map_err(|e| MergeError::Device(format!("queue drain failed: {e:?}")))
    }
}
