//! Compute-device abstraction for the merge core.
//!
//! [`HardwareDevice`] is the surface the merge core drives: buffer
//! allocation, program compilation, kernel argument binding, and a single
//! in-order work queue. Handles are opaque ids owned by the device; the
//! caller never touches device memory directly.

mod select;
mod software;

#[cfg(feature = "cuda")]
mod cuda;

pub use select::{hardware_only, select_device, MergeConfig};
pub use software::SoftwareDevice;

#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;

use crate::MergeResult;

/// Accelerator families a descriptor can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// NVIDIA GPU driven through the CUDA driver API.
    CudaGpu,
    /// GPU reachable through a portable compute API.
    GenericGpu,
    /// In-process software execution.
    Cpu,
}

impl DeviceKind {
    /// Whether selection may consider this device at all.
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::CudaGpu | Self::GenericGpu)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::CudaGpu => "CUDA GPU",
            Self::GenericGpu => "GPU",
            Self::Cpu => "CPU",
        }
    }
}

/// One enumerated accelerator, re-listed fresh on each selection.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub name: String,
    /// Compute API version where the platform reports one (major, minor).
    pub compute_capability: Option<(u32, u32)>,
    /// Platform-local ordinal used to open the device.
    pub ordinal: usize,
}

/// Opaque id of a device-resident buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle(pub(crate) u32);

/// Opaque id of a compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHandle(pub(crate) u32);

/// Opaque id of a resolved kernel entry point plus its argument slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandle(pub(crate) u32);

/// A value bound to one positional kernel argument slot.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg {
    U32(u32),
    F32(f32),
    Buffer(BufferHandle),
}

/// Kernel-side access intent for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    ReadWrite,
    ReadOnly,
}

/// The placeholder dataset every device must carry before it can start.
///
/// A protocol requirement of the compute platform, not domain logic: a
/// context refuses to start without some dataset attached, even a trivial
/// one, and the dataset must be preprocessed first.
#[derive(Debug, Default)]
pub struct EmptyDataset {
    preprocessed: bool,
}

impl EmptyDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preprocess(&mut self) {
        self.preprocessed = true;
    }

    pub fn is_preprocessed(&self) -> bool {
        self.preprocessed
    }

    /// Error unless preprocessing ran; devices call this from `start`.
    pub fn ensure_preprocessed(&self) -> MergeResult<()> {
        if self.preprocessed {
            Ok(())
        } else {
            Err(crate::MergeError::Device(
                "dataset must be preprocessed before the device starts".to_string(),
            ))
        }
    }
}

/// One compute accelerator with a single in-order work queue.
///
/// All `enqueue_*` methods are non-blocking submissions; same-queue
/// operations execute in submission order, and [`finish`](Self::finish)
/// blocks until everything submitted so far has completed. Argument slots
/// set with [`set_kernel_arg`](Self::set_kernel_arg) persist until rebound.
pub trait HardwareDevice: Send {
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Attach the dataset and start the device's internal processing.
    fn start(&mut self, dataset: EmptyDataset) -> MergeResult<()>;

    /// Gate per-allocation and per-compile diagnostics.
    fn set_verbose(&mut self, verbose: bool);

    /// Bytes of device memory currently allocated through this device.
    fn used_memory(&self) -> u64;

    /// Allocate `words` f32 words, zeroed, or seeded from `init` when given
    /// (`init` must then be exactly `words` long).
    fn alloc_buffer(
        &mut self,
        access: BufferAccess,
        init: Option<&[f32]>,
        words: usize,
        label: &str,
    ) -> MergeResult<BufferHandle>;

    /// Free a buffer; the handle is dead afterwards. Stale handles are ignored.
    fn free_buffer(&mut self, buffer: BufferHandle);

    fn compile_program(
        &mut self,
        options: &str,
        source: &str,
        label: &str,
    ) -> MergeResult<ProgramHandle>;

    /// Resolve one entry point of a compiled program.
    fn get_kernel(&mut self, program: ProgramHandle, name: &str) -> MergeResult<KernelHandle>;

    /// Release a program; kernels already resolved from it stay valid.
    fn release_program(&mut self, program: ProgramHandle);

    fn release_kernel(&mut self, kernel: KernelHandle);

    /// Bind one positional argument slot; the binding persists across
    /// dispatches until rebound.
    fn set_kernel_arg(&mut self, kernel: KernelHandle, index: usize, arg: KernelArg)
        -> MergeResult<()>;

    /// Enqueue a host-to-device copy into the front of the buffer.
    fn enqueue_write_buffer(&mut self, buffer: BufferHandle, data: &[f32]) -> MergeResult<()>;

    /// Enqueue a device-to-host copy; complete once [`finish`](Self::finish)
    /// returns.
    fn enqueue_read_buffer(&mut self, buffer: BufferHandle, out: &mut [f32]) -> MergeResult<()>;

    /// Enqueue a 1-D dispatch of `global_size` instances in groups of
    /// `local_size`.
    fn enqueue_kernel(
        &mut self,
        kernel: KernelHandle,
        global_size: u32,
        local_size: u32,
    ) -> MergeResult<()>;

    /// Block until every enqueued operation has completed.
    fn finish(&mut self) -> MergeResult<()>;
}
