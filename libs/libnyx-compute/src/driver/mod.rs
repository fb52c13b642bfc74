//! Driver seam
//!
//! A [`Driver`] owns every driver-level object and names them with the opaque
//! ids from [`crate::handle`]. The caching and dispatch layers only ever talk
//! to a driver through this trait.
//!
//! Two implementations ship with the crate:
//!
//! - [`host::HostDriver`]: an in-process reference device. Kernels are Rust
//!   closures registered by entry-point name.
//! - `opencl::OclDriver` (feature `opencl`): the system OpenCL runtime.

pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;

use crate::buffer::{Access, HostMemory};
use crate::error::Result;
use crate::frame::WorkSize;
use crate::handle::{ContextId, DriverObject, KernelId, MemId, ProgramId, QueueId};
use crate::platform::{Device, DeviceHandle, DeviceKind, PlatformHandle, PlatformInfo};

/// Value bound into a kernel argument slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgValue<'a> {
    /// Device memory object
    Memory(MemId),
    /// Raw bytes, size taken from the slice
    Bytes(&'a [u8]),
}

/// Driver-level object lifecycle and command submission
///
/// Commands enqueued on one queue execute in enqueue order. `finish` blocks
/// until everything enqueued so far on that queue has completed and reports
/// the first failure among them.
pub trait Driver: Send + Sync {
    /// Driver name for logging
    fn name(&self) -> &str;

    /// List platforms
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    /// List devices of one kind; may fail with `NoDevices`
    fn devices(&self, platform: PlatformHandle, kind: DeviceKind) -> Result<Vec<Device>>;

    /// Create a context scoped to a single device
    fn create_context(&self, device: DeviceHandle) -> Result<ContextId>;

    /// Create a command queue on a context
    fn create_queue(&self, context: ContextId, device: DeviceHandle) -> Result<QueueId>;

    /// Create an unbuilt program from source
    fn create_program(&self, context: ContextId, source: &str) -> Result<ProgramId>;

    /// Build a program synchronously
    fn build_program(&self, program: ProgramId, options: &str) -> Result<()>;

    /// Resolve an entry point in a built program
    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId>;

    /// Allocate device memory
    fn create_memory(&self, context: ContextId, access: Access, size: usize) -> Result<MemId>;

    /// Enqueue a host->device copy; `data` is captured at enqueue time
    fn enqueue_write(&self, queue: QueueId, memory: MemId, data: &[u8]) -> Result<()>;

    /// Enqueue a device->host copy; `target` is written on completion
    fn enqueue_read(&self, queue: QueueId, memory: MemId, target: HostMemory) -> Result<()>;

    /// Number of argument slots a kernel object declares
    fn kernel_arg_count(&self, kernel: KernelId) -> Result<u32>;

    /// Bind an argument slot on a kernel object
    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue<'_>) -> Result<()>;

    /// Enqueue an N-dimensional launch with the kernel's current arguments
    fn enqueue_launch(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &WorkSize,
        local: &WorkSize,
    ) -> Result<()>;

    /// Block until the queue drains
    fn finish(&self, queue: QueueId) -> Result<()>;

    /// Release a driver object
    fn release(&self, object: DriverObject) -> Result<()>;
}

/// Default system driver
#[cfg(feature = "opencl")]
pub fn system_driver() -> Result<std::sync::Arc<dyn Driver>> {
    Ok(std::sync::Arc::new(opencl::OclDriver::new()?))
}
