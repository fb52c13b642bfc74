//! System OpenCL driver
//!
//! Thin mapping from the [`Driver`] seam onto `ocl::core`. Driver objects
//! are held in id-keyed tables; removing an entry drops the `ocl` wrapper,
//! which releases the underlying CL object.
//!
//! Transfers are enqueued non-blocking. Their staging buffers are parked on
//! the queue until `finish`, where completed reads are copied into the
//! caller's [`HostMemory`].

use super::{ArgValue, Driver};
use crate::buffer::{Access, HostMemory};
use crate::error::{ComputeError, Result};
use crate::frame::WorkSize;
use crate::handle::{ContextId, DriverObject, KernelId, MemId, ProgramId, QueueId};
use crate::platform::{Device, DeviceHandle, DeviceKind, PlatformHandle, PlatformInfo};
use ocl::core::{
    self, ArgVal, CommandQueue, Context, ContextProperties, DeviceId, DeviceInfo, DeviceInfoResult,
    DeviceType, Event, Kernel, KernelInfo, KernelInfoResult, Mem, MemFlags, PlatformId,
    PlatformInfo as ClPlatformInfo, Program, Status,
};
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Transfer kept alive until its queue drains
enum Staged {
    Write(Vec<u8>),
    Read { staging: Vec<u8>, target: HostMemory },
}

struct QueueEntry {
    queue: CommandQueue,
    staged: Vec<Staged>,
}

#[derive(Default)]
struct OclState {
    platforms: Vec<PlatformId>,
    devices: HashMap<DeviceHandle, (PlatformId, DeviceId)>,
    contexts: HashMap<ContextId, (Context, DeviceId)>,
    queues: HashMap<QueueId, QueueEntry>,
    programs: HashMap<ProgramId, (Program, DeviceId)>,
    kernels: HashMap<KernelId, Kernel>,
    memory: HashMap<MemId, Mem>,
}

/// Driver backed by the installed OpenCL ICD
pub struct OclDriver {
    state: Mutex<OclState>,
}

fn map_error(operation: &'static str, err: core::Error) -> ComputeError {
    let message = err.to_string();
    match err.api_status() {
        Some(Status::CL_OUT_OF_HOST_MEMORY) | Some(Status::CL_OUT_OF_RESOURCES) => {
            ComputeError::OutOfMemory(message)
        }
        Some(Status::CL_DEVICE_NOT_AVAILABLE) => ComputeError::DeviceNotAvailable(message),
        Some(Status::CL_COMPILER_NOT_AVAILABLE) => ComputeError::CompilerNotAvailable(message),
        Some(Status::CL_BUILD_PROGRAM_FAILURE) => ComputeError::BuildFailure { log: message },
        Some(Status::CL_INVALID_KERNEL_NAME) => ComputeError::InvalidKernelName(message),
        Some(Status::CL_INVALID_BUFFER_SIZE) | Some(Status::CL_MEM_OBJECT_ALLOCATION_FAILURE) => {
            ComputeError::AllocationFailed(message)
        }
        Some(Status::CL_INVALID_WORK_DIMENSION)
        | Some(Status::CL_INVALID_WORK_GROUP_SIZE)
        | Some(Status::CL_INVALID_WORK_ITEM_SIZE)
        | Some(Status::CL_INVALID_GLOBAL_WORK_SIZE) => ComputeError::InvalidWorkSize(message),
        _ => ComputeError::driver(operation, message),
    }
}

fn device_type(kind: DeviceKind) -> DeviceType {
    match kind {
        DeviceKind::Cpu => DeviceType::CPU,
        DeviceKind::Gpu => DeviceType::GPU,
        DeviceKind::Accelerator => DeviceType::ACCELERATOR,
    }
}

fn mem_flags(access: Access) -> MemFlags {
    match access {
        Access::ReadOnly => MemFlags::new().read_only(),
        Access::WriteOnly => MemFlags::new().write_only(),
        Access::ReadWrite => MemFlags::new().read_write(),
    }
}

fn platform_string(platform: PlatformId, request: ClPlatformInfo) -> String {
    core::get_platform_info(platform, request)
        .map(|r| r.to_string())
        .unwrap_or_default()
}

fn device_string(device: DeviceId, request: DeviceInfo) -> String {
    core::get_device_info(device, request)
        .map(|r| r.to_string())
        .unwrap_or_default()
}

fn device_usize(device: DeviceId, request: DeviceInfo) -> usize {
    match core::get_device_info(device, request) {
        Ok(DeviceInfoResult::MaxComputeUnits(n)) => n as usize,
        Ok(DeviceInfoResult::MaxWorkGroupSize(n)) => n,
        Ok(DeviceInfoResult::MaxWorkItemDimensions(n)) => n as usize,
        _ => 0,
    }
}

fn device_item_sizes(device: DeviceId) -> Vec<usize> {
    match core::get_device_info(device, DeviceInfo::MaxWorkItemSizes) {
        Ok(DeviceInfoResult::MaxWorkItemSizes(sizes)) => sizes,
        _ => Vec::new(),
    }
}

fn invalid(operation: &'static str, what: impl std::fmt::Debug) -> ComputeError {
    ComputeError::driver(operation, format!("invalid object {:?}", what))
}

impl OclDriver {
    /// Open the system OpenCL runtime
    pub fn new() -> Result<Self> {
        let platforms = core::get_platform_ids().map_err(|e| map_error("get_platform_ids", e))?;
        debug!("OpenCL runtime reports {} platform(s)", platforms.len());

        Ok(Self {
            state: Mutex::new(OclState {
                platforms,
                ..OclState::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, OclState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Driver for OclDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        let state = self.state();
        Ok(state
            .platforms
            .iter()
            .enumerate()
            .map(|(index, &platform)| PlatformInfo {
                handle: PlatformHandle::new(index as u64),
                name: platform_string(platform, ClPlatformInfo::Name),
                version: platform_string(platform, ClPlatformInfo::Version),
                extensions: platform_string(platform, ClPlatformInfo::Extensions),
            })
            .collect())
    }

    fn devices(&self, platform: PlatformHandle, kind: DeviceKind) -> Result<Vec<Device>> {
        let mut state = self.state();
        let index = platform.raw();
        let platform_id = *state
            .platforms
            .get(index as usize)
            .ok_or_else(|| invalid("devices", platform))?;

        let ids = match core::get_device_ids(platform_id, Some(device_type(kind)), None) {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => return Err(ComputeError::NoDevices(kind)),
            Err(e) if e.api_status() == Some(Status::CL_DEVICE_NOT_FOUND) => {
                return Err(ComputeError::NoDevices(kind));
            }
            Err(e) => return Err(map_error("get_device_ids", e)),
        };

        let mut devices = Vec::with_capacity(ids.len());
        for (position, id) in ids.into_iter().enumerate() {
            let handle = DeviceHandle::new(
                (index << 32) | ((kind as u64) << 24) | position as u64,
            );
            state.devices.insert(handle, (platform_id, id));

            devices.push(Device {
                kind,
                name: device_string(id, DeviceInfo::Name),
                extensions: device_string(id, DeviceInfo::Extensions),
                version: device_string(id, DeviceInfo::Version),
                compute_units: device_usize(id, DeviceInfo::MaxComputeUnits),
                max_work_group_size: device_usize(id, DeviceInfo::MaxWorkGroupSize),
                max_work_item_dimensions: device_usize(id, DeviceInfo::MaxWorkItemDimensions),
                max_work_item_sizes: device_item_sizes(id),
                handle,
            });
        }
        Ok(devices)
    }

    fn create_context(&self, device: DeviceHandle) -> Result<ContextId> {
        let mut state = self.state();
        let (platform, device_id) = *state
            .devices
            .get(&device)
            .ok_or_else(|| invalid("create_context", device))?;

        let properties = ContextProperties::new().platform(platform);
        let context = core::create_context(Some(&properties), &[device_id], None, None)
            .map_err(|e| map_error("create_context", e))?;

        let id = ContextId::next();
        state.contexts.insert(id, (context, device_id));
        Ok(id)
    }

    fn create_queue(&self, context: ContextId, device: DeviceHandle) -> Result<QueueId> {
        let mut state = self.state();
        let (_, device_id) = *state
            .devices
            .get(&device)
            .ok_or_else(|| invalid("create_queue", device))?;
        let (cl_context, _) = state
            .contexts
            .get(&context)
            .ok_or_else(|| invalid("create_queue", context))?;

        let queue = core::create_command_queue(cl_context, device_id, None)
            .map_err(|e| map_error("create_queue", e))?;

        let id = QueueId::next();
        state.queues.insert(
            id,
            QueueEntry {
                queue,
                staged: Vec::new(),
            },
        );
        Ok(id)
    }

    fn create_program(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        let mut state = self.state();
        let (cl_context, device_id) = state
            .contexts
            .get(&context)
            .ok_or_else(|| invalid("create_program", context))?;
        let device_id = *device_id;

        let source = CString::new(source)
            .map_err(|_| ComputeError::driver("create_program", "source contains a NUL byte"))?;
        let program = core::create_program_with_source(cl_context, &[source])
            .map_err(|e| map_error("create_program", e))?;

        let id = ProgramId::next();
        state.programs.insert(id, (program, device_id));
        Ok(id)
    }

    fn build_program(&self, program: ProgramId, options: &str) -> Result<()> {
        let state = self.state();
        let (cl_program, device_id) = state
            .programs
            .get(&program)
            .ok_or_else(|| invalid("build_program", program))?;

        let options = CString::new(options)
            .map_err(|_| ComputeError::driver("build_program", "options contain a NUL byte"))?;

        // ocl-core folds the build log into the error text
        core::build_program(cl_program, Some(&[*device_id]), &options, None, None).map_err(|e| {
            match map_error("build_program", e) {
                ComputeError::Driver { message, .. } => ComputeError::BuildFailure { log: message },
                other => other,
            }
        })
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.state();
        let (cl_program, _) = state
            .programs
            .get(&program)
            .ok_or_else(|| invalid("create_kernel", program))?;

        let kernel = core::create_kernel(cl_program, name).map_err(|e| match e.api_status() {
            Some(Status::CL_INVALID_KERNEL_NAME) => ComputeError::InvalidKernelName(name.to_string()),
            _ => map_error("create_kernel", e),
        })?;

        let id = KernelId::next();
        state.kernels.insert(id, kernel);
        Ok(id)
    }

    fn create_memory(&self, context: ContextId, access: Access, size: usize) -> Result<MemId> {
        let mut state = self.state();
        let (cl_context, _) = state
            .contexts
            .get(&context)
            .ok_or_else(|| invalid("create_memory", context))?;

        // SAFETY: no host pointer is passed; the runtime owns the allocation
        let memory = unsafe { core::create_buffer::<_, u8>(cl_context, mem_flags(access), size, None) }
            .map_err(|e| map_error("create_memory", e))?;

        let id = MemId::next();
        state.memory.insert(id, memory);
        Ok(id)
    }

    fn enqueue_write(&self, queue: QueueId, memory: MemId, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let staging = data.to_vec();
        let mem = state
            .memory
            .get(&memory)
            .ok_or_else(|| invalid("enqueue_write", memory))?
            .clone();
        let entry = state
            .queues
            .get_mut(&queue)
            .ok_or_else(|| invalid("enqueue_write", queue))?;

        // SAFETY: `staging` is parked on the queue until `finish` returns
        unsafe {
            core::enqueue_write_buffer(
                &entry.queue,
                &mem,
                false,
                0,
                &staging,
                None::<Event>,
                None::<&mut Event>,
            )
        }
        .map_err(|e| map_error("enqueue_write", e))?;

        entry.staged.push(Staged::Write(staging));
        Ok(())
    }

    fn enqueue_read(&self, queue: QueueId, memory: MemId, target: HostMemory) -> Result<()> {
        let mut state = self.state();
        let mut staging = vec![0u8; target.len()];
        let mem = state
            .memory
            .get(&memory)
            .ok_or_else(|| invalid("enqueue_read", memory))?
            .clone();
        let entry = state
            .queues
            .get_mut(&queue)
            .ok_or_else(|| invalid("enqueue_read", queue))?;

        // SAFETY: `staging` is parked on the queue until `finish` returns
        unsafe {
            core::enqueue_read_buffer(
                &entry.queue,
                &mem,
                false,
                0,
                &mut staging,
                None::<Event>,
                None::<&mut Event>,
            )
        }
        .map_err(|e| map_error("enqueue_read", e))?;

        entry.staged.push(Staged::Read { staging, target });
        Ok(())
    }

    fn kernel_arg_count(&self, kernel: KernelId) -> Result<u32> {
        let state = self.state();
        let cl_kernel = state
            .kernels
            .get(&kernel)
            .ok_or_else(|| invalid("kernel_arg_count", kernel))?;

        match core::get_kernel_info(cl_kernel, KernelInfo::NumArgs) {
            Ok(KernelInfoResult::NumArgs(count)) => Ok(count),
            Ok(other) => Err(ComputeError::driver(
                "kernel_arg_count",
                format!("unexpected kernel info {:?}", other),
            )),
            Err(e) => Err(map_error("kernel_arg_count", e)),
        }
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue<'_>) -> Result<()> {
        let state = self.state();
        let cl_kernel = state
            .kernels
            .get(&kernel)
            .ok_or_else(|| invalid("set_kernel_arg", kernel))?;

        let result = match value {
            ArgValue::Memory(memory) => {
                let mem = state.memory.get(&memory).ok_or(ComputeError::KernelArgument {
                    index,
                    reason: format!("invalid memory object {:?}", memory),
                })?;
                core::set_kernel_arg(cl_kernel, index, ArgVal::mem(mem))
            }
            ArgValue::Bytes(bytes) => {
                // SAFETY: the runtime copies `bytes` before returning
                let arg = unsafe { ArgVal::from_raw(bytes.len(), bytes.as_ptr() as *const _, false) };
                core::set_kernel_arg(cl_kernel, index, arg)
            }
        };

        result.map_err(|e| ComputeError::KernelArgument {
            index,
            reason: e.to_string(),
        })
    }

    fn enqueue_launch(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &WorkSize,
        local: &WorkSize,
    ) -> Result<()> {
        let state = self.state();
        let cl_kernel = state
            .kernels
            .get(&kernel)
            .ok_or_else(|| invalid("enqueue_launch", kernel))?;
        let entry = state
            .queues
            .get(&queue)
            .ok_or_else(|| invalid("enqueue_launch", queue))?;

        // SAFETY: every argument slot was bound by the caller
        unsafe {
            core::enqueue_kernel(
                &entry.queue,
                cl_kernel,
                global.dim() as u32,
                None,
                &global.padded(),
                Some(local.padded()),
                None::<Event>,
                None::<&mut Event>,
            )
        }
        .map_err(|e| map_error("enqueue_launch", e))
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        let (cl_queue, staged) = {
            let mut state = self.state();
            let entry = state
                .queues
                .get_mut(&queue)
                .ok_or_else(|| invalid("finish", queue))?;
            (entry.queue.clone(), std::mem::take(&mut entry.staged))
        };

        // Staging stays alive until the drain returns
        core::finish(&cl_queue).map_err(|e| map_error("finish", e))?;

        for transfer in staged {
            if let Staged::Read { staging, target } = transfer {
                target.store(&staging)?;
            }
        }
        Ok(())
    }

    fn release(&self, object: DriverObject) -> Result<()> {
        if let DriverObject::Queue(id) = object {
            // Drained outside the lock, with its staging still alive
            let entry = self.state().queues.remove(&id).ok_or_else(|| invalid("release", object))?;
            if let Err(e) = core::finish(&entry.queue) {
                warn!("Queue {:?} did not drain before release: {}", id, e);
            }
            return Ok(());
        }

        let mut state = self.state();
        let found = match object {
            DriverObject::Context(id) => state.contexts.remove(&id).is_some(),
            DriverObject::Queue(_) => false,
            DriverObject::Program(id) => state.programs.remove(&id).is_some(),
            DriverObject::Kernel(id) => state.kernels.remove(&id).is_some(),
            DriverObject::Memory(id) => state.memory.remove(&id).is_some(),
        };

        if !found {
            return Err(invalid("release", object));
        }
        Ok(())
    }
}
