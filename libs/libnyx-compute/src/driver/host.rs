//! In-process reference driver
//!
//! `HostDriver` behaves like a small OpenCL runtime without any hardware:
//!
//! - Platforms and devices come from a configurable topology
//! - Building a program scans the source for `__kernel void name(...)` (or
//!   `kernel void name(...)`) entry points; a `#error` line fails the build with a build log
//! - Kernel bodies are Rust closures registered by entry-point name
//! - Each queue holds its commands until `finish`, then runs them in order
//!
//! Kernel bodies run while the driver state is locked and must not call back
//! into the driver.

use super::{ArgValue, Driver};
use crate::buffer::{decode, Access, HostMemory};
use crate::error::{ComputeError, Result};
use crate::frame::WorkSize;
use crate::handle::{ContextId, DriverObject, KernelId, MemId, ObjectKind, ProgramId, QueueId};
use crate::platform::{Device, DeviceHandle, DeviceKind, PlatformHandle, PlatformInfo};
use bytemuck::Pod;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, trace};

const HOST_VERSION: &str = "OpenCL 3.0 nyx-host";
const HOST_EXTENSIONS: &str = "cl_khr_fp64 cl_khr_int64_base_atomics cl_khr_byte_addressable_store";

/// Simulated device
#[derive(Debug, Clone)]
pub struct HostDevice {
    pub kind: DeviceKind,
    pub name: String,
    pub extensions: String,
    pub compute_units: usize,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: Vec<usize>,
    /// Total device memory in bytes
    pub memory_limit: usize,
    /// Accepts context creation
    pub available: bool,
    /// Can build programs
    pub compiler_available: bool,
}

impl HostDevice {
    pub fn new(kind: DeviceKind, name: &str) -> Self {
        let (compute_units, max_work_group_size) = match kind {
            DeviceKind::Cpu => (8, 1024),
            DeviceKind::Gpu => (32, 256),
            DeviceKind::Accelerator => (4, 64),
        };

        Self {
            kind,
            name: name.to_string(),
            extensions: HOST_EXTENSIONS.to_string(),
            compute_units,
            max_work_group_size,
            max_work_item_sizes: vec![max_work_group_size; 3],
            memory_limit: 256 * 1024 * 1024,
            available: true,
            compiler_available: true,
        }
    }

    pub fn cpu(name: &str) -> Self {
        Self::new(DeviceKind::Cpu, name)
    }

    pub fn gpu(name: &str) -> Self {
        Self::new(DeviceKind::Gpu, name)
    }

    pub fn accelerator(name: &str) -> Self {
        Self::new(DeviceKind::Accelerator, name)
    }

    pub fn compute_units(mut self, units: usize) -> Self {
        self.compute_units = units;
        self
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self.max_work_item_sizes = vec![size; 3];
        self
    }

    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn extensions(mut self, extensions: &str) -> Self {
        self.extensions = extensions.to_string();
        self
    }

    /// Reject context creation
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Reject program builds
    pub fn without_compiler(mut self) -> Self {
        self.compiler_available = false;
        self
    }

    fn record(&self, handle: DeviceHandle, version: &str) -> Device {
        Device {
            kind: self.kind,
            name: self.name.clone(),
            extensions: self.extensions.clone(),
            version: version.to_string(),
            compute_units: self.compute_units,
            max_work_group_size: self.max_work_group_size,
            max_work_item_dimensions: self.max_work_item_sizes.len(),
            max_work_item_sizes: self.max_work_item_sizes.clone(),
            handle,
        }
    }
}

/// Simulated platform
#[derive(Debug, Clone)]
pub struct HostPlatform {
    pub name: String,
    pub version: String,
    pub extensions: String,
    pub devices: Vec<HostDevice>,
}

impl HostPlatform {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: HOST_VERSION.to_string(),
            extensions: HOST_EXTENSIONS.to_string(),
            devices: Vec::new(),
        }
    }

    pub fn device(mut self, device: HostDevice) -> Self {
        self.devices.push(device);
        self
    }
}

/// Kernel body run by the host driver
pub type HostKernelFn = dyn Fn(&mut HostLaunch<'_>) -> Result<()> + Send + Sync;

enum Slot {
    Memory {
        memory: MemId,
        access: Access,
        bytes: Vec<u8>,
    },
    /// Same memory object as an earlier slot
    Alias(usize),
    Bytes(Vec<u8>),
}

fn arg_error(index: usize, reason: impl Into<String>) -> ComputeError {
    ComputeError::KernelArgument {
        index: index as u32,
        reason: reason.into(),
    }
}

/// Arguments and grid of one launch, as seen by a kernel body
pub struct HostLaunch<'a> {
    global: WorkSize,
    local: WorkSize,
    slots: &'a mut [Slot],
}

impl HostLaunch<'_> {
    pub fn global(&self) -> &WorkSize {
        &self.global
    }

    pub fn local(&self) -> &WorkSize {
        &self.local
    }

    pub fn arg_count(&self) -> usize {
        self.slots.len()
    }

    fn target(&self, index: usize) -> Result<usize> {
        match self.slots.get(index) {
            Some(Slot::Alias(first)) => Ok(*first),
            Some(_) => Ok(index),
            None => Err(arg_error(index, "no such argument")),
        }
    }

    /// Whether slot `index` holds a memory object
    pub fn is_buffer(&self, index: usize) -> bool {
        self.target(index)
            .map(|target| matches!(self.slots[target], Slot::Memory { .. }))
            .unwrap_or(false)
    }

    /// Raw bytes of a buffer or value argument
    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        match &self.slots[self.target(index)?] {
            Slot::Memory { bytes, .. } | Slot::Bytes(bytes) => Ok(bytes),
            Slot::Alias(_) => Err(arg_error(index, "dangling alias")),
        }
    }

    /// Value argument decoded as `T`
    pub fn scalar<T: Pod>(&self, index: usize) -> Result<T> {
        match &self.slots[self.target(index)?] {
            Slot::Bytes(bytes) if bytes.len() == std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            Slot::Bytes(bytes) => Err(arg_error(
                index,
                format!("{} byte value, expected {}", bytes.len(), std::mem::size_of::<T>()),
            )),
            _ => Err(arg_error(index, "not a value argument")),
        }
    }

    /// Buffer argument decoded as elements of `T`
    pub fn read<T: Pod>(&self, index: usize) -> Result<Vec<T>> {
        Ok(decode(self.bytes(index)?))
    }

    /// Overwrite the start of a buffer argument
    pub fn write<T: Pod>(&mut self, index: usize, data: &[T]) -> Result<()> {
        let target = self.target(index)?;
        match &mut self.slots[target] {
            Slot::Memory {
                access: Access::ReadOnly,
                memory,
                ..
            } => Err(arg_error(index, format!("{:?} is read-only", memory))),
            Slot::Memory { bytes, .. } => {
                let src: &[u8] = bytemuck::cast_slice(data);
                if src.len() > bytes.len() {
                    return Err(arg_error(
                        index,
                        format!("{} byte write into {} byte buffer", src.len(), bytes.len()),
                    ));
                }
                bytes[..src.len()].copy_from_slice(src);
                Ok(())
            }
            _ => Err(arg_error(index, "not a buffer argument")),
        }
    }

    /// Read a buffer argument as `T`, modify it, write it back
    pub fn update<T: Pod>(&mut self, index: usize, f: impl FnOnce(&mut [T])) -> Result<()> {
        let mut data = self.read::<T>(index)?;
        f(&mut data);
        self.write(index, &data)
    }
}

#[derive(Clone)]
enum Bound {
    Memory(MemId),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
struct EntryPoint {
    name: String,
    arity: usize,
}

struct ContextRecord {
    device: DeviceHandle,
    allocated: usize,
}

struct QueueRecord {
    context: ContextId,
    device: DeviceHandle,
    pending: VecDeque<Command>,
}

struct ProgramRecord {
    context: ContextId,
    source: String,
    entry_points: Option<Vec<EntryPoint>>,
}

struct KernelRecord {
    program: ProgramId,
    name: String,
    args: Vec<Option<Bound>>,
}

struct MemoryRecord {
    context: ContextId,
    access: Access,
    bytes: Vec<u8>,
}

enum Command {
    Write {
        memory: MemId,
        data: Vec<u8>,
    },
    Read {
        memory: MemId,
        target: HostMemory,
    },
    Launch {
        kernel: String,
        args: Vec<Option<Bound>>,
        global: WorkSize,
        local: WorkSize,
    },
}

#[derive(Default)]
struct HostState {
    contexts: HashMap<ContextId, ContextRecord>,
    queues: HashMap<QueueId, QueueRecord>,
    programs: HashMap<ProgramId, ProgramRecord>,
    kernels: HashMap<KernelId, KernelRecord>,
    memory: HashMap<MemId, MemoryRecord>,
    created: HashMap<ObjectKind, usize>,
}

impl HostState {
    fn count_created(&mut self, kind: ObjectKind) {
        *self.created.entry(kind).or_default() += 1;
    }

    /// Queue record, after checking `memory` lives in the queue's context
    fn queue_for(&mut self, queue: QueueId, memory: MemId, op: &'static str) -> Result<&mut QueueRecord> {
        let context = self
            .memory
            .get(&memory)
            .map(|m| m.context)
            .ok_or_else(|| ComputeError::driver(op, format!("invalid memory object {:?}", memory)))?;
        let record = self
            .queues
            .get_mut(&queue)
            .ok_or_else(|| ComputeError::driver(op, format!("invalid queue {:?}", queue)))?;
        if record.context != context {
            return Err(ComputeError::driver(
                op,
                format!("{:?} belongs to another context", memory),
            ));
        }
        Ok(record)
    }
}

/// Software compute driver
pub struct HostDriver {
    platforms: Vec<HostPlatform>,
    bodies: RwLock<HashMap<String, Arc<HostKernelFn>>>,
    state: Mutex<HostState>,
}

impl HostDriver {
    /// One platform with a CPU and a GPU device
    pub fn new() -> Self {
        Self::with_platforms(vec![HostPlatform::new("Nyx Host Compute")
            .device(HostDevice::cpu("Nyx Host CPU"))
            .device(HostDevice::gpu("Nyx Reference GPU"))])
    }

    pub fn with_platforms(platforms: Vec<HostPlatform>) -> Self {
        Self {
            platforms,
            bodies: RwLock::new(HashMap::new()),
            state: Mutex::new(HostState::default()),
        }
    }

    /// Register the body run for entry point `name`
    pub fn register_kernel<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut HostLaunch<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.bodies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(body));
    }

    /// Objects of `kind` ever created
    pub fn created(&self, kind: ObjectKind) -> usize {
        self.state().created.get(&kind).copied().unwrap_or(0)
    }

    /// Objects of `kind` currently alive
    pub fn live(&self, kind: ObjectKind) -> usize {
        let state = self.state();
        match kind {
            ObjectKind::Context => state.contexts.len(),
            ObjectKind::Queue => state.queues.len(),
            ObjectKind::Program => state.programs.len(),
            ObjectKind::Kernel => state.kernels.len(),
            ObjectKind::Memory => state.memory.len(),
        }
    }

    /// Commands waiting on `queue`
    pub fn pending(&self, queue: QueueId) -> usize {
        self.state()
            .queues
            .get(&queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Current device-side contents of a memory object
    pub fn device_bytes(&self, memory: MemId) -> Option<Vec<u8>> {
        self.state().memory.get(&memory).map(|m| m.bytes.clone())
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host_device(&self, handle: DeviceHandle) -> Option<&HostDevice> {
        let platform = (handle.raw() >> 32) as usize;
        let index = (handle.raw() & 0xFFFF_FFFF) as usize;
        self.platforms.get(platform)?.devices.get(index)
    }

    fn run(&self, state: &mut HostState, command: Command) -> Result<()> {
        match command {
            Command::Write { memory, data } => {
                let record = state
                    .memory
                    .get_mut(&memory)
                    .ok_or_else(|| ComputeError::driver("finish", format!("{:?} was released", memory)))?;
                record.bytes[..data.len()].copy_from_slice(&data);
                trace!("Wrote {} bytes to {:?}", data.len(), memory);
                Ok(())
            }
            Command::Read { memory, target } => {
                let record = state
                    .memory
                    .get(&memory)
                    .ok_or_else(|| ComputeError::driver("finish", format!("{:?} was released", memory)))?;
                let len = record.bytes.len().min(target.len());
                target.store(&record.bytes[..len])?;
                trace!("Read {} bytes from {:?}", len, memory);
                Ok(())
            }
            Command::Launch {
                kernel,
                args,
                global,
                local,
            } => self.launch(state, &kernel, args, global, local),
        }
    }

    fn launch(
        &self,
        state: &mut HostState,
        kernel: &str,
        args: Vec<Option<Bound>>,
        global: WorkSize,
        local: WorkSize,
    ) -> Result<()> {
        let body = self
            .bodies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kernel)
            .cloned()
            .ok_or_else(|| {
                ComputeError::driver("finish", format!("no host body registered for `{}`", kernel))
            })?;

        // Validate before taking any memory out of the state
        for (index, arg) in args.iter().enumerate() {
            match arg {
                None => return Err(arg_error(index, "not set")),
                Some(Bound::Memory(memory)) if !state.memory.contains_key(memory) => {
                    return Err(arg_error(index, format!("{:?} was released", memory)));
                }
                Some(_) => {}
            }
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(args.len());
        for arg in args.into_iter().flatten() {
            let slot = match arg {
                Bound::Bytes(bytes) => Slot::Bytes(bytes),
                Bound::Memory(memory) => {
                    let first = slots
                        .iter()
                        .position(|s| matches!(s, Slot::Memory { memory: m, .. } if *m == memory));
                    match (first, state.memory.get_mut(&memory)) {
                        (Some(first), _) => Slot::Alias(first),
                        (None, Some(record)) => Slot::Memory {
                            memory,
                            access: record.access,
                            bytes: std::mem::take(&mut record.bytes),
                        },
                        (None, None) => Slot::Bytes(Vec::new()),
                    }
                }
            };
            slots.push(slot);
        }

        debug!("Host launch `{}` over {:?}", kernel, global.sizes());
        let result = body(&mut HostLaunch {
            global,
            local,
            slots: &mut slots,
        });

        for slot in slots {
            if let Slot::Memory { memory, bytes, .. } = slot {
                if let Some(record) = state.memory.get_mut(&memory) {
                    record.bytes = bytes;
                }
            }
        }

        result
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDriver")
            .field("platforms", &self.platforms.len())
            .field(
                "kernels",
                &self.bodies.read().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .finish()
    }
}

/// Whether a `kernel` match preceded by `before` starts a qualifier token
fn at_qualifier(before: &str) -> bool {
    let before = before.strip_suffix("__").unwrap_or(before);
    !before
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Scan source for `__kernel void name(params)` and `kernel void name(params)`
fn entry_points(source: &str) -> Vec<EntryPoint> {
    let mut found = Vec::new();
    let mut rest = source;

    while let Some(pos) = rest.find("kernel") {
        let qualified = at_qualifier(&rest[..pos]);
        rest = &rest[pos + "kernel".len()..];
        if !qualified || !rest.starts_with(char::is_whitespace) {
            continue;
        }

        let Some(after) = rest.trim_start().strip_prefix("void") else {
            continue;
        };
        if !after.starts_with(char::is_whitespace) {
            continue;
        }
        let Some(open) = after.find('(') else {
            continue;
        };
        let name = after[..open].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        let Some(close) = after[open..].find(')') else {
            continue;
        };

        let params = after[open + 1..open + close].trim();
        let arity = if params.is_empty() || params == "void" {
            0
        } else {
            params.split(',').count()
        };

        found.push(EntryPoint {
            name: name.to_string(),
            arity,
        });
    }

    found
}

/// Simulated compile: reject `#error` lines and malformed options
fn compile(source: &str, options: &str) -> Result<Vec<EntryPoint>> {
    if let Some(option) = options.split_whitespace().find(|o| !o.starts_with('-')) {
        return Err(ComputeError::BuildFailure {
            log: format!("error: invalid build option '{}'", option),
        });
    }

    for (line_no, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.starts_with("#error") {
            return Err(ComputeError::BuildFailure {
                log: format!("<source>:{}: error: {}", line_no + 1, line),
            });
        }
    }

    Ok(entry_points(source))
}

fn check_grid(global: &WorkSize, local: &WorkSize, device: &HostDevice) -> Result<()> {
    if global.dim() != local.dim() {
        return Err(ComputeError::InvalidWorkSize(format!(
            "global is {}-dimensional, local is {}-dimensional",
            global.dim(),
            local.dim()
        )));
    }

    for d in 0..global.dim() {
        let (g, l) = (global.size(d), local.size(d));
        if l == 0 || g % l != 0 {
            return Err(ComputeError::InvalidWorkSize(format!(
                "global size {} is not a multiple of local size {} in dimension {}",
                g, l, d
            )));
        }
        if device.max_work_item_sizes.get(d).is_some_and(|max| l > *max) {
            return Err(ComputeError::InvalidWorkSize(format!(
                "local size {} exceeds device limit in dimension {}",
                l, d
            )));
        }
    }

    if local.total() > device.max_work_group_size {
        return Err(ComputeError::InvalidWorkSize(format!(
            "work-group of {} items exceeds device limit {}",
            local.total(),
            device.max_work_group_size
        )));
    }

    Ok(())
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(index, p)| PlatformInfo {
                handle: PlatformHandle::new(index as u64),
                name: p.name.clone(),
                version: p.version.clone(),
                extensions: p.extensions.clone(),
            })
            .collect())
    }

    fn devices(&self, platform: PlatformHandle, kind: DeviceKind) -> Result<Vec<Device>> {
        let index = platform.raw();
        let record = self
            .platforms
            .get(index as usize)
            .ok_or_else(|| ComputeError::driver("devices", format!("invalid platform {:?}", platform)))?;

        let devices: Vec<Device> = record
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.kind == kind)
            .map(|(i, d)| d.record(DeviceHandle::new((index << 32) | i as u64), &record.version))
            .collect();

        if devices.is_empty() {
            return Err(ComputeError::NoDevices(kind));
        }
        Ok(devices)
    }

    fn create_context(&self, device: DeviceHandle) -> Result<ContextId> {
        let dev = self
            .host_device(device)
            .ok_or_else(|| ComputeError::driver("create_context", format!("invalid device {:?}", device)))?;
        if !dev.available {
            return Err(ComputeError::DeviceNotAvailable(dev.name.clone()));
        }

        let id = ContextId::next();
        let mut state = self.state();
        state.contexts.insert(
            id,
            ContextRecord {
                device,
                allocated: 0,
            },
        );
        state.count_created(ObjectKind::Context);
        Ok(id)
    }

    fn create_queue(&self, context: ContextId, device: DeviceHandle) -> Result<QueueId> {
        let mut state = self.state();
        let record = state
            .contexts
            .get(&context)
            .ok_or_else(|| ComputeError::driver("create_queue", format!("invalid context {:?}", context)))?;
        if record.device != device {
            return Err(ComputeError::driver(
                "create_queue",
                format!("{:?} is not part of {:?}", device, context),
            ));
        }

        let id = QueueId::next();
        state.queues.insert(
            id,
            QueueRecord {
                context,
                device,
                pending: VecDeque::new(),
            },
        );
        state.count_created(ObjectKind::Queue);
        Ok(id)
    }

    fn create_program(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        let mut state = self.state();
        if !state.contexts.contains_key(&context) {
            return Err(ComputeError::driver(
                "create_program",
                format!("invalid context {:?}", context),
            ));
        }
        if source.trim().is_empty() {
            return Err(ComputeError::driver("create_program", "empty source"));
        }

        let id = ProgramId::next();
        state.programs.insert(
            id,
            ProgramRecord {
                context,
                source: source.to_string(),
                entry_points: None,
            },
        );
        state.count_created(ObjectKind::Program);
        Ok(id)
    }

    fn build_program(&self, program: ProgramId, options: &str) -> Result<()> {
        let mut state = self.state();
        let (context, source) = state
            .programs
            .get(&program)
            .map(|p| (p.context, p.source.clone()))
            .ok_or_else(|| ComputeError::driver("build_program", format!("invalid program {:?}", program)))?;
        let device = state
            .contexts
            .get(&context)
            .map(|c| c.device)
            .ok_or_else(|| ComputeError::driver("build_program", format!("{:?} was released", context)))?;
        let dev = self
            .host_device(device)
            .ok_or_else(|| ComputeError::driver("build_program", format!("invalid device {:?}", device)))?;

        if !dev.compiler_available {
            return Err(ComputeError::CompilerNotAvailable(dev.name.clone()));
        }

        let found = compile(&source, options)?;
        debug!(
            "Built {:?}: {:?}",
            program,
            found.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
        );
        if let Some(record) = state.programs.get_mut(&program) {
            record.entry_points = Some(found);
        }
        Ok(())
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.state();
        let record = state
            .programs
            .get(&program)
            .ok_or_else(|| ComputeError::driver("create_kernel", format!("invalid program {:?}", program)))?;
        let entry_points = record.entry_points.as_ref().ok_or_else(|| {
            ComputeError::driver("create_kernel", format!("{:?} has not been built", program))
        })?;
        let arity = entry_points
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.arity)
            .ok_or_else(|| ComputeError::InvalidKernelName(name.to_string()))?;

        let id = KernelId::next();
        state.kernels.insert(
            id,
            KernelRecord {
                program,
                name: name.to_string(),
                args: vec![None; arity],
            },
        );
        state.count_created(ObjectKind::Kernel);
        Ok(id)
    }

    fn create_memory(&self, context: ContextId, access: Access, size: usize) -> Result<MemId> {
        if size == 0 {
            return Err(ComputeError::AllocationFailed("invalid buffer size 0".into()));
        }

        let mut state = self.state();
        let record = state
            .contexts
            .get_mut(&context)
            .ok_or_else(|| ComputeError::driver("create_memory", format!("invalid context {:?}", context)))?;
        let dev = self
            .host_device(record.device)
            .ok_or_else(|| ComputeError::driver("create_memory", format!("invalid device {:?}", record.device)))?;

        if record.allocated + size > dev.memory_limit {
            return Err(ComputeError::AllocationFailed(format!(
                "{} bytes requested on {}, {} of {} in use",
                size, dev.name, record.allocated, dev.memory_limit
            )));
        }
        record.allocated += size;

        let id = MemId::next();
        state.memory.insert(
            id,
            MemoryRecord {
                context,
                access,
                bytes: vec![0; size],
            },
        );
        state.count_created(ObjectKind::Memory);
        Ok(id)
    }

    fn enqueue_write(&self, queue: QueueId, memory: MemId, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let size = state.memory.get(&memory).map(|m| m.bytes.len()).unwrap_or(0);
        if data.len() > size {
            return Err(ComputeError::driver(
                "enqueue_write",
                format!("{} bytes into {} byte {:?}", data.len(), size, memory),
            ));
        }

        let record = state.queue_for(queue, memory, "enqueue_write")?;
        record.pending.push_back(Command::Write {
            memory,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn enqueue_read(&self, queue: QueueId, memory: MemId, target: HostMemory) -> Result<()> {
        let mut state = self.state();
        let record = state.queue_for(queue, memory, "enqueue_read")?;
        record.pending.push_back(Command::Read { memory, target });
        Ok(())
    }

    fn kernel_arg_count(&self, kernel: KernelId) -> Result<u32> {
        let state = self.state();
        state
            .kernels
            .get(&kernel)
            .map(|record| record.args.len() as u32)
            .ok_or_else(|| ComputeError::driver("kernel_arg_count", format!("invalid kernel {:?}", kernel)))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue<'_>) -> Result<()> {
        let mut state = self.state();
        let bound = match value {
            ArgValue::Memory(memory) => {
                if !state.memory.contains_key(&memory) {
                    return Err(arg_error(index as usize, format!("invalid memory object {:?}", memory)));
                }
                Bound::Memory(memory)
            }
            ArgValue::Bytes(bytes) => Bound::Bytes(bytes.to_vec()),
        };

        let record = state
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| ComputeError::driver("set_kernel_arg", format!("invalid kernel {:?}", kernel)))?;
        let arity = record.args.len();
        if index as usize >= arity {
            return Err(arg_error(
                index as usize,
                format!("`{}` takes {} arguments", record.name, arity),
            ));
        }

        record.args[index as usize] = Some(bound);
        Ok(())
    }

    fn enqueue_launch(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &WorkSize,
        local: &WorkSize,
    ) -> Result<()> {
        let mut state = self.state();
        let record = state
            .kernels
            .get(&kernel)
            .ok_or_else(|| ComputeError::driver("enqueue_launch", format!("invalid kernel {:?}", kernel)))?;
        if let Some(index) = record.args.iter().position(Option::is_none) {
            return Err(arg_error(index, format!("not set for `{}`", record.name)));
        }
        let (name, args) = (record.name.clone(), record.args.clone());
        let program_context = state.programs.get(&record.program).map(|p| p.context);

        let queue_record = state
            .queues
            .get_mut(&queue)
            .ok_or_else(|| ComputeError::driver("enqueue_launch", format!("invalid queue {:?}", queue)))?;
        if program_context != Some(queue_record.context) {
            return Err(ComputeError::driver(
                "enqueue_launch",
                format!("`{}` was not built for this queue's context", name),
            ));
        }

        let device = self.host_device(queue_record.device).ok_or_else(|| {
            ComputeError::driver("enqueue_launch", format!("invalid device {:?}", queue_record.device))
        })?;
        check_grid(global, local, device)?;

        queue_record.pending.push_back(Command::Launch {
            kernel: name,
            args,
            global: *global,
            local: *local,
        });
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        let mut state = self.state();
        let commands = state
            .queues
            .get_mut(&queue)
            .map(|q| std::mem::take(&mut q.pending))
            .ok_or_else(|| ComputeError::driver("finish", format!("invalid queue {:?}", queue)))?;

        for command in commands {
            self.run(&mut state, command)?;
        }
        Ok(())
    }

    fn release(&self, object: DriverObject) -> Result<()> {
        let mut state = self.state();
        let found = match object {
            DriverObject::Context(id) => state.contexts.remove(&id).is_some(),
            DriverObject::Queue(id) => state.queues.remove(&id).is_some(),
            DriverObject::Program(id) => state.programs.remove(&id).is_some(),
            DriverObject::Kernel(id) => state.kernels.remove(&id).is_some(),
            DriverObject::Memory(id) => match state.memory.remove(&id) {
                Some(record) => {
                    if let Some(context) = state.contexts.get_mut(&record.context) {
                        context.allocated -= record.bytes.len();
                    }
                    true
                }
                None => false,
            },
        };

        if !found {
            return Err(ComputeError::driver("release", format!("invalid object {:?}", object)));
        }
        trace!("Released {:?}", object);
        Ok(())
    }
}
