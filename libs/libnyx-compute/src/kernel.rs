//! Kernels: named entry points resolved per compiled program

use crate::cache::{Owned, ResourceCache};
use crate::config::DEFAULT_CACHE_CAPACITY;
use crate::driver::Driver;
use crate::error::Result;
use crate::handle::{KernelId, ProgramId};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Logical kernel: an entry-point name plus one kernel object per compiled program
pub struct Kernel {
    name: String,
    cache: ResourceCache<ProgramId, Owned<KernelId>>,
}

impl Kernel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache: ResourceCache::new(DEFAULT_CACHE_CAPACITY),
        }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = ResourceCache::new(capacity);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel object inside `program`, creating it on first use
    pub fn resolve(&mut self, program: ProgramId, driver: &Arc<dyn Driver>) -> Result<KernelId> {
        let name = &self.name;
        let kernel = self.cache.get_or_create(program, || {
            let kernel = driver.create_kernel(program, name)?;
            debug!("Created kernel `{}` as {:?} in {:?}", name, kernel, program);
            Ok(Owned::new(kernel, driver.clone()))
        })?;

        Ok(kernel.handle())
    }

    /// Kernel object inside `program`, if already created
    pub fn lookup(&self, program: ProgramId) -> Option<KernelId> {
        self.cache.lookup(&program).map(Owned::handle)
    }

    /// Number of compiled programs this kernel has been resolved in
    pub fn cached_programs(&self) -> usize {
        self.cache.len()
    }

    /// Release the kernel objects created inside `programs`
    pub fn forget(&mut self, programs: &[ProgramId]) -> usize {
        let released = self.cache.forget(programs);
        if released > 0 {
            debug!("Released {} `{}` kernel objects", released, self.name);
        }
        released
    }

    /// Release every kernel object
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::HostDriver;
    use crate::error::ComputeError;
    use crate::handle::ObjectKind;
    use crate::platform::{DeviceHandle, DeviceKind, PlatformHandle};

    fn built_program(driver: &Arc<dyn Driver>, source: &str) -> ProgramId {
        let device: DeviceHandle = driver
            .devices(PlatformHandle::new(0), DeviceKind::Gpu)
            .unwrap()[0]
            .handle;
        let context = driver.create_context(device).unwrap();
        let program = driver.create_program(context, source).unwrap();
        driver.build_program(program, "").unwrap();
        program
    }

    #[test]
    fn test_resolve_once_per_program() {
        let host = Arc::new(HostDriver::new());
        let driver: Arc<dyn Driver> = host.clone();
        let first = built_program(&driver, "__kernel void blur(__global float* img) {}");
        let second = built_program(&driver, "__kernel void blur(__global float* img) {}");

        let mut kernel = Kernel::new("blur");
        let a = kernel.resolve(first, &driver).unwrap();
        assert_eq!(kernel.resolve(first, &driver).unwrap(), a);
        let b = kernel.resolve(second, &driver).unwrap();
        assert_ne!(a, b);

        assert_eq!(kernel.cached_programs(), 2);
        assert_eq!(host.created(ObjectKind::Kernel), 2);
        assert_eq!(kernel.lookup(first), Some(a));

        kernel.clear();
        assert_eq!(host.live(ObjectKind::Kernel), 0);
        assert!(kernel.lookup(first).is_none());
    }

    #[test]
    fn test_forget_released_programs() {
        let host = Arc::new(HostDriver::new());
        let driver: Arc<dyn Driver> = host.clone();
        let mut kernel = Kernel::new("blur").with_cache_capacity(2);

        for _ in 0..5 {
            let program = built_program(&driver, "__kernel void blur(__global float* img) {}");
            kernel.resolve(program, &driver).unwrap();
            assert_eq!(kernel.forget(&[program]), 1);
            assert!(kernel.lookup(program).is_none());
        }

        assert_eq!(kernel.cached_programs(), 0);
        assert_eq!(host.created(ObjectKind::Kernel), 5);
        assert_eq!(host.live(ObjectKind::Kernel), 0);
    }

    #[test]
    fn test_plain_kernel_qualifier() {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new());
        let program = built_program(&driver, "kernel void blur(global float* img) {}");

        let mut kernel = Kernel::new("blur");
        let id = kernel.resolve(program, &driver).unwrap();
        assert_eq!(driver.kernel_arg_count(id).unwrap(), 1);
    }

    #[test]
    fn test_unknown_entry_point() {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new());
        let program = built_program(&driver, "__kernel void blur(__global float* img) {}");

        let mut kernel = Kernel::new("sharpen");
        assert!(matches!(
            kernel.resolve(program, &driver),
            Err(ComputeError::InvalidKernelName(_))
        ));
        assert_eq!(kernel.cached_programs(), 0);
    }
}
