//! Host-backed buffers mirrored to device memory on demand

use crate::cache::{Owned, ResourceCache};
use crate::computer::Computer;
use crate::config::DEFAULT_CACHE_CAPACITY;
use crate::error::{ComputeError, Result};
use crate::handle::{ContextId, MemId};
use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Buffer access mode, from the device's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    /// Whether `receive` may copy this buffer back to the host
    pub fn host_readable(&self) -> bool {
        !matches!(self, Access::WriteOnly)
    }
}

/// Shared host memory region
///
/// Drivers hold a clone while a device->host copy is in flight and write
/// into it when the copy completes.
#[derive(Clone, Default)]
pub struct HostMemory(Arc<RwLock<Vec<u8>>>);

impl HostMemory {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(RwLock::new(bytes)))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.read().clone()
    }

    /// Overwrite the start of the region with `data`
    pub fn store(&self, data: &[u8]) -> Result<()> {
        let mut bytes = self.write();
        if data.len() > bytes.len() {
            return Err(ComputeError::AllocationFailed(format!(
                "{} bytes do not fit a {} byte host region",
                data.len(),
                bytes.len()
            )));
        }
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostMemory({} bytes)", self.len())
    }
}

/// Decode a byte region as a vector of `T`; trailing partial elements are dropped
pub(crate) fn decode<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Logical buffer: host data, access mode and per-context device memory
pub struct Buffer {
    memory: HostMemory,
    access: Access,
    cache: ResourceCache<ContextId, Owned<MemId>>,
}

impl Buffer {
    /// Zero-filled buffer of `size` bytes
    pub fn new(size: usize, access: Access) -> Self {
        Self::from_bytes(vec![0; size], access)
    }

    pub fn from_bytes(bytes: Vec<u8>, access: Access) -> Self {
        Self {
            memory: HostMemory::new(bytes),
            access,
            cache: ResourceCache::new(DEFAULT_CACHE_CAPACITY),
        }
    }

    /// Buffer initialised from a typed slice
    pub fn from_slice<T: Pod>(data: &[T], access: Access) -> Self {
        Self::from_bytes(bytemuck::cast_slice(data).to_vec(), access)
    }

    /// Zero-filled buffer holding `len` elements of `T`
    pub fn zeroed<T: Pod>(len: usize, access: Access) -> Self {
        Self::new(len * std::mem::size_of::<T>(), access)
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = ResourceCache::new(capacity);
        self
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn memory(&self) -> &HostMemory {
        &self.memory
    }

    /// Host contents as raw bytes
    pub fn bytes(&self) -> Vec<u8> {
        self.memory.snapshot()
    }

    /// Host contents as elements of `T`
    pub fn to_vec<T: Pod>(&self) -> Vec<T> {
        decode(&self.memory.read())
    }

    /// Overwrite the start of the host contents
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.memory.store(bytemuck::cast_slice(data))
    }

    /// Device memory already created for `computer`, if any
    pub fn device_memory(&self, computer: &Computer) -> Option<MemId> {
        let context = computer.context().ok()?;
        self.cache.lookup(&context).map(Owned::handle)
    }

    /// Device memory for `computer`, allocating it on first use
    pub(crate) fn ensure_device_memory(&mut self, computer: &Computer) -> Result<MemId> {
        let context = computer.context()?;
        let driver = computer.driver();
        let size = self.memory.len();
        let access = self.access;

        let memory = self.cache.get_or_create(context, || {
            let memory = driver.create_memory(context, access, size)?;
            debug!("Allocated {:?} ({} bytes, {:?}) in {:?}", memory, size, access, context);
            Ok(Owned::new(memory, driver.clone()))
        })?;

        Ok(memory.handle())
    }

    /// Number of contexts holding device memory for this buffer
    pub fn cached_contexts(&self) -> usize {
        self.cache.len()
    }

    /// Release every device copy
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("access", &self.access)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_round_trip_on_host() {
        let buffer = Buffer::from_slice(&[1i32, -2, 3], Access::ReadWrite);
        assert_eq!(buffer.size(), 12);
        assert_eq!(buffer.to_vec::<i32>(), vec![1, -2, 3]);

        buffer.write(&[9i32]).unwrap();
        assert_eq!(buffer.to_vec::<i32>(), vec![9, -2, 3]);
    }

    #[test]
    fn test_write_past_end() {
        let buffer = Buffer::zeroed::<u16>(2, Access::ReadOnly);
        assert!(matches!(
            buffer.write(&[1u16, 2, 3]),
            Err(ComputeError::AllocationFailed(_))
        ));
        assert_eq!(buffer.to_vec::<u16>(), vec![0, 0]);
    }

    #[test]
    fn test_decode_drops_partial_tail() {
        assert_eq!(decode::<u16>(&[1, 0, 2, 0, 3]), vec![1, 2]);
    }

    #[test]
    fn test_host_readable() {
        assert!(Access::ReadOnly.host_readable());
        assert!(Access::ReadWrite.host_readable());
        assert!(!Access::WriteOnly.host_readable());
    }
}
