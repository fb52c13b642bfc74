//! Buffer transfer tests: send/receive rules and device memory caching

use std::sync::Arc;

use libnyx_compute::driver::host::{HostDevice, HostDriver, HostPlatform};
use libnyx_compute::handle::ObjectKind;
use libnyx_compute::prelude::*;

fn gpu(driver: &Arc<HostDriver>) -> Computer {
    let platform = Directory::new(driver.clone()).platform(0).unwrap();
    Computer::new(0, DeviceKind::Gpu, &platform).unwrap()
}

#[test]
fn test_send_then_receive() {
    let driver = Arc::new(HostDriver::new());
    let computer = gpu(&driver);
    let mut data = Buffer::from_slice(&[1.5f32, -2.0, 8.25], Access::ReadWrite);

    computer.send(&mut data, ExecMode::Sync).unwrap();
    let memory = data.device_memory(&computer).unwrap();
    assert_eq!(driver.device_bytes(memory).unwrap(), data.bytes());

    data.write(&[0.0f32; 3]).unwrap();
    computer.receive(&data, ExecMode::Sync).unwrap();
    assert_eq!(data.to_vec::<f32>(), vec![1.5, -2.0, 8.25]);
}

#[test]
fn test_receive_before_send() {
    let driver = Arc::new(HostDriver::new());
    let computer = gpu(&driver);
    let data = Buffer::zeroed::<u32>(4, Access::ReadWrite);

    assert!(matches!(
        computer.receive(&data, ExecMode::Sync),
        Err(ComputeError::NotSent)
    ));
    assert_eq!(driver.created(ObjectKind::Memory), 0);
}

#[test]
fn test_write_only_never_received() {
    let driver = Arc::new(HostDriver::new());
    let computer = gpu(&driver);
    let mut data = Buffer::from_slice(&[7u32, 8, 9], Access::WriteOnly);

    // Unsent buffers report the access violation too
    assert!(matches!(
        computer.receive(&data, ExecMode::Sync),
        Err(ComputeError::ReadOnlyViolation)
    ));

    computer.send(&mut data, ExecMode::Sync).unwrap();
    data.write(&[0u32; 3]).unwrap();
    assert!(matches!(
        computer.receive(&data, ExecMode::Sync),
        Err(ComputeError::ReadOnlyViolation)
    ));
    assert_eq!(data.to_vec::<u32>(), vec![0, 0, 0]);
}

#[test]
fn test_read_only_buffers_round_trip() {
    let driver = Arc::new(HostDriver::new());
    let computer = gpu(&driver);
    let mut data = Buffer::from_slice(&[3u16, 1, 4, 1], Access::ReadOnly);

    computer.send(&mut data, ExecMode::Sync).unwrap();
    computer.receive(&data, ExecMode::Sync).unwrap();
    assert_eq!(data.to_vec::<u16>(), vec![3, 1, 4, 1]);
}

#[test]
fn test_device_memory_allocated_once_per_context() {
    let driver = Arc::new(HostDriver::new());
    let first = gpu(&driver);
    let second = gpu(&driver);
    let mut data = Buffer::zeroed::<u64>(16, Access::ReadWrite);

    first.send(&mut data, ExecMode::Sync).unwrap();
    first.send(&mut data, ExecMode::Sync).unwrap();
    assert_eq!(driver.created(ObjectKind::Memory), 1);

    second.send(&mut data, ExecMode::Sync).unwrap();
    assert_eq!(driver.created(ObjectKind::Memory), 2);
    assert_eq!(data.cached_contexts(), 2);
    assert_ne!(data.device_memory(&first), data.device_memory(&second));

    data.clear();
    assert_eq!(driver.live(ObjectKind::Memory), 0);
    assert!(data.device_memory(&first).is_none());
}

#[test]
fn test_async_send_captures_data() {
    let driver = Arc::new(HostDriver::new());
    let computer = gpu(&driver);
    let mut data = Buffer::from_slice(&[1i32, 2], Access::ReadWrite);

    computer.send(&mut data, ExecMode::Async).unwrap();
    data.write(&[9i32, 9]).unwrap();
    computer.finish().unwrap();

    let memory = data.device_memory(&computer).unwrap();
    let device: Vec<i32> = driver
        .device_bytes(memory)
        .unwrap()
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(device, vec![1, 2]);
}

#[test]
fn test_buffer_cache_capacity() {
    let driver = Arc::new(HostDriver::new());
    let first = gpu(&driver);
    let second = gpu(&driver);
    let mut data = Buffer::zeroed::<u8>(8, Access::ReadWrite).with_cache_capacity(1);

    first.send(&mut data, ExecMode::Sync).unwrap();
    assert!(matches!(
        second.send(&mut data, ExecMode::Sync),
        Err(ComputeError::CacheCapacityExceeded { capacity: 1 })
    ));
    assert_eq!(driver.created(ObjectKind::Memory), 1);
}

#[test]
fn test_allocation_failure() {
    let driver = Arc::new(HostDriver::with_platforms(vec![
        HostPlatform::new("Small").device(HostDevice::gpu("gpu0").memory_limit(64)),
    ]));
    let computer = gpu(&driver);
    let mut data = Buffer::zeroed::<u8>(128, Access::ReadWrite);

    assert!(matches!(
        computer.send(&mut data, ExecMode::Sync),
        Err(ComputeError::AllocationFailed(_))
    ));
    assert_eq!(data.cached_contexts(), 0);
}

#[test]
fn test_default_mode_transfers() {
    let driver = Arc::new(HostDriver::new());
    let computer = gpu(&driver).with_default_mode(ExecMode::Async);
    let mut data = Buffer::from_slice(&[4u8, 5, 6], Access::ReadWrite);

    computer.send_default(&mut data).unwrap();
    assert_eq!(driver.pending(computer.queue().unwrap()), 1);

    data.write(&[0u8; 3]).unwrap();
    computer.receive_default(&data).unwrap();
    assert_eq!(data.to_vec::<u8>(), vec![0, 0, 0]);

    computer.finish().unwrap();
    assert_eq!(data.to_vec::<u8>(), vec![4, 5, 6]);
}
