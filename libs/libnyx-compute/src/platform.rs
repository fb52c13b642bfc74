//! Platform and device directory
//!
//! Discovery is a flat query against the driver: every platform is listed
//! with its CPU, GPU and accelerator devices, each carrying an immutable
//! capability record. Listings are bounded by [`ComputeConfig`].

use crate::computer::ExecMode;
use crate::config::ComputeConfig;
use crate::driver::Driver;
use crate::error::{ComputeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Driver-assigned platform handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformHandle(u64);

impl PlatformHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Driver-assigned device handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Type of compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Accelerator];
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
            DeviceKind::Accelerator => "accelerator",
        };
        write!(f, "{}", s)
    }
}

/// Device capability record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Device type
    pub kind: DeviceKind,
    /// Human-readable name
    pub name: String,
    /// Space-separated extension list
    pub extensions: String,
    /// Runtime version string
    pub version: String,
    /// Max compute units
    pub compute_units: usize,
    /// Max work-group size
    pub max_work_group_size: usize,
    /// Max work-item dimensions
    pub max_work_item_dimensions: usize,
    /// Max work-item size per dimension
    pub max_work_item_sizes: Vec<usize>,
    /// Driver handle
    pub handle: DeviceHandle,
}

impl Device {
    /// Check whether the device lists an extension
    pub fn supports_extension(&self, ext: &str) -> bool {
        self.extensions.split_whitespace().any(|e| e == ext)
    }
}

/// Platform record as reported by the driver, before device discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub handle: PlatformHandle,
    pub name: String,
    pub version: String,
    pub extensions: String,
}

/// A discovered platform and its devices
pub struct Platform {
    info: PlatformInfo,
    cpu: Vec<Device>,
    gpu: Vec<Device>,
    accelerator: Vec<Device>,
    exec_mode: ExecMode,
    driver: Arc<dyn Driver>,
}

impl Platform {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn version(&self) -> &str {
        &self.info.version
    }

    pub fn extensions(&self) -> &str {
        &self.info.extensions
    }

    pub fn handle(&self) -> PlatformHandle {
        self.info.handle
    }

    /// Exec mode computers on this platform start with
    pub fn default_exec_mode(&self) -> ExecMode {
        self.exec_mode
    }

    /// Devices of one kind
    pub fn devices(&self, kind: DeviceKind) -> &[Device] {
        match kind {
            DeviceKind::Cpu => &self.cpu,
            DeviceKind::Gpu => &self.gpu,
            DeviceKind::Accelerator => &self.accelerator,
        }
    }

    /// Number of devices of one kind
    pub fn device_count(&self, kind: DeviceKind) -> usize {
        self.devices(kind).len()
    }

    /// Device at `index` among devices of `kind`
    pub fn device(&self, index: usize, kind: DeviceKind) -> Result<&Device> {
        let devices = self.devices(kind);
        devices.get(index).ok_or(ComputeError::NoDevice {
            index,
            kind,
            count: devices.len(),
        })
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("name", &self.info.name)
            .field("version", &self.info.version)
            .field("cpu", &self.cpu.len())
            .field("gpu", &self.gpu.len())
            .field("accelerator", &self.accelerator.len())
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// Platform directory over one driver
pub struct Directory {
    driver: Arc<dyn Driver>,
    config: ComputeConfig,
}

impl Directory {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self::with_config(driver, ComputeConfig::default())
    }

    pub fn with_config(driver: Arc<dyn Driver>, config: ComputeConfig) -> Self {
        Self { driver, config }
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Number of platforms, failing when there are none
    pub fn platform_count(&self) -> Result<usize> {
        Ok(self.platform_infos()?.len())
    }

    /// Discover the platform at `index` and all of its devices
    pub fn platform(&self, index: usize) -> Result<Platform> {
        let infos = self.platform_infos()?;
        let count = infos.len();
        let info = infos
            .into_iter()
            .nth(index)
            .ok_or(ComputeError::NoPlatform { index, count })?;

        let platform = Platform {
            cpu: self.discover_devices(&info, DeviceKind::Cpu)?,
            gpu: self.discover_devices(&info, DeviceKind::Gpu)?,
            accelerator: self.discover_devices(&info, DeviceKind::Accelerator)?,
            info,
            exec_mode: self.config.default_exec_mode,
            driver: self.driver.clone(),
        };

        info!(
            "Platform {}: {} ({}) with {} CPU, {} GPU, {} accelerator devices",
            index,
            platform.name(),
            platform.version(),
            platform.cpu.len(),
            platform.gpu.len(),
            platform.accelerator.len()
        );

        Ok(platform)
    }

    /// Discover every platform
    pub fn platforms(&self) -> Result<Vec<Platform>> {
        let count = self.platform_count()?;
        (0..count).map(|index| self.platform(index)).collect()
    }

    fn platform_infos(&self) -> Result<Vec<PlatformInfo>> {
        let mut infos = self.driver.platforms()?;
        if infos.is_empty() {
            return Err(ComputeError::NoPlatforms);
        }

        if infos.len() > self.config.max_platforms {
            warn!(
                "{} platforms reported, keeping the first {}",
                infos.len(),
                self.config.max_platforms
            );
            infos.truncate(self.config.max_platforms);
        }

        Ok(infos)
    }

    fn discover_devices(&self, info: &PlatformInfo, kind: DeviceKind) -> Result<Vec<Device>> {
        let mut devices = match self.driver.devices(info.handle, kind) {
            Ok(devices) => devices,
            // A platform without devices of one kind is still a valid platform
            Err(ComputeError::NoDevices(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        if devices.len() > self.config.max_devices {
            warn!(
                "{}: {} {} devices reported, keeping the first {}",
                info.name,
                devices.len(),
                kind,
                self.config.max_devices
            );
            devices.truncate(self.config.max_devices);
        }

        for device in &devices {
            debug!("{} device: {} ({} CUs)", kind, device.name, device.compute_units);
        }

        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::{HostDevice, HostDriver, HostPlatform};

    fn two_platforms() -> Arc<HostDriver> {
        Arc::new(HostDriver::with_platforms(vec![
            HostPlatform::new("First").device(HostDevice::gpu("gpu0")),
            HostPlatform::new("Second")
                .device(HostDevice::cpu("cpu0"))
                .device(HostDevice::gpu("gpu0"))
                .device(HostDevice::gpu("gpu1")),
        ]))
    }

    #[test]
    fn test_platform_listing() {
        let directory = Directory::new(two_platforms());
        assert_eq!(directory.platform_count().unwrap(), 2);

        let second = directory.platform(1).unwrap();
        assert_eq!(second.name(), "Second");
        assert_eq!(second.device_count(DeviceKind::Cpu), 1);
        assert_eq!(second.device_count(DeviceKind::Gpu), 2);
        assert_eq!(second.device_count(DeviceKind::Accelerator), 0);
        assert_eq!(second.device(1, DeviceKind::Gpu).unwrap().name, "gpu1");
    }

    #[test]
    fn test_platform_out_of_range() {
        let directory = Directory::new(two_platforms());
        match directory.platform(2) {
            Err(ComputeError::NoPlatform { index, count }) => {
                assert_eq!(index, 2);
                assert_eq!(count, 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_no_platforms() {
        let directory = Directory::new(Arc::new(HostDriver::with_platforms(vec![])));
        assert!(matches!(directory.platform_count(), Err(ComputeError::NoPlatforms)));
    }

    #[test]
    fn test_device_out_of_range() {
        let directory = Directory::new(two_platforms());
        let first = directory.platform(0).unwrap();
        assert!(matches!(
            first.device(0, DeviceKind::Cpu),
            Err(ComputeError::NoDevice { count: 0, .. })
        ));
    }

    #[test]
    fn test_listing_bounds() {
        let config = ComputeConfig {
            max_platforms: 1,
            max_devices: 1,
            ..ComputeConfig::default()
        };
        let directory = Directory::with_config(two_platforms(), config);
        assert_eq!(directory.platform_count().unwrap(), 1);

        let driver = Arc::new(HostDriver::with_platforms(vec![HostPlatform::new("Wide")
            .device(HostDevice::gpu("gpu0"))
            .device(HostDevice::gpu("gpu1"))]));
        let directory = Directory::with_config(
            driver,
            ComputeConfig {
                max_devices: 1,
                ..ComputeConfig::default()
            },
        );
        let platform = directory.platform(0).unwrap();
        assert_eq!(platform.device_count(DeviceKind::Gpu), 1);
    }

    #[test]
    fn test_extension_lookup() {
        let directory = Directory::new(Arc::new(HostDriver::new()));
        let platform = directory.platform(0).unwrap();
        let gpu = platform.device(0, DeviceKind::Gpu).unwrap();
        assert!(gpu.supports_extension("cl_khr_fp64"));
        assert!(!gpu.supports_extension("cl_khr"));
    }
}
