//! Computers: one device bound to a context and a command queue
//!
//! A [`Computer`] is the key every resource cache is taken against: a
//! program, kernel or buffer is "the same resource for this computer" iff its
//! cached context equals this computer's context.

use crate::driver::Driver;
use crate::error::{ComputeError, Result};
use crate::frame::{Frame, WorkSize};
use crate::handle::{ContextId, QueueId};
use crate::platform::{Device, DeviceKind, Platform};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Whether the host waits for queued work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Block until the queue drains
    #[default]
    Sync,
    /// Return after enqueueing
    Async,
}

struct Binding {
    device: Device,
    context: ContextId,
    queue: QueueId,
}

/// A device bound to an execution context and command queue
pub struct Computer {
    binding: Option<Binding>,
    default_mode: ExecMode,
    driver: Arc<dyn Driver>,
}

impl Computer {
    /// Bind the `index`-th device of `kind` on `platform`
    pub fn new(index: usize, kind: DeviceKind, platform: &Platform) -> Result<Self> {
        let device = platform.device(index, kind)?.clone();
        Ok(Self::with_device(device, platform.driver().clone())?
            .with_default_mode(platform.default_exec_mode()))
    }

    /// Bind an already discovered device
    pub fn with_device(device: Device, driver: Arc<dyn Driver>) -> Result<Self> {
        let context = driver.create_context(device.handle)?;
        let queue = match driver.create_queue(context, device.handle) {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(release) = driver.release(context.into()) {
                    warn!("Failed to release {:?}: {}", context, release);
                }
                return Err(e);
            }
        };

        info!(
            "Computer ready on {} ({}) via {}: {:?}",
            device.name,
            device.kind,
            driver.name(),
            context
        );

        Ok(Self {
            binding: Some(Binding {
                device,
                context,
                queue,
            }),
            default_mode: ExecMode::default(),
            driver,
        })
    }

    /// Mode used by the `*_default` calls
    pub fn with_default_mode(mut self, mode: ExecMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn default_mode(&self) -> ExecMode {
        self.default_mode
    }

    fn binding(&self) -> Result<&Binding> {
        self.binding.as_ref().ok_or(ComputeError::ComputerReleased)
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn device(&self) -> Result<&Device> {
        Ok(&self.binding()?.device)
    }

    /// Context identity; the cache key for programs and buffers
    pub fn context(&self) -> Result<ContextId> {
        Ok(self.binding()?.context)
    }

    pub fn queue(&self) -> Result<QueueId> {
        Ok(self.binding()?.queue)
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Block until everything enqueued on this computer has completed
    pub fn finish(&self) -> Result<()> {
        self.driver.finish(self.queue()?)
    }

    pub(crate) fn complete(&self, mode: ExecMode) -> Result<()> {
        match mode {
            ExecMode::Sync => self.finish(),
            ExecMode::Async => Ok(()),
        }
    }

    /// Launch `frame` over the given grid
    pub fn execute(
        &self,
        frame: &mut Frame<'_>,
        global: &WorkSize,
        local: &WorkSize,
        mode: ExecMode,
    ) -> Result<()> {
        frame.execute(self, global, local, mode)
    }

    /// `execute` in the default mode
    pub fn execute_default(
        &self,
        frame: &mut Frame<'_>,
        global: &WorkSize,
        local: &WorkSize,
    ) -> Result<()> {
        self.execute(frame, global, local, self.default_mode)
    }

    /// Drain and release the queue, then the context
    ///
    /// The computer is left unbound; any later use reports
    /// `ComputerReleased`. Both objects are released even if draining fails,
    /// and the first error is returned.
    pub fn release(&mut self) -> Result<()> {
        let binding = self.binding.take().ok_or(ComputeError::ComputerReleased)?;

        let drained = self.driver.finish(binding.queue);
        let queue = self.driver.release(binding.queue.into());
        let context = self.driver.release(binding.context.into());

        info!("Released computer on {}", binding.device.name);
        drained.and(queue).and(context)
    }
}

impl Drop for Computer {
    fn drop(&mut self) {
        if self.binding.is_some() {
            if let Err(e) = self.release() {
                warn!("Error releasing computer: {}", e);
            }
        }
    }
}

impl fmt::Debug for Computer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Computer");
        match &self.binding {
            Some(b) => s
                .field("device", &b.device.name)
                .field("context", &b.context)
                .field("queue", &b.queue),
            None => s.field("binding", &"released"),
        };
        s.field("default_mode", &self.default_mode)
            .field("driver", &self.driver.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::{HostDevice, HostDriver, HostPlatform};
    use crate::handle::ObjectKind;
    use crate::config::ComputeConfig;
    use crate::platform::Directory;

    #[test]
    fn test_bind_and_release() {
        let driver = Arc::new(HostDriver::new());
        let platform = Directory::new(driver.clone()).platform(0).unwrap();

        let mut computer = Computer::new(0, DeviceKind::Gpu, &platform).unwrap();
        assert!(computer.is_bound());
        assert_eq!(driver.live(ObjectKind::Context), 1);
        assert_eq!(driver.live(ObjectKind::Queue), 1);

        computer.release().unwrap();
        assert!(!computer.is_bound());
        assert_eq!(driver.live(ObjectKind::Context), 0);
        assert_eq!(driver.live(ObjectKind::Queue), 0);
        assert!(matches!(computer.context(), Err(ComputeError::ComputerReleased)));
        assert!(matches!(computer.release(), Err(ComputeError::ComputerReleased)));
    }

    #[test]
    fn test_drop_releases() {
        let driver = Arc::new(HostDriver::new());
        let platform = Directory::new(driver.clone()).platform(0).unwrap();
        {
            let _computer = Computer::new(0, DeviceKind::Cpu, &platform).unwrap();
            assert_eq!(driver.live(ObjectKind::Context), 1);
        }
        assert_eq!(driver.live(ObjectKind::Context), 0);
    }

    #[test]
    fn test_missing_device() {
        let driver = Arc::new(HostDriver::new());
        let platform = Directory::new(driver).platform(0).unwrap();
        assert!(matches!(
            Computer::new(5, DeviceKind::Gpu, &platform),
            Err(ComputeError::NoDevice { index: 5, .. })
        ));
    }

    #[test]
    fn test_unavailable_device() {
        let driver = Arc::new(HostDriver::with_platforms(vec![
            HostPlatform::new("Offline").device(HostDevice::gpu("gpu0").unavailable()),
        ]));
        let platform = Directory::new(driver.clone()).platform(0).unwrap();
        assert!(matches!(
            Computer::new(0, DeviceKind::Gpu, &platform),
            Err(ComputeError::DeviceNotAvailable(_))
        ));
        assert_eq!(driver.live(ObjectKind::Context), 0);
    }

    #[test]
    fn test_default_mode_from_config() {
        let driver = Arc::new(HostDriver::new());
        let config = ComputeConfig {
            default_exec_mode: ExecMode::Async,
            ..ComputeConfig::default()
        };
        let platform = Directory::with_config(driver, config).platform(0).unwrap();

        let computer = Computer::new(0, DeviceKind::Gpu, &platform).unwrap();
        assert_eq!(computer.default_mode(), ExecMode::Async);

        let device = platform.device(0, DeviceKind::Cpu).unwrap().clone();
        let computer = Computer::with_device(device, platform.driver().clone()).unwrap();
        assert_eq!(computer.default_mode(), ExecMode::Sync);
    }

    #[test]
    fn test_contexts_are_distinct() {
        let driver = Arc::new(HostDriver::new());
        let platform = Directory::new(driver).platform(0).unwrap();
        let a = Computer::new(0, DeviceKind::Gpu, &platform).unwrap();
        let b = Computer::new(0, DeviceKind::Gpu, &platform).unwrap();
        assert_ne!(a.context().unwrap(), b.context().unwrap());
        assert_eq!(a.device().unwrap(), b.device().unwrap());
    }
}
