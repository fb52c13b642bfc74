//! # libnyx-compute
//!
//! Compute device runtime for Nyx. Discovers platforms and devices, binds a
//! device into a [`Computer`], and dispatches kernels over N-dimensional
//! grids while caching every driver object it creates.
//!
//! ## Architecture
//!
//! ```text
//! Directory ──> Platform ──> Device ──> Computer (context + queue)
//!                                           │
//!            ┌──────────────────────────────┼─────────────────────┐
//!            │                              │                     │
//!   Program (per context)      Kernel (per program)     Buffer (per context)
//!            └──────────────> Frame <───────┘─────────────────────┘
//! ```
//!
//! Programs, kernels and buffers each keep a bounded cache of the driver
//! objects made for them, keyed by context or program identity. Compiling,
//! resolving and allocating happen at most once per key; entries live until
//! explicitly cleared or forgotten.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use libnyx_compute::prelude::*;
//!
//! # fn main() -> libnyx_compute::Result<()> {
//! let driver = Arc::new(HostDriver::new());
//! driver.register_kernel("fill", |launch| {
//!     let value: i32 = launch.scalar(1)?;
//!     launch.update::<i32>(0, |a| a.iter_mut().for_each(|x| *x = value))
//! });
//!
//! let platform = Directory::new(driver).platform(0)?;
//! let computer = Computer::new(0, DeviceKind::Gpu, &platform)?;
//!
//! let mut program = Program::from_source("__kernel void fill(__global int* a, int v) {}");
//! let mut kernel = Kernel::new("fill");
//! let mut data = Buffer::zeroed::<i32>(12, Access::ReadWrite);
//!
//! computer.send(&mut data, ExecMode::Sync)?;
//! let mut frame = Frame::new(&mut program, &mut kernel)
//!     .arg(Arg::buffer(&data))
//!     .arg(Arg::value(5i32));
//! computer.execute(&mut frame, &WorkSize::d1(12), &WorkSize::d1(3), ExecMode::Sync)?;
//! computer.receive(&data, ExecMode::Sync)?;
//!
//! assert_eq!(data.to_vec::<i32>(), vec![5; 12]);
//! # Ok(())
//! # }
//! ```
//!
//! With the `opencl` feature, `driver::system_driver()` opens the installed
//! OpenCL runtime instead of the host reference driver.

pub mod buffer;
pub mod cache;
pub mod computer;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod handle;
pub mod kernel;
pub mod platform;
pub mod program;
mod transfer;

pub use buffer::{Access, Buffer, HostMemory};
pub use computer::{Computer, ExecMode};
pub use config::{load_config, ComputeConfig};
pub use driver::host::{HostDevice, HostDriver, HostLaunch, HostPlatform};
pub use driver::Driver;
pub use error::{ComputeError, Result};
pub use frame::{Arg, Frame, WorkSize};
pub use kernel::Kernel;
pub use platform::{Device, DeviceKind, Directory, Platform};
pub use program::{load_program_source, Program};

/// Re-export common types
pub mod prelude {
    pub use crate::buffer::{Access, Buffer};
    pub use crate::computer::{Computer, ExecMode};
    pub use crate::driver::host::HostDriver;
    pub use crate::driver::Driver;
    pub use crate::error::{ComputeError, Result};
    pub use crate::frame::{Arg, Frame, WorkSize};
    pub use crate::kernel::Kernel;
    pub use crate::platform::{DeviceKind, Directory};
    pub use crate::program::Program;
}
