//! Dispatch frames: one kernel launch over an N-dimensional grid

use crate::buffer::Buffer;
use crate::computer::{Computer, ExecMode};
use crate::driver::ArgValue;
use crate::error::{ComputeError, Result};
use crate::kernel::Kernel;
use crate::program::Program;
use bytemuck::Pod;
use tracing::debug;

/// Largest grid dimensionality a launch accepts
pub const MAX_WORK_DIMENSIONS: usize = 3;

/// Grid shape: global or local work size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSize {
    dim: usize,
    sizes: [usize; MAX_WORK_DIMENSIONS],
}

impl WorkSize {
    /// Work size from per-dimension extents (1 to 3 dimensions)
    pub fn new(sizes: &[usize]) -> Result<Self> {
        if sizes.is_empty() || sizes.len() > MAX_WORK_DIMENSIONS {
            return Err(ComputeError::InvalidWorkSize(format!(
                "{} dimensions, expected 1 to {}",
                sizes.len(),
                MAX_WORK_DIMENSIONS
            )));
        }

        let mut work = Self {
            dim: sizes.len(),
            sizes: [1; MAX_WORK_DIMENSIONS],
        };
        work.sizes[..sizes.len()].copy_from_slice(sizes);
        Ok(work)
    }

    pub fn d1(x: usize) -> Self {
        Self {
            dim: 1,
            sizes: [x, 1, 1],
        }
    }

    pub fn d2(x: usize, y: usize) -> Self {
        Self {
            dim: 2,
            sizes: [x, y, 1],
        }
    }

    pub fn d3(x: usize, y: usize, z: usize) -> Self {
        Self {
            dim: 3,
            sizes: [x, y, z],
        }
    }

    /// Number of dimensions
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Extents of the used dimensions
    pub fn sizes(&self) -> &[usize] {
        &self.sizes[..self.dim]
    }

    /// Extent of one dimension; unused dimensions are 1
    pub fn size(&self, d: usize) -> usize {
        if d < self.dim {
            self.sizes[d]
        } else {
            1
        }
    }

    /// Extents padded to three dimensions
    pub fn padded(&self) -> [usize; MAX_WORK_DIMENSIONS] {
        self.sizes
    }

    /// Total work items
    pub fn total(&self) -> usize {
        self.sizes().iter().product()
    }
}

/// A bound kernel argument
///
/// The kind is explicit: device buffers are bound by their memory object,
/// values by their raw bytes.
#[derive(Debug)]
pub enum Arg<'a> {
    /// Buffer already sent to the executing computer
    Buffer(&'a Buffer),
    /// Inline value; its byte length is the declared argument size
    Value(Vec<u8>),
}

impl<'a> Arg<'a> {
    pub fn buffer(buffer: &'a Buffer) -> Self {
        Arg::Buffer(buffer)
    }

    /// Inline scalar bound by its in-memory representation
    pub fn value<T: Pod>(value: T) -> Self {
        Arg::Value(bytemuck::bytes_of(&value).to_vec())
    }

    /// Inline value from raw bytes
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Arg::Value(bytes.into())
    }
}

/// One kernel launch: program, kernel and ordered arguments
///
/// Argument `i` is bound to kernel parameter slot `i`. Frames are not
/// cached; the program, kernel and buffer caches they touch are.
#[derive(Debug)]
pub struct Frame<'a> {
    program: &'a mut Program,
    kernel: &'a mut Kernel,
    args: Vec<Arg<'a>>,
}

impl<'a> Frame<'a> {
    pub fn new(program: &'a mut Program, kernel: &'a mut Kernel) -> Self {
        Self {
            program,
            kernel,
            args: Vec::new(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: Arg<'a>) -> Self {
        self.args.push(arg);
        self
    }

    pub fn push(&mut self, arg: Arg<'a>) {
        self.args.push(arg);
    }

    pub fn args(&self) -> &[Arg<'a>] {
        &self.args
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Release the compiled programs and the kernel objects inside them
    pub fn clear(&mut self) {
        let programs = self.program.clear();
        self.kernel.forget(&programs);
    }

    /// Build, bind and launch on `computer`
    ///
    /// Stops at the first failing step. Whatever was cached before the
    /// failure (compiled program, kernel object) stays cached.
    pub fn execute(
        &mut self,
        computer: &Computer,
        global: &WorkSize,
        local: &WorkSize,
        mode: ExecMode,
    ) -> Result<()> {
        let queue = computer.queue()?;
        let driver = computer.driver();

        let program = self.program.build(computer)?;
        let kernel = self.kernel.resolve(program, driver)?;

        // Kernel objects are shared between frames; every slot is rebound
        let expected = driver.kernel_arg_count(kernel)? as usize;
        if self.args.len() != expected {
            return Err(ComputeError::KernelArgument {
                index: self.args.len().min(expected) as u32,
                reason: format!(
                    "`{}` takes {} arguments, frame binds {}",
                    self.kernel.name(),
                    expected,
                    self.args.len()
                ),
            });
        }

        for (index, arg) in self.args.iter().enumerate() {
            let index = index as u32;
            match arg {
                Arg::Buffer(buffer) => {
                    let memory = buffer.device_memory(computer).ok_or(ComputeError::NotSent)?;
                    driver.set_kernel_arg(kernel, index, ArgValue::Memory(memory))?;
                }
                Arg::Value(bytes) => {
                    driver.set_kernel_arg(kernel, index, ArgValue::Bytes(bytes))?;
                }
            }
        }

        debug!(
            "Launching `{}` over {:?} / {:?} ({:?})",
            self.kernel.name(),
            global.sizes(),
            local.sizes(),
            mode
        );
        driver.enqueue_launch(queue, kernel, global, local)?;
        computer.complete(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_size_shapes() {
        let w = WorkSize::d2(2048, 1024);
        assert_eq!(w.dim(), 2);
        assert_eq!(w.sizes(), &[2048, 1024]);
        assert_eq!(w.size(2), 1);
        assert_eq!(w.total(), 2048 * 1024);
        assert_eq!(WorkSize::new(&[12]).unwrap(), WorkSize::d1(12));
    }

    #[test]
    fn test_work_size_dimension_bounds() {
        assert!(matches!(WorkSize::new(&[]), Err(ComputeError::InvalidWorkSize(_))));
        assert!(matches!(
            WorkSize::new(&[1, 1, 1, 1]),
            Err(ComputeError::InvalidWorkSize(_))
        ));
    }

    #[test]
    fn test_value_args_keep_declared_size() {
        match Arg::value(5i32) {
            Arg::Value(bytes) => assert_eq!(bytes, 5i32.to_ne_bytes().to_vec()),
            Arg::Buffer(_) => panic!("expected value"),
        }
        match Arg::value(0.5f64) {
            Arg::Value(bytes) => assert_eq!(bytes.len(), 8),
            Arg::Buffer(_) => panic!("expected value"),
        }
    }
}
