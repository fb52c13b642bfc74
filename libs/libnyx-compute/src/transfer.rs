//! Host <-> device buffer transfers

use crate::buffer::Buffer;
use crate::computer::{Computer, ExecMode};
use crate::error::{ComputeError, Result};
use tracing::trace;

impl Computer {
    /// Copy `buffer`'s host data to this computer
    ///
    /// Device memory is allocated on the first send with the buffer's access
    /// mode and size, then reused.
    pub fn send(&self, buffer: &mut Buffer, mode: ExecMode) -> Result<()> {
        let queue = self.queue()?;
        let memory = buffer.ensure_device_memory(self)?;

        trace!("Send {} bytes to {:?} ({:?})", buffer.size(), memory, mode);
        self.driver()
            .enqueue_write(queue, memory, &buffer.memory().read())?;
        self.complete(mode)
    }

    /// Copy this computer's copy of `buffer` back to host memory
    ///
    /// Write-only buffers are never read back, sent or not. Otherwise the
    /// buffer must have been sent to this computer first. With
    /// `ExecMode::Async` the host data is updated once the queue drains.
    pub fn receive(&self, buffer: &Buffer, mode: ExecMode) -> Result<()> {
        let queue = self.queue()?;
        if !buffer.access().host_readable() {
            return Err(ComputeError::ReadOnlyViolation);
        }
        let memory = buffer.device_memory(self).ok_or(ComputeError::NotSent)?;

        trace!("Receive {} bytes from {:?} ({:?})", buffer.size(), memory, mode);
        self.driver()
            .enqueue_read(queue, memory, buffer.memory().clone())?;
        self.complete(mode)
    }

    /// `send` in the default mode
    pub fn send_default(&self, buffer: &mut Buffer) -> Result<()> {
        self.send(buffer, self.default_mode())
    }

    /// `receive` in the default mode
    pub fn receive_default(&self, buffer: &Buffer) -> Result<()> {
        self.receive(buffer, self.default_mode())
    }
}
