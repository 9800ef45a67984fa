use tracing::trace;

use crate::graphics::{
    backend::{Backend, GpuCommandList, GpuDevice},
    device::Device,
    error::Result,
    types::Engine,
};

use super::command_allocator::{CommandAllocator, FrameAllocators};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Closed,
    Recording,
}

/// Command list owned by one (engine, thread slot) pair.
#[derive(Debug)]
pub(crate) struct CommandBuffer<B: Backend> {
    pub(crate) raw: B::CommandList,
    engine: Engine,
    thread: usize,
    state: CommandBufferState,
    frame: usize,
}

impl<B: Backend> CommandBuffer<B> {
    /// The list starts closed, recorded against the first allocator of `frame`.
    pub(crate) fn inner_new(
        device: &Device<B>,
        engine: Engine,
        thread: usize,
        frame: &FrameAllocators<B>,
    ) -> Result<Self> {
        let raw = device
            .raw
            .create_command_list(engine, &frame.peek(thread).raw)?;

        Ok(Self {
            raw,
            engine,
            thread,
            state: CommandBufferState::Closed,
            frame: 0,
        })
    }

    pub(crate) fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Opens the list for `frame`. Returns `true` when it was closed before.
    pub(crate) fn activate(&mut self, allocator: &CommandAllocator<B>, frame: usize) -> Result<bool> {
        debug_assert_eq!(allocator.engine(), self.engine);

        if self.state == CommandBufferState::Recording {
            debug_assert_eq!(
                self.frame, frame,
                "command buffer of thread {} still recording frame {}",
                self.thread, self.frame
            );
            return Ok(false);
        }

        self.raw.reset(&allocator.raw)?;
        self.state = CommandBufferState::Recording;
        self.frame = frame;

        trace!(engine = ?self.engine, thread = self.thread, frame, "command buffer opened");

        Ok(true)
    }

    /// Returns `true` if the list was recording and is now ready to submit.
    pub(crate) fn close(&mut self) -> Result<bool> {
        if self.state == CommandBufferState::Closed {
            return Ok(false);
        }

        self.state = CommandBufferState::Closed;
        self.raw.close()?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::graphics::{
        backends::soft::{SoftBackend, SoftDevice},
        commands::command_allocator::FrameAllocators,
        device::Device,
        types::Engine,
    };

    use super::{CommandBuffer, CommandBufferState};

    #[test]
    fn activation_is_idempotent_within_a_frame() {
        let device = Device::<SoftBackend>::new("soft", SoftDevice::new());
        let frame = FrameAllocators::inner_new(&device, Engine::Graphics, 2).unwrap();
        let mut list = CommandBuffer::inner_new(&device, Engine::Graphics, 1, &frame).unwrap();

        assert_eq!(list.state(), CommandBufferState::Closed);
        assert!(!list.close().unwrap());

        assert!(list.activate(frame.require(1), 0).unwrap());
        assert!(!list.activate(frame.require(1), 0).unwrap());
        assert_eq!(list.state(), CommandBufferState::Recording);

        assert!(list.close().unwrap());
        assert!(!list.close().unwrap());
        assert_eq!(list.state(), CommandBufferState::Closed);
    }
}
