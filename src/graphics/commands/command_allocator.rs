use std::sync::atomic::{AtomicUsize, Ordering};

use crate::graphics::{
    backend::{Backend, GpuCommandAllocator, GpuDevice},
    device::Device,
    error::Result,
    types::Engine,
};

#[derive(Debug)]
pub(crate) struct CommandAllocator<B: Backend> {
    pub(crate) raw: B::CommandAllocator,
    engine: Engine,
}

impl<B: Backend> CommandAllocator<B> {
    pub(crate) fn inner_new(device: &Device<B>, engine: Engine) -> Result<Self> {
        let raw = device.raw.create_command_allocator(engine)?;

        Ok(Self { raw, engine })
    }

    pub(crate) fn engine(&self) -> Engine {
        self.engine
    }

    pub(crate) fn reset(&self) -> Result<()> {
        self.raw.reset()
    }
}

/// One allocator per thread slot for a single frame slot of one engine.
#[derive(Debug)]
pub(crate) struct FrameAllocators<B: Backend> {
    allocators: Vec<CommandAllocator<B>>,
    used: AtomicUsize,
}

impl<B: Backend> FrameAllocators<B> {
    pub(crate) fn inner_new(device: &Device<B>, engine: Engine, threads: usize) -> Result<Self> {
        let allocators = (0..threads)
            .map(|_| device.create_command_allocator(engine))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            allocators,
            used: AtomicUsize::new(0),
        })
    }

    /// Allocator of `thread`, marking every slot up to it as used this frame.
    pub(crate) fn require(&self, thread: usize) -> &CommandAllocator<B> {
        self.used.fetch_max(thread + 1, Ordering::AcqRel);
        &self.allocators[thread]
    }

    pub(crate) fn peek(&self, thread: usize) -> &CommandAllocator<B> {
        &self.allocators[thread]
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Resets the allocators touched since the last reset. The frame's last
    /// signal must have been waited on.
    pub(crate) fn reset_used(&self) -> Result<()> {
        let used = self.used.swap(0, Ordering::AcqRel);

        for allocator in &self.allocators[..used] {
            allocator.reset()?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(dead_code)]
mod tests {
    use crate::graphics::{
        backends::soft::{SoftBackend, SoftDevice},
        device::Device,
        types::Engine,
    };

    use super::{CommandAllocator, FrameAllocators};

    const fn is_send_sync<T: Send + Sync>() {}

    const _: () = is_send_sync::<CommandAllocator<SoftBackend>>();
    const _: () = is_send_sync::<FrameAllocators<SoftBackend>>();

    #[test]
    fn only_used_allocators_are_reset() {
        let device = Device::<SoftBackend>::new("soft", SoftDevice::new());
        let frame = FrameAllocators::inner_new(&device, Engine::Compute, 8).unwrap();

        assert_eq!(frame.require(2).engine(), Engine::Compute);
        frame.require(0);
        assert_eq!(frame.used(), 3);

        frame.reset_used().unwrap();
        assert_eq!(frame.used(), 0);
        assert_eq!(device.raw().stats().allocator_resets, 3);

        frame.reset_used().unwrap();
        assert_eq!(device.raw().stats().allocator_resets, 3);
    }
}
