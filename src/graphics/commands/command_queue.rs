use std::{ops::Deref, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::graphics::{
    backend::{Backend, GpuDevice, GpuQueue},
    device::Device,
    error::Result,
    fence::Fence,
    types::Engine,
};

#[derive(Debug)]
pub struct CommandQueue<B: Backend>(Arc<CommandQueueInner<B>>);

impl<B: Backend> Clone for CommandQueue<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

#[derive(Debug)]
pub struct CommandQueueInner<B: Backend> {
    device: Device<B>,
    engine: Engine,

    pub(crate) raw: Mutex<B::Queue>,
    pub(crate) fence: Fence<B>,
}

impl<B: Backend> CommandQueue<B> {
    pub(crate) fn inner_new(device: Device<B>, engine: Engine) -> Result<Self> {
        let raw = device.raw.create_command_queue(engine)?;
        let fence = device.create_fence()?;

        Ok(Self(Arc::new(CommandQueueInner {
            device,
            engine,
            raw: Mutex::new(raw),
            fence,
        })))
    }
}

impl<B: Backend> CommandQueue<B> {
    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn fence(&self) -> &Fence<B> {
        &self.fence
    }

    /// Submits closed lists and signals the next rally value after them.
    pub(crate) fn execute(&self, lists: &[&B::CommandList]) -> Result<u64> {
        let raw = self.raw.lock();

        raw.execute(lists)?;

        let value = self.fence.inc_value();
        raw.signal(self.fence.get_raw(), value)?;

        debug!(engine = ?self.engine, lists = lists.len(), rally = value, "submitted");

        Ok(value)
    }

    /// Last rally value handed out, or 0 if nothing was ever submitted.
    pub fn last_value(&self) -> u64 {
        self.fence.get_current_value()
    }

    pub fn wait_on_cpu(&self, value: u64) -> Result<()> {
        if self.fence.is_complete(value) {
            return Ok(());
        }

        self.device
            .raw
            .wait_for_fences(&[(self.fence.get_raw(), value)])
    }
}

impl<B: Backend> Deref for CommandQueue<B> {
    type Target = CommandQueueInner<B>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
