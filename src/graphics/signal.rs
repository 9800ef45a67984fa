use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::{
    backend::{Backend, GpuDevice},
    commands::CommandQueue,
    device::Device,
    error::Result,
    types::Engine,
};

/// The queues a signal's rally points refer to.
#[derive(Debug)]
pub(crate) struct Rally<B: Backend> {
    pub(crate) device: Device<B>,
    pub(crate) queues: SmallVec<[CommandQueue<B>; Engine::COUNT]>,
}

impl<B: Backend> Rally<B> {
    pub(crate) fn queue(&self, engine: Engine) -> &CommandQueue<B> {
        &self.queues[engine.index()]
    }
}

/// Per-engine fence values reached once everything flushed before the signal
/// has run. A zero entry means the engine had nothing to submit.
#[derive(Debug)]
pub struct Signal<B: Backend> {
    rally_points: [u64; Engine::COUNT],
    rally: Option<Arc<Rally<B>>>,
}

impl<B: Backend> Clone for Signal<B> {
    fn clone(&self) -> Self {
        Self {
            rally_points: self.rally_points,
            rally: self.rally.clone(),
        }
    }
}

impl<B: Backend> Default for Signal<B> {
    fn default() -> Self {
        Self {
            rally_points: [0; Engine::COUNT],
            rally: None,
        }
    }
}

impl<B: Backend> Signal<B> {
    pub(crate) fn new(rally: Arc<Rally<B>>, rally_points: [u64; Engine::COUNT]) -> Self {
        Self {
            rally_points,
            rally: Some(rally),
        }
    }

    pub fn rally_point(&self, engine: Engine) -> u64 {
        self.rally_points[engine.index()]
    }

    pub fn rally_points(&self) -> [u64; Engine::COUNT] {
        self.rally_points
    }

    pub fn is_empty(&self) -> bool {
        self.rally_points.iter().all(|&value| value == 0)
    }

    pub fn is_complete(&self) -> bool {
        let Some(rally) = &self.rally else {
            return true;
        };

        Engine::ALL.iter().all(|&engine| {
            rally
                .queue(engine)
                .fence()
                .is_complete(self.rally_point(engine))
        })
    }

    /// Blocks until every engine reached its rally point. Returns at once for
    /// points already passed, so waiting twice costs nothing.
    pub fn wait_for(&self) -> Result<()> {
        let Some(rally) = &self.rally else {
            return Ok(());
        };

        let waits = Engine::ALL
            .iter()
            .map(|&engine| (rally.queue(engine).fence(), self.rally_point(engine)))
            .filter(|(fence, value)| *value != 0 && !fence.is_complete(*value))
            .map(|(fence, value)| (fence.get_raw(), value))
            .collect::<SmallVec<[_; Engine::COUNT]>>();

        if waits.is_empty() {
            return Ok(());
        }

        trace!(points = ?self.rally_points, "waiting for signal");

        rally.device.raw.wait_for_fences(&waits)
    }
}
