use std::{
    fmt::Debug,
    ops::Deref,
    sync::{atomic::Ordering, Arc},
};

use atomig::Atomic;

use crate::graphics::{
    backend::{Backend, GpuDevice, Transition},
    device::Device,
    error::Result,
    types::{MemoryHeapType, ResourceStates},
};

/// Buffer shared between frames in flight; carries its last known usage state.
#[derive(Debug)]
pub struct GpuResource<B: Backend>(Arc<GpuResourceInner<B>>);

impl<B: Backend> Clone for GpuResource<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<B: Backend> Deref for GpuResource<B> {
    type Target = GpuResourceInner<B>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct GpuResourceInner<B: Backend> {
    device: Device<B>,
    id: u64,
    raw: B::Resource,
    size: usize,
    heap: MemoryHeapType,
    state: Atomic<ResourceStates>,
}

impl<B: Backend> GpuResource<B> {
    pub(crate) fn inner_new(
        device: Device<B>,
        raw: B::Resource,
        size: usize,
        heap: MemoryHeapType,
        state: ResourceStates,
    ) -> Self {
        let id = device.next_resource_id();

        Self(Arc::new(GpuResourceInner {
            device,
            id,
            raw,
            size,
            heap,
            state: Atomic::new(state),
        }))
    }
}

impl<B: Backend> GpuResourceInner<B> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn memory_type(&self) -> MemoryHeapType {
        self.heap
    }

    pub fn get_raw(&self) -> &B::Resource {
        &self.raw
    }

    pub fn get_current_state(&self) -> ResourceStates {
        self.state.load(Ordering::Relaxed)
    }

    /// Records `state` as the new usage and returns the transition into it,
    /// or `None` when the resource already is in that state.
    pub fn get_barrier(&self, state: ResourceStates) -> Option<Transition<'_, B>> {
        let old = self.state.swap(state, Ordering::Relaxed);

        if old != state {
            Some(Transition {
                resource: &self.raw,
                before: old,
                after: state,
            })
        } else {
            None
        }
    }

    pub fn write_data(&self, offset: usize, src: &[u8]) -> Result<()> {
        assert_eq!(
            self.heap,
            MemoryHeapType::Cpu,
            "GpuResource: only upload buffers are CPU-writable"
        );
        assert!(offset + src.len() <= self.size);

        self.device.raw.write_buffer(&self.raw, offset, src)
    }

    pub fn read_data(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        assert_ne!(
            self.heap,
            MemoryHeapType::Gpu,
            "GpuResource: device-local buffers are not CPU-readable"
        );
        assert!(offset + dst.len() <= self.size);

        self.device.raw.read_buffer(&self.raw, offset, dst)
    }
}
