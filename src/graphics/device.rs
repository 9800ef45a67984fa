use std::{
    ops::Deref,
    sync::{atomic::AtomicU64, Arc},
};

use super::{
    backend::{Backend, GpuDevice},
    commands::{CommandAllocator, CommandQueue},
    descriptor_heap::{CpuDescriptorHeap, DescriptorAllocator},
    error::Result,
    fence::Fence,
    frame_descriptor_heap::GpuDescriptorHeap,
    resources::GpuResource,
    types::{DescriptorHeapKind, Engine, MemoryHeapType, ResourceStates},
};

#[derive(Debug)]
pub struct Device<B: Backend>(Arc<DeviceInner<B>>);

impl<B: Backend> Clone for Device<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<B: Backend> Device<B> {
    pub fn new(name: impl Into<String>, raw: B::Device) -> Self {
        Self(Arc::new(DeviceInner {
            name: name.into(),
            raw,
            resource_ids: AtomicU64::new(1),
        }))
    }
}

impl<B: Backend> Deref for Device<B> {
    type Target = DeviceInner<B>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct DeviceInner<B: Backend> {
    name: String,
    pub(crate) raw: B::Device,
    resource_ids: AtomicU64,
}

impl<B: Backend> DeviceInner<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> &B::Device {
        &self.raw
    }

    pub(crate) fn next_resource_id(&self) -> u64 {
        self.resource_ids
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

impl<B: Backend> Device<B> {
    pub(crate) fn create_command_allocator(&self, engine: Engine) -> Result<CommandAllocator<B>> {
        CommandAllocator::inner_new(self, engine)
    }

    pub fn create_command_queue(&self, engine: Engine) -> Result<CommandQueue<B>> {
        CommandQueue::inner_new(self.clone(), engine)
    }

    pub fn create_fence(&self) -> Result<Fence<B>> {
        Fence::inner_new(self)
    }

    pub fn create_buffer(
        &self,
        size: usize,
        heap: MemoryHeapType,
        state: ResourceStates,
    ) -> Result<GpuResource<B>> {
        let raw = self.raw.create_buffer(size, heap, state)?;

        Ok(GpuResource::inner_new(self.clone(), raw, size, heap, state))
    }

    pub fn create_cpu_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: usize,
    ) -> Result<CpuDescriptorHeap<B>> {
        CpuDescriptorHeap::inner_new(self.clone(), kind, capacity)
    }

    pub fn create_gpu_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: usize,
        persistent: usize,
        buffers: usize,
    ) -> Result<GpuDescriptorHeap<B>> {
        GpuDescriptorHeap::inner_new(self, kind, capacity, persistent, buffers)
    }

    pub fn create_descriptor_allocator(
        &self,
        rtv_size: usize,
        dsv_size: usize,
        cbv_srv_uav_size: usize,
        sampler_size: usize,
    ) -> Result<DescriptorAllocator<B>> {
        DescriptorAllocator::inner_new(self, rtv_size, dsv_size, cbv_srv_uav_size, sampler_size)
    }
}
