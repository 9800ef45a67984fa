use std::{ops::Deref, sync::Arc};

use parking_lot::{Mutex, MutexGuard};

use super::{
    backend::{Backend, GpuDevice},
    device::Device,
    error::{Error, Result},
    resources::GpuResource,
    types::{DescriptorHeapKind, ViewKind},
};

/// Slot in a CPU-only staging heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CpuDescriptor {
    pub(crate) kind: ViewKind,
    pub(crate) index: usize,
}

impl CpuDescriptor {
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// A resource together with the staging descriptor describing how shaders see it.
#[derive(Debug)]
pub struct ResourceView<B: Backend> {
    resource: Option<GpuResource<B>>,
    descriptor: CpuDescriptor,
}

impl<B: Backend> Clone for ResourceView<B> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            descriptor: self.descriptor,
        }
    }
}

impl<B: Backend> ResourceView<B> {
    pub fn resource(&self) -> Option<&GpuResource<B>> {
        self.resource.as_ref()
    }

    pub fn descriptor(&self) -> CpuDescriptor {
        self.descriptor
    }

    pub fn kind(&self) -> ViewKind {
        self.descriptor.kind
    }
}

/// Staging descriptor heaps, one per descriptor kind. Views are created here and
/// copied into the shader-visible heaps right before the work that reads them.
#[derive(Debug)]
pub struct DescriptorAllocator<B: Backend>(Arc<DescriptorAllocatorInner<B>>);

impl<B: Backend> Clone for DescriptorAllocator<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<B: Backend> Deref for DescriptorAllocator<B> {
    type Target = DescriptorAllocatorInner<B>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct DescriptorAllocatorInner<B: Backend> {
    rtv: Mutex<CpuDescriptorHeap<B>>,
    dsv: Mutex<CpuDescriptorHeap<B>>,
    cbv_srv_uav: Mutex<CpuDescriptorHeap<B>>,
    sampler: Mutex<CpuDescriptorHeap<B>>,

    null_cbv: CpuDescriptor,
    null_srv: CpuDescriptor,
    null_uav: CpuDescriptor,
    null_sampler: CpuDescriptor,
}

impl<B: Backend> DescriptorAllocator<B> {
    pub(super) fn inner_new(
        device: &Device<B>,
        rtv_size: usize,
        dsv_size: usize,
        cbv_srv_uav_size: usize,
        sampler_size: usize,
    ) -> Result<Self> {
        let mut cbv_srv_uav =
            CpuDescriptorHeap::inner_new(device.clone(), DescriptorHeapKind::CbvSrvUav, cbv_srv_uav_size)?;
        let mut sampler =
            CpuDescriptorHeap::inner_new(device.clone(), DescriptorHeapKind::Sampler, sampler_size)?;

        let null_cbv = cbv_srv_uav.push(ViewKind::Cbv, None)?;
        let null_srv = cbv_srv_uav.push(ViewKind::Srv, None)?;
        let null_uav = cbv_srv_uav.push(ViewKind::Uav, None)?;
        let null_sampler = sampler.push(ViewKind::Sampler, None)?;

        Ok(Self(Arc::new(DescriptorAllocatorInner {
            rtv: Mutex::new(CpuDescriptorHeap::inner_new(
                device.clone(),
                DescriptorHeapKind::Rtv,
                rtv_size,
            )?),
            dsv: Mutex::new(CpuDescriptorHeap::inner_new(
                device.clone(),
                DescriptorHeapKind::Dsv,
                dsv_size,
            )?),
            cbv_srv_uav: Mutex::new(cbv_srv_uav),
            sampler: Mutex::new(sampler),
            null_cbv,
            null_srv,
            null_uav,
            null_sampler,
        })))
    }

    pub fn push_rtv(&self, resource: &GpuResource<B>) -> Result<ResourceView<B>> {
        self.push_view(ViewKind::Rtv, Some(resource))
    }

    pub fn push_dsv(&self, resource: &GpuResource<B>) -> Result<ResourceView<B>> {
        self.push_view(ViewKind::Dsv, Some(resource))
    }

    pub fn push_cbv(&self, resource: &GpuResource<B>) -> Result<ResourceView<B>> {
        self.push_view(ViewKind::Cbv, Some(resource))
    }

    pub fn push_srv(&self, resource: &GpuResource<B>) -> Result<ResourceView<B>> {
        self.push_view(ViewKind::Srv, Some(resource))
    }

    pub fn push_uav(&self, resource: &GpuResource<B>) -> Result<ResourceView<B>> {
        self.push_view(ViewKind::Uav, Some(resource))
    }

    pub fn push_sampler(&self) -> Result<ResourceView<B>> {
        self.push_view(ViewKind::Sampler, None)
    }

    pub fn remove(&self, view: ResourceView<B>) {
        self.heap(view.kind().heap_kind()).remove(view.descriptor)
    }

    fn push_view(
        &self,
        kind: ViewKind,
        resource: Option<&GpuResource<B>>,
    ) -> Result<ResourceView<B>> {
        let descriptor = self
            .heap(kind.heap_kind())
            .push(kind, resource.map(|r| r.get_raw()))?;

        Ok(ResourceView {
            resource: resource.cloned(),
            descriptor,
        })
    }
}

impl<B: Backend> DescriptorAllocatorInner<B> {
    pub(crate) fn heap(&self, kind: DescriptorHeapKind) -> MutexGuard<'_, CpuDescriptorHeap<B>> {
        match kind {
            DescriptorHeapKind::Rtv => self.rtv.lock(),
            DescriptorHeapKind::Dsv => self.dsv.lock(),
            DescriptorHeapKind::CbvSrvUav => self.cbv_srv_uav.lock(),
            DescriptorHeapKind::Sampler => self.sampler.lock(),
        }
    }

    /// Staging slot bound in place of a missing view.
    pub fn null_descriptor(&self, kind: ViewKind) -> CpuDescriptor {
        match kind {
            ViewKind::Cbv => self.null_cbv,
            ViewKind::Srv => self.null_srv,
            ViewKind::Uav => self.null_uav,
            ViewKind::Sampler => self.null_sampler,
            ViewKind::Rtv | ViewKind::Dsv => {
                panic!("DescriptorAllocator: {kind:?} views are never bound through tables")
            }
        }
    }
}

#[derive(Debug)]
pub struct CpuDescriptorHeap<B: Backend> {
    device: Device<B>,
    kind: DescriptorHeapKind,
    raw: B::DescriptorHeap,
    free_list: Vec<usize>,

    size: usize,
    next: usize,
    capacity: usize,
}

impl<B: Backend> CpuDescriptorHeap<B> {
    pub(super) fn inner_new(
        device: Device<B>,
        kind: DescriptorHeapKind,
        capacity: usize,
    ) -> Result<Self> {
        let raw = device.raw.create_descriptor_heap(kind, capacity, false)?;

        Ok(Self {
            device,
            kind,
            raw,
            free_list: vec![],
            size: 0,
            next: 0,
            capacity,
        })
    }

    pub fn push(
        &mut self,
        kind: ViewKind,
        resource: Option<&B::Resource>,
    ) -> Result<CpuDescriptor> {
        debug_assert_eq!(kind.heap_kind(), self.kind);

        let index = if let Some(free) = self.free_list.pop() {
            free
        } else {
            if self.next == self.capacity {
                return Err(Error::OutOfDescriptors {
                    kind: self.kind,
                    requested: 1,
                    available: 0,
                    capacity: self.capacity,
                });
            }

            self.next += 1;
            self.next - 1
        };

        if let Err(err) = self.device.raw.write_view(&self.raw, index, kind, resource) {
            self.free_list.push(index);
            return Err(err);
        }

        self.size += 1;

        Ok(CpuDescriptor { kind, index })
    }

    pub fn remove(&mut self, handle: CpuDescriptor) {
        if handle.index >= self.next {
            panic!(
                "CpuDescriptorHeap<{:?}>: Index out of bounds, length {} and passed {}",
                self.kind, self.next, handle.index
            );
        }

        self.size -= 1;
        self.free_list.push(handle.index);
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn get_raw(&self) -> &B::DescriptorHeap {
        &self.raw
    }
}
