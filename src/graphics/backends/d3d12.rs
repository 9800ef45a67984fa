//! D3D12 device through `oxidx`. Graphics and ray tracing both submit to a
//! DIRECT queue of their own.
//!
//! Lists are plain graphics command lists, so acceleration structure builds
//! and ray dispatches fail the flush that would submit them.

use std::fmt::Debug;

use oxidx::dx::{
    self, ICommandAllocator, ICommandQueue, IDescriptorHeap, IDevice, IFence,
    IGraphicsCommandList, IResource, PSO_NONE,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::error;

use crate::graphics::{
    backend::{
        copy_runs, Backend, DescriptorRange, GpuCommandAllocator, GpuCommandList, GpuDevice, GpuFence,
        GpuQueue, Transition,
    },
    error::{Error, Result},
    types::{DescriptorHeapKind, Engine, MemoryHeapType, QueueKind, ResourceStates, ViewKind},
};

#[derive(Clone, Copy, Debug)]
pub struct D3D12Backend;

impl Backend for D3D12Backend {
    type Device = D3D12Device;
    type Queue = D3D12Queue;
    type CommandAllocator = D3D12CommandAllocator;
    type CommandList = D3D12CommandList;
    type Fence = D3D12Fence;
    type Resource = dx::Resource;
    type DescriptorHeap = D3D12DescriptorHeap;
}

fn device_error(err: impl Debug) -> Error {
    Error::Device(format!("{err:?}"))
}

fn list_type(engine: Engine) -> dx::CommandListType {
    match engine.queue_kind() {
        QueueKind::Direct => dx::CommandListType::Direct,
        QueueKind::Compute => dx::CommandListType::Compute,
        QueueKind::Copy => dx::CommandListType::Copy,
    }
}

fn heap_type(kind: DescriptorHeapKind) -> dx::DescriptorHeapType {
    match kind {
        DescriptorHeapKind::Rtv => dx::DescriptorHeapType::Rtv,
        DescriptorHeapKind::Dsv => dx::DescriptorHeapType::Dsv,
        DescriptorHeapKind::CbvSrvUav => dx::DescriptorHeapType::CbvSrvUav,
        DescriptorHeapKind::Sampler => dx::DescriptorHeapType::Sampler,
    }
}

fn raw_state(state: ResourceStates) -> dx::ResourceStates {
    dx::ResourceStates::from_bits_truncate(state.bits() as i32)
}

#[derive(Debug)]
pub struct D3D12Device {
    raw: dx::Device,
}

impl D3D12Device {
    pub fn new(raw: dx::Device) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &dx::Device {
        &self.raw
    }
}

impl GpuDevice<D3D12Backend> for D3D12Device {
    fn create_command_queue(&self, engine: Engine) -> Result<D3D12Queue> {
        let desc = match engine.queue_kind() {
            QueueKind::Direct => dx::CommandQueueDesc::direct(),
            QueueKind::Compute => dx::CommandQueueDesc::compute(),
            QueueKind::Copy => dx::CommandQueueDesc::copy(),
        };

        let raw = self.raw.create_command_queue(&desc).map_err(device_error)?;

        Ok(D3D12Queue {
            raw: Mutex::new(raw),
        })
    }

    fn create_command_allocator(&self, engine: Engine) -> Result<D3D12CommandAllocator> {
        let raw = self
            .raw
            .create_command_allocator(list_type(engine))
            .map_err(device_error)?;

        Ok(D3D12CommandAllocator { raw })
    }

    fn create_command_list(
        &self,
        engine: Engine,
        allocator: &D3D12CommandAllocator,
    ) -> Result<D3D12CommandList> {
        let raw: dx::GraphicsCommandList = self
            .raw
            .create_command_list(0, list_type(engine), &allocator.raw, PSO_NONE)
            .map_err(device_error)?;

        raw.close().map_err(device_error)?;

        Ok(D3D12CommandList {
            raw,
            engine,
            unsupported: None,
        })
    }

    fn create_fence(&self) -> Result<D3D12Fence> {
        let raw = self
            .raw
            .create_fence(0, dx::FenceFlags::empty())
            .map_err(device_error)?;

        Ok(D3D12Fence { raw })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: usize,
        shader_visible: bool,
    ) -> Result<D3D12DescriptorHeap> {
        let desc = match kind {
            DescriptorHeapKind::Rtv => dx::DescriptorHeapDesc::rtv(capacity),
            DescriptorHeapKind::Dsv => dx::DescriptorHeapDesc::dsv(capacity),
            DescriptorHeapKind::CbvSrvUav => dx::DescriptorHeapDesc::cbr_srv_uav(capacity),
            DescriptorHeapKind::Sampler => dx::DescriptorHeapDesc::sampler(capacity),
        };

        let desc = if shader_visible {
            desc.with_flags(dx::DescriptorHeapFlags::ShaderVisible)
        } else {
            desc
        };

        let raw: dx::DescriptorHeap = self.raw.create_descriptor_heap(&desc).map_err(device_error)?;
        let increment_size = self.raw.get_descriptor_handle_increment_size(heap_type(kind));

        Ok(D3D12DescriptorHeap {
            raw,
            kind,
            increment_size,
        })
    }

    fn create_buffer(
        &self,
        size: usize,
        heap: MemoryHeapType,
        state: ResourceStates,
    ) -> Result<dx::Resource> {
        let properties = match heap {
            MemoryHeapType::Gpu => dx::HeapProperties::default(),
            MemoryHeapType::Cpu => dx::HeapProperties::upload(),
            MemoryHeapType::Readback => dx::HeapProperties::readback(),
        };

        self.raw
            .create_committed_resource(
                &properties,
                dx::HeapFlags::empty(),
                &dx::ResourceDesc::buffer(size),
                raw_state(state),
                None,
            )
            .map_err(device_error)
    }

    fn write_view(
        &self,
        heap: &D3D12DescriptorHeap,
        index: usize,
        kind: ViewKind,
        resource: Option<&dx::Resource>,
    ) -> Result<()> {
        let handle = heap.cpu_handle(index);

        match kind {
            ViewKind::Cbv => {
                let desc = resource.map(|resource| {
                    dx::ConstantBufferViewDesc::new(
                        resource.get_gpu_virtual_address(),
                        resource.get_desc().width() as u32,
                    )
                });
                self.raw.create_constant_buffer_view(desc.as_ref(), handle);
            }
            ViewKind::Srv => self.raw.create_shader_resource_view(resource, None, handle),
            ViewKind::Uav => self
                .raw
                .create_unordered_access_view(resource, None, None, handle),
            ViewKind::Rtv => self.raw.create_render_target_view(resource, None, handle),
            ViewKind::Dsv => self.raw.create_depth_stencil_view(resource, None, handle),
            ViewKind::Sampler => self
                .raw
                .create_sampler(&dx::SamplerDesc::linear(), handle),
        }

        Ok(())
    }

    fn copy_descriptors(
        &self,
        kind: DescriptorHeapKind,
        dst: &D3D12DescriptorHeap,
        dst_ranges: &[DescriptorRange],
        src: &D3D12DescriptorHeap,
        src_slots: &[usize],
    ) {
        for run in copy_runs(dst_ranges, src_slots) {
            self.raw.copy_descriptors_simple(
                run.count as u32,
                dst.cpu_handle(run.dst),
                src.cpu_handle(run.src),
                heap_type(kind),
            );
        }
    }

    fn write_buffer(&self, resource: &dx::Resource, offset: usize, data: &[u8]) -> Result<()> {
        let mapped = resource.map::<u8>(0, None).map_err(device_error)?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr().add(offset), data.len());
        }

        resource.unmap(0, None);

        Ok(())
    }

    fn read_buffer(&self, resource: &dx::Resource, offset: usize, dst: &mut [u8]) -> Result<()> {
        let mapped = resource.map::<u8>(0, None).map_err(device_error)?;

        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }

        resource.unmap(0, None);

        Ok(())
    }

    fn wait_for_fences(&self, waits: &[(&D3D12Fence, u64)]) -> Result<()> {
        // a removed device reports u64::MAX, which would pass every completion check
        if waits.iter().any(|(fence, _)| fence.is_lost()) {
            return Err(Error::DeviceRemoved("fence reports device removal".to_string()));
        }

        let mut armed = SmallVec::<[(&D3D12Fence, dx::Event); 4]>::new();
        for &(fence, value) in waits {
            if fence.raw.get_completed_value() >= value {
                continue;
            }

            let event = dx::Event::create(false, false).map_err(device_error)?;
            fence
                .raw
                .set_event_on_completion(value, event)
                .map_err(device_error)?;
            armed.push((fence, event));
        }

        let mut removed = false;
        for (fence, event) in armed {
            event.wait(u32::MAX);
            event.close().map_err(device_error)?;
            removed |= fence.is_lost();
        }

        if removed {
            return Err(Error::DeviceRemoved("fence reports device removal".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct D3D12Queue {
    raw: Mutex<dx::CommandQueue>,
}

impl GpuQueue<D3D12Backend> for D3D12Queue {
    fn execute(&self, lists: &[&D3D12CommandList]) -> Result<()> {
        let lists = lists
            .iter()
            .map(|list| Some(list.raw.clone()))
            .collect::<Vec<_>>();

        self.raw.lock().execute_command_lists(&lists);

        Ok(())
    }

    fn signal(&self, fence: &D3D12Fence, value: u64) -> Result<()> {
        self.raw
            .lock()
            .signal(&fence.raw, value)
            .map_err(|err| {
                if fence.is_lost() {
                    Error::DeviceRemoved(format!("{err:?}"))
                } else {
                    device_error(err)
                }
            })
    }
}

#[derive(Debug)]
pub struct D3D12CommandAllocator {
    raw: dx::CommandAllocator,
}

impl GpuCommandAllocator for D3D12CommandAllocator {
    fn reset(&self) -> Result<()> {
        self.raw.reset().map_err(device_error)
    }
}

#[derive(Debug)]
pub struct D3D12Fence {
    raw: dx::Fence,
}

impl D3D12Fence {
    fn is_lost(&self) -> bool {
        self.raw.get_completed_value() == u64::MAX
    }
}

impl GpuFence for D3D12Fence {
    fn completed_value(&self) -> u64 {
        self.raw.get_completed_value()
    }
}

#[derive(Debug)]
pub struct D3D12DescriptorHeap {
    raw: dx::DescriptorHeap,
    kind: DescriptorHeapKind,
    increment_size: usize,
}

impl D3D12DescriptorHeap {
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    fn cpu_handle(&self, index: usize) -> dx::CpuDescriptorHandle {
        self.raw
            .get_cpu_descriptor_handle_for_heap_start()
            .advance(index, self.increment_size)
    }

    fn gpu_handle(&self, index: usize) -> dx::GpuDescriptorHandle {
        self.raw
            .get_gpu_descriptor_handle_for_heap_start()
            .advance(index, self.increment_size)
    }
}

#[derive(Debug)]
pub struct D3D12CommandList {
    raw: dx::GraphicsCommandList,
    engine: Engine,
    /// First recorded operation this list type cannot encode; fails the close.
    unsupported: Option<&'static str>,
}

impl D3D12CommandList {
    fn reject(&mut self, operation: &'static str) {
        error!(engine = ?self.engine, operation, "operation needs a DXR command list");
        self.unsupported.get_or_insert(operation);
    }
}

impl GpuCommandList<D3D12Backend> for D3D12CommandList {
    fn reset(&mut self, allocator: &D3D12CommandAllocator) -> Result<()> {
        self.unsupported = None;
        self.raw.reset(&allocator.raw, PSO_NONE).map_err(device_error)
    }

    fn close(&mut self) -> Result<()> {
        self.raw.close().map_err(device_error)?;

        match self.unsupported.take() {
            Some(operation) => Err(Error::Device(format!(
                "{operation} was recorded on a command list without DXR support"
            ))),
            None => Ok(()),
        }
    }

    fn resource_barrier(&mut self, barriers: &[Transition<'_, D3D12Backend>]) {
        let barriers = barriers
            .iter()
            .map(|barrier| {
                dx::ResourceBarrier::transition(
                    barrier.resource,
                    raw_state(barrier.before),
                    raw_state(barrier.after),
                    None,
                )
            })
            .collect::<Vec<_>>();

        self.raw.resource_barrier(&barriers);
    }

    fn copy_resource(&mut self, dst: &dx::Resource, src: &dx::Resource) {
        self.raw.copy_resource(dst, src);
    }

    fn copy_buffer_region(
        &mut self,
        dst: &dx::Resource,
        dst_offset: usize,
        src: &dx::Resource,
        src_offset: usize,
        size: usize,
    ) {
        self.raw
            .copy_buffer_region(dst, dst_offset as u64, src, src_offset as u64, size as u64);
    }

    fn set_descriptor_heaps(&mut self, csu: &D3D12DescriptorHeap, sampler: &D3D12DescriptorHeap) {
        self.raw
            .set_descriptor_heaps(&[Some(csu.raw.clone()), Some(sampler.raw.clone())]);
    }

    fn set_descriptor_table(
        &mut self,
        engine: Engine,
        root_index: u32,
        heap: &D3D12DescriptorHeap,
        start: usize,
    ) {
        let handle = heap.gpu_handle(start);

        if engine.uses_graphics_root() {
            self.raw.set_graphics_root_descriptor_table(root_index, handle);
        } else {
            self.raw.set_compute_root_descriptor_table(root_index, handle);
        }
    }

    fn set_constant_buffer(&mut self, engine: Engine, root_index: u32, resource: &dx::Resource) {
        let address = resource.get_gpu_virtual_address();

        if engine.uses_graphics_root() {
            self.raw
                .set_graphics_root_constant_buffer_view(root_index, address);
        } else {
            self.raw
                .set_compute_root_constant_buffer_view(root_index, address);
        }
    }

    fn set_acceleration_structure(&mut self, root_index: u32, resource: &dx::Resource) {
        self.raw
            .set_compute_root_shader_resource_view(root_index, resource.get_gpu_virtual_address());
    }

    fn clear_render_target(&mut self, heap: &D3D12DescriptorHeap, index: usize, color: [f32; 4]) {
        self.raw
            .clear_render_target_view(heap.cpu_handle(index), color, &[]);
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.raw
            .draw_instanced(vertex_count, instance_count, start_vertex, start_instance);
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.raw.draw_indexed_instanced(
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        );
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.raw.dispatch(x, y, z);
    }

    fn build_acceleration_structure(
        &mut self,
        _dst: &dx::Resource,
        _scratch: &dx::Resource,
        _inputs: &dx::Resource,
    ) {
        self.reject("acceleration structure build");
    }

    fn dispatch_rays(&mut self, _width: u32, _height: u32, _depth: u32) {
        self.reject("ray dispatch");
    }
}
