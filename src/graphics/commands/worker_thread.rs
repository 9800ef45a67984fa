use std::marker::PhantomData;

use smallvec::SmallVec;

use super::{
    command_buffer::CommandBuffer,
    worker_type::{ComputeCapable, CopyCapable, GraphicsCapable, RayTracingCapable, WorkerType},
};

use crate::graphics::{
    backend::{Backend, DescriptorRange, GpuCommandList, Transition},
    bindings::{DescriptorBatch, SlotBinding},
    descriptor_heap::{DescriptorAllocator, ResourceView},
    device::Device,
    error::Result,
    frame_descriptor_heap::GpuDescriptorHeap,
    resources::GpuResource,
    scheduler::Tag,
    types::{DescriptorHeapKind, Engine, MemoryHeapType, ResourceStates, ViewKind},
};

/// Everything a recording callback may touch, borrowed from the scheduler for
/// the duration of one work item.
pub(crate) struct RecordContext<'a, B: Backend> {
    pub(crate) device: &'a Device<B>,
    pub(crate) descriptors: &'a DescriptorAllocator<B>,
    pub(crate) gpu_cbv_srv_uav: &'a GpuDescriptorHeap<B>,
    pub(crate) gpu_sampler: &'a GpuDescriptorHeap<B>,
    pub(crate) list: &'a mut CommandBuffer<B>,
    pub(crate) tag: &'a Tag,
    pub(crate) thread_index: usize,
    pub(crate) frame_index: usize,
}

/// Recorder handed to a process. Only the operations its engine supports are
/// available.
pub struct WorkerThread<'a, B: Backend, T: WorkerType> {
    ctx: RecordContext<'a, B>,
    batch: DescriptorBatch,
    _marker: PhantomData<T>,
}

impl<'a, B: Backend, T: WorkerType> WorkerThread<'a, B, T> {
    pub(crate) fn inner_new(ctx: RecordContext<'a, B>) -> Self {
        Self {
            ctx,
            batch: DescriptorBatch::default(),
            _marker: PhantomData,
        }
    }

    pub fn tag(&self) -> &Tag {
        self.ctx.tag
    }

    pub fn thread_index(&self) -> usize {
        self.ctx.thread_index
    }

    pub fn frame_index(&self) -> usize {
        self.ctx.frame_index
    }

    pub fn engine(&self) -> Engine {
        T::ENGINE
    }

    pub fn device(&self) -> &Device<B> {
        self.ctx.device
    }

    pub fn descriptors(&self) -> &DescriptorAllocator<B> {
        self.ctx.descriptors
    }

    pub fn barrier(&mut self, resource: &GpuResource<B>, state: ResourceStates) {
        self.barriers(&[(resource, state)]);
    }

    /// Transitions every tracked resource whose state differs, in one call.
    /// Upload and readback buffers keep their creation state.
    pub fn barriers(&mut self, requests: &[(&GpuResource<B>, ResourceStates)]) {
        let barriers = requests
            .iter()
            .filter(|(resource, _)| resource.memory_type() == MemoryHeapType::Gpu)
            .filter_map(|(resource, state)| resource.get_barrier(*state))
            .collect::<SmallVec<[Transition<'_, B>; 4]>>();

        if !barriers.is_empty() {
            self.ctx.list.raw.resource_barrier(&barriers);
        }
    }

    pub(crate) fn pending_descriptors(&self) -> bool {
        !self.batch.is_empty()
    }

    fn flush_descriptors(&mut self) {
        if !self.pending_descriptors() {
            return;
        }

        self.batch.flush(
            self.ctx.device,
            self.ctx.descriptors,
            self.ctx.gpu_cbv_srv_uav,
            self.ctx.gpu_sampler,
        );
    }
}

impl<B: Backend, T: CopyCapable> WorkerThread<'_, B, T> {
    pub fn copy_resource(&mut self, dst: &GpuResource<B>, src: &GpuResource<B>) {
        assert!(dst.size() >= src.size());

        self.barriers(&[
            (dst, ResourceStates::CopyDst),
            (src, ResourceStates::CopySrc),
        ]);

        self.ctx.list.raw.copy_resource(dst.get_raw(), src.get_raw());
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &GpuResource<B>,
        dst_offset: usize,
        src: &GpuResource<B>,
        src_offset: usize,
        size: usize,
    ) {
        assert!(dst_offset + size <= dst.size());
        assert!(src_offset + size <= src.size());

        self.barriers(&[
            (dst, ResourceStates::CopyDst),
            (src, ResourceStates::CopySrc),
        ]);

        self.ctx.list.raw.copy_buffer_region(
            dst.get_raw(),
            dst_offset,
            src.get_raw(),
            src_offset,
            size,
        );
    }
}

impl<B: Backend, T: ComputeCapable> WorkerThread<'_, B, T> {
    /// Binds root parameter `root_index`. Descriptor tables are allocated in the
    /// current frame's ring and filled right before the next draw or dispatch.
    pub fn bind(&mut self, root_index: u32, binding: &SlotBinding<'_, B>) -> Result<()> {
        match binding {
            SlotBinding::Constant(resource) => {
                self.barrier(resource, ResourceStates::VertexAndConstantBuffer);
                self.ctx
                    .list
                    .raw
                    .set_constant_buffer(T::ENGINE, root_index, resource.get_raw());
            }
            SlotBinding::DescriptorRange { kind, views } => {
                self.bind_table(root_index, *kind, views)?;
            }
            SlotBinding::AccelerationStructure(resource) => {
                self.ctx
                    .list
                    .raw
                    .set_acceleration_structure(root_index, resource.get_raw());
            }
        }

        Ok(())
    }

    fn bind_table(
        &mut self,
        root_index: u32,
        kind: ViewKind,
        views: &[Option<ResourceView<B>>],
    ) -> Result<()> {
        if views.is_empty() {
            return Ok(());
        }

        let state = match kind {
            ViewKind::Srv => Some(ResourceStates::shader_resource_for(T::ENGINE)),
            ViewKind::Uav => Some(ResourceStates::UnorderedAccess),
            ViewKind::Cbv => Some(ResourceStates::VertexAndConstantBuffer),
            ViewKind::Sampler => None,
            ViewKind::Rtv | ViewKind::Dsv => {
                panic!("WorkerThread: {kind:?} views cannot be bound as a table")
            }
        };

        let heap = match kind.heap_kind() {
            DescriptorHeapKind::Sampler => self.ctx.gpu_sampler,
            _ => self.ctx.gpu_cbv_srv_uav,
        };

        let allocation = heap.allocate_in_frame(self.ctx.frame_index, views.len())?;

        if let Some(state) = state {
            let requests = views
                .iter()
                .flatten()
                .filter_map(|view| view.resource().map(|resource| (resource, state)))
                .collect::<SmallVec<[_; 8]>>();
            self.barriers(&requests);
        }

        let null = self.ctx.descriptors.null_descriptor(kind).index();
        let src = views.iter().map(|view| match view {
            Some(view) => {
                debug_assert_eq!(view.kind(), kind);
                view.descriptor().index()
            }
            None => null,
        });

        self.batch.push(
            kind.heap_kind(),
            DescriptorRange::new(allocation.offset, allocation.count),
            src,
        );

        self.ctx
            .list
            .raw
            .set_descriptor_table(T::ENGINE, root_index, heap.get_raw(), allocation.offset);

        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.flush_descriptors();
        self.ctx.list.raw.dispatch(x, y, z);
    }
}

impl<B: Backend, T: GraphicsCapable> WorkerThread<'_, B, T> {
    pub fn clear_render_target(&mut self, view: &ResourceView<B>, color: [f32; 4]) {
        assert_eq!(view.kind(), ViewKind::Rtv);

        if let Some(resource) = view.resource() {
            self.barrier(resource, ResourceStates::RenderTarget);
        }

        let heap = self.ctx.descriptors.heap(DescriptorHeapKind::Rtv);
        self.ctx
            .list
            .raw
            .clear_render_target(heap.get_raw(), view.descriptor().index(), color);
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.flush_descriptors();
        self.ctx
            .list
            .raw
            .draw(vertex_count, instance_count, start_vertex, start_instance);
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.flush_descriptors();
        self.ctx.list.raw.draw_indexed(
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        );
    }
}

impl<B: Backend, T: RayTracingCapable> WorkerThread<'_, B, T> {
    pub fn build_acceleration_structure(
        &mut self,
        dst: &GpuResource<B>,
        scratch: &GpuResource<B>,
        inputs: &GpuResource<B>,
    ) {
        self.barriers(&[
            (scratch, ResourceStates::UnorderedAccess),
            (inputs, ResourceStates::NonPixelShaderResource),
        ]);

        self.ctx.list.raw.build_acceleration_structure(
            dst.get_raw(),
            scratch.get_raw(),
            inputs.get_raw(),
        );
    }

    pub fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32) {
        self.flush_descriptors();
        self.ctx.list.raw.dispatch_rays(width, height, depth);
    }
}

#[cfg(test)]
#[allow(dead_code)]
mod tests {
    use crate::graphics::{
        backends::soft::{SoftBackend, SoftCommand, SoftDevice},
        bindings::SlotBinding,
        commands::{
            command_allocator::FrameAllocators, command_buffer::CommandBuffer, Compute, Copy,
            Graphics, RayTracing,
        },
        device::Device,
        scheduler::Tag,
        types::{DescriptorHeapKind, Engine, MemoryHeapType, ResourceStates, ViewKind},
    };

    use super::{RecordContext, WorkerThread};

    const fn is_send<T: Send>() {}

    const _: () = is_send::<WorkerThread<'static, SoftBackend, Graphics>>();
    const _: () = is_send::<WorkerThread<'static, SoftBackend, Compute>>();
    const _: () = is_send::<WorkerThread<'static, SoftBackend, Copy>>();
    const _: () = is_send::<WorkerThread<'static, SoftBackend, RayTracing>>();

    #[test]
    fn table_binding_applies_barriers_and_defers_copies() {
        let device = Device::<SoftBackend>::new("soft", SoftDevice::new());
        let descriptors = device.create_descriptor_allocator(4, 4, 32, 8).unwrap();
        let csu = device
            .create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 64, 8, 2)
            .unwrap();
        let sampler = device
            .create_gpu_descriptor_heap(DescriptorHeapKind::Sampler, 16, 0, 2)
            .unwrap();

        let texture = device
            .create_buffer(256, MemoryHeapType::Gpu, ResourceStates::Common)
            .unwrap();
        let srv = descriptors.push_srv(&texture).unwrap();

        let frame = FrameAllocators::inner_new(&device, Engine::Compute, 1).unwrap();
        let mut list = CommandBuffer::inner_new(&device, Engine::Compute, 0, &frame).unwrap();
        list.activate(frame.require(0), 1).unwrap();

        let tag = Tag::none();
        let mut worker = WorkerThread::<_, Compute>::inner_new(RecordContext {
            device: &device,
            descriptors: &descriptors,
            gpu_cbv_srv_uav: &csu,
            gpu_sampler: &sampler,
            list: &mut list,
            tag: &tag,
            thread_index: 0,
            frame_index: 1,
        });

        let views = [Some(srv.clone()), None, Some(srv.clone())];
        worker
            .bind(
                0,
                &SlotBinding::DescriptorRange {
                    kind: ViewKind::Srv,
                    views: &views,
                },
            )
            .unwrap();

        assert!(worker.pending_descriptors());
        assert_eq!(device.raw().stats().descriptor_copies, 0);

        worker.dispatch(8, 8, 1);
        assert!(!worker.pending_descriptors());
        drop(worker);

        let stats = device.raw().stats();
        assert_eq!(stats.barriers, 1);
        assert_eq!(stats.descriptor_copies, 1);
        assert_eq!(stats.descriptors_copied, 3);

        assert_eq!(
            texture.get_current_state(),
            ResourceStates::NonPixelShaderResource
        );
        assert_eq!(csu.used_in_frame(1), 3);

        // frame 1 region begins after persistent slots and frame 0 region
        let table_start = 8 + 28;
        assert!(list.raw.commands().iter().any(|command| matches!(
            command,
            SoftCommand::SetDescriptorTable { start, .. } if *start == table_start
        )));
    }

    #[test]
    fn copies_skip_barriers_on_cpu_visible_buffers() {
        let device = Device::<SoftBackend>::new("soft", SoftDevice::new());
        let descriptors = device.create_descriptor_allocator(4, 4, 8, 4).unwrap();
        let csu = device
            .create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 8, 0, 1)
            .unwrap();
        let sampler = device
            .create_gpu_descriptor_heap(DescriptorHeapKind::Sampler, 8, 0, 1)
            .unwrap();

        let upload = device
            .create_buffer(16, MemoryHeapType::Cpu, ResourceStates::GenericRead)
            .unwrap();
        let local = device
            .create_buffer(16, MemoryHeapType::Gpu, ResourceStates::Common)
            .unwrap();

        let frame = FrameAllocators::inner_new(&device, Engine::Copy, 1).unwrap();
        let mut list = CommandBuffer::inner_new(&device, Engine::Copy, 0, &frame).unwrap();
        list.activate(frame.require(0), 0).unwrap();

        let tag = Tag::none();
        let mut worker = WorkerThread::<_, Copy>::inner_new(RecordContext {
            device: &device,
            descriptors: &descriptors,
            gpu_cbv_srv_uav: &csu,
            gpu_sampler: &sampler,
            list: &mut list,
            tag: &tag,
            thread_index: 0,
            frame_index: 0,
        });

        worker.copy_resource(&local, &upload);
        worker.copy_buffer_region(&local, 0, &upload, 8, 8);

        assert_eq!(worker.engine(), Engine::Copy);
        assert_eq!(device.raw().stats().barriers, 1);
        assert_eq!(upload.get_current_state(), ResourceStates::GenericRead);
        assert_eq!(local.get_current_state(), ResourceStates::CopyDst);
    }
}
