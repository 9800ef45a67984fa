//! Raw device interface the scheduler records and submits through.
//!
//! Every object the scheduler touches is an associated type of [`Backend`], so the
//! same frame pacing and recording code drives a D3D12 device or the software
//! device used for headless runs and tests.

use std::fmt::Debug;

use smallvec::SmallVec;

use super::{
    error::Result,
    types::{DescriptorHeapKind, Engine, MemoryHeapType, ResourceStates, ViewKind},
};

pub trait Backend: Sized + Send + Sync + Debug + 'static {
    type Device: GpuDevice<Self>;
    type Queue: GpuQueue<Self>;
    type CommandAllocator: GpuCommandAllocator;
    type CommandList: GpuCommandList<Self>;
    type Fence: GpuFence;
    type Resource: Clone + Send + Sync + Debug;
    type DescriptorHeap: Send + Sync + Debug;
}

/// One transition barrier.
#[derive(Debug)]
pub struct Transition<'a, B: Backend> {
    pub resource: &'a B::Resource,
    pub before: ResourceStates,
    pub after: ResourceStates,
}

/// Contiguous slots in a descriptor heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub start: usize,
    pub count: usize,
}

impl DescriptorRange {
    pub fn new(start: usize, count: usize) -> Self {
        Self { start, count }
    }

    pub fn end(&self) -> usize {
        self.start + self.count
    }
}

/// One contiguous descriptor copy: `count` slots from `src` to `dst`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyRun {
    pub dst: usize,
    pub src: usize,
    pub count: usize,
}

/// Folds per-slot copies into the fewest runs where both sides are contiguous.
pub fn copy_runs(dst_ranges: &[DescriptorRange], src_slots: &[usize]) -> SmallVec<[CopyRun; 8]> {
    let dst_slots = dst_ranges.iter().flat_map(|range| range.start..range.end());

    let mut runs = SmallVec::<[CopyRun; 8]>::new();
    for (dst, &src) in dst_slots.zip(src_slots) {
        match runs.last_mut() {
            Some(run) if run.dst + run.count == dst && run.src + run.count == src => run.count += 1,
            _ => runs.push(CopyRun { dst, src, count: 1 }),
        }
    }

    runs
}

pub trait GpuDevice<B: Backend>: Send + Sync + Debug {
    fn create_command_queue(&self, engine: Engine) -> Result<B::Queue>;

    fn create_command_allocator(&self, engine: Engine) -> Result<B::CommandAllocator>;

    /// The returned list is closed.
    fn create_command_list(
        &self,
        engine: Engine,
        allocator: &B::CommandAllocator,
    ) -> Result<B::CommandList>;

    fn create_fence(&self) -> Result<B::Fence>;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: usize,
        shader_visible: bool,
    ) -> Result<B::DescriptorHeap>;

    fn create_buffer(
        &self,
        size: usize,
        heap: MemoryHeapType,
        state: ResourceStates,
    ) -> Result<B::Resource>;

    /// Writes a view of `resource` (or a null view) into slot `index` of a CPU heap.
    fn write_view(
        &self,
        heap: &B::DescriptorHeap,
        index: usize,
        kind: ViewKind,
        resource: Option<&B::Resource>,
    ) -> Result<()>;

    /// Copies single source slots into destination ranges in one call.
    ///
    /// `src` holds one slot index per destination slot, in range order.
    fn copy_descriptors(
        &self,
        kind: DescriptorHeapKind,
        dst: &B::DescriptorHeap,
        dst_ranges: &[DescriptorRange],
        src: &B::DescriptorHeap,
        src_slots: &[usize],
    );

    fn write_buffer(&self, resource: &B::Resource, offset: usize, data: &[u8]) -> Result<()>;

    fn read_buffer(&self, resource: &B::Resource, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Blocks until every fence reached its value.
    fn wait_for_fences(&self, waits: &[(&B::Fence, u64)]) -> Result<()>;
}

pub trait GpuQueue<B: Backend>: Send + Sync + Debug {
    fn execute(&self, lists: &[&B::CommandList]) -> Result<()>;

    fn signal(&self, fence: &B::Fence, value: u64) -> Result<()>;
}

pub trait GpuCommandAllocator: Send + Sync + Debug {
    fn reset(&self) -> Result<()>;
}

pub trait GpuFence: Send + Sync + Debug {
    fn completed_value(&self) -> u64;
}

pub trait GpuCommandList<B: Backend>: Send + Debug {
    fn reset(&mut self, allocator: &B::CommandAllocator) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn resource_barrier(&mut self, barriers: &[Transition<'_, B>]);

    fn copy_resource(&mut self, dst: &B::Resource, src: &B::Resource);

    fn copy_buffer_region(
        &mut self,
        dst: &B::Resource,
        dst_offset: usize,
        src: &B::Resource,
        src_offset: usize,
        size: usize,
    );

    fn set_descriptor_heaps(&mut self, csu: &B::DescriptorHeap, sampler: &B::DescriptorHeap);

    fn set_descriptor_table(
        &mut self,
        engine: Engine,
        root_index: u32,
        heap: &B::DescriptorHeap,
        start: usize,
    );

    fn set_constant_buffer(&mut self, engine: Engine, root_index: u32, resource: &B::Resource);

    fn set_acceleration_structure(&mut self, root_index: u32, resource: &B::Resource);

    fn clear_render_target(&mut self, heap: &B::DescriptorHeap, index: usize, color: [f32; 4]);

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    );

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );

    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    fn build_acceleration_structure(
        &mut self,
        dst: &B::Resource,
        scratch: &B::Resource,
        inputs: &B::Resource,
    );

    fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32);
}
