//! Software device. Command lists are plain vectors of commands; every queue
//! owns a thread that plays the GPU timeline, running submitted batches in
//! order and advancing fences after them.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::graphics::{
    backend::{
        Backend, DescriptorRange, GpuCommandAllocator, GpuCommandList, GpuDevice, GpuFence,
        GpuQueue, Transition,
    },
    error::{Error, Result},
    types::{DescriptorHeapKind, Engine, MemoryHeapType, ResourceStates, ViewKind},
};

#[derive(Clone, Copy, Debug)]
pub struct SoftBackend;

impl Backend for SoftBackend {
    type Device = SoftDevice;
    type Queue = SoftQueue;
    type CommandAllocator = SoftCommandAllocator;
    type CommandList = SoftCommandList;
    type Fence = SoftFence;
    type Resource = SoftResource;
    type DescriptorHeap = SoftDescriptorHeap;
}

/// Counters of everything the device was asked to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub submissions: u64,
    pub command_lists: u64,
    pub barriers: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub copies: u64,
    pub descriptor_copies: u64,
    pub descriptors_copied: u64,
    pub rays: u64,
    pub allocator_resets: u64,
    pub fence_waits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submissions: AtomicU64,
    command_lists: AtomicU64,
    barriers: AtomicU64,
    draws: AtomicU64,
    dispatches: AtomicU64,
    copies: AtomicU64,
    descriptor_copies: AtomicU64,
    descriptors_copied: AtomicU64,
    rays: AtomicU64,
    allocator_resets: AtomicU64,
    fence_waits: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SoftStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        SoftStats {
            submissions: load(&self.submissions),
            command_lists: load(&self.command_lists),
            barriers: load(&self.barriers),
            draws: load(&self.draws),
            dispatches: load(&self.dispatches),
            copies: load(&self.copies),
            descriptor_copies: load(&self.descriptor_copies),
            descriptors_copied: load(&self.descriptors_copied),
            rays: load(&self.rays),
            allocator_resets: load(&self.allocator_resets),
            fence_waits: load(&self.fence_waits),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    latency: Duration,
    removed: AtomicBool,
    reset_failures: AtomicUsize,
    close_failures: AtomicUsize,
    counters: Counters,
}

impl Shared {
    fn check_removed(&self) -> Result<()> {
        if self.removed.load(Ordering::Acquire) {
            Err(Error::DeviceRemoved("soft device was removed".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug)]
pub struct SoftDevice {
    shared: Arc<Shared>,
    resource_ids: AtomicU64,
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDevice {
    pub fn new() -> Self {
        Self {
            shared: Arc::default(),
            resource_ids: AtomicU64::new(1),
        }
    }

    /// Every submitted batch takes at least `latency` on its queue.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                latency,
                ..Default::default()
            }),
            resource_ids: self.resource_ids,
        }
    }

    /// Simulates device removal. Later submissions and waits fail.
    pub fn remove(&self) {
        warn!("soft device removed");
        self.shared.removed.store(true, Ordering::Release);
    }

    /// The next `count` command list resets fail with a device error.
    pub fn fail_list_resets(&self, count: usize) {
        self.shared.reset_failures.store(count, Ordering::Release);
    }

    /// The next `count` command list closes fail with a device error.
    pub fn fail_list_closes(&self, count: usize) {
        self.shared.close_failures.store(count, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.shared.removed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SoftStats {
        self.shared.counters.snapshot()
    }
}

impl GpuDevice<SoftBackend> for SoftDevice {
    fn create_command_queue(&self, engine: Engine) -> Result<SoftQueue> {
        SoftQueue::new(engine, Arc::clone(&self.shared))
    }

    fn create_command_allocator(&self, engine: Engine) -> Result<SoftCommandAllocator> {
        Ok(SoftCommandAllocator {
            engine,
            shared: Arc::clone(&self.shared),
        })
    }

    fn create_command_list(
        &self,
        engine: Engine,
        allocator: &SoftCommandAllocator,
    ) -> Result<SoftCommandList> {
        debug_assert_eq!(allocator.engine, engine);

        Ok(SoftCommandList {
            engine,
            commands: vec![],
            closed: true,
            shared: Arc::clone(&self.shared),
        })
    }

    fn create_fence(&self) -> Result<SoftFence> {
        Ok(SoftFence::default())
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: usize,
        shader_visible: bool,
    ) -> Result<SoftDescriptorHeap> {
        if shader_visible && matches!(kind, DescriptorHeapKind::Rtv | DescriptorHeapKind::Dsv) {
            return Err(Error::Device(format!(
                "{kind:?} heaps cannot be shader visible"
            )));
        }

        Ok(SoftDescriptorHeap {
            kind,
            capacity,
            shader_visible,
            slots: Mutex::default(),
        })
    }

    fn create_buffer(
        &self,
        size: usize,
        heap: MemoryHeapType,
        _state: ResourceStates,
    ) -> Result<SoftResource> {
        Ok(SoftResource(Arc::new(SoftResourceInner {
            id: self.resource_ids.fetch_add(1, Ordering::Relaxed),
            heap,
            data: Mutex::new(vec![0; size]),
        })))
    }

    fn write_view(
        &self,
        heap: &SoftDescriptorHeap,
        index: usize,
        kind: ViewKind,
        resource: Option<&SoftResource>,
    ) -> Result<()> {
        if index >= heap.capacity {
            return Err(Error::Device(format!(
                "descriptor {index} is outside a heap of {}",
                heap.capacity
            )));
        }

        heap.slots.lock().insert(
            index,
            SoftDescriptor {
                view: kind,
                resource: resource.map(|resource| resource.id()),
            },
        );

        Ok(())
    }

    fn copy_descriptors(
        &self,
        kind: DescriptorHeapKind,
        dst: &SoftDescriptorHeap,
        dst_ranges: &[DescriptorRange],
        src: &SoftDescriptorHeap,
        src_slots: &[usize],
    ) {
        debug_assert_eq!(dst.kind, kind);
        debug_assert_eq!(src.kind, kind);
        debug_assert!(!src.shader_visible);
        debug_assert_eq!(
            dst_ranges.iter().map(|range| range.count).sum::<usize>(),
            src_slots.len()
        );

        let copied = {
            let source = src.slots.lock();
            dst_ranges
                .iter()
                .flat_map(|range| range.start..range.end())
                .zip(src_slots)
                .map(|(dst_index, src_index)| (dst_index, source.get(src_index).copied()))
                .collect::<Vec<_>>()
        };

        let mut target = dst.slots.lock();
        for (index, descriptor) in copied {
            debug_assert!(index < dst.capacity);

            match descriptor {
                Some(descriptor) => target.insert(index, descriptor),
                None => target.remove(&index),
            };
        }

        Counters::add(&self.shared.counters.descriptor_copies, 1);
        Counters::add(
            &self.shared.counters.descriptors_copied,
            src_slots.len() as u64,
        );
    }

    fn write_buffer(&self, resource: &SoftResource, offset: usize, data: &[u8]) -> Result<()> {
        let mut bytes = resource.0.data.lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);

        Ok(())
    }

    fn read_buffer(&self, resource: &SoftResource, offset: usize, dst: &mut [u8]) -> Result<()> {
        let bytes = resource.0.data.lock();
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);

        Ok(())
    }

    fn wait_for_fences(&self, waits: &[(&SoftFence, u64)]) -> Result<()> {
        self.shared.check_removed()?;
        Counters::add(&self.shared.counters.fence_waits, 1);

        for (fence, value) in waits {
            fence.wait(*value);
        }

        Ok(())
    }
}

#[derive(Debug)]
enum Job {
    Execute(Vec<Vec<SoftCommand>>),
    Signal(SoftFence, u64),
}

#[derive(Debug)]
pub struct SoftQueue {
    engine: Engine,
    shared: Arc<Shared>,
    sender: Option<Sender<Job>>,
    timeline: Option<JoinHandle<()>>,
}

impl SoftQueue {
    fn new(engine: Engine, shared: Arc<Shared>) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let latency = shared.latency;

        let timeline = thread::Builder::new()
            .name(format!("soft-gpu-{engine:?}").to_lowercase())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    match job {
                        Job::Execute(batch) => {
                            if !latency.is_zero() {
                                thread::sleep(latency);
                            }

                            for commands in batch {
                                commands.iter().for_each(SoftCommand::execute);
                            }
                        }
                        Job::Signal(fence, value) => fence.set(value),
                    }
                }
            })?;

        Ok(Self {
            engine,
            shared,
            sender: Some(sender),
            timeline: Some(timeline),
        })
    }

    fn send(&self, job: Job) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or(Error::QueueClosed)?
            .send(job)
            .map_err(|_| Error::DeviceRemoved(format!("{:?} timeline stopped", self.engine)))
    }
}

impl GpuQueue<SoftBackend> for SoftQueue {
    fn execute(&self, lists: &[&SoftCommandList]) -> Result<()> {
        self.shared.check_removed()?;

        let batch = lists
            .iter()
            .map(|list| {
                debug_assert!(list.closed, "submitted a command list that is still recording");
                debug_assert_eq!(list.engine, self.engine);
                list.commands.clone()
            })
            .collect::<Vec<_>>();

        Counters::add(&self.shared.counters.submissions, 1);
        Counters::add(&self.shared.counters.command_lists, lists.len() as u64);

        trace!(engine = ?self.engine, lists = lists.len(), "soft submit");

        self.send(Job::Execute(batch))
    }

    fn signal(&self, fence: &SoftFence, value: u64) -> Result<()> {
        self.shared.check_removed()?;
        self.send(Job::Signal(fence.clone(), value))
    }
}

impl Drop for SoftQueue {
    fn drop(&mut self) {
        self.sender.take();

        if let Some(timeline) = self.timeline.take() {
            let _ = timeline.join();
        }
    }
}

#[derive(Debug)]
pub struct SoftCommandAllocator {
    engine: Engine,
    shared: Arc<Shared>,
}

impl GpuCommandAllocator for SoftCommandAllocator {
    fn reset(&self) -> Result<()> {
        Counters::add(&self.shared.counters.allocator_resets, 1);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FenceState {
    value: Mutex<u64>,
    reached: Condvar,
}

#[derive(Clone, Debug, Default)]
pub struct SoftFence(Arc<FenceState>);

impl SoftFence {
    fn set(&self, value: u64) {
        let mut current = self.0.value.lock();
        *current = (*current).max(value);
        self.0.reached.notify_all();
    }

    fn wait(&self, value: u64) {
        let mut current = self.0.value.lock();
        while *current < value {
            self.0.reached.wait(&mut current);
        }
    }
}

impl GpuFence for SoftFence {
    fn completed_value(&self) -> u64 {
        *self.0.value.lock()
    }
}

#[derive(Debug)]
struct SoftResourceInner {
    id: u64,
    heap: MemoryHeapType,
    data: Mutex<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct SoftResource(Arc<SoftResourceInner>);

impl SoftResource {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn heap(&self) -> MemoryHeapType {
        self.0.heap
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoftDescriptor {
    pub view: ViewKind,
    pub resource: Option<u64>,
}

/// Descriptor slots are materialized on first write.
#[derive(Debug)]
pub struct SoftDescriptorHeap {
    kind: DescriptorHeapKind,
    capacity: usize,
    shader_visible: bool,
    slots: Mutex<HashMap<usize, SoftDescriptor>>,
}

impl SoftDescriptorHeap {
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn view_at(&self, index: usize) -> Option<SoftDescriptor> {
        self.slots.lock().get(&index).copied()
    }
}

#[derive(Clone, Debug)]
pub enum SoftCommand {
    Barrier {
        resource: u64,
        before: ResourceStates,
        after: ResourceStates,
    },
    CopyResource {
        dst: SoftResource,
        src: SoftResource,
    },
    CopyBufferRegion {
        dst: SoftResource,
        dst_offset: usize,
        src: SoftResource,
        src_offset: usize,
        size: usize,
    },
    SetDescriptorHeaps,
    SetDescriptorTable {
        engine: Engine,
        root_index: u32,
        start: usize,
    },
    SetConstantBuffer {
        engine: Engine,
        root_index: u32,
        resource: u64,
    },
    SetAccelerationStructure {
        root_index: u32,
        resource: u64,
    },
    ClearRenderTarget {
        index: usize,
        color: [f32; 4],
    },
    Draw {
        vertices: u32,
        instances: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BuildAccelerationStructure {
        dst: u64,
    },
    DispatchRays {
        width: u32,
        height: u32,
        depth: u32,
    },
}

impl SoftCommand {
    fn execute(&self) {
        match self {
            SoftCommand::CopyResource { dst, src } => {
                let len = src.0.data.lock().len();
                copy_bytes(dst, 0, src, 0, len);
            }
            SoftCommand::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => copy_bytes(dst, *dst_offset, src, *src_offset, *size),
            _ => {}
        }
    }
}

fn copy_bytes(dst: &SoftResource, dst_offset: usize, src: &SoftResource, src_offset: usize, size: usize) {
    if Arc::ptr_eq(&dst.0, &src.0) {
        let mut bytes = dst.0.data.lock();
        bytes.copy_within(src_offset..src_offset + size, dst_offset);
        return;
    }

    let from = src.0.data.lock();
    let mut to = dst.0.data.lock();
    to[dst_offset..dst_offset + size].copy_from_slice(&from[src_offset..src_offset + size]);
}

#[derive(Debug)]
pub struct SoftCommandList {
    engine: Engine,
    commands: Vec<SoftCommand>,
    closed: bool,
    shared: Arc<Shared>,
}

impl SoftCommandList {
    pub fn commands(&self) -> &[SoftCommand] {
        &self.commands
    }

    fn push(&mut self, command: SoftCommand) {
        debug_assert!(!self.closed, "recording into a closed command list");
        self.commands.push(command);
    }
}

impl GpuCommandList<SoftBackend> for SoftCommandList {
    fn reset(&mut self, allocator: &SoftCommandAllocator) -> Result<()> {
        debug_assert!(self.closed, "reset of a command list that is still recording");
        debug_assert_eq!(allocator.engine, self.engine);

        if Shared::take_failure(&self.shared.reset_failures) {
            return Err(Error::Device("command list reset failed".to_string()));
        }

        self.commands.clear();
        self.closed = false;

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;

        if Shared::take_failure(&self.shared.close_failures) {
            return Err(Error::Device("command list close failed".to_string()));
        }

        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[Transition<'_, SoftBackend>]) {
        Counters::add(&self.shared.counters.barriers, barriers.len() as u64);

        for barrier in barriers {
            self.push(SoftCommand::Barrier {
                resource: barrier.resource.id(),
                before: barrier.before,
                after: barrier.after,
            });
        }
    }

    fn copy_resource(&mut self, dst: &SoftResource, src: &SoftResource) {
        Counters::add(&self.shared.counters.copies, 1);
        self.push(SoftCommand::CopyResource {
            dst: dst.clone(),
            src: src.clone(),
        });
    }

    fn copy_buffer_region(
        &mut self,
        dst: &SoftResource,
        dst_offset: usize,
        src: &SoftResource,
        src_offset: usize,
        size: usize,
    ) {
        Counters::add(&self.shared.counters.copies, 1);
        self.push(SoftCommand::CopyBufferRegion {
            dst: dst.clone(),
            dst_offset,
            src: src.clone(),
            src_offset,
            size,
        });
    }

    fn set_descriptor_heaps(&mut self, csu: &SoftDescriptorHeap, sampler: &SoftDescriptorHeap) {
        debug_assert!(csu.shader_visible && sampler.shader_visible);
        self.push(SoftCommand::SetDescriptorHeaps);
    }

    fn set_descriptor_table(
        &mut self,
        engine: Engine,
        root_index: u32,
        heap: &SoftDescriptorHeap,
        start: usize,
    ) {
        debug_assert!(heap.shader_visible);
        self.push(SoftCommand::SetDescriptorTable {
            engine,
            root_index,
            start,
        });
    }

    fn set_constant_buffer(&mut self, engine: Engine, root_index: u32, resource: &SoftResource) {
        self.push(SoftCommand::SetConstantBuffer {
            engine,
            root_index,
            resource: resource.id(),
        });
    }

    fn set_acceleration_structure(&mut self, root_index: u32, resource: &SoftResource) {
        self.push(SoftCommand::SetAccelerationStructure {
            root_index,
            resource: resource.id(),
        });
    }

    fn clear_render_target(&mut self, heap: &SoftDescriptorHeap, index: usize, color: [f32; 4]) {
        debug_assert_eq!(heap.kind, DescriptorHeapKind::Rtv);
        self.push(SoftCommand::ClearRenderTarget { index, color });
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        _start_vertex: u32,
        _start_instance: u32,
    ) {
        Counters::add(&self.shared.counters.draws, 1);
        self.push(SoftCommand::Draw {
            vertices: vertex_count,
            instances: instance_count,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        _start_index: u32,
        _base_vertex: i32,
        _start_instance: u32,
    ) {
        Counters::add(&self.shared.counters.draws, 1);
        self.push(SoftCommand::Draw {
            vertices: index_count,
            instances: instance_count,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        Counters::add(&self.shared.counters.dispatches, 1);
        self.push(SoftCommand::Dispatch { x, y, z });
    }

    fn build_acceleration_structure(
        &mut self,
        dst: &SoftResource,
        _scratch: &SoftResource,
        _inputs: &SoftResource,
    ) {
        self.push(SoftCommand::BuildAccelerationStructure { dst: dst.id() });
    }

    fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32) {
        Counters::add(&self.shared.counters.rays, 1);
        self.push(SoftCommand::DispatchRays {
            width,
            height,
            depth,
        });
    }
}
