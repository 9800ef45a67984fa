mod desc;
mod process;
mod work_queue;

pub use desc::*;
pub use process::{process_fn, FnProcess, GpuProcess, Tag};

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use process::WorkItem;
use work_queue::{CountEvent, WorkQueue};

use super::{
    backend::{Backend, DescriptorRange, GpuCommandList, GpuDevice},
    commands::{
        CommandBuffer, CommandBufferState, CommandQueue, FrameAllocators, RecordContext,
        WorkerThread, WorkerType,
    },
    descriptor_heap::{DescriptorAllocator, ResourceView},
    device::Device,
    error::{Error, Result},
    frame_descriptor_heap::{AllocationLifetime, DescriptorAllocation, GpuDescriptorHeap},
    signal::{Rally, Signal},
    types::{DescriptorHeapKind, Engine, EngineMask, ViewKind},
};

/// Queue, per-thread command buffers and per-frame allocators of one engine.
#[derive(Debug)]
struct EngineState<B: Backend> {
    engine: Engine,
    queue: CommandQueue<B>,
    lists: Vec<Mutex<CommandBuffer<B>>>,
    frames: Vec<FrameAllocators<B>>,
}

impl<B: Backend> EngineState<B> {
    fn inner_new(device: &Device<B>, engine: Engine, desc: &SchedulerDesc) -> Result<Self> {
        let queue = device.create_command_queue(engine)?;

        let frames = (0..desc.buffer_count)
            .map(|_| FrameAllocators::inner_new(device, engine, desc.thread_count))
            .collect::<Result<Vec<_>>>()?;

        let lists = (0..desc.thread_count)
            .map(|thread| CommandBuffer::inner_new(device, engine, thread, &frames[0]).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            engine,
            queue,
            lists,
            frames,
        })
    }
}

#[derive(Debug)]
struct SchedulerInner<B: Backend> {
    device: Device<B>,
    desc: SchedulerDesc,

    engines: SmallVec<[EngineState<B>; Engine::COUNT]>,
    rally: Arc<Rally<B>>,

    descriptors: DescriptorAllocator<B>,
    gpu_cbv_srv_uav: GpuDescriptorHeap<B>,
    gpu_sampler: GpuDescriptorHeap<B>,

    frame: AtomicUsize,
    frame_signals: Mutex<Vec<Signal<B>>>,

    queue: WorkQueue<WorkItem<B>>,
    pending: CountEvent,
    failure: Mutex<Option<Error>>,
    closed: AtomicBool,
}

impl<B: Backend> SchedulerInner<B> {
    fn record(&self, item: &WorkItem<B>, thread: usize) -> Result<()> {
        let engine = item.engine();
        let state = &self.engines[engine.index()];
        let frame = self.frame.load(Ordering::Acquire);

        let mut list = state.lists[thread].lock();
        let opened = list.activate(state.frames[frame].require(thread), frame)?;

        if opened && engine != Engine::Copy {
            list.raw.set_descriptor_heaps(
                self.gpu_cbv_srv_uav.get_raw(),
                self.gpu_sampler.get_raw(),
            );
        }

        item.record(RecordContext {
            device: &self.device,
            descriptors: &self.descriptors,
            gpu_cbv_srv_uav: &self.gpu_cbv_srv_uav,
            gpu_sampler: &self.gpu_sampler,
            list: &mut *list,
            tag: &item.tag,
            thread_index: thread,
            frame_index: frame,
        });

        Ok(())
    }

    fn record_on_worker(&self, item: WorkItem<B>, thread: usize) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.record(&item, thread)));

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.fail(err),
            Err(_) => error!(thread, engine = ?item.engine(), "recording callback panicked"),
        }

        self.pending.signal();
    }

    fn fail(&self, err: Error) {
        error!(%err, "recording failed");

        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn worker_loop(&self, thread: usize) {
        debug!(thread, "worker started");

        while let Some(item) = self.queue.pop() {
            trace!(thread, ?item, "recording");
            self.record_on_worker(item, thread);
        }

        debug!(thread, "worker stopped");
    }

    fn flush_and_signal(&self, mask: EngineMask) -> Result<Signal<B>> {
        self.pending.wait();

        // recorded work is submitted even when a sibling item failed
        let mut failure = self.failure.lock().take();
        let mut rally_points = [0; Engine::COUNT];

        for state in self
            .engines
            .iter()
            .filter(|state| mask.contains(state.engine.mask()))
        {
            let mut lists = state
                .lists
                .iter()
                .map(|list| list.lock())
                .collect::<SmallVec<[_; 8]>>();

            let mut closed = SmallVec::<[usize; 8]>::new();
            for (thread, list) in lists.iter_mut().enumerate() {
                match list.close() {
                    Ok(true) => closed.push(thread),
                    Ok(false) => {}
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }

            if closed.is_empty() {
                continue;
            }

            let raw = closed
                .iter()
                .map(|&thread| &lists[thread].raw)
                .collect::<SmallVec<[_; 8]>>();

            match state.queue.execute(&raw) {
                Ok(value) => rally_points[state.engine.index()] = value,
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        debug!(?mask, rally = ?rally_points, "flushed");

        match failure {
            Some(err) => Err(err),
            None => Ok(Signal::new(Arc::clone(&self.rally), rally_points)),
        }
    }

    /// Last value submitted to every queue.
    fn retire_signal(&self) -> Signal<B> {
        let rally_points =
            std::array::from_fn(|index| self.engines[index].queue.last_value());

        Signal::new(Arc::clone(&self.rally), rally_points)
    }

    fn gpu_heap(&self, kind: DescriptorHeapKind) -> &GpuDescriptorHeap<B> {
        match kind {
            DescriptorHeapKind::CbvSrvUav => &self.gpu_cbv_srv_uav,
            DescriptorHeapKind::Sampler => &self.gpu_sampler,
            DescriptorHeapKind::Rtv | DescriptorHeapKind::Dsv => {
                panic!("GpuScheduler: {kind:?} heaps are never shader visible")
            }
        }
    }
}

/// Records processes on a pool of threads and submits them per engine,
/// pacing frames with fence signals.
///
/// Thread slot 0 belongs to whoever calls [`GpuScheduler::enqueue`]; slots
/// `1..thread_count` are workers fed by [`GpuScheduler::enqueue_async`].
#[derive(Debug)]
pub struct GpuScheduler<B: Backend> {
    inner: Arc<SchedulerInner<B>>,
    workers: Vec<JoinHandle<()>>,
}

impl<B: Backend> GpuScheduler<B> {
    pub fn new(device: Device<B>, desc: SchedulerDesc) -> Result<Self> {
        desc.validate()?;

        let engines = Engine::ALL
            .iter()
            .map(|&engine| EngineState::inner_new(&device, engine, &desc))
            .collect::<Result<SmallVec<[_; Engine::COUNT]>>>()?;

        let rally = Arc::new(Rally {
            device: device.clone(),
            queues: engines.iter().map(|state| state.queue.clone()).collect(),
        });

        let descriptors = device.create_descriptor_allocator(
            desc.cpu_heaps.rtv,
            desc.cpu_heaps.dsv,
            desc.cpu_heaps.cbv_srv_uav,
            desc.cpu_heaps.sampler,
        )?;

        let gpu_cbv_srv_uav = device.create_gpu_descriptor_heap(
            DescriptorHeapKind::CbvSrvUav,
            desc.gpu_cbv_srv_uav.capacity,
            desc.gpu_cbv_srv_uav.persistent,
            desc.buffer_count,
        )?;
        let gpu_sampler = device.create_gpu_descriptor_heap(
            DescriptorHeapKind::Sampler,
            desc.gpu_sampler.capacity,
            desc.gpu_sampler.persistent,
            desc.buffer_count,
        )?;

        info!(
            device = device.name(),
            buffers = desc.buffer_count,
            threads = desc.thread_count,
            frame_buffering = desc.frame_buffering,
            "scheduler created"
        );

        let inner = Arc::new(SchedulerInner {
            frame_signals: Mutex::new(vec![Signal::default(); desc.buffer_count]),
            device,
            desc,
            engines,
            rally,
            descriptors,
            gpu_cbv_srv_uav,
            gpu_sampler,
            frame: AtomicUsize::new(0),
            queue: WorkQueue::new(),
            pending: CountEvent::default(),
            failure: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(inner.desc.thread_count.saturating_sub(1));
        for thread in 1..inner.desc.thread_count {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("gpu-worker-{thread}"))
                .spawn(move || worker_inner.worker_loop(thread));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    inner.queue.close();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(Self { inner, workers })
    }

    pub fn device(&self) -> &Device<B> {
        &self.inner.device
    }

    pub fn desc(&self) -> &SchedulerDesc {
        &self.inner.desc
    }

    pub fn descriptors(&self) -> &DescriptorAllocator<B> {
        &self.inner.descriptors
    }

    pub fn frame_index(&self) -> usize {
        self.inner.frame.load(Ordering::Acquire)
    }

    pub fn queue(&self, engine: Engine) -> &CommandQueue<B> {
        &self.inner.engines[engine.index()].queue
    }

    /// Records `process` right away on the calling thread. Items enqueued this
    /// way keep their order.
    pub fn enqueue<P: GpuProcess<B>>(&self, process: P, tag: Tag) {
        if self.rejected_after_shutdown() {
            return;
        }

        let item = WorkItem::new(process, tag);
        if let Err(err) = self.inner.record(&item, 0) {
            self.inner.fail(err);
        }
    }

    /// Hands `process` to the first idle worker. Order among async items is
    /// unspecified; all of them are recorded before the next flush returns.
    pub fn enqueue_async<P: GpuProcess<B>>(&self, process: P, tag: Tag) {
        if self.rejected_after_shutdown() {
            return;
        }

        let item = WorkItem::new(process, tag);

        if self.workers.is_empty() {
            if let Err(err) = self.inner.record(&item, 0) {
                self.inner.fail(err);
            }
            return;
        }

        self.inner.pending.increment();
        if let Err(err) = self.inner.queue.push(item) {
            self.inner.pending.signal();
            warn!(%err, "dropping async work item");
        }
    }

    pub fn enqueue_fn<T, F>(&self, f: F, tag: Tag)
    where
        T: WorkerType,
        F: Fn(&mut WorkerThread<'_, B, T>) + Send + 'static,
    {
        self.enqueue(process_fn::<B, T, F>(f), tag)
    }

    pub fn enqueue_async_fn<T, F>(&self, f: F, tag: Tag)
    where
        T: WorkerType,
        F: Fn(&mut WorkerThread<'_, B, T>) + Send + 'static,
    {
        self.enqueue_async(process_fn::<B, T, F>(f), tag)
    }

    /// Waits for pending async items, then closes and submits the open command
    /// buffers of every engine in `mask`. Engines with nothing recorded get a
    /// zero rally point.
    pub fn flush_and_signal(&self, mask: EngineMask) -> Result<Signal<B>> {
        self.inner.flush_and_signal(mask)
    }

    /// Makes `frame` current. With frame buffering the slot's previous frame
    /// is waited for first. The slot's allocators and descriptor ring are then
    /// recycled.
    pub fn setup_frame(&self, frame: usize) -> Result<()> {
        let buffers = self.inner.desc.buffer_count;
        if frame >= buffers {
            return Err(Error::FrameOutOfRange { frame, buffers });
        }

        if self.inner.desc.frame_buffering {
            let retired = self.inner.frame_signals.lock()[frame].clone();
            retired.wait_for()?;
        }

        for state in &self.inner.engines {
            debug_assert!(
                state
                    .lists
                    .iter()
                    .all(|list| list.lock().state() == CommandBufferState::Closed),
                "frame set up while {:?} command buffers are still recording",
                state.engine
            );

            trace!(
                frame,
                engine = ?state.engine,
                allocators = state.frames[frame].used(),
                "recycling allocators"
            );
            state.frames[frame].reset_used()?;
        }

        self.inner.gpu_cbv_srv_uav.reset_frame(frame)?;
        self.inner.gpu_sampler.reset_frame(frame)?;

        self.inner.frame.store(frame, Ordering::Release);
        trace!(frame, "frame set up");

        Ok(())
    }

    /// Flushes every engine and retires the current frame slot. Without frame
    /// buffering this blocks until the GPU finished the frame.
    pub fn finish_frame(&self) -> Result<Signal<B>> {
        let signal = self.inner.flush_and_signal(EngineMask::All)?;

        // covers mid-frame flushes too
        let retired = self.inner.retire_signal();
        let frame = self.frame_index();
        self.inner.frame_signals.lock()[frame] = retired.clone();

        if !self.inner.desc.frame_buffering {
            retired.wait_for()?;
        }

        debug!(frame, rally = ?retired.rally_points(), "frame finished");

        Ok(signal)
    }

    /// Finishes the current frame and sets up `next`, as done around a
    /// swap chain present.
    pub fn present_cycle(&self, next: usize) -> Result<Signal<B>> {
        let signal = self.finish_frame()?;
        self.setup_frame(next)?;

        Ok(signal)
    }

    pub fn allocate_persistent(
        &self,
        kind: DescriptorHeapKind,
        count: usize,
    ) -> Result<DescriptorAllocation> {
        self.inner.gpu_heap(kind).allocate_persistent(count)
    }

    /// Copies `views` into a persistent table right away. Missing views become
    /// null descriptors of `kind`.
    pub fn write_persistent(
        &self,
        allocation: &DescriptorAllocation,
        kind: ViewKind,
        views: &[Option<ResourceView<B>>],
    ) {
        assert_eq!(allocation.lifetime, AllocationLifetime::Persistent);
        assert_eq!(allocation.kind, kind.heap_kind());
        assert!(views.len() <= allocation.count);

        let null = self.inner.descriptors.null_descriptor(kind).index();
        let src = views
            .iter()
            .map(|view| view.as_ref().map_or(null, |view| view.descriptor().index()))
            .collect::<SmallVec<[_; 16]>>();

        let gpu = self.inner.gpu_heap(allocation.kind);
        let cpu = self.inner.descriptors.heap(allocation.kind);

        self.inner.device.raw.copy_descriptors(
            allocation.kind,
            gpu.get_raw(),
            &[DescriptorRange::new(allocation.offset, src.len())],
            cpu.get_raw(),
            &src,
        );
    }

    /// Drains the work queue, joins the workers, submits what they recorded
    /// and waits for the GPU to go idle.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.queue.close();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }

        let flushed = self.inner.flush_and_signal(EngineMask::All);
        let idle = self.inner.retire_signal().wait_for();

        info!("scheduler shut down");

        flushed.and(idle)
    }

    fn rejected_after_shutdown(&self) -> bool {
        let closed = self.inner.closed.load(Ordering::Acquire);
        debug_assert!(!closed, "work enqueued after shutdown");

        if closed {
            warn!("work enqueued after shutdown is ignored");
        }

        closed
    }
}

impl<B: Backend> Drop for GpuScheduler<B> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(%err, "scheduler shutdown failed");
        }
    }
}

#[cfg(test)]
#[allow(dead_code)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use parking_lot::Mutex;
    use rand::Rng;

    use crate::graphics::{
        backends::soft::{SoftBackend, SoftCommand, SoftDevice},
        bindings::SlotBinding,
        commands::{Compute, Copy, Graphics, RayTracing},
        device::Device,
        error::Error,
        types::{DescriptorHeapKind, Engine, EngineMask, MemoryHeapType, ResourceStates, ViewKind},
    };

    use super::{CommandBufferState, GpuScheduler, SchedulerDesc, Tag};

    const fn is_send_sync<T: Send + Sync>() {}

    const _: () = is_send_sync::<GpuScheduler<SoftBackend>>();

    fn small(desc: SchedulerDesc) -> SchedulerDesc {
        desc.with_gpu_cbv_srv_uav_heap(4096, 64)
            .with_gpu_sampler_heap(256, 16)
            .with_cpu_heaps(64, 64, 1024, 64)
    }

    fn scheduler(desc: SchedulerDesc) -> GpuScheduler<SoftBackend> {
        GpuScheduler::new(Device::new("soft", SoftDevice::new()), small(desc)).unwrap()
    }

    fn slow_scheduler(desc: SchedulerDesc, latency: Duration) -> GpuScheduler<SoftBackend> {
        let device = Device::new("soft", SoftDevice::new().with_latency(latency));
        GpuScheduler::new(device, small(desc)).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let device = Device::<SoftBackend>::new("soft", SoftDevice::new());

        assert!(matches!(
            GpuScheduler::new(device.clone(), small(SchedulerDesc::default().with_thread_count(0))),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            GpuScheduler::new(device, small(SchedulerDesc::default().with_buffer_count(0))),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn signal_covers_exactly_the_engines_with_work() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(4));
        scheduler.setup_frame(0).unwrap();

        scheduler.enqueue_fn::<Copy, _>(|ctx| assert_eq!(ctx.thread_index(), 0), Tag::none());
        scheduler.enqueue_async_fn::<Graphics, _>(
            |ctx| {
                assert_ne!(ctx.thread_index(), 0);
                ctx.draw(3, 1, 0, 0);
            },
            Tag::none(),
        );

        let signal = scheduler.flush_and_signal(EngineMask::All).unwrap();

        assert_ne!(signal.rally_point(Engine::Copy), 0);
        assert_ne!(signal.rally_point(Engine::Graphics), 0);
        assert_eq!(signal.rally_point(Engine::Compute), 0);
        assert_eq!(signal.rally_point(Engine::RayTracing), 0);

        signal.wait_for().unwrap();
        assert_eq!(scheduler.device().raw().stats().draws, 1);
    }

    #[test]
    fn flush_restricted_to_mask_leaves_other_engines_open() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(2));
        scheduler.setup_frame(0).unwrap();

        scheduler.enqueue_fn::<Compute, _>(|ctx| ctx.dispatch(1, 1, 1), Tag::none());
        scheduler.enqueue_fn::<RayTracing, _>(|ctx| ctx.dispatch_rays(4, 4, 1), Tag::none());

        let rays = scheduler.flush_and_signal(EngineMask::RayTracing).unwrap();
        assert_ne!(rays.rally_point(Engine::RayTracing), 0);
        assert_eq!(rays.rally_point(Engine::Compute), 0);

        let rest = scheduler.flush_and_signal(EngineMask::All).unwrap();
        assert_ne!(rest.rally_point(Engine::Compute), 0);
        assert_eq!(rest.rally_point(Engine::RayTracing), 0);
    }

    #[test]
    fn no_async_work_is_lost() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(6));
        scheduler.setup_frame(0).unwrap();

        let recorded = Arc::new(AtomicUsize::new(0));
        let mut used = EngineMask::empty();
        let mut rng = rand::thread_rng();

        const ITEMS: usize = 300;
        for i in 0..ITEMS {
            let recorded = Arc::clone(&recorded);
            let spin = rng.gen_range(0..50u64);
            let count = move || {
                thread::sleep(Duration::from_micros(spin));
                recorded.fetch_add(1, Ordering::SeqCst);
            };

            let engine = Engine::ALL[rng.gen_range(0..Engine::COUNT)];
            used |= engine.mask();

            match engine {
                Engine::Graphics => scheduler.enqueue_async_fn::<Graphics, _>(move |_| count(), Tag::new(i)),
                Engine::Compute => scheduler.enqueue_async_fn::<Compute, _>(move |_| count(), Tag::new(i)),
                Engine::Copy => scheduler.enqueue_async_fn::<Copy, _>(move |_| count(), Tag::new(i)),
                Engine::RayTracing => {
                    scheduler.enqueue_async_fn::<RayTracing, _>(move |_| count(), Tag::new(i))
                }
            }
        }

        let signal = scheduler.flush_and_signal(EngineMask::All).unwrap();
        assert_eq!(recorded.load(Ordering::SeqCst), ITEMS);

        for engine in Engine::ALL {
            assert_eq!(
                signal.rally_point(engine) != 0,
                used.contains(engine.mask()),
                "{engine:?}"
            );
        }
    }

    #[test]
    fn tags_reach_the_recording_callback() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(3));
        scheduler.setup_frame(0).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for value in 0..8u32 {
            let seen = Arc::clone(&seen);
            scheduler.enqueue_async_fn::<Compute, _>(
                move |ctx| seen.lock().extend(ctx.tag().get::<u32>().copied()),
                Tag::new(value),
            );
        }

        scheduler.flush_and_signal(EngineMask::Compute).unwrap();

        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn single_thread_records_async_work_inline() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(1));
        scheduler.setup_frame(0).unwrap();

        let recorded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&recorded);
        scheduler.enqueue_async_fn::<Graphics, _>(
            move |ctx| {
                assert_eq!(ctx.thread_index(), 0);
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Tag::none(),
        );

        assert_eq!(recorded.load(Ordering::SeqCst), 1);
        scheduler.finish_frame().unwrap();
    }

    #[test]
    fn frame_buffering_waits_for_the_reused_slot() {
        let scheduler = slow_scheduler(
            SchedulerDesc::default()
                .with_buffer_count(3)
                .with_thread_count(2)
                .with_frame_buffering(true),
            Duration::from_millis(60),
        );

        let mut signals = Vec::new();
        for frame in 0..3 {
            scheduler.setup_frame(frame).unwrap();
            scheduler.enqueue_fn::<Graphics, _>(|ctx| ctx.draw(3, 1, 0, 0), Tag::none());
            signals.push(scheduler.finish_frame().unwrap());
        }

        // still on the GPU timeline, so setting the slot up again has to block
        assert!(!signals[0].is_complete());
        scheduler.setup_frame(0).unwrap();
        assert!(signals[0].is_complete());
        assert_eq!(scheduler.frame_index(), 0);

        let graphics = scheduler.queue(Engine::Graphics);
        assert!(graphics.fence().get_completed_value() >= signals[0].rally_point(Engine::Graphics));
    }

    #[test]
    fn serialized_frames_are_readable_after_finish() {
        let scheduler = slow_scheduler(
            SchedulerDesc::default().with_thread_count(2),
            Duration::from_millis(20),
        );
        let device = scheduler.device().clone();

        let upload = device
            .create_buffer(16, MemoryHeapType::Cpu, ResourceStates::GenericRead)
            .unwrap();
        let readback = device
            .create_buffer(16, MemoryHeapType::Readback, ResourceStates::CopyDst)
            .unwrap();

        let payload = (1..=16).collect::<Vec<u8>>();
        upload.write_data(0, &payload).unwrap();

        scheduler.setup_frame(0).unwrap();

        let (dst, src) = (readback.clone(), upload.clone());
        scheduler.enqueue_async_fn::<Copy, _>(move |ctx| ctx.copy_resource(&dst, &src), Tag::none());

        scheduler.finish_frame().unwrap();

        let mut out = [0u8; 16];
        readback.read_data(0, &mut out).unwrap();
        assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn descriptor_tables_are_recycled_per_frame() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(2));
        let device = scheduler.device().clone();

        let buffer = device
            .create_buffer(64, MemoryHeapType::Gpu, ResourceStates::Common)
            .unwrap();
        let uav = scheduler.descriptors().push_uav(&buffer).unwrap();

        for frame in [0, 1, 0] {
            scheduler.setup_frame(frame).unwrap();

            let views = vec![Some(uav.clone()), None];
            scheduler.enqueue_fn::<Compute, _>(
                move |ctx| {
                    ctx.bind(
                        0,
                        &SlotBinding::DescriptorRange {
                            kind: ViewKind::Uav,
                            views: &views,
                        },
                    )
                    .unwrap();
                    ctx.dispatch(1, 1, 1);
                },
                Tag::none(),
            );

            scheduler.finish_frame().unwrap();
        }

        let stats = device.raw().stats();
        assert_eq!(stats.dispatches, 3);
        assert_eq!(stats.descriptor_copies, 3);
        assert_eq!(stats.descriptors_copied, 6);
        assert_eq!(buffer.get_current_state(), ResourceStates::UnorderedAccess);
    }

    #[test]
    fn persistent_tables_are_written_once() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(2));
        let device = scheduler.device().clone();

        let buffer = device
            .create_buffer(64, MemoryHeapType::Gpu, ResourceStates::Common)
            .unwrap();
        let srv = scheduler.descriptors().push_srv(&buffer).unwrap();

        let table = scheduler
            .allocate_persistent(DescriptorHeapKind::CbvSrvUav, 2)
            .unwrap();
        scheduler.write_persistent(&table, ViewKind::Srv, &[Some(srv), None]);

        let stats = device.raw().stats();
        assert_eq!(stats.descriptor_copies, 1);
        assert_eq!(stats.descriptors_copied, 2);

        assert!(matches!(
            scheduler.allocate_persistent(DescriptorHeapKind::Sampler, 17),
            Err(Error::OutOfDescriptors { .. })
        ));
    }

    #[test]
    fn ring_exhaustion_is_reported_to_the_callback() {
        let device = Device::new("soft", SoftDevice::new());
        let desc = small(SchedulerDesc::default().with_thread_count(1))
            .with_gpu_cbv_srv_uav_heap(8, 0);
        let scheduler = GpuScheduler::<SoftBackend>::new(device, desc).unwrap();
        assert_eq!(scheduler.desc().gpu_cbv_srv_uav.capacity, 8);
        scheduler.setup_frame(0).unwrap();

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        scheduler.enqueue_fn::<Compute, _>(
            move |ctx| {
                let views = vec![None; 3];
                for _ in 0..2 {
                    let binding = SlotBinding::DescriptorRange {
                        kind: ViewKind::Srv,
                        views: &views,
                    };
                    if let Err(Error::OutOfDescriptors { .. }) = ctx.bind(0, &binding) {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            },
            Tag::none(),
        );

        assert_eq!(failures.load(Ordering::SeqCst), 1);
        scheduler.finish_frame().unwrap();
    }

    #[test]
    fn sync_items_keep_their_order() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(4));
        scheduler.setup_frame(0).unwrap();

        for x in 1..=5 {
            scheduler.enqueue_fn::<Compute, _>(move |ctx| ctx.dispatch(x, 1, 1), Tag::none());
        }
        scheduler.flush_and_signal(EngineMask::Compute).unwrap();

        let state = &scheduler.inner.engines[Engine::Compute.index()];
        let list = state.lists[0].lock();
        let order = list
            .raw
            .commands()
            .iter()
            .filter_map(|command| match command {
                SoftCommand::Dispatch { x, .. } => Some(*x),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn failed_activation_still_submits_sibling_work() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(2));
        scheduler.setup_frame(0).unwrap();

        scheduler.enqueue_fn::<Graphics, _>(|ctx| ctx.draw(3, 1, 0, 0), Tag::none());
        scheduler.device().raw().fail_list_resets(1);
        scheduler.enqueue_fn::<Compute, _>(|ctx| ctx.dispatch(1, 1, 1), Tag::none());

        let err = scheduler.flush_and_signal(EngineMask::All).unwrap_err();
        assert!(matches!(err, Error::Device(_)));

        let stats = scheduler.device().raw().stats();
        assert_eq!(stats.submissions, 1);
        assert_eq!(stats.dispatches, 0);

        for state in &scheduler.inner.engines {
            assert!(state
                .lists
                .iter()
                .all(|list| list.lock().state() == CommandBufferState::Closed));
        }

        scheduler.finish_frame().unwrap();
        scheduler.setup_frame(1).unwrap();

        scheduler.enqueue_fn::<Compute, _>(|ctx| ctx.dispatch(1, 1, 1), Tag::none());
        let signal = scheduler.flush_and_signal(EngineMask::All).unwrap();
        assert_ne!(signal.rally_point(Engine::Compute), 0);
        assert_eq!(scheduler.device().raw().stats().dispatches, 1);
    }

    #[test]
    fn work_that_fails_to_close_gets_no_rally_point() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(2));
        scheduler.setup_frame(0).unwrap();

        scheduler.enqueue_fn::<RayTracing, _>(|ctx| ctx.dispatch_rays(8, 8, 1), Tag::none());
        scheduler.device().raw().fail_list_closes(1);

        assert!(matches!(
            scheduler.flush_and_signal(EngineMask::RayTracing),
            Err(Error::Device(_))
        ));
        assert_eq!(scheduler.device().raw().stats().submissions, 0);
        assert_eq!(scheduler.queue(Engine::RayTracing).last_value(), 0);

        scheduler.finish_frame().unwrap();
        scheduler.setup_frame(1).unwrap();

        scheduler.enqueue_fn::<RayTracing, _>(|ctx| ctx.dispatch_rays(8, 8, 1), Tag::none());
        let signal = scheduler.flush_and_signal(EngineMask::RayTracing).unwrap();
        assert_ne!(signal.rally_point(Engine::RayTracing), 0);
    }

    #[test]
    fn panicking_worker_does_not_stall_the_flush() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(2));
        scheduler.setup_frame(0).unwrap();

        scheduler.enqueue_async_fn::<Compute, _>(|_| panic!("broken process"), Tag::none());
        scheduler.enqueue_async_fn::<Compute, _>(|ctx| ctx.dispatch(1, 1, 1), Tag::none());

        scheduler.flush_and_signal(EngineMask::All).unwrap();
        assert_eq!(scheduler.device().raw().stats().dispatches, 1);
    }

    #[test]
    fn device_removal_aborts_the_frame() {
        let scheduler = scheduler(SchedulerDesc::default().with_thread_count(2));
        scheduler.setup_frame(0).unwrap();

        scheduler.enqueue_fn::<Graphics, _>(|ctx| ctx.draw(3, 1, 0, 0), Tag::none());
        scheduler.device().raw().remove();

        let err = scheduler.finish_frame().unwrap_err();
        assert!(err.is_device_failure());
        assert!(matches!(err, Error::DeviceRemoved(_)));
    }

    #[test]
    fn frame_slots_are_bounds_checked() {
        let scheduler = scheduler(SchedulerDesc::default().with_buffer_count(2));

        assert!(matches!(
            scheduler.setup_frame(2),
            Err(Error::FrameOutOfRange { frame: 2, buffers: 2 })
        ));
    }

    #[test]
    fn present_cycle_rotates_slots() {
        let scheduler = scheduler(
            SchedulerDesc::default()
                .with_buffer_count(2)
                .with_frame_buffering(true),
        );
        scheduler.setup_frame(0).unwrap();

        for next in [1, 0, 1, 0] {
            scheduler.enqueue_fn::<Graphics, _>(|ctx| ctx.draw(3, 1, 0, 0), Tag::none());
            scheduler.present_cycle(next).unwrap();
            assert_eq!(scheduler.frame_index(), next);
        }

        assert_eq!(scheduler.device().raw().stats().draws, 4);
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let mut scheduler = scheduler(SchedulerDesc::default().with_thread_count(3));
        scheduler.setup_frame(0).unwrap();

        let recorded = Arc::new(AtomicUsize::new(0));
        for _ in 0..40 {
            let recorded = Arc::clone(&recorded);
            scheduler.enqueue_async_fn::<Compute, _>(
                move |ctx| {
                    thread::sleep(Duration::from_millis(1));
                    ctx.dispatch(1, 1, 1);
                    recorded.fetch_add(1, Ordering::SeqCst);
                },
                Tag::none(),
            );
        }

        scheduler.shutdown().unwrap();

        assert_eq!(recorded.load(Ordering::SeqCst), 40);
        let queue = scheduler.queue(Engine::Compute);
        assert!(queue.fence().is_complete(queue.last_value()));
        assert_ne!(queue.last_value(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "after shutdown")]
    fn enqueue_after_shutdown_is_a_programming_error() {
        let mut scheduler = scheduler(SchedulerDesc::default().with_thread_count(2));
        scheduler.shutdown().unwrap();

        scheduler.enqueue_fn::<Copy, _>(|_| {}, Tag::none());
    }
}
