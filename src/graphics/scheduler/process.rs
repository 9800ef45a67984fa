use std::{any::Any, fmt, marker::PhantomData, sync::Arc};

use crate::graphics::{
    backend::Backend,
    commands::{RecordContext, WorkerThread, WorkerType},
    types::Engine,
};

/// A unit of GPU work. `Engine` picks the queue it is recorded for and
/// with it the operations the recorder exposes.
pub trait GpuProcess<B: Backend>: Send + 'static {
    type Engine: WorkerType;

    fn record(&self, ctx: &mut WorkerThread<'_, B, Self::Engine>);
}

impl<B: Backend, P: GpuProcess<B> + Sync> GpuProcess<B> for Arc<P> {
    type Engine = P::Engine;

    fn record(&self, ctx: &mut WorkerThread<'_, B, Self::Engine>) {
        P::record(self, ctx)
    }
}

/// Process made from a closure, see [`process_fn`].
pub struct FnProcess<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<B, T, F> GpuProcess<B> for FnProcess<T, F>
where
    B: Backend,
    T: WorkerType,
    F: Fn(&mut WorkerThread<'_, B, T>) + Send + 'static,
{
    type Engine = T;

    fn record(&self, ctx: &mut WorkerThread<'_, B, T>) {
        (self.f)(ctx)
    }
}

pub fn process_fn<B, T, F>(f: F) -> FnProcess<T, F>
where
    B: Backend,
    T: WorkerType,
    F: Fn(&mut WorkerThread<'_, B, T>) + Send + 'static,
{
    FnProcess {
        f,
        _marker: PhantomData,
    }
}

/// Caller data attached to a work item, readable while it records.
#[derive(Clone, Default)]
pub struct Tag(Option<Arc<dyn Any + Send + Sync>>);

impl Tag {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f.write_str("Tag(..)"),
            None => f.write_str("Tag(None)"),
        }
    }
}

trait ErasedProcess<B: Backend>: Send {
    fn engine(&self) -> Engine;

    fn record(&self, ctx: RecordContext<'_, B>);
}

impl<B: Backend, P: GpuProcess<B>> ErasedProcess<B> for P {
    fn engine(&self) -> Engine {
        P::Engine::ENGINE
    }

    fn record(&self, ctx: RecordContext<'_, B>) {
        let mut worker = WorkerThread::<B, P::Engine>::inner_new(ctx);
        GpuProcess::record(self, &mut worker);
    }
}

pub(crate) struct WorkItem<B: Backend> {
    process: Box<dyn ErasedProcess<B>>,
    pub(crate) tag: Tag,
}

impl<B: Backend> WorkItem<B> {
    pub(crate) fn new<P: GpuProcess<B>>(process: P, tag: Tag) -> Self {
        Self {
            process: Box::new(process),
            tag,
        }
    }

    pub(crate) fn engine(&self) -> Engine {
        self.process.engine()
    }

    pub(crate) fn record(&self, ctx: RecordContext<'_, B>) {
        self.process.record(ctx)
    }
}

impl<B: Backend> fmt::Debug for WorkItem<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("engine", &self.engine())
            .field("tag", &self.tag)
            .finish()
    }
}
