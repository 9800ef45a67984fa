use crate::graphics::{types::Engine, Sealed};

/// Engine a recorder is bound to, known at compile time.
pub trait WorkerType: Sealed + Send + Sync + 'static {
    const ENGINE: Engine;
}

/// Transfers and barriers. Every engine can do this.
pub trait CopyCapable: WorkerType {}

/// Root bindings and dispatch.
pub trait ComputeCapable: CopyCapable {}

/// Rasterization and render target clears.
pub trait GraphicsCapable: ComputeCapable {}

/// Acceleration structure builds and ray dispatch.
pub trait RayTracingCapable: ComputeCapable {}

#[derive(Clone, Copy, Debug)]
pub struct Graphics;
impl Sealed for Graphics {}
impl WorkerType for Graphics {
    const ENGINE: Engine = Engine::Graphics;
}
impl CopyCapable for Graphics {}
impl ComputeCapable for Graphics {}
impl GraphicsCapable for Graphics {}

#[derive(Clone, Copy, Debug)]
pub struct Compute;
impl Sealed for Compute {}
impl WorkerType for Compute {
    const ENGINE: Engine = Engine::Compute;
}
impl CopyCapable for Compute {}
impl ComputeCapable for Compute {}

#[derive(Clone, Copy, Debug)]
pub struct Copy;
impl Sealed for Copy {}
impl WorkerType for Copy {
    const ENGINE: Engine = Engine::Copy;
}
impl CopyCapable for Copy {}

#[derive(Clone, Copy, Debug)]
pub struct RayTracing;
impl Sealed for RayTracing {}
impl WorkerType for RayTracing {
    const ENGINE: Engine = Engine::RayTracing;
}
impl CopyCapable for RayTracing {}
impl ComputeCapable for RayTracing {}
impl RayTracingCapable for RayTracing {}
