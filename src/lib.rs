pub mod graphics;

#[cfg(windows)]
pub use graphics::backends::d3d12::D3D12Backend;

pub use graphics::{
    backends::soft::SoftBackend,
    commands::{Compute, Copy, Graphics, RayTracing, WorkerThread, WorkerType},
    error::{Error, Result},
    scheduler::{GpuProcess, GpuScheduler, SchedulerDesc, Tag},
    signal::Signal,
    types::{Engine, EngineMask, ResourceStates},
};

/*

fn render(scheduler: &GpuScheduler<B>) -> Result<()> {
    scheduler.setup_frame(back_buffer_index)?;

    // recorded right here, on thread slot 0
    scheduler.enqueue(UploadProcess::new(...), Tag::none());

    // recorded by whichever worker is idle
    for chunk in scene.chunks() {
        scheduler.enqueue_async(DrawChunk::new(chunk), Tag::new(chunk.id()));
    }

    // acceleration structure must be ready before the rays
    scheduler.enqueue(BuildBvh::new(...), Tag::none());
    scheduler.flush_and_signal(EngineMask::RayTracing)?.wait_for()?;

    scheduler.enqueue(TraceShadows::new(...), Tag::none());

    let _frame = scheduler.finish_frame()?;
    swapchain.present();
}

*/
