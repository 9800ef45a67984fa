use std::time::Duration;

use gpu_scheduler::{
    graphics::{
        backends::soft::SoftDevice,
        bindings::SlotBinding,
        device::Device,
        types::{MemoryHeapType, ViewKind},
    },
    Compute, Copy, EngineMask, Graphics, GpuScheduler, RayTracing, ResourceStates, Result,
    SchedulerDesc, SoftBackend, Tag,
};
use tracing::{info, Level};

const FRAMES: usize = 6;
const CHUNKS: usize = 16;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_thread_names(true)
        .init();

    let device = Device::<SoftBackend>::new(
        "soft",
        SoftDevice::new().with_latency(Duration::from_millis(2)),
    );

    let desc = SchedulerDesc::default()
        .with_buffer_count(3)
        .with_thread_count(4)
        .with_frame_buffering(true)
        .with_gpu_cbv_srv_uav_heap(65536, 1024)
        .with_gpu_sampler_heap(512, 16)
        .with_cpu_heaps(64, 64, 4096, 64);

    let mut scheduler = GpuScheduler::new(device.clone(), desc)?;

    let upload = device.create_buffer(4096, MemoryHeapType::Cpu, ResourceStates::GenericRead)?;
    let vertices = device.create_buffer(4096, MemoryHeapType::Gpu, ResourceStates::Common)?;
    let target = device.create_buffer(4096, MemoryHeapType::Gpu, ResourceStates::Common)?;
    let blas = device.create_buffer(1024, MemoryHeapType::Gpu, ResourceStates::Common)?;
    let scratch = device.create_buffer(1024, MemoryHeapType::Gpu, ResourceStates::Common)?;

    upload.write_data(0, &[0x7f; 4096])?;

    let rtv = scheduler.descriptors().push_rtv(&target)?;
    let srv = scheduler.descriptors().push_srv(&vertices)?;
    let uav = scheduler.descriptors().push_uav(&target)?;

    let back_buffer = 0;
    scheduler.setup_frame(back_buffer)?;

    for frame in 0..FRAMES {
        {
            let (upload, vertices) = (upload.clone(), vertices.clone());
            scheduler.enqueue_fn::<Copy, _>(
                move |ctx| ctx.copy_resource(&vertices, &upload),
                Tag::new(frame),
            );
        }

        {
            let (blas, scratch, vertices) = (blas.clone(), scratch.clone(), vertices.clone());
            scheduler.enqueue_fn::<RayTracing, _>(
                move |ctx| ctx.build_acceleration_structure(&blas, &scratch, &vertices),
                Tag::none(),
            );
        }
        scheduler.flush_and_signal(EngineMask::RayTracing)?.wait_for()?;

        for chunk in 0..CHUNKS {
            let (rtv, srv) = (rtv.clone(), srv.clone());
            scheduler.enqueue_async_fn::<Graphics, _>(
                move |ctx| {
                    let views = [Some(srv.clone()), None];
                    let table = SlotBinding::DescriptorRange {
                        kind: ViewKind::Srv,
                        views: &views,
                    };

                    if let Err(err) = ctx.bind(0, &table) {
                        tracing::error!(%err, "chunk binding failed");
                        return;
                    }

                    ctx.clear_render_target(&rtv, [0.1, 0.1, 0.1, 1.0]);
                    ctx.draw(3 * 64, 1, 0, 0);
                },
                Tag::new(chunk),
            );
        }

        {
            let uav = uav.clone();
            scheduler.enqueue_async_fn::<Compute, _>(
                move |ctx| {
                    let views = [Some(uav.clone())];
                    let table = SlotBinding::DescriptorRange {
                        kind: ViewKind::Uav,
                        views: &views,
                    };

                    if ctx.bind(0, &table).is_ok() {
                        ctx.dispatch(8, 8, 1);
                    }
                },
                Tag::none(),
            );
        }

        let next = (scheduler.frame_index() + 1) % scheduler.desc().buffer_count;
        let signal = scheduler.present_cycle(next)?;

        info!(frame, rally_points = ?signal.rally_points(), "frame submitted");
    }

    scheduler.shutdown()?;

    let stats = device.raw().stats();
    info!(
        submissions = stats.submissions,
        command_lists = stats.command_lists,
        draws = stats.draws,
        dispatches = stats.dispatches,
        copies = stats.copies,
        barriers = stats.barriers,
        descriptors_copied = stats.descriptors_copied,
        fence_waits = stats.fence_waits,
        "done"
    );

    Ok(())
}
