use smallvec::SmallVec;
use tracing::trace;

use super::{
    backend::{Backend, DescriptorRange, GpuDevice},
    descriptor_heap::{DescriptorAllocator, ResourceView},
    device::Device,
    frame_descriptor_heap::GpuDescriptorHeap,
    resources::GpuResource,
    types::{DescriptorHeapKind, ViewKind},
};

/// What a root parameter slot is bound to for the next draw or dispatch.
#[derive(Debug)]
pub enum SlotBinding<'a, B: Backend> {
    /// Root constant buffer view.
    Constant(&'a GpuResource<B>),
    /// Descriptor table; `None` entries bind a null view of `kind`.
    DescriptorRange {
        kind: ViewKind,
        views: &'a [Option<ResourceView<B>>],
    },
    AccelerationStructure(&'a GpuResource<B>),
}

#[derive(Debug, Default)]
struct PendingCopies {
    dst: SmallVec<[DescriptorRange; 8]>,
    src: SmallVec<[usize; 16]>,
}

impl PendingCopies {
    fn is_empty(&self) -> bool {
        self.dst.is_empty()
    }

    fn clear(&mut self) {
        self.dst.clear();
        self.src.clear();
    }
}

/// Staging-to-shader-visible copies queued by bindings, issued in one call per
/// heap right before the draw or dispatch that reads them.
#[derive(Debug, Default)]
pub(crate) struct DescriptorBatch {
    cbv_srv_uav: PendingCopies,
    sampler: PendingCopies,
}

impl DescriptorBatch {
    pub(crate) fn push(
        &mut self,
        kind: DescriptorHeapKind,
        dst: DescriptorRange,
        src: impl IntoIterator<Item = usize>,
    ) {
        let pending = match kind {
            DescriptorHeapKind::CbvSrvUav => &mut self.cbv_srv_uav,
            DescriptorHeapKind::Sampler => &mut self.sampler,
            DescriptorHeapKind::Rtv | DescriptorHeapKind::Dsv => {
                panic!("DescriptorBatch: {kind:?} heaps are never shader visible")
            }
        };

        let before = pending.src.len();
        pending.src.extend(src);
        debug_assert_eq!(pending.src.len() - before, dst.count);

        pending.dst.push(dst);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cbv_srv_uav.is_empty() && self.sampler.is_empty()
    }

    pub(crate) fn flush<B: Backend>(
        &mut self,
        device: &Device<B>,
        descriptors: &DescriptorAllocator<B>,
        gpu_cbv_srv_uav: &GpuDescriptorHeap<B>,
        gpu_sampler: &GpuDescriptorHeap<B>,
    ) {
        for (kind, pending, gpu) in [
            (
                DescriptorHeapKind::CbvSrvUav,
                &mut self.cbv_srv_uav,
                gpu_cbv_srv_uav,
            ),
            (DescriptorHeapKind::Sampler, &mut self.sampler, gpu_sampler),
        ] {
            if pending.is_empty() {
                continue;
            }

            trace!(
                ?kind,
                ranges = pending.dst.len(),
                slots = pending.src.len(),
                "copying descriptors"
            );

            let cpu = descriptors.heap(kind);
            device
                .raw
                .copy_descriptors(kind, gpu.get_raw(), &pending.dst, cpu.get_raw(), &pending.src);

            pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::graphics::{
        backend::DescriptorRange,
        backends::soft::{SoftBackend, SoftDevice},
        device::Device,
        types::{DescriptorHeapKind, ViewKind},
    };

    use super::DescriptorBatch;

    #[test]
    fn batch_issues_one_copy_per_heap() {
        let device = Device::<SoftBackend>::new("soft", SoftDevice::new());
        let descriptors = device.create_descriptor_allocator(4, 4, 16, 8).unwrap();
        let csu = device
            .create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 64, 0, 2)
            .unwrap();
        let sampler = device
            .create_gpu_descriptor_heap(DescriptorHeapKind::Sampler, 16, 0, 2)
            .unwrap();

        let null_srv = descriptors.null_descriptor(ViewKind::Srv).index();
        let null_uav = descriptors.null_descriptor(ViewKind::Uav).index();

        let mut batch = DescriptorBatch::default();
        batch.push(
            DescriptorHeapKind::CbvSrvUav,
            DescriptorRange::new(0, 2),
            [null_srv, null_srv],
        );
        batch.push(
            DescriptorHeapKind::CbvSrvUav,
            DescriptorRange::new(5, 1),
            [null_uav],
        );
        assert!(!batch.is_empty());

        batch.flush(&device, &descriptors, &csu, &sampler);
        assert!(batch.is_empty());

        let stats = device.raw().stats();
        assert_eq!(stats.descriptor_copies, 1);
        assert_eq!(stats.descriptors_copied, 3);

        let raw = csu.get_raw();
        assert_eq!(raw.view_at(1).map(|d| d.view), Some(ViewKind::Srv));
        assert_eq!(raw.view_at(5).map(|d| d.view), Some(ViewKind::Uav));
        assert!(raw.view_at(2).is_none());
    }
}
