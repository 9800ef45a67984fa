use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use super::{
    backend::{Backend, GpuDevice},
    device::Device,
    error::{Error, Result},
    types::DescriptorHeapKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationLifetime {
    /// Valid until the frame slot is set up again.
    Frame(usize),
    Persistent,
}

/// Contiguous slots in a shader-visible heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorAllocation {
    pub kind: DescriptorHeapKind,
    pub offset: usize,
    pub count: usize,
    pub lifetime: AllocationLifetime,
}

#[derive(Debug)]
struct RingState {
    cursors: SmallVec<[usize; 4]>,
    persistent: usize,
}

/// Shader-visible heap laid out as `[persistent][frame 0]..[frame N-1]`.
///
/// Frame regions are bumped while a frame records and rewound by
/// [`GpuDescriptorHeap::reset_frame`]; the persistent region is never reclaimed.
#[derive(Debug)]
pub struct GpuDescriptorHeap<B: Backend> {
    kind: DescriptorHeapKind,
    raw: B::DescriptorHeap,

    capacity: usize,
    persistent_capacity: usize,
    frame_capacity: usize,

    state: Mutex<RingState>,
}

impl<B: Backend> GpuDescriptorHeap<B> {
    pub(super) fn inner_new(
        device: &Device<B>,
        kind: DescriptorHeapKind,
        capacity: usize,
        persistent: usize,
        buffers: usize,
    ) -> Result<Self> {
        if buffers == 0 {
            return Err(Error::InvalidConfig(format!(
                "{kind:?} heap needs at least one frame region"
            )));
        }

        if persistent >= capacity {
            return Err(Error::InvalidConfig(format!(
                "{kind:?} heap: persistent region {persistent} must be smaller than capacity {capacity}"
            )));
        }

        let frame_capacity = (capacity - persistent) / buffers;
        if frame_capacity == 0 {
            return Err(Error::InvalidConfig(format!(
                "{kind:?} heap: capacity {capacity} leaves no room for {buffers} frame regions"
            )));
        }

        let raw = device.raw.create_descriptor_heap(kind, capacity, true)?;

        Ok(Self {
            kind,
            raw,
            capacity,
            persistent_capacity: persistent,
            frame_capacity,
            state: Mutex::new(RingState {
                cursors: std::iter::repeat(0).take(buffers).collect(),
                persistent: 0,
            }),
        })
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_capacity(&self) -> usize {
        self.frame_capacity
    }

    pub fn persistent_capacity(&self) -> usize {
        self.persistent_capacity
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().cursors.len()
    }

    pub(crate) fn get_raw(&self) -> &B::DescriptorHeap {
        &self.raw
    }

    pub fn allocate_in_frame(&self, frame: usize, count: usize) -> Result<DescriptorAllocation> {
        let mut state = self.state.lock();
        let buffers = state.cursors.len();

        let cursor = state
            .cursors
            .get_mut(frame)
            .ok_or(Error::FrameOutOfRange { frame, buffers })?;

        if count > self.frame_capacity - *cursor {
            return Err(Error::OutOfDescriptors {
                kind: self.kind,
                requested: count,
                available: self.frame_capacity - *cursor,
                capacity: self.frame_capacity,
            });
        }

        let offset = self.persistent_capacity + frame * self.frame_capacity + *cursor;
        *cursor += count;

        Ok(DescriptorAllocation {
            kind: self.kind,
            offset,
            count,
            lifetime: AllocationLifetime::Frame(frame),
        })
    }

    pub fn allocate_persistent(&self, count: usize) -> Result<DescriptorAllocation> {
        let mut state = self.state.lock();

        if count > self.persistent_capacity - state.persistent {
            return Err(Error::OutOfDescriptors {
                kind: self.kind,
                requested: count,
                available: self.persistent_capacity - state.persistent,
                capacity: self.persistent_capacity,
            });
        }

        let offset = state.persistent;
        state.persistent += count;

        Ok(DescriptorAllocation {
            kind: self.kind,
            offset,
            count,
            lifetime: AllocationLifetime::Persistent,
        })
    }

    /// Rewinds the region of `frame`. Callers must have waited for the frame's
    /// last signal first.
    pub fn reset_frame(&self, frame: usize) -> Result<()> {
        let mut state = self.state.lock();
        let buffers = state.cursors.len();

        let cursor = state
            .cursors
            .get_mut(frame)
            .ok_or(Error::FrameOutOfRange { frame, buffers })?;

        trace!(kind = ?self.kind, frame, used = *cursor, "descriptor ring rewound");
        *cursor = 0;

        Ok(())
    }

    pub fn used_in_frame(&self, frame: usize) -> usize {
        self.state.lock().cursors.get(frame).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use crate::graphics::{
        backends::soft::{SoftBackend, SoftDevice},
        device::Device,
        error::Error,
        types::DescriptorHeapKind,
    };

    use super::AllocationLifetime;

    fn device() -> Device<SoftBackend> {
        Device::new("soft", SoftDevice::new())
    }

    #[test]
    fn frame_regions_follow_persistent_region() {
        let heap = device()
            .create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 100, 10, 3)
            .unwrap();

        assert_eq!(heap.frame_capacity(), 30);

        let a = heap.allocate_in_frame(0, 4).unwrap();
        let b = heap.allocate_in_frame(0, 2).unwrap();
        let c = heap.allocate_in_frame(2, 1).unwrap();

        assert_eq!(a.offset, 10);
        assert_eq!(b.offset, 14);
        assert_eq!(c.offset, 70);
        assert_eq!(c.lifetime, AllocationLifetime::Frame(2));

        let p = heap.allocate_persistent(3).unwrap();
        assert_eq!(p.offset, 0);
        assert_eq!(p.lifetime, AllocationLifetime::Persistent);
    }

    #[test]
    fn frame_overflow_is_an_error_not_a_wrap() {
        let heap = device()
            .create_gpu_descriptor_heap(DescriptorHeapKind::Sampler, 20, 4, 2)
            .unwrap();

        heap.allocate_in_frame(1, 6).unwrap();
        let err = heap.allocate_in_frame(1, 3).unwrap_err();

        assert!(matches!(
            err,
            Error::OutOfDescriptors {
                requested: 3,
                available: 2,
                capacity: 8,
                ..
            }
        ));

        // the neighbouring region is untouched
        assert_eq!(heap.allocate_in_frame(0, 8).unwrap().offset, 4);
    }

    #[test]
    fn reset_recycles_only_that_frame() {
        let heap = device()
            .create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 16, 0, 2)
            .unwrap();

        heap.allocate_in_frame(0, 8).unwrap();
        heap.allocate_in_frame(1, 5).unwrap();
        assert!(heap.allocate_in_frame(0, 1).is_err());

        heap.reset_frame(0).unwrap();

        assert_eq!(heap.allocate_in_frame(0, 8).unwrap().offset, 0);
        assert_eq!(heap.used_in_frame(1), 5);
    }

    #[test]
    fn persistent_region_is_never_reclaimed() {
        let heap = device()
            .create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 16, 4, 2)
            .unwrap();

        heap.allocate_persistent(4).unwrap();
        heap.reset_frame(0).unwrap();
        heap.reset_frame(1).unwrap();

        assert!(matches!(
            heap.allocate_persistent(1),
            Err(Error::OutOfDescriptors { available: 0, .. })
        ));
    }

    #[test]
    fn huge_requests_do_not_move_the_cursors() {
        let heap = device()
            .create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 16, 4, 2)
            .unwrap();

        heap.allocate_persistent(1).unwrap();
        heap.allocate_in_frame(0, 1).unwrap();

        assert!(matches!(
            heap.allocate_persistent(usize::MAX),
            Err(Error::OutOfDescriptors { available: 3, .. })
        ));
        assert!(matches!(
            heap.allocate_in_frame(0, usize::MAX),
            Err(Error::OutOfDescriptors { available: 5, .. })
        ));

        assert_eq!(heap.allocate_persistent(1).unwrap().offset, 1);
        assert_eq!(heap.allocate_in_frame(0, 1).unwrap().offset, 5);
        assert_eq!(heap.used_in_frame(0), 2);
    }

    #[test]
    fn bad_layouts_are_rejected() {
        let device = device();

        assert!(matches!(
            device.create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 10, 10, 2),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            device.create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 10, 9, 2),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            device
                .create_gpu_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 10, 0, 2)
                .unwrap()
                .allocate_in_frame(2, 1),
            Err(Error::FrameOutOfRange { frame: 2, buffers: 2 })
        ));
    }
}
