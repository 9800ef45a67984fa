use crate::graphics::error::{Error, Result};

pub const MAX_BUFFER_COUNT: usize = 16;

/// Size of a shader-visible heap and how much of it never recycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuHeapLayout {
    pub capacity: usize,
    pub persistent: usize,
}

impl GpuHeapLayout {
    pub const fn new(capacity: usize, persistent: usize) -> Self {
        Self {
            capacity,
            persistent,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuHeapSizes {
    pub rtv: usize,
    pub dsv: usize,
    pub cbv_srv_uav: usize,
    pub sampler: usize,
}

/// Fixed at scheduler creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerDesc {
    /// Frames that may be in flight, one frame slot each.
    pub buffer_count: usize,
    /// Thread slots including the calling thread.
    pub thread_count: usize,
    /// Wait for a slot's previous frame in `setup_frame` instead of right
    /// after `finish_frame`.
    pub frame_buffering: bool,
    pub gpu_cbv_srv_uav: GpuHeapLayout,
    pub gpu_sampler: GpuHeapLayout,
    pub cpu_heaps: CpuHeapSizes,
}

impl Default for SchedulerDesc {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            thread_count: 8,
            frame_buffering: false,
            gpu_cbv_srv_uav: GpuHeapLayout::new(900_000, 1_000),
            gpu_sampler: GpuHeapLayout::new(2_000, 100),
            cpu_heaps: CpuHeapSizes {
                rtv: 1_000,
                dsv: 1_000,
                cbv_srv_uav: 1_000_000,
                sampler: 2_000,
            },
        }
    }
}

impl SchedulerDesc {
    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_frame_buffering(mut self, frame_buffering: bool) -> Self {
        self.frame_buffering = frame_buffering;
        self
    }

    pub fn with_gpu_cbv_srv_uav_heap(mut self, capacity: usize, persistent: usize) -> Self {
        self.gpu_cbv_srv_uav = GpuHeapLayout::new(capacity, persistent);
        self
    }

    pub fn with_gpu_sampler_heap(mut self, capacity: usize, persistent: usize) -> Self {
        self.gpu_sampler = GpuHeapLayout::new(capacity, persistent);
        self
    }

    pub fn with_cpu_heaps(
        mut self,
        rtv: usize,
        dsv: usize,
        cbv_srv_uav: usize,
        sampler: usize,
    ) -> Self {
        self.cpu_heaps = CpuHeapSizes {
            rtv,
            dsv,
            cbv_srv_uav,
            sampler,
        };
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFER_COUNT {
            return Err(Error::InvalidConfig(format!(
                "buffer count {} is outside 1..={MAX_BUFFER_COUNT}",
                self.buffer_count
            )));
        }

        if self.thread_count == 0 {
            return Err(Error::InvalidConfig(
                "at least one thread slot is required".to_string(),
            ));
        }

        for (name, layout) in [
            ("cbv/srv/uav", self.gpu_cbv_srv_uav),
            ("sampler", self.gpu_sampler),
        ] {
            if layout.persistent >= layout.capacity {
                return Err(Error::InvalidConfig(format!(
                    "{name} heap: persistent region {} must be smaller than capacity {}",
                    layout.persistent, layout.capacity
                )));
            }

            if (layout.capacity - layout.persistent) / self.buffer_count == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{name} heap: capacity {} leaves no room for {} frame regions",
                    layout.capacity, self.buffer_count
                )));
            }
        }

        // null cbv, srv and uav live in the staging heaps
        if self.cpu_heaps.cbv_srv_uav < 3 || self.cpu_heaps.sampler < 1 {
            return Err(Error::InvalidConfig(
                "staging heaps are too small for the null views".to_string(),
            ));
        }

        Ok(())
    }
}
