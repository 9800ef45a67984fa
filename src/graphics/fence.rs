use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    backend::{Backend, GpuDevice, GpuFence},
    device::Device,
    error::Result,
};

/// Fence plus the last value handed out for it.
#[derive(Debug)]
pub struct Fence<B: Backend> {
    pub(crate) raw: B::Fence,
    value: AtomicU64,
}

impl<B: Backend> Fence<B> {
    pub(super) fn inner_new(device: &Device<B>) -> Result<Self> {
        let raw = device.raw.create_fence()?;

        Ok(Self {
            raw,
            value: AtomicU64::new(0),
        })
    }

    pub fn get_completed_value(&self) -> u64 {
        self.raw.completed_value()
    }

    pub fn get_current_value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Reserves the next rally value. Values start at 1 so 0 can mean "nothing".
    pub(crate) fn inc_value(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_complete(&self, value: u64) -> bool {
        self.get_completed_value() >= value
    }

    pub fn get_raw(&self) -> &B::Fence {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use crate::graphics::{
        backends::soft::{SoftBackend, SoftDevice},
        device::Device,
    };

    #[test]
    fn rally_values_start_at_one_and_increase() {
        let device = Device::<SoftBackend>::new("soft", SoftDevice::new());
        let fence = device.create_fence().unwrap();

        assert_eq!(fence.get_current_value(), 0);
        assert!(fence.is_complete(0));
        assert_eq!(fence.inc_value(), 1);
        assert_eq!(fence.inc_value(), 2);
        assert_eq!(fence.get_current_value(), 2);
        assert!(!fence.is_complete(1));
    }
}
