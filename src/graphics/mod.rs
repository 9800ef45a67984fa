pub mod backend;
pub mod backends;
pub mod bindings;
pub mod commands;
pub mod descriptor_heap;
pub mod device;
pub mod error;
pub mod fence;
pub mod frame_descriptor_heap;
pub mod resources;
pub mod scheduler;
pub mod signal;
pub mod types;

mod sealed {
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;
