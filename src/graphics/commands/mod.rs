mod command_allocator;
mod command_buffer;
mod command_queue;
mod worker_thread;
mod worker_type;

pub(crate) use command_allocator::*;
pub(crate) use command_buffer::CommandBuffer;
pub use command_buffer::CommandBufferState;
pub use command_queue::*;
pub use worker_thread::*;
pub use worker_type::*;
