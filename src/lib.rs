//! A single-threaded cooperative scheduler built on stackful fibers.

extern crate libc;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate tracing;

pub mod co;
pub mod error;
pub mod handle;
pub mod host;
pub mod scheduler;
pub mod stack;
pub mod stack_pool;

pub use co::{CoState, FiberId, Resumption, TaskExit, Transfer};
pub use error::SchedulerError;
pub use handle::FiberHandle;
pub use host::{Host, HostDriver};
pub use scheduler::{await_host_call, Scheduler, SchedulerConfig, SchedulerStats};
pub use stack::Stack;
pub use stack_pool::{StackPool, StackPoolConfig};
