//! Task descriptors and the supervisor that drives jobs.

pub mod descriptor;
pub mod state;
pub mod supervisor;

pub use descriptor::{DescriptorStore, strip_inline_images};
pub use state::{StateTransition, TaskDescriptor, TaskParams, TaskStatus};
pub use supervisor::{SupervisorConfig, TaskSupervisor};
