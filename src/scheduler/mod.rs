pub mod allocator;
pub mod bookkeeper;
pub mod lease;
pub mod servant;
pub mod service;

pub use allocator::{LeaseAllocator, SweepReport, TaskInfo};
pub use bookkeeper::RunningTaskBookkeeper;
pub use lease::{Lease, LeaseStatus};
pub use servant::{Servant, ServantInfo, ServantRegistry};
pub use service::SchedulerService;
