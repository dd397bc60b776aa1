pub mod collaborators;
pub mod config_keeper;
pub mod dispatcher;
pub mod grant_keeper;
pub mod quota;
pub mod run_keeper;
pub mod task;

pub use collaborators::{
    CacheReader, InProcessScheduler, NoCache, ProcessProbe, ProcfsProbe, SchedulerClient,
    ServantClient, ServantConnector,
};
pub use config_keeper::ConfigKeeper;
pub use dispatcher::{Collaborators, CompletionCallback, DispatcherStats, TaskDispatcher};
pub use grant_keeper::{GrantDesc, GrantKeeper};
pub use quota::TaskQuota;
pub use run_keeper::{RunKeeper, RunningTaskDesc};
pub use task::{CompileTask, TaskState};
