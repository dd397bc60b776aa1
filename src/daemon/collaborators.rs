//! Contracts the daemon consumes from the outside world.
//!
//! Transport, remote execution and cache storage live behind these traits so
//! the orchestration logic can be driven by in-process fakes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{
    CacheEntry, FreeTaskRequest, KeepTaskAliveRequest, RunningTask, StartTaskRequest, TaskGrant,
    WaitForStartingTaskRequest, WaitTaskStatus,
};
use crate::scheduler::SchedulerService;

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn wait_for_starting_task(&self, req: WaitForStartingTaskRequest)
        -> Result<Vec<TaskGrant>>;

    async fn keep_task_alive(&self, req: KeepTaskAliveRequest) -> Result<Vec<bool>>;

    async fn free_task(&self, req: FreeTaskRequest) -> Result<()>;

    async fn get_running_tasks(&self, token: &str) -> Result<Vec<RunningTask>>;

    /// Daemon token to present to servants.
    async fn get_config(&self, token: &str) -> Result<String>;
}

/// Remote execution endpoint on one servant.
#[async_trait]
pub trait ServantClient: Send + Sync {
    async fn start_task(&self, req: StartTaskRequest) -> Result<u64>;

    /// Block up to `wait_budget` for the task to finish.
    async fn wait_for_task(
        &self,
        servant_task_id: u64,
        wait_budget: Duration,
        token: &str,
    ) -> Result<WaitTaskStatus>;

    /// Attach to a task someone else started. `TaskNotFound` if it is gone.
    async fn add_task_ref(&self, servant_task_id: u64, token: &str) -> Result<()>;

    async fn free_task(&self, servant_task_id: u64, token: &str) -> Result<()>;
}

pub trait ServantConnector: Send + Sync {
    fn connect(&self, location: SocketAddr) -> Arc<dyn ServantClient>;
}

#[async_trait]
pub trait CacheReader: Send + Sync {
    async fn try_read(&self, cache_key: &str) -> Option<CacheEntry>;
}

/// Cache that never hits.
pub struct NoCache;

#[async_trait]
impl CacheReader for NoCache {
    async fn try_read(&self, _cache_key: &str) -> Option<CacheEntry> {
        None
    }
}

pub trait ProcessProbe: Send + Sync {
    fn is_process_alive(&self, pid: u32) -> bool;
}

/// Reads `/proc/<pid>/status`. Zombies and dead processes count as gone.
pub struct ProcfsProbe;

impl ProcessProbe for ProcfsProbe {
    fn is_process_alive(&self, pid: u32) -> bool {
        let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) else {
            return false;
        };
        status
            .lines()
            .find_map(|line| line.strip_prefix("State:"))
            .and_then(|state| state.trim().chars().next())
            .is_some_and(|state| !matches!(state, 'Z' | 'X' | 'x'))
    }
}

/// Calls a `SchedulerService` living in the same process.
pub struct InProcessScheduler {
    service: Arc<SchedulerService>,
    peer: SocketAddr,
}

impl InProcessScheduler {
    /// `peer` is the address the scheduler should believe calls come from.
    pub fn new(service: Arc<SchedulerService>, peer: SocketAddr) -> Self {
        Self { service, peer }
    }
}

#[async_trait]
impl SchedulerClient for InProcessScheduler {
    async fn wait_for_starting_task(
        &self,
        req: WaitForStartingTaskRequest,
    ) -> Result<Vec<TaskGrant>> {
        self.service.wait_for_starting_task(self.peer, req).await
    }

    async fn keep_task_alive(&self, req: KeepTaskAliveRequest) -> Result<Vec<bool>> {
        self.service.keep_task_alive(req).await
    }

    async fn free_task(&self, req: FreeTaskRequest) -> Result<()> {
        self.service.free_task(req).await
    }

    async fn get_running_tasks(&self, token: &str) -> Result<Vec<RunningTask>> {
        self.service.get_running_tasks(token).await
    }

    async fn get_config(&self, token: &str) -> Result<String> {
        self.service.get_config(token).await
    }
}
