//! Shared fixtures for scheduler and daemon integration tests.
//!
//! Provides in-process fakes for servants, the cache and the process probe,
//! plus helpers for building heartbeats and polling for conditions.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use buildfarm_lite::config::{DaemonConfig, QuotaConfig, SchedulerConfig, TokenConfig};
use buildfarm_lite::daemon::{
    CacheReader, Collaborators, CompileTask, InProcessScheduler, ProcessProbe, ServantClient,
    ServantConnector, TaskDispatcher,
};
use buildfarm_lite::error::{BuildFarmError, Result};
use buildfarm_lite::protocol::{
    CacheEntry, DistOutput, EnvironmentDesc, HeartbeatRequest, RunningTask, ServantPriority,
    StartTaskRequest, WaitTaskStatus,
};
use buildfarm_lite::scheduler::SchedulerService;

pub const USER_TOKEN: &str = "user-secret";
pub const SERVANT_TOKEN: &str = "servant-secret";
pub const GCC: &str = "gcc-9f3";

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig::default().with_tokens(TokenConfig {
        user_tokens: vec![USER_TOKEN.to_string()],
        servant_tokens: vec![SERVANT_TOKEN.to_string()],
        rollout_interval: Duration::from_secs(3000),
    })
}

/// Daemon config with short timers so tests finish quickly.
pub fn test_daemon_config() -> DaemonConfig {
    DaemonConfig {
        scheduler_token: USER_TOKEN.to_string(),
        keep_alive_interval: Duration::from_millis(100),
        abort_check_interval: Duration::from_millis(50),
        run_keeper_refresh: Duration::from_millis(100),
        config_refresh: Duration::from_millis(100),
        grant_fetch_wait: Duration::from_secs(1),
        wait_for_task_budget: Duration::from_millis(50),
        quota: QuotaConfig::with_heavy(2),
        ..Default::default()
    }
}

/// Heartbeat from a servant reachable at `location`, offering `env`.
pub fn servant_heartbeat(location: &str, env: &str, concurrency: usize) -> HeartbeatRequest {
    HeartbeatRequest {
        token: SERVANT_TOKEN.to_string(),
        version: 1,
        location: location.to_string(),
        environments: vec![EnvironmentDesc::new(env)],
        num_cpu_cores: 16,
        current_load: 0,
        total_memory: 0,
        avail_memory: 0,
        concurrency,
        priority: Some(ServantPriority::Dedicated),
        next_heartbeat_in: Duration::from_secs(10),
        running_tasks: Vec::new(),
    }
}

pub fn compile_task(args: &str) -> CompileTask {
    compile_task_for(GCC, args)
}

pub fn compile_task_for(env: &str, args: &str) -> CompileTask {
    CompileTask::new(
        std::process::id(),
        EnvironmentDesc::new(env),
        args,
        "source-digest",
        b"int main() {}".to_vec(),
        true,
    )
    .unwrap()
}

pub fn successful_output() -> DistOutput {
    DistOutput {
        exit_code: 0,
        stdout: "compiled".to_string(),
        stderr: String::new(),
        output_files: vec![(".o".to_string(), vec![0x7f, b'E', b'L', b'F'])],
    }
}

/// In-memory servant. Tasks keep running until `release` is called.
pub struct FakeServant {
    next_task_id: AtomicU64,
    released: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_task: AtomicBool,
    pub add_ref_missing: AtomicBool,
    /// Number of upcoming `wait_for_task` calls that fail in transport.
    pub wait_errors: AtomicU32,
    pub output: Mutex<DistOutput>,
    pub started: Mutex<Vec<StartTaskRequest>>,
    pub refs_added: Mutex<Vec<u64>>,
    pub freed: Mutex<Vec<u64>>,
}

impl FakeServant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_task_id: AtomicU64::new(100),
            released: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_task: AtomicBool::new(false),
            add_ref_missing: AtomicBool::new(false),
            wait_errors: AtomicU32::new(0),
            output: Mutex::new(successful_output()),
            started: Mutex::new(Vec::new()),
            refs_added: Mutex::new(Vec::new()),
            freed: Mutex::new(Vec::new()),
        })
    }

    /// Let every running task finish with `output`.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn ref_count(&self) -> usize {
        self.refs_added.lock().unwrap().len()
    }

    pub fn freed_tasks(&self) -> Vec<u64> {
        self.freed.lock().unwrap().clone()
    }

    pub fn started_leases(&self) -> Vec<u64> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.lease_id)
            .collect()
    }
}

#[async_trait]
impl ServantClient for FakeServant {
    async fn start_task(&self, req: StartTaskRequest) -> Result<u64> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(BuildFarmError::Transport("connection refused".to_string()));
        }
        self.started.lock().unwrap().push(req);
        Ok(self.next_task_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn wait_for_task(
        &self,
        _servant_task_id: u64,
        wait_budget: Duration,
        _token: &str,
    ) -> Result<WaitTaskStatus> {
        if self
            .wait_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BuildFarmError::Transport("connection reset".to_string()));
        }
        if self.fail_task.load(Ordering::SeqCst) {
            return Ok(WaitTaskStatus::Failed);
        }
        if self.released.load(Ordering::SeqCst) {
            return Ok(WaitTaskStatus::Done(self.output.lock().unwrap().clone()));
        }
        tokio::time::sleep(wait_budget.min(Duration::from_millis(10))).await;
        Ok(WaitTaskStatus::Running)
    }

    async fn add_task_ref(&self, servant_task_id: u64, _token: &str) -> Result<()> {
        if self.add_ref_missing.load(Ordering::SeqCst) {
            return Err(BuildFarmError::TaskNotFound(servant_task_id));
        }
        self.refs_added.lock().unwrap().push(servant_task_id);
        Ok(())
    }

    async fn free_task(&self, servant_task_id: u64, _token: &str) -> Result<()> {
        self.freed.lock().unwrap().push(servant_task_id);
        Ok(())
    }
}

/// Routes every location to the same fake servant.
pub struct FakeConnector(pub Arc<FakeServant>);

impl ServantConnector for FakeConnector {
    fn connect(&self, _location: SocketAddr) -> Arc<dyn ServantClient> {
        self.0.clone()
    }
}

#[derive(Default)]
pub struct FakeCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FakeCache {
    pub fn insert(&self, key: String, entry: CacheEntry) {
        self.entries.lock().unwrap().insert(key, entry);
    }
}

#[async_trait]
impl CacheReader for FakeCache {
    async fn try_read(&self, cache_key: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(cache_key).cloned()
    }
}

/// Every process is alive unless marked dead.
#[derive(Default)]
pub struct FakeProbe {
    dead: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    pub fn kill(&self, pid: u32) {
        self.dead.lock().unwrap().insert(pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_process_alive(&self, pid: u32) -> bool {
        !self.dead.lock().unwrap().contains(&pid)
    }
}

/// A scheduler with one registered servant plus the fakes around it.
pub struct TestFarm {
    pub service: Arc<SchedulerService>,
    pub servant: Arc<FakeServant>,
    pub cache: Arc<FakeCache>,
    pub probe: Arc<FakeProbe>,
    pub cancel: CancellationToken,
}

pub const SERVANT_LOCATION: &str = "10.0.0.1:8000";
pub const SERVANT_PEER: &str = "10.0.0.1:55000";

impl TestFarm {
    pub async fn new() -> Self {
        let service = Arc::new(SchedulerService::new(test_scheduler_config()));
        service
            .heartbeat(addr(SERVANT_PEER), servant_heartbeat(SERVANT_LOCATION, GCC, 4))
            .await
            .unwrap();
        Self {
            service,
            servant: FakeServant::new(),
            cache: Arc::new(FakeCache::default()),
            probe: Arc::new(FakeProbe::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// A started dispatcher whose calls appear to come from `peer`.
    pub fn dispatcher(&self, peer: &str, config: DaemonConfig) -> Arc<TaskDispatcher> {
        let collaborators = Collaborators {
            scheduler: Arc::new(InProcessScheduler::new(self.service.clone(), addr(peer))),
            servants: Arc::new(FakeConnector(self.servant.clone())),
            cache: self.cache.clone(),
            probe: self.probe.clone(),
        };
        let dispatcher = TaskDispatcher::new(config, collaborators, self.cancel.clone());
        dispatcher.start();
        dispatcher
    }

    /// Heartbeat the servant again, reporting `running` as its task list.
    pub async fn report_running(&self, running: Vec<RunningTask>) -> Vec<u64> {
        let mut heartbeat = servant_heartbeat(SERVANT_LOCATION, GCC, 4);
        heartbeat.running_tasks = running;
        self.service
            .heartbeat(addr(SERVANT_PEER), heartbeat)
            .await
            .unwrap()
            .expired_leases
    }
}

impl Drop for TestFarm {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll `condition` until it holds or `timeout_duration` passes.
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
