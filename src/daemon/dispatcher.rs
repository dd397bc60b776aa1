use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::daemon::collaborators::{
    CacheReader, ProcessProbe, SchedulerClient, ServantClient, ServantConnector,
};
use crate::daemon::config_keeper::ConfigKeeper;
use crate::daemon::grant_keeper::GrantKeeper;
use crate::daemon::quota::TaskQuota;
use crate::daemon::run_keeper::RunKeeper;
use crate::daemon::task::{CompileTask, TaskState};
use crate::error::{BuildFarmError, Result};
use crate::protocol::{
    DistOutput, KeepTaskAliveRequest, WaitTaskStatus, EXIT_COMPILER_NOT_FOUND, EXIT_NOT_EXECUTED,
    EXIT_REMOTE_FAILED,
};
use crate::timer::spawn_periodic;

/// Pause between failed polls of a servant task.
const WAIT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Invoked once with the final output, before waiters are released.
pub type CompletionCallback = Box<dyn FnOnce(&DistOutput) + Send + 'static>;

/// External services the dispatcher talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub scheduler: Arc<dyn SchedulerClient>,
    pub servants: Arc<dyn ServantConnector>,
    pub cache: Arc<dyn CacheReader>,
    pub probe: Arc<dyn ProcessProbe>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub cache_hits: u64,
    pub joined: u64,
    pub fresh_runs: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    joined: AtomicU64,
    fresh_runs: AtomicU64,
}

struct TaskProgress {
    state: TaskState,
    output: Option<DistOutput>,
    on_completed: Option<CompletionCallback>,
    last_keep_alive: Instant,
    /// Zero while the request holds no lease of its own.
    grant_id: u64,
    servant_location: Option<SocketAddr>,
    servant_task_id: u64,
}

struct TaskDesc {
    task_id: u64,
    task: CompileTask,
    start_deadline: Instant,
    queued_at: Instant,
    aborted: AtomicBool,
    done: watch::Sender<bool>,
    progress: Mutex<TaskProgress>,
}

impl TaskDesc {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the call that actually set the flag.
    fn abort(&self) -> bool {
        !self.aborted.swap(true, Ordering::SeqCst)
    }

    async fn state(&self) -> TaskState {
        self.progress.lock().await.state
    }
}

/// Drives compile requests from queueing to a final output.
///
/// Each request is tried against the cache, then joined onto an identical
/// task already running somewhere, and only then dispatched to a freshly
/// leased servant. Four timers police the table: start deadlines, lease
/// keep-alive, requester liveness, and collection of finished requests.
pub struct TaskDispatcher {
    config: DaemonConfig,
    next_task_id: AtomicU64,
    tasks: Mutex<HashMap<u64, Arc<TaskDesc>>>,
    scheduler: Arc<dyn SchedulerClient>,
    servants: Arc<dyn ServantConnector>,
    cache: Arc<dyn CacheReader>,
    probe: Arc<dyn ProcessProbe>,
    config_keeper: Arc<ConfigKeeper>,
    run_keeper: Arc<RunKeeper>,
    grant_keeper: GrantKeeper,
    quota: Arc<TaskQuota>,
    counters: Counters,
    cancel: CancellationToken,
}

impl TaskDispatcher {
    /// Background work stops when `cancel` fires.
    pub fn new(
        config: DaemonConfig,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let Collaborators {
            scheduler,
            servants,
            cache,
            probe,
        } = collaborators;
        Arc::new(Self {
            config_keeper: Arc::new(ConfigKeeper::new(
                scheduler.clone(),
                config.scheduler_token.clone(),
            )),
            run_keeper: Arc::new(RunKeeper::new(
                scheduler.clone(),
                config.scheduler_token.clone(),
                config.run_keeper_staleness,
            )),
            grant_keeper: GrantKeeper::new(scheduler.clone(), config.clone(), cancel.clone()),
            quota: Arc::new(TaskQuota::new(config.quota.clone())),
            next_task_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            scheduler,
            servants,
            cache,
            probe,
            config,
            cancel,
        })
    }

    /// Spawn the keepers and maintenance timers.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let interval = self.config.abort_check_interval;
        vec![
            self.config_keeper
                .spawn(self.config.config_refresh, self.cancel.clone()),
            self.run_keeper
                .spawn(self.config.run_keeper_refresh, self.cancel.clone()),
            self.quota
                .spawn_reaper(self.probe.clone(), self.cancel.clone()),
            self.spawn_timer("abort-timed-out", interval, |d| async move {
                d.abort_timed_out().await;
            }),
            self.spawn_timer("keep-alive", self.config.keep_alive_interval, |d| async move {
                d.keep_alive().await;
            }),
            self.spawn_timer("abort-orphaned", interval, |d| async move {
                d.abort_orphaned().await;
            }),
            self.spawn_timer("clear-finished", interval, |d| async move {
                d.clear_finished().await;
            }),
        ]
    }

    pub fn config_keeper(&self) -> &Arc<ConfigKeeper> {
        &self.config_keeper
    }

    pub fn run_keeper(&self) -> &Arc<RunKeeper> {
        &self.run_keeper
    }

    pub fn quota(&self) -> &Arc<TaskQuota> {
        &self.quota
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            joined: self.counters.joined.load(Ordering::Relaxed),
            fresh_runs: self.counters.fresh_runs.load(Ordering::Relaxed),
        }
    }

    /// Accept a request and start working on it in the background.
    pub async fn queue_task(
        self: &Arc<Self>,
        task: CompileTask,
        start_deadline: Instant,
        on_completed: Option<CompletionCallback>,
    ) -> u64 {
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Instant::now();
        let (done, _) = watch::channel(false);
        let desc = Arc::new(TaskDesc {
            task_id,
            task,
            start_deadline,
            queued_at: now,
            aborted: AtomicBool::new(false),
            done,
            progress: Mutex::new(TaskProgress {
                state: TaskState::Pending,
                output: None,
                on_completed,
                last_keep_alive: now,
                grant_id: 0,
                servant_location: None,
                servant_task_id: 0,
            }),
        });
        self.tasks.lock().await.insert(task_id, desc.clone());
        tracing::debug!(task_id, env = %desc.task.env, "Task queued");

        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.perform_task(desc).await });
        task_id
    }

    /// Wait for a request to finish and collect its output.
    ///
    /// A collected request is forgotten; asking again yields `TaskNotFound`.
    pub async fn wait_for_task(&self, task_id: u64, timeout: Duration) -> Result<DistOutput> {
        let desc = self
            .tasks
            .lock()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(BuildFarmError::TaskNotFound(task_id))?;

        let mut done = desc.done.subscribe();
        match tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await {
            Err(_) => return Err(BuildFarmError::Timeout),
            Ok(Err(_)) => {
                return Err(BuildFarmError::Internal(format!(
                    "completion channel of task {} closed",
                    task_id
                )))
            }
            Ok(Ok(_)) => {}
        }

        self.tasks.lock().await.remove(&task_id);
        let output = desc.progress.lock().await.output.take();
        output.ok_or(BuildFarmError::TaskNotFound(task_id))
    }

    pub async fn task_state(&self, task_id: u64) -> Option<TaskState> {
        let desc = self.tasks.lock().await.get(&task_id).cloned()?;
        Some(desc.state().await)
    }

    pub async fn is_aborted(&self, task_id: u64) -> Option<bool> {
        let desc = self.tasks.lock().await.get(&task_id).cloned()?;
        Some(desc.is_aborted())
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn perform_task(self: Arc<Self>, desc: Arc<TaskDesc>) {
        let output = self.run(&desc).await;
        self.complete(&desc, output).await;
    }

    async fn run(&self, desc: &TaskDesc) -> DistOutput {
        if desc.task.cache_control {
            if let Some(hit) = self.cache.try_read(&desc.task.cache_key()).await {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(task_id = desc.task_id, "Cache hit");
                return hit.into();
            }
        }

        if let Some(output) = self.try_join_running(desc).await {
            self.counters.joined.fetch_add(1, Ordering::Relaxed);
            return output;
        }

        self.counters.fresh_runs.fetch_add(1, Ordering::Relaxed);
        self.dispatch_fresh(desc).await
    }

    /// Attach to an identical task some servant is already running.
    ///
    /// `None` means there was nothing to join, or it finished before we got
    /// there.
    async fn try_join_running(&self, desc: &TaskDesc) -> Option<DistOutput> {
        let running = self.run_keeper.try_find(&desc.task.digest()).await?;
        let token = self.config_keeper.serving_token().await;
        let servant = self.servants.connect(running.servant_location);

        if let Err(e) = servant.add_task_ref(running.servant_task_id, &token).await {
            tracing::debug!(
                task_id = desc.task_id,
                servant = %running.servant_location,
                error = %e,
                "Running task is gone, dispatching afresh"
            );
            return None;
        }

        {
            let mut progress = desc.progress.lock().await;
            progress.state = TaskState::Dispatched;
            progress.servant_location = Some(running.servant_location);
            progress.servant_task_id = running.servant_task_id;
            progress.last_keep_alive = Instant::now();
        }
        tracing::info!(
            task_id = desc.task_id,
            servant = %running.servant_location,
            servant_task_id = running.servant_task_id,
            "Joined running task"
        );

        let output = self
            .wait_servant_task(servant.as_ref(), desc, running.servant_task_id)
            .await;
        self.free_servant_task(servant.as_ref(), running.servant_task_id)
            .await;
        Some(output)
    }

    async fn dispatch_fresh(&self, desc: &TaskDesc) -> DistOutput {
        desc.progress.lock().await.state = TaskState::Ready;

        let grant = loop {
            if desc.is_aborted() {
                return DistOutput::failure(EXIT_NOT_EXECUTED, "aborted while waiting for a servant");
            }
            match self
                .grant_keeper
                .get(&desc.task.env, self.config.grant_get_timeout)
                .await
            {
                Ok(grant) => break grant,
                Err(BuildFarmError::Timeout) => continue,
                Err(e) => {
                    tracing::warn!(task_id = desc.task_id, error = %e, "Cannot obtain a servant");
                    return DistOutput::failure(EXIT_NOT_EXECUTED, e.to_string());
                }
            }
        };

        {
            let mut progress = desc.progress.lock().await;
            progress.grant_id = grant.grant_id;
            progress.servant_location = Some(grant.servant_location);
            progress.last_keep_alive = Instant::now();
        }

        let token = self.config_keeper.serving_token().await;
        let servant = self.servants.connect(grant.servant_location);
        let output = match servant
            .start_task(desc.task.start_request(&token, grant.grant_id))
            .await
        {
            Ok(servant_task_id) => {
                {
                    let mut progress = desc.progress.lock().await;
                    progress.servant_task_id = servant_task_id;
                    progress.state = TaskState::Dispatched;
                }
                tracing::info!(
                    task_id = desc.task_id,
                    servant = %grant.servant_location,
                    servant_task_id,
                    "Task dispatched"
                );
                let output = self
                    .wait_servant_task(servant.as_ref(), desc, servant_task_id)
                    .await;
                self.free_servant_task(servant.as_ref(), servant_task_id)
                    .await;
                output
            }
            Err(e) => {
                tracing::warn!(
                    task_id = desc.task_id,
                    servant = %grant.servant_location,
                    error = %e,
                    "Failed to start task on servant"
                );
                desc.abort();
                DistOutput::failure(EXIT_NOT_EXECUTED, format!("failed to start task: {}", e))
            }
        };

        self.grant_keeper.free(grant.grant_id).await;
        output
    }

    /// Poll the servant until the task finishes, retrying transport errors.
    ///
    /// "Still running" restores the retry budget; only consecutive failures
    /// use it up.
    async fn wait_servant_task(
        &self,
        servant: &dyn ServantClient,
        desc: &TaskDesc,
        servant_task_id: u64,
    ) -> DistOutput {
        let token = self.config_keeper.serving_token().await;
        let mut retries_left = self.config.wait_retries;

        while retries_left > 0 && !desc.is_aborted() {
            match servant
                .wait_for_task(servant_task_id, self.config.wait_for_task_budget, &token)
                .await
            {
                Ok(WaitTaskStatus::Running) => retries_left = self.config.wait_retries,
                Ok(WaitTaskStatus::Done(output)) => {
                    if output.exit_code == EXIT_COMPILER_NOT_FOUND {
                        tracing::warn!(
                            task_id = desc.task_id,
                            env = %desc.task.env,
                            "Compiler not found on servant"
                        );
                    }
                    return output;
                }
                Ok(WaitTaskStatus::Failed) | Ok(WaitTaskStatus::NotFound) => {
                    tracing::warn!(task_id = desc.task_id, servant_task_id, "Servant lost the task");
                    return DistOutput::failure(EXIT_REMOTE_FAILED, "servant failed to run the task");
                }
                Err(e) => {
                    retries_left -= 1;
                    tracing::warn!(
                        task_id = desc.task_id,
                        servant_task_id,
                        retries_left,
                        error = %e,
                        "Failed to wait for servant task"
                    );
                    if retries_left > 0 {
                        tokio::time::sleep(WAIT_RETRY_DELAY).await;
                    }
                }
            }
        }

        if desc.is_aborted() {
            DistOutput::failure(EXIT_NOT_EXECUTED, "aborted")
        } else {
            DistOutput::failure(EXIT_NOT_EXECUTED, "gave up waiting for servant")
        }
    }

    async fn free_servant_task(&self, servant: &dyn ServantClient, servant_task_id: u64) {
        let token = self.config_keeper.serving_token().await;
        if let Err(e) = servant.free_task(servant_task_id, &token).await {
            tracing::warn!(servant_task_id, error = %e, "Failed to free servant task");
        }
    }

    async fn complete(&self, desc: &TaskDesc, output: DistOutput) {
        let callback = desc.progress.lock().await.on_completed.take();
        if let Some(callback) = callback {
            callback(&output);
        }

        tracing::info!(
            task_id = desc.task_id,
            exit_code = output.exit_code,
            elapsed_ms = desc.queued_at.elapsed().as_millis() as u64,
            "Task completed"
        );
        {
            let mut progress = desc.progress.lock().await;
            progress.output = Some(output);
            progress.state = TaskState::Done;
        }
        desc.done.send_replace(true);
    }

    async fn snapshot(&self) -> Vec<Arc<TaskDesc>> {
        self.tasks.lock().await.values().cloned().collect()
    }

    /// Abort unfinished requests past their start deadline.
    pub async fn abort_timed_out(&self) -> usize {
        let now = Instant::now();
        let mut aborted = 0;
        for desc in self.snapshot().await {
            if desc.start_deadline < now && desc.state().await != TaskState::Done && desc.abort() {
                tracing::warn!(task_id = desc.task_id, "Task missed its deadline, aborting");
                aborted += 1;
            }
        }
        aborted
    }

    /// Renew the leases of in-flight requests in one batch.
    ///
    /// Requests that have gone unrenewed longer than the grace window are
    /// aborted instead.
    pub async fn keep_alive(&self) {
        let now = Instant::now();
        let mut renewing: Vec<(Arc<TaskDesc>, u64)> = Vec::new();

        for desc in self.snapshot().await {
            if desc.is_aborted() {
                continue;
            }
            let mut progress = desc.progress.lock().await;
            if matches!(progress.state, TaskState::Pending | TaskState::Done) {
                continue;
            }
            if now.saturating_duration_since(progress.last_keep_alive) > self.config.keep_alive_grace
            {
                tracing::warn!(
                    task_id = desc.task_id,
                    servant = ?progress.servant_location,
                    servant_task_id = progress.servant_task_id,
                    "Lease not renewed in time, aborting"
                );
                drop(progress);
                desc.abort();
                continue;
            }
            if progress.grant_id == 0 {
                // Nothing to renew: still waiting for a grant, or riding on
                // someone else's task.
                progress.last_keep_alive = now;
                continue;
            }
            renewing.push((desc.clone(), progress.grant_id));
        }

        if renewing.is_empty() {
            return;
        }

        let req = KeepTaskAliveRequest {
            token: self.config.scheduler_token.clone(),
            lease_ids: renewing.iter().map(|(_, grant_id)| *grant_id).collect(),
            ttl: self.config.keep_alive_ttl,
        };
        match self.scheduler.keep_task_alive(req).await {
            Ok(statuses) if statuses.len() == renewing.len() => {
                let renewed_at = Instant::now();
                for ((desc, grant_id), renewed) in renewing.iter().zip(statuses) {
                    if renewed {
                        desc.progress.lock().await.last_keep_alive = renewed_at;
                    } else {
                        tracing::warn!(task_id = desc.task_id, grant_id, "Scheduler refused to renew lease");
                    }
                }
            }
            Ok(statuses) => tracing::warn!(
                expected = renewing.len(),
                got = statuses.len(),
                "Malformed keep-alive response"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to renew leases"),
        }
    }

    /// Abort requests whose requesting process has exited.
    pub async fn abort_orphaned(&self) -> usize {
        let mut aborted = 0;
        for desc in self.snapshot().await {
            if desc.is_aborted() || desc.state().await == TaskState::Done {
                continue;
            }
            let pid = desc.task.requester_pid;
            if !self.probe.is_process_alive(pid) && desc.abort() {
                tracing::warn!(task_id = desc.task_id, pid, "Requester exited, aborting");
                aborted += 1;
            }
        }
        aborted
    }

    /// Forget finished requests nobody is going to collect.
    pub async fn clear_finished(&self) -> usize {
        let now = Instant::now();
        let mut stale = Vec::new();
        for desc in self.snapshot().await {
            if desc.state().await != TaskState::Done {
                continue;
            }
            if desc.is_aborted() || desc.start_deadline + self.config.uncollected_grace < now {
                stale.push(desc.task_id);
            }
        }
        if stale.is_empty() {
            return 0;
        }

        let mut tasks = self.tasks.lock().await;
        for task_id in &stale {
            tasks.remove(task_id);
        }
        tracing::debug!(tasks = ?stale, "Dropped uncollected tasks");
        stale.len()
    }

    fn spawn_timer<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, f: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dispatcher = self.clone();
        spawn_periodic(name, period, self.cancel.clone(), move || f(dispatcher.clone()))
    }
}
