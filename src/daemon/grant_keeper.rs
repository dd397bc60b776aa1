use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::daemon::collaborators::SchedulerClient;
use crate::error::{BuildFarmError, Result};
use crate::protocol::{EnvironmentDesc, FreeTaskRequest, WaitForStartingTaskRequest};

const FETCH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A lease held locally, trusted until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDesc {
    pub grant_id: u64,
    pub servant_location: SocketAddr,
    pub expires_at: Instant,
}

#[derive(Default)]
struct EnvState {
    remaining: VecDeque<GrantDesc>,
    /// Set when the scheduler says nobody has this environment.
    fetch_error: Option<BuildFarmError>,
}

struct EnvGrantKeeper {
    env: EnvironmentDesc,
    /// Callers blocked in `get`. Kept outside the lock so a dropped `get`
    /// can deregister without awaiting.
    waiters: AtomicUsize,
    state: Mutex<EnvState>,
    available: Notify,
    need_more: Notify,
}

/// Per-environment grant cache in front of the scheduler.
///
/// Each environment gets one background fetcher with at most one request in
/// flight, asking for as many grants as there are local waiters plus a small
/// prefetch.
pub struct GrantKeeper {
    scheduler: Arc<dyn SchedulerClient>,
    config: DaemonConfig,
    cancel: CancellationToken,
    keepers: Mutex<HashMap<EnvironmentDesc, Arc<EnvGrantKeeper>>>,
}

impl GrantKeeper {
    /// Fetchers stop when `cancel` fires.
    pub fn new(
        scheduler: Arc<dyn SchedulerClient>,
        config: DaemonConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            config,
            cancel,
            keepers: Mutex::new(HashMap::new()),
        }
    }

    /// Take a grant for `env`, waiting up to `timeout` for one to arrive.
    pub async fn get(&self, env: &EnvironmentDesc, timeout: Duration) -> Result<GrantDesc> {
        let keeper = self.keeper_for(env).await;
        let deadline = Instant::now() + timeout;
        let mut waiting = None;
        let mut expired = Vec::new();

        let result = loop {
            let available = keeper.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut state = keeper.state.lock().await;
                let now = Instant::now();
                while let Some(stale) = state.remaining.pop_front() {
                    if stale.expires_at >= now {
                        state.remaining.push_front(stale);
                        break;
                    }
                    expired.push(stale.grant_id);
                }
                if let Some(grant) = state.remaining.pop_front() {
                    if state.remaining.is_empty() {
                        keeper.need_more.notify_one();
                    }
                    break Ok(grant);
                }
                if waiting.is_some() {
                    if let Some(e) = state.fetch_error.clone() {
                        break Err(e);
                    }
                } else {
                    state.fetch_error = None;
                    waiting = Some(WaiterGuard::register(&keeper.waiters));
                }
            }

            keeper.need_more.notify_one();
            if tokio::time::timeout_at(deadline, available).await.is_err() {
                break Err(BuildFarmError::Timeout);
            }
        };

        drop(waiting);
        if !expired.is_empty() {
            tracing::debug!(grants = ?expired, env = %env, "Dropping expired grants");
            self.free_many(expired).await;
        }
        result
    }

    /// Return a grant to the scheduler. Failures are logged; the lease then
    /// expires on its own.
    pub async fn free(&self, grant_id: u64) {
        self.free_many(vec![grant_id]).await;
    }

    async fn free_many(&self, lease_ids: Vec<u64>) {
        let req = FreeTaskRequest {
            token: self.config.scheduler_token.clone(),
            lease_ids,
        };
        if let Err(e) = self.scheduler.free_task(req).await {
            tracing::warn!(error = %e, "Failed to free grants");
        }
    }

    async fn keeper_for(&self, env: &EnvironmentDesc) -> Arc<EnvGrantKeeper> {
        let mut keepers = self.keepers.lock().await;
        if let Some(keeper) = keepers.get(env) {
            return keeper.clone();
        }

        let keeper = Arc::new(EnvGrantKeeper {
            env: env.clone(),
            waiters: AtomicUsize::new(0),
            state: Mutex::new(EnvState::default()),
            available: Notify::new(),
            need_more: Notify::new(),
        });
        keepers.insert(env.clone(), keeper.clone());
        tracing::debug!(env = %env, "Starting grant fetcher");
        tokio::spawn(fetch_grants(
            self.scheduler.clone(),
            self.config.clone(),
            keeper.clone(),
            self.cancel.clone(),
        ));
        keeper
    }
}

/// Counts one blocked `get` for as long as it lives.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn register(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::SeqCst);
        Self(waiters)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn fetch_grants(
    scheduler: Arc<dyn SchedulerClient>,
    config: DaemonConfig,
    keeper: Arc<EnvGrantKeeper>,
    cancel: CancellationToken,
) {
    loop {
        // Idle while grants are on hand, or after the environment turned out
        // to be missing and nobody is asking anymore.
        loop {
            {
                let state = keeper.state.lock().await;
                let waiters = keeper.waiters.load(Ordering::SeqCst);
                if state.remaining.is_empty() && (waiters > 0 || state.fetch_error.is_none()) {
                    break;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = keeper.need_more.notified() => {}
            }
        }

        let waiters = keeper.waiters.load(Ordering::SeqCst);
        let req = WaitForStartingTaskRequest {
            token: config.scheduler_token.clone(),
            env: keeper.env.clone(),
            min_version: config.version,
            immediate: u32::try_from(waiters).unwrap_or(u32::MAX),
            prefetch: config.prefetch_grants,
            lease_ttl: config.lease_ttl,
            wait_budget: config.grant_fetch_wait,
        };
        let requested_at = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = scheduler.wait_for_starting_task(req) => result,
        };

        match result {
            Ok(grants) => {
                let expires_at = requested_at + config.grant_trust_horizon();
                {
                    let mut state = keeper.state.lock().await;
                    state.fetch_error = None;
                    state.remaining.extend(grants.into_iter().map(|g| GrantDesc {
                        grant_id: g.grant_id,
                        servant_location: g.servant_location,
                        expires_at,
                    }));
                }
                keeper.available.notify_waiters();
            }
            Err(e) => {
                match &e {
                    BuildFarmError::EnvironmentNotFound(_) => {
                        tracing::warn!(env = %keeper.env, "No servant offers this environment");
                        keeper.state.lock().await.fetch_error = Some(e);
                        keeper.available.notify_waiters();
                    }
                    BuildFarmError::ResourceExhausted | BuildFarmError::Timeout => {
                        tracing::debug!(env = %keeper.env, "No capacity available yet");
                    }
                    _ => tracing::warn!(env = %keeper.env, error = %e, "Failed to fetch grants"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(FETCH_RETRY_DELAY) => {}
                }
            }
        }
    }
}
