use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{RotatingTokens, TokenVerifier};
use crate::config::SchedulerConfig;
use crate::error::{BuildFarmError, Result};
use crate::protocol::{
    FreeTaskRequest, HeartbeatRequest, HeartbeatResponse, KeepTaskAliveRequest, RunningTask,
    ServantPriority, TaskGrant, WaitForStartingTaskRequest,
};
use crate::scheduler::allocator::{LeaseAllocator, TaskInfo};
use crate::scheduler::servant::ServantInfo;
use crate::timer::spawn_periodic;

/// Entry points an RPC layer forwards scheduler calls to.
///
/// `peer` arguments are the address the call actually arrived from, as seen
/// by the transport.
pub struct SchedulerService {
    config: SchedulerConfig,
    allocator: Arc<LeaseAllocator>,
    user_tokens: TokenVerifier,
    servant_tokens: TokenVerifier,
    daemon_tokens: RotatingTokens,
}

impl SchedulerService {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            allocator: Arc::new(LeaseAllocator::from_config(&config)),
            user_tokens: TokenVerifier::new(config.tokens.user_tokens.clone()),
            servant_tokens: TokenVerifier::new(config.tokens.servant_tokens.clone()),
            daemon_tokens: RotatingTokens::new(config.tokens.rollout_interval),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<LeaseAllocator> {
        &self.allocator
    }

    /// Start the registry sweep on `sweep_interval`.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let allocator = self.allocator.clone();
        spawn_periodic("servant-sweep", self.config.sweep_interval, cancel, move || {
            let allocator = allocator.clone();
            async move {
                allocator.sweep().await;
            }
        })
    }

    pub async fn heartbeat(
        &self,
        peer: SocketAddr,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        let is_servant = self.servant_tokens.verify(&req.token);
        if !is_servant && !self.user_tokens.verify(&req.token) {
            return Err(BuildFarmError::PermissionDenied(
                "heartbeat token not recognized".to_string(),
            ));
        }
        if req.version < self.config.min_daemon_version {
            return Err(BuildFarmError::InvalidArgument(format!(
                "version {} is older than the minimum {}",
                req.version, self.config.min_daemon_version
            )));
        }
        if req.next_heartbeat_in > self.config.max_heartbeat_ttl {
            return Err(BuildFarmError::InvalidArgument(format!(
                "heartbeat interval {:?} exceeds {:?}",
                req.next_heartbeat_in, self.config.max_heartbeat_ttl
            )));
        }
        let reported: SocketAddr = req.location.parse().map_err(|_| {
            BuildFarmError::InvalidArgument(format!("malformed location {:?}", req.location))
        })?;
        let observed = SocketAddr::new(peer.ip(), reported.port());

        // Only servants we can reach, that authenticated as servants and that
        // promise another heartbeat get work.
        let accepts_work =
            observed == reported && is_servant && !req.next_heartbeat_in.is_zero();
        let concurrency = if accepts_work { req.concurrency } else { 0 };
        let num_cpu_cores = if req.num_cpu_cores == 0 {
            req.concurrency
        } else {
            req.num_cpu_cores
        };

        let info = ServantInfo {
            version: req.version,
            observed_location: observed,
            reported_location: reported,
            environments: req.environments,
            num_cpu_cores,
            current_load: req.current_load,
            total_memory: req.total_memory,
            avail_memory: req.avail_memory,
            concurrency,
            priority: req.priority.unwrap_or(ServantPriority::User),
        };
        self.allocator
            .keep_servant_alive(info, req.next_heartbeat_in)
            .await;

        // Daemons join running tasks at the address we can reach.
        let running: Vec<RunningTask> = req
            .running_tasks
            .into_iter()
            .map(|t| RunningTask {
                servant_location: observed,
                ..t
            })
            .collect();
        let expired_leases = self.allocator.notify_running_tasks(observed, running).await;

        Ok(HeartbeatResponse {
            tokens: self.daemon_tokens.active().await,
            expired_leases,
        })
    }

    /// Daemon token to present to servants.
    pub async fn get_config(&self, token: &str) -> Result<String> {
        self.check_user_token(token)?;
        Ok(self.daemon_tokens.serving().await)
    }

    /// Whether a servant should accept `token` on a task call.
    pub async fn is_daemon_token_valid(&self, token: &str) -> bool {
        self.daemon_tokens.verify(token).await
    }

    /// Grant up to `immediate + prefetch` leases.
    ///
    /// Only the first immediate grant may wait for capacity; the rest are
    /// taken only if already free. Prefetch grants wait only when nothing was
    /// granted yet.
    pub async fn wait_for_starting_task(
        &self,
        peer: SocketAddr,
        req: WaitForStartingTaskRequest,
    ) -> Result<Vec<TaskGrant>> {
        self.check_user_token(&req.token)?;
        if req.wait_budget > self.config.max_wait_budget {
            return Err(BuildFarmError::InvalidArgument(format!(
                "wait budget {:?} exceeds {:?}",
                req.wait_budget, self.config.max_wait_budget
            )));
        }
        if req.lease_ttl > self.config.max_lease_ttl {
            return Err(BuildFarmError::InvalidArgument(format!(
                "lease ttl {:?} exceeds {:?}",
                req.lease_ttl, self.config.max_lease_ttl
            )));
        }

        let task = TaskInfo {
            requester: Some(peer),
            env: req.env,
            min_version: req.min_version,
        };
        let deadline = Instant::now() + req.wait_budget;
        let mut grants = Vec::new();

        for i in 0..req.immediate {
            let wait_until = if i == 0 { deadline } else { Instant::now() };
            match self
                .allocator
                .request_lease(&task, req.lease_ttl, wait_until, false)
                .await
            {
                Ok(grant) => grants.push(grant),
                Err(e @ BuildFarmError::EnvironmentNotFound(_)) => {
                    self.release(&grants).await;
                    return Err(e);
                }
                Err(_) => break,
            }
        }

        for _ in 0..req.prefetch {
            let wait_until = if grants.is_empty() {
                deadline
            } else {
                Instant::now()
            };
            match self
                .allocator
                .request_lease(&task, req.lease_ttl, wait_until, true)
                .await
            {
                Ok(grant) => grants.push(grant),
                Err(e @ BuildFarmError::EnvironmentNotFound(_)) if grants.is_empty() => {
                    return Err(e);
                }
                Err(_) => break,
            }
        }

        if grants.is_empty() {
            return Err(BuildFarmError::ResourceExhausted);
        }
        Ok(grants)
    }

    pub async fn keep_task_alive(&self, req: KeepTaskAliveRequest) -> Result<Vec<bool>> {
        self.check_user_token(&req.token)?;
        if req.ttl > self.config.max_lease_ttl {
            return Err(BuildFarmError::InvalidArgument(format!(
                "lease ttl {:?} exceeds {:?}",
                req.ttl, self.config.max_lease_ttl
            )));
        }
        Ok(self.allocator.renew_leases(&req.lease_ids, req.ttl).await)
    }

    pub async fn free_task(&self, req: FreeTaskRequest) -> Result<()> {
        self.check_user_token(&req.token)?;
        self.allocator.free_leases(&req.lease_ids).await;
        Ok(())
    }

    pub async fn get_running_tasks(&self, token: &str) -> Result<Vec<RunningTask>> {
        self.check_user_token(token)?;
        Ok(self.allocator.bookkeeper().running_tasks().await)
    }

    async fn release(&self, grants: &[TaskGrant]) {
        if grants.is_empty() {
            return;
        }
        let ids: Vec<u64> = grants.iter().map(|g| g.grant_id).collect();
        self.allocator.free_leases(&ids).await;
    }

    fn check_user_token(&self, token: &str) -> Result<()> {
        if self.user_tokens.verify(token) {
            Ok(())
        } else {
            Err(BuildFarmError::PermissionDenied(
                "user token not recognized".to_string(),
            ))
        }
    }
}
