use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::{BuildFarmError, Result};
use crate::protocol::{EnvironmentDesc, RunningTask, ServantPriority, TaskGrant};
use crate::scheduler::bookkeeper::RunningTaskBookkeeper;
use crate::scheduler::lease::Lease;
use crate::scheduler::servant::{Servant, ServantInfo, ServantRegistry};

/// What a lease is being requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Daemon asking for the lease. A servant on the same host is only used
    /// when nothing else is free.
    pub requester: Option<SocketAddr>,
    pub env: EnvironmentDesc,
    pub min_version: u32,
}

/// Outcome of one registry sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_servants: Vec<SocketAddr>,
    pub freed_leases: Vec<u64>,
    pub new_zombies: Vec<u64>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    servants: ServantRegistry,
    leases: HashMap<u64, Lease>,
    next_lease_id: u64,
}

impl AllocatorState {
    fn issue_lease(
        &mut self,
        location: SocketAddr,
        task: &TaskInfo,
        prefetch: bool,
        ttl: Duration,
        now: Instant,
    ) -> Option<TaskGrant> {
        let servant = self.servants.get_mut(&location)?;
        servant.running += 1;
        servant.ever_assigned += 1;
        self.next_lease_id += 1;
        let id = self.next_lease_id;
        self.leases
            .insert(id, Lease::new(id, location, task.clone(), prefetch, ttl, now));
        Some(TaskGrant {
            grant_id: id,
            servant_location: location,
        })
    }

    /// Drop a lease and release its slot. `false` if the id is unknown.
    fn free_lease(&mut self, id: u64) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        if let Some(servant) = self.servants.get_mut(&lease.servant) {
            servant.running = servant.running.saturating_sub(1);
        }
        true
    }

    fn leases_of(&self, servant: SocketAddr) -> impl Iterator<Item = &Lease> {
        self.leases.values().filter(move |l| l.servant == servant)
    }
}

/// Servant registry plus lease table, behind one lock.
///
/// Callers that find no free capacity park on `capacity_changed` until a
/// heartbeat or a free wakes them, or their deadline passes.
pub struct LeaseAllocator {
    state: Mutex<AllocatorState>,
    capacity_changed: Notify,
    bookkeeper: RunningTaskBookkeeper,
    min_memory_for_new_task: u64,
    unreported_lease_grace: Duration,
}

impl LeaseAllocator {
    pub fn new(min_memory_for_new_task: u64, unreported_lease_grace: Duration) -> Self {
        Self {
            state: Mutex::new(AllocatorState::default()),
            capacity_changed: Notify::new(),
            bookkeeper: RunningTaskBookkeeper::new(),
            min_memory_for_new_task,
            unreported_lease_grace,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.min_memory_for_new_task, config.unreported_lease_grace)
    }

    pub fn min_memory_for_new_task(&self) -> u64 {
        self.min_memory_for_new_task
    }

    pub fn bookkeeper(&self) -> &RunningTaskBookkeeper {
        &self.bookkeeper
    }

    /// Upsert a servant. Returns `true` when it was newly discovered.
    pub async fn keep_servant_alive(&self, info: ServantInfo, ttl: Duration) -> bool {
        let discovered = self
            .state
            .lock()
            .await
            .servants
            .keep_alive(info, ttl, Instant::now());
        self.capacity_changed.notify_waiters();
        discovered
    }

    /// Lease one slot on a servant able to run `task`.
    ///
    /// Fails immediately with `EnvironmentNotFound` when no servant could
    /// ever take the task, and with `Timeout` when the eligible ones stay
    /// full until `deadline`.
    pub async fn request_lease(
        &self,
        task: &TaskInfo,
        lease_ttl: Duration,
        deadline: Instant,
        prefetch: bool,
    ) -> Result<TaskGrant> {
        loop {
            let changed = self.capacity_changed.notified();
            tokio::pin!(changed);
            // Register before inspecting state so a free between the check and
            // the wait is not lost.
            changed.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let eligible = state.servants.eligible(&task.env, task.min_version);
                if eligible.is_empty() {
                    return Err(BuildFarmError::EnvironmentNotFound(
                        task.env.compiler_digest.clone(),
                    ));
                }

                let free: Vec<SocketAddr> = eligible
                    .into_iter()
                    .filter(|location| {
                        state
                            .servants
                            .get(location)
                            .is_some_and(|s| s.has_free_capacity(self.min_memory_for_new_task))
                    })
                    .collect();
                let requester_ip = task.requester.map(|r| r.ip());
                if let Some(picked) = pick_servant(&state.servants, free, requester_ip) {
                    if let Some(grant) =
                        state.issue_lease(picked, task, prefetch, lease_ttl, Instant::now())
                    {
                        tracing::debug!(
                            lease_id = grant.grant_id,
                            servant = %picked,
                            env = %task.env,
                            prefetch,
                            "Lease granted"
                        );
                        return Ok(grant);
                    }
                }
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Err(BuildFarmError::Timeout);
            }
        }
    }

    /// Extend one lease. Unknown and zombie leases are refused.
    pub async fn renew_lease(&self, lease_id: u64, ttl: Duration) -> bool {
        let mut state = self.state.lock().await;
        renew_locked(&mut state, lease_id, ttl, Instant::now())
    }

    pub async fn renew_leases(&self, lease_ids: &[u64], ttl: Duration) -> Vec<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        lease_ids
            .iter()
            .map(|&id| renew_locked(&mut state, id, ttl, now))
            .collect()
    }

    /// Release leases. Unknown ids are logged and skipped.
    pub async fn free_leases(&self, lease_ids: &[u64]) {
        let mut freed = 0usize;
        {
            let mut state = self.state.lock().await;
            for &id in lease_ids {
                if state.free_lease(id) {
                    freed += 1;
                } else {
                    tracing::warn!(lease_id = id, "Freeing unknown lease");
                }
            }
        }
        if freed > 0 {
            self.capacity_changed.notify_waiters();
        }
    }

    /// Reconcile leases against the full set of tasks a servant says it is
    /// running, and record that set for duplicate lookups.
    ///
    /// Zombie and expired leases of the servant are reclaimed, as are leases
    /// the servant has not reported for longer than the unreported grace.
    /// Returns the lease ids the servant reported that no longer exist; the
    /// servant should kill those tasks.
    pub async fn notify_running_tasks(
        &self,
        servant: SocketAddr,
        tasks: Vec<RunningTask>,
    ) -> Vec<u64> {
        let now = Instant::now();
        let reported: HashSet<u64> = tasks.iter().map(|t| t.lease_id).collect();

        let (reclaimed, permitted) = {
            let mut state = self.state.lock().await;
            if state.servants.get(&servant).is_none() {
                drop(state);
                self.bookkeeper.drop_servant(&servant).await;
                return tasks.into_iter().map(|t| t.lease_id).collect();
            }

            let reclaimed: Vec<u64> = state
                .leases_of(servant)
                .filter(|l| {
                    l.zombie
                        || l.is_expired(now)
                        // A fresh lease may not have reached the servant yet.
                        || (!reported.contains(&l.id) && l.age(now) > self.unreported_lease_grace)
                })
                .map(|l| l.id)
                .collect();
            for &id in &reclaimed {
                state.free_lease(id);
            }
            let permitted: HashSet<u64> = state.leases_of(servant).map(|l| l.id).collect();
            (reclaimed, permitted)
        };

        if !reclaimed.is_empty() {
            tracing::info!(
                servant = %servant,
                leases = ?reclaimed,
                "Reclaimed leases from servant report"
            );
            self.capacity_changed.notify_waiters();
        }

        let (kept, unknown): (Vec<RunningTask>, Vec<RunningTask>) = tasks
            .into_iter()
            .partition(|t| permitted.contains(&t.lease_id));
        self.bookkeeper
            .set_servant_running_tasks(servant, kept)
            .await;
        unknown.into_iter().map(|t| t.lease_id).collect()
    }

    /// Drop expired servants together with their leases, then mark leases
    /// past their own expiry as zombies.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let report = {
            let mut state = self.state.lock().await;
            let removed_servants = state.servants.expired(now);
            let gone: HashSet<SocketAddr> = removed_servants.iter().copied().collect();

            let freed_leases: Vec<u64> = state
                .leases
                .values()
                .filter(|l| gone.contains(&l.servant))
                .map(|l| l.id)
                .collect();
            for &id in &freed_leases {
                state.free_lease(id);
            }
            for location in &removed_servants {
                state.servants.remove(location);
                tracing::info!(servant = %location, "Servant expired");
            }

            let mut new_zombies = Vec::new();
            for lease in state.leases.values_mut() {
                if !lease.zombie && lease.is_expired(now) {
                    lease.zombie = true;
                    new_zombies.push(lease.id);
                }
            }
            SweepReport {
                removed_servants,
                freed_leases,
                new_zombies,
            }
        };

        for location in &report.removed_servants {
            self.bookkeeper.drop_servant(location).await;
        }
        if !report.new_zombies.is_empty() {
            tracing::info!(leases = ?report.new_zombies, "Leases expired without renewal");
        }
        if !report.freed_leases.is_empty() {
            self.capacity_changed.notify_waiters();
        }
        report
    }

    pub async fn servants(&self) -> Vec<Servant> {
        self.state.lock().await.servants.iter().cloned().collect()
    }

    pub async fn servant(&self, location: &SocketAddr) -> Option<Servant> {
        self.state.lock().await.servants.get(location).cloned()
    }

    pub async fn leases(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.state.lock().await.leases.values().cloned().collect();
        leases.sort_by_key(|l| l.id);
        leases
    }

    pub async fn lease(&self, lease_id: u64) -> Option<Lease> {
        self.state.lock().await.leases.get(&lease_id).cloned()
    }
}

fn renew_locked(state: &mut AllocatorState, lease_id: u64, ttl: Duration, now: Instant) -> bool {
    match state.leases.get_mut(&lease_id) {
        None => {
            tracing::warn!(lease_id, "Renewing unknown lease");
            false
        }
        Some(lease) if lease.zombie => {
            tracing::warn!(lease_id, "Renewing zombie lease");
            false
        }
        Some(lease) => {
            lease.expires_at = now + ttl;
            true
        }
    }
}

/// Choose among servants with free capacity.
///
/// A servant on the requester's own host is set aside and used last.
/// Dedicated servants that are less than half busy win next, then whatever
/// is least utilized.
fn pick_servant(
    servants: &ServantRegistry,
    mut free: Vec<SocketAddr>,
    requester_ip: Option<IpAddr>,
) -> Option<SocketAddr> {
    let self_servant = requester_ip
        .and_then(|ip| free.iter().position(|l| l.ip() == ip))
        .map(|i| free.swap_remove(i));

    let candidates: Vec<&Servant> = free.iter().filter_map(|l| servants.get(l)).collect();
    let roomy_dedicated = candidates.iter().copied().filter(|s| {
        s.info.priority == ServantPriority::Dedicated && s.info.concurrency > 2 * s.running
    });

    least_utilized(roomy_dedicated)
        .or_else(|| least_utilized(candidates.iter().copied()))
        .or(self_servant)
}

fn least_utilized<'a>(servants: impl Iterator<Item = &'a Servant>) -> Option<SocketAddr> {
    servants
        .min_by(|a, b| {
            a.utilization()
                .total_cmp(&b.utilization())
                .then_with(|| a.info.observed_location.cmp(&b.info.observed_location))
        })
        .map(|s| s.info.observed_location)
}
