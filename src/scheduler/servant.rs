use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::protocol::{EnvironmentDesc, ServantPriority};

/// What a servant told us about itself in its latest heartbeat.
#[derive(Debug, Clone)]
pub struct ServantInfo {
    pub version: u32,
    /// Address we saw the heartbeat come from, with the reported port.
    pub observed_location: SocketAddr,
    pub reported_location: SocketAddr,
    pub environments: Vec<EnvironmentDesc>,
    pub num_cpu_cores: usize,
    pub current_load: usize,
    pub total_memory: u64,
    pub avail_memory: u64,
    /// Maximum simultaneous tasks. Zero means "do not send me work".
    pub concurrency: usize,
    pub priority: ServantPriority,
}

impl ServantInfo {
    pub fn has_environment(&self, env: &EnvironmentDesc) -> bool {
        self.environments.iter().any(|e| e == env)
    }

    /// True when the servant sits behind NAT or misreports its address.
    pub fn is_address_mismatched(&self) -> bool {
        self.observed_location != self.reported_location
    }
}

#[derive(Debug, Clone)]
pub struct Servant {
    pub info: ServantInfo,
    pub discovered_at: DateTime<Utc>,
    pub expires_at: Instant,
    /// Leases currently charged against this servant.
    pub running: usize,
    /// Leases ever granted to this servant.
    pub ever_assigned: u64,
}

impl Servant {
    fn new(info: ServantInfo, expires_at: Instant) -> Self {
        Self {
            info,
            discovered_at: Utc::now(),
            expires_at,
            running: 0,
            ever_assigned: 0,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at < now
    }

    /// How many tasks this servant could be running right now.
    ///
    /// Load reported by the servant includes our own tasks, so those are
    /// subtracted before comparing against its core count. A servant short
    /// on memory is capped at what it is already running.
    pub fn capacity(&self, min_memory_for_new_task: u64) -> usize {
        let info = &self.info;
        if info.total_memory != 0 && info.avail_memory < min_memory_for_new_task {
            return self.running;
        }
        let foreign_load = info.current_load.saturating_sub(self.running);
        let idle_cores = info.num_cpu_cores.saturating_sub(foreign_load);
        info.concurrency.min(idle_cores)
    }

    pub fn has_free_capacity(&self, min_memory_for_new_task: u64) -> bool {
        self.running < self.capacity(min_memory_for_new_task)
    }

    pub fn utilization(&self) -> f64 {
        if self.info.concurrency == 0 {
            return f64::INFINITY;
        }
        self.running as f64 / self.info.concurrency as f64
    }

    pub fn ip(&self) -> IpAddr {
        self.info.observed_location.ip()
    }
}

/// Live servants keyed by observed location.
#[derive(Debug, Default)]
pub struct ServantRegistry {
    servants: HashMap<SocketAddr, Servant>,
}

impl ServantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a servant. Returns `true` if it was not known before.
    ///
    /// Lease counters survive a refresh; only the self-reported facts and the
    /// expiry move.
    pub fn keep_alive(&mut self, info: ServantInfo, ttl: Duration, now: Instant) -> bool {
        let location = info.observed_location;
        let expires_at = now + ttl;
        match self.servants.get_mut(&location) {
            Some(servant) => {
                servant.info = info;
                servant.expires_at = expires_at;
                false
            }
            None => {
                if info.is_address_mismatched() {
                    tracing::warn!(
                        observed = %location,
                        reported = %info.reported_location,
                        "Servant is behind NAT, it will not be assigned tasks"
                    );
                }
                tracing::info!(
                    location = %location,
                    priority = %info.priority,
                    concurrency = info.concurrency,
                    "Discovered new servant"
                );
                self.servants.insert(location, Servant::new(info, expires_at));
                true
            }
        }
    }

    pub fn get(&self, location: &SocketAddr) -> Option<&Servant> {
        self.servants.get(location)
    }

    pub fn get_mut(&mut self, location: &SocketAddr) -> Option<&mut Servant> {
        self.servants.get_mut(location)
    }

    pub fn remove(&mut self, location: &SocketAddr) -> Option<Servant> {
        self.servants.remove(location)
    }

    pub fn expired(&self, now: Instant) -> Vec<SocketAddr> {
        self.servants
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(location, _)| *location)
            .collect()
    }

    /// Servants that could ever run a task for `env` at `min_version`.
    pub fn eligible(&self, env: &EnvironmentDesc, min_version: u32) -> Vec<SocketAddr> {
        self.servants
            .iter()
            .filter(|(_, s)| {
                s.info.concurrency > 0
                    && s.info.version >= min_version
                    && s.info.has_environment(env)
            })
            .map(|(location, _)| *location)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Servant> {
        self.servants.values()
    }

    pub fn len(&self) -> usize {
        self.servants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servants.is_empty()
    }
}
