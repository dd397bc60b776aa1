use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::scheduler::allocator::TaskInfo;

/// A grant of one execution slot on one servant.
///
/// The servant is referenced by its registry key. A lease never outlives its
/// servant: the sweep frees every lease of an expired servant in the same
/// critical section that removes it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: u64,
    pub servant: SocketAddr,
    pub task: TaskInfo,
    /// Requested ahead of need by a daemon's grant keeper.
    pub prefetch: bool,
    pub granted_at: Instant,
    pub expires_at: Instant,
    /// Set once the lease outlived its TTL without renewal. A zombie is still
    /// charged to its servant until the servant stops reporting it.
    pub zombie: bool,
}

impl Lease {
    pub fn new(
        id: u64,
        servant: SocketAddr,
        task: TaskInfo,
        prefetch: bool,
        ttl: Duration,
        now: Instant,
    ) -> Self {
        Self {
            id,
            servant,
            task,
            prefetch,
            granted_at: now,
            expires_at: now + ttl,
            zombie: false,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at < now
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.granted_at)
    }

    pub fn status(&self) -> LeaseStatus {
        if self.zombie {
            LeaseStatus::Zombie
        } else {
            LeaseStatus::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    Active,
    Zombie,
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseStatus::Active => write!(f, "active"),
            LeaseStatus::Zombie => write!(f, "zombie"),
        }
    }
}
