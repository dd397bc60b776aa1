use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::QuotaConfig;
use crate::daemon::collaborators::ProcessProbe;
use crate::timer::spawn_periodic;

/// Caps how many local compiler processes run at once.
///
/// Lightweight jobs (preprocessing, linking a tiny object) may use the extra
/// light slots on top of the heavy ones. Permissions are keyed by the
/// requesting pid so a crashed client's slot can be reclaimed.
pub struct TaskQuota {
    config: QuotaConfig,
    granted: Mutex<HashSet<u32>>,
    released: Notify,
}

impl TaskQuota {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            granted: Mutex::new(HashSet::new()),
            released: Notify::new(),
        }
    }

    /// Returns `false` if no slot freed up within `timeout`.
    pub async fn acquire(&self, pid: u32, lightweight: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let limit = if lightweight {
            self.config.max_heavy_tasks + self.config.max_light_tasks
        } else {
            self.config.max_heavy_tasks
        };

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut granted = self.granted.lock().await;
                if granted.contains(&pid) {
                    tracing::warn!(pid, "Process already holds a quota slot");
                    return true;
                }
                if granted.len() < limit {
                    granted.insert(pid);
                    return true;
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return false;
            }
        }
    }

    pub async fn release(&self, pid: u32) {
        if self.granted.lock().await.remove(&pid) {
            self.released.notify_waiters();
        } else {
            tracing::warn!(pid, "Releasing quota slot that was never granted");
        }
    }

    /// Reclaim slots held by processes that exited without releasing.
    pub async fn reclaim_dead(&self, probe: &dyn ProcessProbe) -> Vec<u32> {
        let dead: Vec<u32> = {
            let mut granted = self.granted.lock().await;
            let dead: Vec<u32> = granted
                .iter()
                .copied()
                .filter(|&pid| !probe.is_process_alive(pid))
                .collect();
            for pid in &dead {
                granted.remove(pid);
            }
            dead
        };
        if !dead.is_empty() {
            tracing::info!(pids = ?dead, "Reclaimed quota of exited processes");
            self.released.notify_waiters();
        }
        dead
    }

    pub async fn in_use(&self) -> usize {
        self.granted.lock().await.len()
    }

    pub fn spawn_reaper(
        self: &Arc<Self>,
        probe: Arc<dyn ProcessProbe>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let quota = self.clone();
        spawn_periodic("quota-reaper", self.config.check_interval, cancel, move || {
            let quota = quota.clone();
            let probe = probe.clone();
            async move {
                quota.reclaim_dead(probe.as_ref()).await;
            }
        })
    }
}
