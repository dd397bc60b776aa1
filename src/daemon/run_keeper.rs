use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::daemon::collaborators::SchedulerClient;
use crate::timer::spawn_periodic;

/// Where a task with a given digest is already running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTaskDesc {
    pub servant_location: SocketAddr,
    pub servant_task_id: u64,
}

struct Snapshot {
    tasks: HashMap<String, RunningTaskDesc>,
    last_update: Instant,
}

/// Local mirror of the scheduler's running-task index.
///
/// Only a hint for joining duplicates: a stale entry costs one failed
/// `add_task_ref`, after which the caller dispatches normally.
pub struct RunKeeper {
    scheduler: Arc<dyn SchedulerClient>,
    token: String,
    staleness: Duration,
    snapshot: RwLock<Snapshot>,
}

impl RunKeeper {
    pub fn new(scheduler: Arc<dyn SchedulerClient>, token: impl Into<String>, staleness: Duration) -> Self {
        Self {
            scheduler,
            token: token.into(),
            staleness,
            snapshot: RwLock::new(Snapshot {
                tasks: HashMap::new(),
                last_update: Instant::now(),
            }),
        }
    }

    pub async fn try_find(&self, task_digest: &str) -> Option<RunningTaskDesc> {
        self.snapshot.read().await.tasks.get(task_digest).cloned()
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn refresh(&self) {
        match self.scheduler.get_running_tasks(&self.token).await {
            Ok(running) => {
                let tasks: HashMap<String, RunningTaskDesc> = running
                    .into_iter()
                    .map(|t| {
                        (
                            t.task_digest,
                            RunningTaskDesc {
                                servant_location: t.servant_location,
                                servant_task_id: t.servant_task_id,
                            },
                        )
                    })
                    .collect();
                let mut snapshot = self.snapshot.write().await;
                snapshot.tasks = tasks;
                snapshot.last_update = Instant::now();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load running tasks from scheduler");
                let mut snapshot = self.snapshot.write().await;
                if snapshot.last_update.elapsed() > self.staleness && !snapshot.tasks.is_empty() {
                    tracing::warn!("Running task list is stale, clearing it");
                    snapshot.tasks.clear();
                }
            }
        }
    }

    pub fn spawn(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let keeper = self.clone();
        spawn_periodic("run-keeper", period, cancel, move || {
            let keeper = keeper.clone();
            async move { keeper.refresh().await }
        })
    }
}
