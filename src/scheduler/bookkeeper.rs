use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::RwLock;

use crate::protocol::RunningTask;

/// What each servant last said it was running.
///
/// Each heartbeat replaces that servant's list wholesale. Daemons read the
/// flattened view to find in-flight work they can join instead of
/// duplicating.
#[derive(Debug, Default)]
pub struct RunningTaskBookkeeper {
    tasks: RwLock<HashMap<SocketAddr, Vec<RunningTask>>>,
}

impl RunningTaskBookkeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_servant_running_tasks(&self, servant: SocketAddr, tasks: Vec<RunningTask>) {
        let mut map = self.tasks.write().await;
        if tasks.is_empty() {
            map.remove(&servant);
        } else {
            map.insert(servant, tasks);
        }
    }

    pub async fn drop_servant(&self, servant: &SocketAddr) {
        self.tasks.write().await.remove(servant);
    }

    pub async fn running_tasks(&self) -> Vec<RunningTask> {
        self.tasks.read().await.values().flatten().cloned().collect()
    }
}
