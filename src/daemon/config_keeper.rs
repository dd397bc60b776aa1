use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::daemon::collaborators::SchedulerClient;
use crate::timer::spawn_periodic;

/// Keeps the scheduler-issued daemon token current.
pub struct ConfigKeeper {
    scheduler: Arc<dyn SchedulerClient>,
    user_token: String,
    serving_token: RwLock<String>,
}

impl ConfigKeeper {
    pub fn new(scheduler: Arc<dyn SchedulerClient>, user_token: impl Into<String>) -> Self {
        Self {
            scheduler,
            user_token: user_token.into(),
            serving_token: RwLock::new(String::new()),
        }
    }

    /// Empty until the first successful refresh.
    pub async fn serving_token(&self) -> String {
        self.serving_token.read().await.clone()
    }

    pub async fn refresh(&self) {
        match self.scheduler.get_config(&self.user_token).await {
            Ok(token) => *self.serving_token.write().await = token,
            Err(e) => tracing::warn!(error = %e, "Failed to fetch daemon config from scheduler"),
        }
    }

    pub fn spawn(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let keeper = self.clone();
        spawn_periodic("config-keeper", period, cancel, move || {
            let keeper = keeper.clone();
            async move { keeper.refresh().await }
        })
    }
}
