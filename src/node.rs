use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::scheduler::SchedulerService;

/// Scheduler process: the service object plus its background tasks.
pub struct SchedulerNode {
    pub service: Arc<SchedulerService>,
}

impl SchedulerNode {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            service: Arc::new(SchedulerService::new(config)),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Starts the servant sweep and, if configured, the dashboard. The RPC
    /// front end is expected to hold a clone of `service` and forward calls
    /// to it.
    ///
    /// # Errors
    ///
    /// Returns an error if a background task panicked.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let config = self.service.config();
        let sweeper = self.service.spawn_sweeper(shutdown.clone());

        let dashboard = config.dashboard_addr.map(|addr| {
            let state = DashboardState {
                allocator: self.service.allocator().clone(),
            };
            tokio::spawn(run_dashboard(addr, state, shutdown.clone()))
        });

        tracing::info!(
            listen_addr = %config.listen_addr,
            min_memory_for_new_task = config.min_memory_for_new_task,
            "Scheduler started"
        );

        shutdown.cancelled().await;
        tracing::info!("Scheduler shutting down");

        sweeper.await?;
        if let Some(dashboard) = dashboard {
            dashboard.await?;
        }
        Ok(())
    }
}
