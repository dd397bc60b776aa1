use std::net::SocketAddr;
use std::time::Duration;

/// Bearer tokens accepted by the scheduler.
///
/// Two independent classes are recognised:
/// - user tokens, held by daemons acting as clients (lease requests, keep-alive)
/// - servant tokens, held by workers that want to receive compile tasks
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub user_tokens: Vec<String>,
    pub servant_tokens: Vec<String>,
    /// How often the scheduler-issued daemon token window rotates.
    pub rollout_interval: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            user_tokens: vec!["buildfarm".to_string()],
            servant_tokens: vec!["buildfarm".to_string()],
            rollout_interval: Duration::from_secs(3000),
        }
    }
}

impl TokenConfig {
    /// Parse a comma-separated token list. Empty entries are kept so that an
    /// accidental `a,,b` is visible to the verifier (which warns about it).
    pub fn parse_list(tokens: &str) -> Vec<String> {
        tokens.split(',').map(|t| t.trim().to_string()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    pub dashboard_addr: Option<SocketAddr>,
    /// Servants reporting less available memory than this take no new leases.
    pub min_memory_for_new_task: u64,
    pub sweep_interval: Duration,
    pub max_heartbeat_ttl: Duration,
    pub max_wait_budget: Duration,
    pub max_lease_ttl: Duration,
    pub min_daemon_version: u32,
    /// A lease missing from its servant's running-task report is reclaimed
    /// once it is older than this.
    pub unreported_lease_grace: Duration,
    pub tokens: TokenConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:10005"
                .parse()
                .expect("default listen address is valid"),
            dashboard_addr: None,
            min_memory_for_new_task: 2 << 30,
            sweep_interval: Duration::from_secs(1),
            max_heartbeat_ttl: Duration::from_secs(15),
            max_wait_budget: Duration::from_secs(15),
            max_lease_ttl: Duration::from_secs(30),
            min_daemon_version: 0,
            unreported_lease_grace: Duration::from_secs(30),
            tokens: TokenConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_min_memory(mut self, bytes: u64) -> Self {
        self.min_memory_for_new_task = bytes;
        self
    }

    pub fn with_tokens(mut self, tokens: TokenConfig) -> Self {
        self.tokens = tokens;
        self
    }
}

/// Sizing for the local compiler-process quota.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub max_heavy_tasks: usize,
    pub max_light_tasks: usize,
    pub check_interval: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let heavy = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_heavy(heavy)
    }
}

impl QuotaConfig {
    pub fn with_heavy(max_heavy_tasks: usize) -> Self {
        Self {
            max_heavy_tasks,
            max_light_tasks: max_heavy_tasks + max_heavy_tasks / 2,
            check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub version: u32,
    pub scheduler_token: String,
    /// Lease TTL requested from the scheduler when fetching grants.
    pub lease_ttl: Duration,
    /// TTL sent with each batched lease renewal.
    pub keep_alive_ttl: Duration,
    pub keep_alive_interval: Duration,
    /// Requests not renewed for longer than this are aborted.
    pub keep_alive_grace: Duration,
    /// How long one grant fetch may block on the scheduler.
    pub grant_fetch_wait: Duration,
    pub network_delay_tolerance: Duration,
    pub prefetch_grants: u32,
    pub grant_get_timeout: Duration,
    pub wait_for_task_budget: Duration,
    pub wait_retries: u32,
    pub run_keeper_refresh: Duration,
    pub run_keeper_staleness: Duration,
    pub config_refresh: Duration,
    pub abort_check_interval: Duration,
    /// Done requests left uncollected this long past their start deadline are dropped.
    pub uncollected_grace: Duration,
    pub quota: QuotaConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            version: 1,
            scheduler_token: "buildfarm".to_string(),
            lease_ttl: Duration::from_secs(15),
            keep_alive_ttl: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(1),
            keep_alive_grace: Duration::from_secs(60),
            grant_fetch_wait: Duration::from_secs(5),
            network_delay_tolerance: Duration::from_secs(5),
            prefetch_grants: 1,
            grant_get_timeout: Duration::from_secs(1),
            wait_for_task_budget: Duration::from_secs(2),
            wait_retries: 5,
            run_keeper_refresh: Duration::from_secs(1),
            run_keeper_staleness: Duration::from_secs(5),
            config_refresh: Duration::from_secs(1),
            abort_check_interval: Duration::from_secs(1),
            uncollected_grace: Duration::from_secs(60),
            quota: QuotaConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.scheduler_token = token.into();
        self
    }

    /// Local trust horizon of a freshly fetched grant. Shorter than the
    /// scheduler-side lease TTL to absorb the round trip.
    pub fn grant_trust_horizon(&self) -> Duration {
        self.lease_ttl.saturating_sub(self.network_delay_tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:10005");
        assert!(cfg.dashboard_addr.is_none());
        assert_eq!(cfg.min_memory_for_new_task, 2 * 1024 * 1024 * 1024);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_heartbeat_ttl, Duration::from_secs(15));
        assert_eq!(cfg.max_lease_ttl, Duration::from_secs(30));
    }

    #[test]
    fn scheduler_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let dash: SocketAddr = "10.0.0.1:9001".parse().unwrap();
        let cfg = SchedulerConfig::new(addr)
            .with_dashboard(dash)
            .with_min_memory(1024);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.dashboard_addr, Some(dash));
        assert_eq!(cfg.min_memory_for_new_task, 1024);
    }

    #[test]
    fn token_list_parsing_keeps_empty_entries() {
        assert_eq!(TokenConfig::parse_list("a, b"), vec!["a", "b"]);
        assert_eq!(TokenConfig::parse_list("a,,b"), vec!["a", "", "b"]);
    }

    #[test]
    fn quota_light_tasks_is_one_and_a_half_heavy() {
        let cfg = QuotaConfig::with_heavy(8);
        assert_eq!(cfg.max_heavy_tasks, 8);
        assert_eq!(cfg.max_light_tasks, 12);
    }

    #[test]
    fn daemon_config_default() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.wait_retries, 5);
        assert_eq!(cfg.prefetch_grants, 1);
        assert_eq!(cfg.keep_alive_grace, Duration::from_secs(60));
        assert_eq!(cfg.run_keeper_staleness, Duration::from_secs(5));
    }

    #[test]
    fn grant_trust_horizon_is_shorter_than_lease_ttl() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.grant_trust_horizon(), Duration::from_secs(10));
        assert!(cfg.grant_trust_horizon() < cfg.lease_ttl);
    }
}
