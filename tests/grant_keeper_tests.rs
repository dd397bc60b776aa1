use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use buildfarm_lite::config::DaemonConfig;
use buildfarm_lite::daemon::{GrantKeeper, SchedulerClient};
use buildfarm_lite::error::{BuildFarmError, Result};
use buildfarm_lite::protocol::{
    EnvironmentDesc, FreeTaskRequest, KeepTaskAliveRequest, RunningTask, TaskGrant,
    WaitForStartingTaskRequest,
};

/// Scheduler that hands out as many grants as asked for, optionally held
/// back behind a gate.
struct ScriptedScheduler {
    next_id: AtomicU64,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    missing_env: Mutex<bool>,
    requests: Mutex<Vec<(u32, u32)>>,
    freed: Mutex<Vec<u64>>,
    gate: watch::Receiver<bool>,
}

impl ScriptedScheduler {
    fn new(open: bool) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(open);
        let scheduler = Arc::new(Self {
            next_id: AtomicU64::new(1),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            missing_env: Mutex::new(false),
            requests: Mutex::new(Vec::new()),
            freed: Mutex::new(Vec::new()),
            gate: rx,
        });
        (scheduler, tx)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn freed(&self) -> Vec<u64> {
        self.freed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulerClient for ScriptedScheduler {
    async fn wait_for_starting_task(
        &self,
        req: WaitForStartingTaskRequest,
    ) -> Result<Vec<TaskGrant>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((req.immediate, req.prefetch));

        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if *self.missing_env.lock().unwrap() {
            return Err(BuildFarmError::EnvironmentNotFound(
                req.env.compiler_digest.clone(),
            ));
        }
        let location: SocketAddr = "10.0.0.1:8000".parse().unwrap();
        Ok((0..req.immediate + req.prefetch)
            .map(|_| TaskGrant {
                grant_id: self.next_id.fetch_add(1, Ordering::SeqCst),
                servant_location: location,
            })
            .collect())
    }

    async fn keep_task_alive(&self, req: KeepTaskAliveRequest) -> Result<Vec<bool>> {
        Ok(vec![true; req.lease_ids.len()])
    }

    async fn free_task(&self, req: FreeTaskRequest) -> Result<()> {
        self.freed.lock().unwrap().extend(req.lease_ids);
        Ok(())
    }

    async fn get_running_tasks(&self, _token: &str) -> Result<Vec<RunningTask>> {
        Ok(Vec::new())
    }

    async fn get_config(&self, _token: &str) -> Result<String> {
        Ok("daemon-token".to_string())
    }
}

fn gcc() -> EnvironmentDesc {
    EnvironmentDesc::new("gcc-9f3")
}

#[tokio::test]
async fn test_get_fetches_with_prefetch() {
    let (scheduler, _gate) = ScriptedScheduler::new(true);
    let cancel = CancellationToken::new();
    let keeper = GrantKeeper::new(scheduler.clone(), DaemonConfig::default(), cancel.clone());

    let first = keeper.get(&gcc(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(first.grant_id, 1);
    assert_eq!(scheduler.requests.lock().unwrap()[0], (1, 1));

    // The prefetched grant is served without another round trip.
    let second = keeper.get(&gcc(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(second.grant_id, 2);
    assert_eq!(second.servant_location, first.servant_location);
    cancel.cancel();
}

#[tokio::test]
async fn test_concurrent_gets_share_one_fetcher() {
    let (scheduler, gate) = ScriptedScheduler::new(false);
    let cancel = CancellationToken::new();
    let keeper = Arc::new(GrantKeeper::new(
        scheduler.clone(),
        DaemonConfig::default(),
        cancel.clone(),
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let keeper = keeper.clone();
        handles.push(tokio::spawn(async move {
            keeper.get(&gcc(), Duration::from_secs(5)).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.send_replace(true);

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().grant_id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(scheduler.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(scheduler.calls() < 4);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_expired_grants_are_freed_not_used() {
    let (scheduler, _gate) = ScriptedScheduler::new(true);
    let cancel = CancellationToken::new();
    let keeper = GrantKeeper::new(scheduler.clone(), DaemonConfig::default(), cancel.clone());

    let first = keeper.get(&gcc(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(first.grant_id, 1);

    // Past the local trust horizon of the prefetched grant.
    tokio::time::advance(Duration::from_secs(11)).await;
    let next = keeper.get(&gcc(), Duration::from_secs(5)).await.unwrap();
    assert_ne!(next.grant_id, 2);
    assert_eq!(scheduler.freed(), vec![2]);
    assert!(next.expires_at > tokio::time::Instant::now());
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_missing_environment_fails_fast() {
    let (scheduler, _gate) = ScriptedScheduler::new(true);
    *scheduler.missing_env.lock().unwrap() = true;
    let cancel = CancellationToken::new();
    let keeper = GrantKeeper::new(scheduler.clone(), DaemonConfig::default(), cancel.clone());

    let err = keeper
        .get(&gcc(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, BuildFarmError::EnvironmentNotFound("gcc-9f3".to_string()));

    // Nobody is waiting, so the fetcher stops asking.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(scheduler.calls(), 1);

    // A new caller retries, and succeeds once a servant shows up.
    *scheduler.missing_env.lock().unwrap() = false;
    let grant = keeper.get(&gcc(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(grant.grant_id, 1);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_get_times_out_while_scheduler_blocks() {
    let (scheduler, _gate) = ScriptedScheduler::new(false);
    let cancel = CancellationToken::new();
    let keeper = GrantKeeper::new(scheduler.clone(), DaemonConfig::default(), cancel.clone());

    let err = keeper
        .get(&gcc(), Duration::from_millis(500))
        .await
        .unwrap_err();
    assert_eq!(err, BuildFarmError::Timeout);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_get_stops_counting_as_waiter() {
    let (scheduler, gate) = ScriptedScheduler::new(false);
    let cancel = CancellationToken::new();
    let keeper = GrantKeeper::new(scheduler.clone(), DaemonConfig::default(), cancel.clone());

    // The caller gives up while the first fetch is still blocked.
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), keeper.get(&gcc(), Duration::from_secs(5)))
            .await;
    assert!(abandoned.is_err());
    gate.send_replace(true);

    for _ in 0..3 {
        keeper.get(&gcc(), Duration::from_secs(5)).await.unwrap();
    }
    let requests = scheduler.requests.lock().unwrap().clone();
    assert!(requests.len() >= 2);
    assert!(
        requests.iter().all(|&(immediate, _)| immediate <= 1),
        "asked for grants nobody waits for: {:?}",
        requests
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_free_reports_to_scheduler() {
    let (scheduler, _gate) = ScriptedScheduler::new(true);
    let keeper = GrantKeeper::new(
        scheduler.clone(),
        DaemonConfig::default(),
        CancellationToken::new(),
    );
    keeper.free(42).await;
    assert_eq!(scheduler.freed(), vec![42]);
}
