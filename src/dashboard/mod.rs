use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::{LeaseAllocator, LeaseStatus};

#[derive(Clone)]
pub struct DashboardState {
    pub allocator: Arc<LeaseAllocator>,
}

#[derive(Serialize)]
struct ServantResponse {
    location: String,
    reported_location: String,
    version: u32,
    priority: String,
    environments: Vec<String>,
    num_cpu_cores: usize,
    current_load: usize,
    total_memory: u64,
    avail_memory: u64,
    concurrency: usize,
    capacity: usize,
    running: usize,
    ever_assigned: u64,
    discovered_at: DateTime<Utc>,
    expires_in_ms: u64,
}

#[derive(Serialize)]
struct LeaseResponse {
    id: u64,
    servant: String,
    env: String,
    requester: Option<String>,
    prefetch: bool,
    status: LeaseStatus,
    age_ms: u64,
    expires_in_ms: u64,
}

/// Read-only JSON views over the scheduler state.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/servants", get(list_servants_handler))
        .route("/api/leases", get(list_leases_handler))
        .route("/api/running-tasks", get(list_running_tasks_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

fn millis_until(deadline: Instant, now: Instant) -> u64 {
    deadline.saturating_duration_since(now).as_millis() as u64
}

async fn list_servants_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let now = Instant::now();
    let min_memory = state.allocator.min_memory_for_new_task();
    let mut servants: Vec<ServantResponse> = state
        .allocator
        .servants()
        .await
        .into_iter()
        .map(|s| ServantResponse {
            location: s.info.observed_location.to_string(),
            reported_location: s.info.reported_location.to_string(),
            version: s.info.version,
            priority: s.info.priority.to_string(),
            environments: s
                .info
                .environments
                .iter()
                .map(|e| e.compiler_digest.clone())
                .collect(),
            num_cpu_cores: s.info.num_cpu_cores,
            current_load: s.info.current_load,
            total_memory: s.info.total_memory,
            avail_memory: s.info.avail_memory,
            concurrency: s.info.concurrency,
            capacity: s.capacity(min_memory),
            running: s.running,
            ever_assigned: s.ever_assigned,
            discovered_at: s.discovered_at,
            expires_in_ms: millis_until(s.expires_at, now),
        })
        .collect();
    servants.sort_by(|a, b| a.location.cmp(&b.location));

    Json(servants)
}

async fn list_leases_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let now = Instant::now();
    let leases: Vec<LeaseResponse> = state
        .allocator
        .leases()
        .await
        .into_iter()
        .map(|l| LeaseResponse {
            id: l.id,
            servant: l.servant.to_string(),
            env: l.task.env.compiler_digest.clone(),
            requester: l.task.requester.map(|r| r.to_string()),
            prefetch: l.prefetch,
            status: l.status(),
            age_ms: l.age(now).as_millis() as u64,
            expires_in_ms: millis_until(l.expires_at, now),
        })
        .collect();

    Json(leases)
}

async fn list_running_tasks_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.allocator.bookkeeper().running_tasks().await)
}
