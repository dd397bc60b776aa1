//! Transport-agnostic messages exchanged between daemons, servants and the
//! scheduler.
//!
//! The RPC layer that carries these is an external collaborator; everything
//! in this crate talks in terms of these plain structs.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifies a compiler toolchain by the digest of its binary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentDesc {
    pub compiler_digest: String,
}

impl EnvironmentDesc {
    pub fn new(compiler_digest: impl Into<String>) -> Self {
        Self {
            compiler_digest: compiler_digest.into(),
        }
    }
}

impl std::fmt::Display for EnvironmentDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.compiler_digest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServantPriority {
    /// Build-farm machine; preferred for new work.
    Dedicated,
    /// Someone's workstation lending spare cycles.
    User,
}

impl std::fmt::Display for ServantPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServantPriority::Dedicated => write!(f, "dedicated"),
            ServantPriority::User => write!(f, "user"),
        }
    }
}

/// A task a servant claims to be executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
    pub servant_location: SocketAddr,
    pub servant_task_id: u64,
    pub lease_id: u64,
    pub task_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGrant {
    pub grant_id: u64,
    pub servant_location: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub token: String,
    pub version: u32,
    /// Address the servant believes it is reachable at (`ip:port`).
    pub location: String,
    pub environments: Vec<EnvironmentDesc>,
    pub num_cpu_cores: usize,
    pub current_load: usize,
    pub total_memory: u64,
    pub avail_memory: u64,
    pub concurrency: usize,
    /// `None` when the servant did not say; treated as `User`.
    pub priority: Option<ServantPriority>,
    pub next_heartbeat_in: Duration,
    pub running_tasks: Vec<RunningTask>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Daemon token window: expiring, active, upcoming.
    pub tokens: Vec<String>,
    /// Lease ids the servant reported but must stop running.
    pub expired_leases: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForStartingTaskRequest {
    pub token: String,
    pub env: EnvironmentDesc,
    pub min_version: u32,
    pub immediate: u32,
    pub prefetch: u32,
    pub lease_ttl: Duration,
    pub wait_budget: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepTaskAliveRequest {
    pub token: String,
    pub lease_ids: Vec<u64>,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeTaskRequest {
    pub token: String,
    pub lease_ids: Vec<u64>,
}

/// Submission of one compile job to a servant under a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTaskRequest {
    pub token: String,
    pub lease_id: u64,
    pub env: EnvironmentDesc,
    pub args: String,
    pub source_digest: String,
    pub source: Vec<u8>,
    pub fill_cache: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// (file extension, contents) pairs, e.g. `(".o", ...)`.
    pub output_files: Vec<(String, Vec<u8>)>,
}

/// Exit code reported for requests that never produced a remote result.
pub const EXIT_NOT_EXECUTED: i32 = -114;
/// Exit code reported when the servant answered with a definitive failure.
pub const EXIT_REMOTE_FAILED: i32 = -125;
/// Exit code shells use for "command not found".
pub const EXIT_COMPILER_NOT_FOUND: i32 = 127;

impl DistOutput {
    pub fn failure(exit_code: i32, reason: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: reason.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitTaskStatus {
    Running,
    Done(DistOutput),
    Failed,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub stdout: String,
    pub stderr: String,
    pub output_files: Vec<(String, Vec<u8>)>,
}

impl From<CacheEntry> for DistOutput {
    fn from(entry: CacheEntry) -> Self {
        Self {
            exit_code: 0,
            stdout: entry.stdout,
            stderr: entry.stderr,
            output_files: entry.output_files,
        }
    }
}
