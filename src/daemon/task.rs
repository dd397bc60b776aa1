use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{BuildFarmError, Result};
use crate::protocol::{EnvironmentDesc, StartTaskRequest};

/// One compiler invocation to be run remotely.
#[derive(Debug, Clone)]
pub struct CompileTask {
    /// Process that asked for the compile; the request is abandoned if it dies.
    pub requester_pid: u32,
    pub env: EnvironmentDesc,
    pub args: String,
    /// Digest of the preprocessed source, computed by the client.
    pub source_digest: String,
    /// Compressed preprocessed source.
    pub source: Vec<u8>,
    /// Whether the result may be served from and written to the cache.
    pub cache_control: bool,
}

impl CompileTask {
    pub fn new(
        requester_pid: u32,
        env: EnvironmentDesc,
        args: impl Into<String>,
        source_digest: impl Into<String>,
        source: Vec<u8>,
        cache_control: bool,
    ) -> Result<Self> {
        let task = Self {
            requester_pid,
            env,
            args: args.into(),
            source_digest: source_digest.into(),
            source,
            cache_control,
        };
        task.validate()?;
        Ok(task)
    }

    fn validate(&self) -> Result<()> {
        if self.requester_pid <= 1 {
            return Err(BuildFarmError::InvalidArgument(format!(
                "requester pid {} is not a client process",
                self.requester_pid
            )));
        }
        if self.env.compiler_digest.is_empty() {
            return Err(BuildFarmError::InvalidArgument(
                "compiler digest is empty".to_string(),
            ));
        }
        if self.source_digest.is_empty() {
            return Err(BuildFarmError::InvalidArgument(
                "source digest is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Identifies byte-identical work across the pool.
    pub fn digest(&self) -> String {
        format!("buildfarm-cxx-digest-{}", self.content_hash())
    }

    pub fn cache_key(&self) -> String {
        format!("buildfarm-cxx-cache-{}", self.content_hash())
    }

    pub fn start_request(&self, token: &str, lease_id: u64) -> StartTaskRequest {
        StartTaskRequest {
            token: token.to_string(),
            lease_id,
            env: self.env.clone(),
            args: self.args.clone(),
            source_digest: self.source_digest.clone(),
            source: self.source.clone(),
            fill_cache: self.cache_control,
        }
    }

    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        for part in [
            self.env.compiler_digest.as_bytes(),
            self.args.as_bytes(),
            self.source_digest.as_bytes(),
        ] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Queued; checking the cache and running tasks.
    Pending,
    /// Waiting for, or holding, a lease.
    Ready,
    /// Running on a servant.
    Dispatched,
    Done,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Dispatched => write!(f, "dispatched"),
            TaskState::Done => write!(f, "done"),
        }
    }
}
