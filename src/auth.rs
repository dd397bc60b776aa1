//! Bearer-token checks for scheduler calls.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Fixed set of accepted tokens for one caller class.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    recognized: HashSet<String>,
}

impl TokenVerifier {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let recognized: HashSet<String> = tokens.into_iter().map(Into::into).collect();
        if recognized.contains("") {
            tracing::warn!("Empty token is accepted, anyone can authenticate");
        }
        if recognized.is_empty() {
            tracing::error!("No tokens configured, every call will be rejected");
        }
        Self { recognized }
    }

    pub fn verify(&self, token: &str) -> bool {
        self.recognized.contains(token)
    }
}

const TOKEN_WINDOW: usize = 3;

struct RotationState {
    tokens: VecDeque<String>,
    next_rollout: Instant,
}

/// Scheduler-issued daemon tokens, kept as a three-slot window
/// (expiring, active, upcoming) that shifts every `interval`.
pub struct RotatingTokens {
    interval: Duration,
    state: Mutex<RotationState>,
}

impl RotatingTokens {
    pub fn new(interval: Duration) -> Self {
        let tokens = (0..TOKEN_WINDOW).map(|_| next_daemon_token()).collect();
        Self {
            interval,
            state: Mutex::new(RotationState {
                tokens,
                next_rollout: Instant::now() + interval,
            }),
        }
    }

    /// Current window, rotating first if the rollout time has passed.
    pub async fn active(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.next_rollout < now {
            state.next_rollout = now + self.interval;
            state.tokens.pop_front();
            state.tokens.push_back(next_daemon_token());
            tracing::info!("Rotated daemon tokens");
        }
        state.tokens.iter().cloned().collect()
    }

    /// The token daemons should present right now (middle slot).
    pub async fn serving(&self) -> String {
        self.active().await.swap_remove(1)
    }

    pub async fn verify(&self, token: &str) -> bool {
        self.active().await.iter().any(|t| t == token)
    }
}

fn next_daemon_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
