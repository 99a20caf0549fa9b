//! Reconnect policy for the distributed store connection.
//!
//! ```text
//! Disconnected --begin_connect--> Connecting --succeeded--> Connected
//!      ^                              |                        |
//!      +----- failed / dropped -------+                        |
//!      +---------------------- connection_lost ----------------+
//! Connecting --failed (> max_retries in a row)--> Failed
//! Failed --cooldown elapsed, begin_connect--> Connecting
//! ```
//!
//! While `Disconnected` after failures, the next attempt waits for the linear reconnect delay.
//! While `Failed`, every operation is refused until the cooldown has elapsed. A
//! [`ConnectAttempt`] dropped before reporting its outcome counts as a failure, so a caller
//! cancelled mid-connect never leaves the gate stuck in `Connecting`.

use crate::clock::{Clock, SystemClock};
use crate::Backoff;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Gave up after too many failed attempts; waiting for the cooldown.
    Failed,
}

/// Limits for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before entering `Failed`.
    pub max_retries: u32,
    /// How long `Failed` refuses work.
    pub cooldown: Duration,
    /// Delay before reconnect attempt `n`.
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            cooldown: Duration::from_secs(30),
            backoff: Backoff::linear(Duration::from_millis(200))
                .with_max(Duration::from_secs(5))
                .unwrap_or_else(|_| Backoff::linear(Duration::from_millis(200))),
        }
    }
}

#[derive(Debug)]
struct GateState {
    state: ConnectionState,
    consecutive_failures: u32,
    last_failure_at: u64,
    failed_at: u64,
}

/// Connection state machine shared by every operation of one adapter.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    name: &'static str,
    policy: ReconnectPolicy,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<GateState>>,
}

impl ConnectionGate {
    pub fn new(name: &'static str, policy: ReconnectPolicy) -> Self {
        Self::with_clock(name, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(name: &'static str, policy: ReconnectPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            policy,
            clock,
            inner: Arc::new(Mutex::new(GateState {
                state: ConnectionState::Disconnected,
                consecutive_failures: 0,
                last_failure_at: 0,
                failed_at: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// `false` only while `Failed` and the cooldown has not yet elapsed.
    pub fn is_accepting(&self) -> bool {
        let gate = self.lock();
        match gate.state {
            ConnectionState::Failed => self.cooldown_elapsed(&gate),
            _ => true,
        }
    }

    fn cooldown_elapsed(&self, gate: &GateState) -> bool {
        let cooldown = self.policy.cooldown.as_millis() as u64;
        self.clock.now_millis().saturating_sub(gate.failed_at) >= cooldown
    }

    /// Ask permission to open a connection. On success the gate moves to `Connecting` and the
    /// returned [`ConnectAttempt`] carries the outcome back. On refusal the reason is returned.
    pub fn begin_connect(&self) -> Result<ConnectAttempt, String> {
        let mut gate = self.lock();
        let now = self.clock.now_millis();
        match gate.state {
            ConnectionState::Connecting => {
                return Err("a connection attempt is already in progress".to_string());
            }
            ConnectionState::Failed => {
                if !self.cooldown_elapsed(&gate) {
                    return Err("cooling down after repeated connection failures".to_string());
                }
                info!(target: "storefront_shield::store", store = self.name, "cooldown elapsed; retrying connection");
                gate.consecutive_failures = 0;
            }
            ConnectionState::Disconnected if gate.consecutive_failures > 0 => {
                let wait = self.policy.backoff.delay(gate.consecutive_failures as usize);
                let ready_at = gate.last_failure_at.saturating_add(wait.as_millis() as u64);
                if now < ready_at {
                    return Err(format!("next reconnect attempt in {}ms", ready_at - now));
                }
            }
            ConnectionState::Disconnected | ConnectionState::Connected => {}
        }
        gate.state = ConnectionState::Connecting;
        Ok(ConnectAttempt { gate: self.clone(), settled: false })
    }

    fn connected(&self) {
        let mut gate = self.lock();
        gate.state = ConnectionState::Connected;
        gate.consecutive_failures = 0;
        info!(target: "storefront_shield::store", store = self.name, "connected");
    }

    fn connect_failed(&self, reason: &str) {
        let mut gate = self.lock();
        let now = self.clock.now_millis();
        gate.consecutive_failures = gate.consecutive_failures.saturating_add(1);
        gate.last_failure_at = now;
        if gate.consecutive_failures > self.policy.max_retries {
            gate.state = ConnectionState::Failed;
            gate.failed_at = now;
            error!(
                target: "storefront_shield::store",
                store = self.name,
                attempts = gate.consecutive_failures,
                cooldown_secs = self.policy.cooldown.as_secs(),
                error = reason,
                "retry limit reached, giving up until cooldown elapses"
            );
        } else {
            gate.state = ConnectionState::Disconnected;
            error!(
                target: "storefront_shield::store",
                store = self.name,
                attempt = gate.consecutive_failures,
                error = reason,
                "connection attempt failed"
            );
        }
    }

    /// An established connection broke.
    pub fn connection_lost(&self, reason: &str) {
        let mut gate = self.lock();
        if gate.state == ConnectionState::Connected {
            gate.state = ConnectionState::Disconnected;
            warn!(target: "storefront_shield::store", store = self.name, error = reason, "connection closed");
        }
    }
}

/// One permitted connection attempt.
///
/// Report the outcome with [`succeeded`](Self::succeeded) or [`failed`](Self::failed).
/// Dropping it unreported is recorded as a failed attempt.
#[derive(Debug)]
#[must_use = "an unreported attempt is recorded as failed when dropped"]
pub struct ConnectAttempt {
    gate: ConnectionGate,
    settled: bool,
}

impl ConnectAttempt {
    pub fn succeeded(mut self) {
        self.settled = true;
        self.gate.connected();
    }

    pub fn failed(mut self, reason: &str) {
        self.settled = true;
        self.gate.connect_failed(reason);
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        if !self.settled {
            self.gate.connect_failed("connection attempt cancelled");
        }
    }
}
