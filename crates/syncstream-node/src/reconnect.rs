//! Auto-reconnect after the peer link drops.
//!
//! Attempts are spaced by `retry_interval`; after `max_attempts_before_backoff`
//! consecutive failures the loop pauses for `backoff` and starts counting
//! again. Once `timeout` has passed since the loop started, it reports
//! [`RECONNECT_TIMEOUT_MESSAGE`] and gives up.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use syncstream_transfer::Event;

use crate::link::{LinkState, PeerLink};

/// Connection error message emitted when the loop gives up.
pub const RECONNECT_TIMEOUT_MESSAGE: &str = "Auto-reconnect timeout";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub timeout: Duration,
    pub max_attempts_before_backoff: u32,
    pub backoff: Duration,
    pub retry_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(180),
            max_attempts_before_backoff: 3,
            backoff: Duration::from_secs(30),
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Attempt bookkeeping for one reconnect period, independent of any clock.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    policy: ReconnectPolicy,
    /// Attempts since the last backoff.
    attempts: u32,
    total: u32,
}

impl ReconnectSchedule {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            total: 0,
        }
    }

    /// Register a dial attempt; returns its 1-based number in this period.
    pub fn next_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.total += 1;
        self.total
    }

    /// Pause to take after a failed attempt. Resets the counter on backoff.
    pub fn delay_after_failure(&mut self) -> Duration {
        if self.attempts >= self.policy.max_attempts_before_backoff.max(1) {
            self.attempts = 0;
            self.policy.backoff
        } else {
            self.policy.retry_interval
        }
    }

    pub fn expired(&self, elapsed: Duration) -> bool {
        elapsed >= self.policy.timeout
    }

    pub fn attempts_since_backoff(&self) -> u32 {
        self.attempts
    }

    pub fn total_attempts(&self) -> u32 {
        self.total
    }
}

/// Run one reconnect period for `link` until connected, cancelled,
/// disabled or timed out. Cancels `cancel` on exit to mark the loop done.
pub(crate) async fn run(link: PeerLink, cancel: CancellationToken) {
    let policy = link.config().reconnect.clone();
    let started = Instant::now();
    let mut schedule = ReconnectSchedule::new(policy.clone());

    tracing::info!(
        peer = %link.peer().address().unwrap_or_default(),
        timeout_secs = policy.timeout.as_secs(),
        "reconnect: started"
    );

    loop {
        if cancel.is_cancelled() || !link.reconnect_enabled() {
            tracing::debug!("reconnect: stopped");
            break;
        }
        if link.state() == LinkState::Connected {
            tracing::info!(attempts = schedule.total_attempts(), "reconnect: link restored");
            break;
        }
        if schedule.expired(started.elapsed()) {
            tracing::warn!(
                attempts = schedule.total_attempts(),
                "reconnect: giving up"
            );
            link.events().emit(Event::ConnectionError {
                message: RECONNECT_TIMEOUT_MESSAGE.to_string(),
            });
            break;
        }

        let attempt = schedule.next_attempt();
        link.record_reconnect_attempt(attempt);
        link.events().emit(Event::Reconnecting { attempt });
        tracing::info!(attempt, "reconnect: dialing");

        match link.begin_dial() {
            Ok(epoch) => {
                let _ = link.dial(epoch).await;
            }
            Err(e) => tracing::debug!(error = %e, "reconnect: dial not started"),
        }
        if link.state() == LinkState::Connected {
            tracing::info!(attempt, "reconnect: link restored");
            break;
        }

        let delay = schedule
            .delay_after_failure()
            .min(policy.timeout.saturating_sub(started.elapsed()));
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("reconnect: cancelled");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    cancel.cancel();
}
