//! # Retry Scheduler
//!
//! Decides how long the delivery loop waits before its next acquire, based on
//! what the previous acquire produced.
//!
//! | outcome                 | delay                          | attempt counter |
//! |-------------------------|--------------------------------|-----------------|
//! | timeout (no data)       | `idle_delay`                   | reset           |
//! | alert, backlog pending  | zero                           | reset           |
//! | alert, caught up        | `caught_up_delay`              | reset           |
//! | stream status notice    | zero                           | reset           |
//! | server error            | `server_error_delay`           | +1              |
//! | transport error         | `min(cap, base * 2^attempt)`   | +1              |
//! | protocol error          | `protocol_error_delay`         | unchanged       |
//!
//! With `max_reconnect_attempts` set, a transport error arriving after that many
//! consecutive failed attempts ends the loop instead of scheduling another one.

use std::time::Duration;

use crate::configs::DeliveryConfig;

/// What a single acquire produced, as far as scheduling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The server held the request and had nothing to send.
    Timeout,
    /// An alert arrived and more are queued.
    AlertWithBacklog,
    /// An alert arrived and the queue is drained.
    AlertCaughtUp,
    /// The stream reported its status.
    Status,
    /// The server answered with an error payload.
    ServerError,
    /// The connection failed, was refused, or timed out past the margin.
    TransportError,
    /// The payload could not be understood.
    ProtocolError,
}

/// Next step for the delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Acquire again after the delay.
    RetryAfter(Duration),
    /// Reconnect budget exhausted.
    GiveUp {
        /// Consecutive failed attempts made.
        attempts: u32,
    },
}

/// Delay table and reconnect budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First transport backoff step.
    pub base_delay: Duration,
    /// Ceiling for transport backoff.
    pub cap_delay: Duration,
    /// Fixed wait after a server error.
    pub server_error_delay: Duration,
    /// Wait after an alert once caught up.
    pub caught_up_delay: Duration,
    /// Wait after an empty acquire.
    pub idle_delay: Duration,
    /// Wait after a malformed payload.
    pub protocol_error_delay: Duration,
    /// Consecutive failures tolerated before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            cap_delay: Duration::from_millis(30_000),
            server_error_delay: Duration::from_millis(5000),
            caught_up_delay: Duration::from_millis(1000),
            idle_delay: Duration::from_millis(100),
            protocol_error_delay: Duration::from_millis(1000),
            max_reconnect_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Policy from config. The reconnect bound is copied as-is; callers decide
    /// whether their channel honours it.
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            cap_delay: Duration::from_millis(config.cap_delay_ms),
            server_error_delay: Duration::from_millis(config.server_error_delay_ms),
            caught_up_delay: Duration::from_millis(config.caught_up_delay_ms),
            idle_delay: Duration::from_millis(config.idle_delay_ms),
            protocol_error_delay: Duration::from_millis(config.protocol_error_delay_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    /// Same policy without a reconnect bound.
    pub fn unbounded(mut self) -> Self {
        self.max_reconnect_attempts = None;
        self
    }

    /// Delay for `kind` given `attempt` previous consecutive failures.
    pub fn next_delay(&self, kind: OutcomeKind, attempt: u32) -> Duration {
        match kind {
            OutcomeKind::Timeout => self.idle_delay,
            OutcomeKind::AlertWithBacklog | OutcomeKind::Status => Duration::ZERO,
            OutcomeKind::AlertCaughtUp => self.caught_up_delay,
            OutcomeKind::ServerError => self.server_error_delay,
            OutcomeKind::ProtocolError => self.protocol_error_delay,
            OutcomeKind::TransportError => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.cap_delay)
                    .min(self.cap_delay)
            }
        }
    }
}

/// Attempt counter plus policy for one channel.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryScheduler {
    /// Fresh scheduler with no recorded failures.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Applies the state machine to one outcome.
    pub fn record(&mut self, kind: OutcomeKind) -> RetryDecision {
        match kind {
            OutcomeKind::Timeout
            | OutcomeKind::AlertWithBacklog
            | OutcomeKind::AlertCaughtUp
            | OutcomeKind::Status => {
                self.attempts = 0;
                RetryDecision::RetryAfter(self.policy.next_delay(kind, 0))
            }
            OutcomeKind::ProtocolError => {
                RetryDecision::RetryAfter(self.policy.next_delay(kind, self.attempts))
            }
            OutcomeKind::ServerError => {
                let delay = self.policy.next_delay(kind, self.attempts);
                self.attempts = self.attempts.saturating_add(1);
                RetryDecision::RetryAfter(delay)
            }
            OutcomeKind::TransportError => {
                if let Some(max) = self.policy.max_reconnect_attempts {
                    if self.attempts >= max {
                        return RetryDecision::GiveUp { attempts: self.attempts };
                    }
                }
                let delay = self.policy.next_delay(kind, self.attempts);
                self.attempts = self.attempts.saturating_add(1);
                RetryDecision::RetryAfter(delay)
            }
        }
    }

    /// Consecutive failures since the last successful acquire.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Clears the failure count.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// The active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64, max: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            cap_delay: Duration::from_millis(cap_ms),
            max_reconnect_attempts: max,
            ..Default::default()
        }
    }

    fn delay(decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::RetryAfter(d) => d,
            RetryDecision::GiveUp { attempts } => panic!("gave up after {}", attempts),
        }
    }

    #[test]
    fn transport_backoff_doubles_up_to_cap() {
        let mut retry = RetryScheduler::new(policy(1000, 5000, None));
        let delays: Vec<u64> = (0..6)
            .map(|_| delay(retry.record(OutcomeKind::TransportError)).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn transport_backoff_is_monotonic_and_bounded() {
        let p = policy(250, 7000, None);
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let d = p.next_delay(OutcomeKind::TransportError, attempt);
            assert!(d >= previous);
            assert!(d <= p.cap_delay);
            previous = d;
        }
        assert_eq!(previous, p.cap_delay);
    }

    #[test]
    fn success_resets_the_counter() {
        let mut retry = RetryScheduler::new(policy(1000, 5000, None));
        retry.record(OutcomeKind::TransportError);
        retry.record(OutcomeKind::TransportError);
        assert_eq!(retry.attempts(), 2);

        assert_eq!(delay(retry.record(OutcomeKind::Timeout)), Duration::from_millis(100));
        assert_eq!(retry.attempts(), 0);
        assert_eq!(delay(retry.record(OutcomeKind::TransportError)), Duration::from_millis(1000));
    }

    #[test]
    fn alerts_drain_backlog_immediately() {
        let mut retry = RetryScheduler::new(RetryPolicy::default());
        assert_eq!(delay(retry.record(OutcomeKind::AlertWithBacklog)), Duration::ZERO);
        assert_eq!(delay(retry.record(OutcomeKind::AlertCaughtUp)), Duration::from_millis(1000));
    }

    #[test]
    fn server_errors_use_fixed_delay_and_count() {
        let mut retry = RetryScheduler::new(RetryPolicy::default());
        assert_eq!(delay(retry.record(OutcomeKind::ServerError)), Duration::from_millis(5000));
        assert_eq!(delay(retry.record(OutcomeKind::ServerError)), Duration::from_millis(5000));
        assert_eq!(retry.attempts(), 2);
    }

    #[test]
    fn protocol_errors_leave_the_counter_alone() {
        let mut retry = RetryScheduler::new(RetryPolicy::default());
        retry.record(OutcomeKind::TransportError);
        assert_eq!(delay(retry.record(OutcomeKind::ProtocolError)), Duration::from_millis(1000));
        assert_eq!(retry.attempts(), 1);
    }

    #[test]
    fn bounded_policy_gives_up() {
        let mut retry = RetryScheduler::new(policy(1000, 5000, Some(5)));
        for _ in 0..5 {
            delay(retry.record(OutcomeKind::TransportError));
        }
        assert_eq!(
            retry.record(OutcomeKind::TransportError),
            RetryDecision::GiveUp { attempts: 5 }
        );
    }

    #[test]
    fn policy_from_config() {
        let config = DeliveryConfig {
            base_delay_ms: 200,
            cap_delay_ms: 800,
            ..Default::default()
        };
        let p = RetryPolicy::from_config(&config);
        assert_eq!(p.base_delay, Duration::from_millis(200));
        assert_eq!(p.max_reconnect_attempts, Some(5));
        assert_eq!(p.unbounded().max_reconnect_attempts, None);
    }
}
