//! Bounded retry for a dropped, previously connected terminal.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{backoff_delay, LifecycleConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts,
            base_delay: config.reconnect_base_delay,
        }
    }

    pub fn delay_before(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected { attempts: u32 },
    Exhausted,
    Cancelled,
}

/// Call `attempt(k)` for k = 1..=max, sleeping `base * 2^(k-2)` before each
/// retry, until one returns true. Cancellation abandons the pending sleep or
/// attempt immediately.
pub async fn run_reconnect<F, Fut>(
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    mut attempt: F,
) -> ReconnectOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for k in 1..=policy.max_attempts {
        let delay = policy.delay_before(k);
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log::debug!("reconnect attempt {k}/{}", policy.max_attempts);
        let succeeded = tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            ok = attempt(k) => ok,
        };
        if succeeded {
            return ReconnectOutcome::Reconnected { attempts: k };
        }
    }
    ReconnectOutcome::Exhausted
}
