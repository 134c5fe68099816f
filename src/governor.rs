//! Rate governor for outbound calls.
//!
//! Two-level fixed-window budgets: one global scope shared by every feature
//! module, and per-action sub-scopes. A request is granted only when both
//! levels have enough permits, and both are decremented under the same lock
//! so concurrent callers can never jointly overspend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LimitConfig, RateConfig};
use crate::error::RateError;

/// Outcome of a budget request. `Denied` is flow control, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    /// `retry_after` is `None` when the cost exceeds a ceiling and can
    /// never be granted.
    Denied { retry_after: Option<Duration> },
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted)
    }
}

/// Budget snapshot returned for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeStatus {
    pub scope: String,
    pub ceiling: u32,
    pub remaining: u32,
    pub resets_in: Duration,
}

struct Budget {
    ceiling: u32,
    window: Duration,
    remaining: u32,
    window_start: Instant,
}

impl Budget {
    fn new(limit: LimitConfig, now: Instant) -> Self {
        Self {
            ceiling: limit.ceiling,
            window: limit.window(),
            remaining: limit.ceiling,
            window_start: now,
        }
    }

    /// Roll forward to the window containing `now`, refilling on change.
    fn refresh(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.window && !self.window.is_zero() {
            let windows = (elapsed.as_nanos() / self.window.as_nanos()) as u32;
            self.window_start += self.window * windows;
            self.remaining = self.ceiling;
        }
    }

    fn resets_in(&self, now: Instant) -> Duration {
        (self.window_start + self.window).saturating_duration_since(now)
    }
}

struct GovernorState {
    global: Budget,
    scopes: HashMap<String, Budget>,
}

pub struct RateGovernor {
    default_limit: LimitConfig,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    /// Create a governor from configuration. Scopes listed in the config are
    /// created up front; others are created on first use with the default.
    pub fn new(config: &RateConfig) -> Self {
        let now = Instant::now();
        let scopes = config
            .scopes
            .iter()
            .map(|(name, limit)| (name.clone(), Budget::new(*limit, now)))
            .collect();
        info!(
            global_ceiling = config.global.ceiling,
            global_window_secs = config.global.window_secs,
            scopes = config.scopes.len(),
            "rate governor ready"
        );
        Self {
            default_limit: config.default_scope,
            state: Mutex::new(GovernorState {
                global: Budget::new(config.global, now),
                scopes,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make sure `scope` exists, without touching its budget if it does.
    pub fn ensure_scope(&self, scope: &str) {
        let now = Instant::now();
        let default = self.default_limit;
        self.lock()
            .scopes
            .entry(scope.to_string())
            .or_insert_with(|| Budget::new(default, now));
    }

    /// Take `cost` permits from the global scope and `scope` together, or
    /// neither.
    pub fn request(&self, scope: &str, cost: u32) -> Decision {
        if cost == 0 {
            return Decision::Granted;
        }

        let now = Instant::now();
        let default = self.default_limit;
        let mut state = self.lock();
        let GovernorState { global, scopes } = &mut *state;

        global.refresh(now);
        let sub = scopes
            .entry(scope.to_string())
            .or_insert_with(|| Budget::new(default, now));
        sub.refresh(now);

        if cost > global.ceiling || cost > sub.ceiling {
            debug!(scope, cost, "request exceeds ceiling");
            return Decision::Denied { retry_after: None };
        }

        let global_ok = global.remaining >= cost;
        let sub_ok = sub.remaining >= cost;
        if global_ok && sub_ok {
            global.remaining -= cost;
            sub.remaining -= cost;
            return Decision::Granted;
        }

        // Both budgets must have room, so wait for the later reset.
        let mut retry_after = Duration::ZERO;
        if !global_ok {
            retry_after = retry_after.max(global.resets_in(now));
        }
        if !sub_ok {
            retry_after = retry_after.max(sub.resets_in(now));
        }
        debug!(scope, cost, global_ok, sub_ok, ?retry_after, "request denied");
        Decision::Denied {
            retry_after: Some(retry_after),
        }
    }

    /// Wait for replenishment until `cost` permits are granted, or `cancel`
    /// fires.
    pub async fn acquire(
        &self,
        scope: &str,
        cost: u32,
        cancel: &CancellationToken,
    ) -> Result<(), RateError> {
        loop {
            match self.request(scope, cost) {
                Decision::Granted => return Ok(()),
                Decision::Denied { retry_after: None } => {
                    return Err(RateError::Unsatisfiable {
                        scope: scope.to_string(),
                        cost,
                    })
                }
                Decision::Denied {
                    retry_after: Some(wait),
                } => {
                    // A zero wait would spin on a boundary tick.
                    let wait = wait.max(Duration::from_millis(1));
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(RateError::Cancelled(scope.to_string()));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Current budget of a sub-scope, if it has been seen.
    pub fn status(&self, scope: &str) -> Option<ScopeStatus> {
        let now = Instant::now();
        let mut state = self.lock();
        let budget = state.scopes.get_mut(scope)?;
        budget.refresh(now);
        Some(ScopeStatus {
            scope: scope.to_string(),
            ceiling: budget.ceiling,
            remaining: budget.remaining,
            resets_in: budget.resets_in(now),
        })
    }

    pub fn global_status(&self) -> ScopeStatus {
        let now = Instant::now();
        let mut state = self.lock();
        state.global.refresh(now);
        ScopeStatus {
            scope: "global".to_string(),
            ceiling: state.global.ceiling,
            remaining: state.global.remaining,
            resets_in: state.global.resets_in(now),
        }
    }

    pub fn remaining(&self, scope: &str) -> Option<u32> {
        self.status(scope).map(|s| s.remaining)
    }
}
