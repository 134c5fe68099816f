//! Rate-governed outbound sends to the chat platform.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DenyMode, RateConfig};
use crate::error::{OutboundError, RateError};
use crate::governor::{Decision, RateGovernor};
use crate::metrics::Metrics;

/// The platform's send primitive. Implemented by the connector that owns the
/// real network session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn send(&self, target: &str, content: &str) -> Result<(), String>;
}

/// What to do when the governor refuses a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyPolicy {
    /// Report the denial and skip the send.
    Drop,
    /// Sleep until budget frees up, at most `max_wait`.
    Wait { max_wait: Duration },
}

impl DenyPolicy {
    pub fn from_config(rate: &RateConfig) -> Self {
        match rate.deny_policy {
            DenyMode::Drop => DenyPolicy::Drop,
            DenyMode::Wait => DenyPolicy::Wait {
                max_wait: rate.max_wait(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Budget was exhausted; the caller may retry after the given delay.
    Deferred(Duration),
    /// Budget can never cover this send, or waiting would exceed the limit.
    Dropped,
}

pub struct Outbound {
    governor: Arc<RateGovernor>,
    connector: Arc<dyn Connector>,
    metrics: Arc<Metrics>,
    policy: DenyPolicy,
}

impl Outbound {
    pub fn new(
        governor: Arc<RateGovernor>,
        connector: Arc<dyn Connector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            governor,
            connector,
            metrics,
            policy: DenyPolicy::Drop,
        }
    }

    pub fn with_policy(mut self, policy: DenyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> DenyPolicy {
        self.policy
    }

    /// Ask the governor for one permit in `scope`, then hand the message to
    /// the connector. A `Wait` policy sleeps for budget until `cancel` fires.
    pub async fn send(
        &self,
        scope: &str,
        target: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, OutboundError> {
        let wait = match self.governor.request(scope, 1) {
            Decision::Granted => None,
            Decision::Denied { retry_after: None } => {
                warn!(scope, target, "send can never fit the rate budget, dropping");
                self.metrics.record_send_denied();
                return Ok(SendOutcome::Dropped);
            }
            Decision::Denied {
                retry_after: Some(wait),
            } => Some(wait),
        };

        if let Some(wait) = wait {
            let DenyPolicy::Wait { max_wait } = self.policy else {
                debug!(scope, target, ?wait, "send deferred by rate governor");
                self.metrics.record_send_denied();
                return Ok(SendOutcome::Deferred(wait));
            };
            if wait > max_wait {
                info!(scope, target, ?wait, "rate budget wait exceeds limit, dropping send");
                self.metrics.record_send_denied();
                return Ok(SendOutcome::Dropped);
            }
            let acquired =
                tokio::time::timeout(max_wait, self.governor.acquire(scope, 1, cancel)).await;
            match acquired {
                Ok(Ok(())) => {}
                Ok(Err(RateError::Cancelled(scope))) => {
                    return Err(RateError::Cancelled(scope).into());
                }
                Ok(Err(RateError::Unsatisfiable { .. })) | Err(_) => {
                    info!(scope, target, "rate budget did not free up in time, dropping send");
                    self.metrics.record_send_denied();
                    return Ok(SendOutcome::Dropped);
                }
            }
        }

        match self.connector.send(target, content).await {
            Ok(()) => {
                self.metrics.record_send();
                debug!(scope, target, "message sent");
                Ok(SendOutcome::Sent)
            }
            Err(reason) => {
                self.metrics.record_send_failed();
                warn!(scope, target, reason = %reason, "connector send failed");
                Err(OutboundError::Connector {
                    target: target.to_string(),
                    reason,
                })
            }
        }
    }
}

/// Connector that writes replies to the log. Used by the console binary.
pub struct LogConnector;

#[async_trait]
impl Connector for LogConnector {
    async fn send(&self, target: &str, content: &str) -> Result<(), String> {
        info!(target = %target, "{content}");
        Ok(())
    }
}
