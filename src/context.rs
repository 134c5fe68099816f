//! Shared handles given to every feature module.
//!
//! The registries are created once at startup and passed around explicitly,
//! so tests can build an isolated context per case.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::error::{CoreError, LockError};
use crate::governor::RateGovernor;
use crate::locks::{KeyGuard, LockRegistry};
use crate::metrics::Metrics;
use crate::outbound::{Connector, DenyPolicy, Outbound, SendOutcome};
use crate::store::{Document, DocumentStore};

#[derive(Clone)]
pub struct CoreContext {
    pub store: Arc<DocumentStore>,
    pub locks: Arc<LockRegistry>,
    pub governor: Arc<RateGovernor>,
    pub outbound: Arc<Outbound>,
    pub metrics: Arc<Metrics>,
    lock_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl CoreContext {
    /// Open the store and build the registries described by `config`.
    pub async fn build(
        config: &Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let store = Arc::new(DocumentStore::open(&config.storage).await?);
        let governor = Arc::new(RateGovernor::new(&config.rate));
        let metrics = Arc::new(Metrics::new());
        let outbound = Outbound::new(governor.clone(), connector, metrics.clone())
            .with_policy(DenyPolicy::from_config(&config.rate));
        Ok(Self {
            store,
            locks: Arc::new(LockRegistry::new()),
            governor,
            outbound: Arc::new(outbound),
            metrics,
            lock_timeout: config.modules.lock_timeout(),
            cancel: CancellationToken::new(),
        })
    }

    /// Token that fires at shutdown. Every suspending call made through the
    /// context observes it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn lock(&self, key: &str) -> Result<KeyGuard, LockError> {
        self.locks
            .acquire_with(key, self.lock_timeout, &self.cancel)
            .await
    }

    /// Unlocked read of the last committed version.
    pub async fn read(&self, key: &str) -> Result<Option<Document>, CoreError> {
        Ok(self.store.read(key).await?)
    }

    /// Locked read-modify-write of one document. A missing document starts
    /// out empty. When this returns `Err` the mutation was not persisted.
    pub async fn update<F, R>(&self, key: &str, mutate: F) -> Result<R, CoreError>
    where
        F: FnOnce(&mut Document) -> R,
    {
        let _guard = self.lock(key).await?;
        let mut doc = self.store.read(key).await?.unwrap_or_default();
        let out = mutate(&mut doc);
        let written = self.store.write(key, &doc).await;
        self.metrics.record_write(written.is_ok());
        if let Err(e) = &written {
            warn!(key, error = %e, "document update not persisted");
        }
        written?;
        Ok(out)
    }

    /// Locked overwrite, for flushing in-memory state.
    pub async fn replace(&self, key: &str, doc: &Document) -> Result<(), CoreError> {
        let _guard = self.lock(key).await?;
        let written = self.store.write(key, doc).await;
        self.metrics.record_write(written.is_ok());
        Ok(written?)
    }

    pub async fn send(
        &self,
        scope: &str,
        target: &str,
        content: &str,
    ) -> Result<SendOutcome, CoreError> {
        Ok(self
            .outbound
            .send(scope, target, content, &self.cancel)
            .await?)
    }
}
