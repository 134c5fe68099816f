use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::CoreContext;
use crate::error::{CoreError, ModuleError};
use crate::modules::manager::dispatch_to;
use crate::modules::{Event, FeatureModule, SessionManager};
use crate::outbound::Connector;

pub struct Bot {
    pub ctx: CoreContext,
    pub modules: Arc<RwLock<SessionManager>>,
    shutdown: CancellationToken,
}

impl Bot {
    /// Create a new bot core with no modules registered
    pub async fn new(config: &Config, connector: Arc<dyn Connector>) -> Result<Self, CoreError> {
        let ctx = CoreContext::build(config, connector).await?;
        // Separate from the context token so teardown can still take locks
        // and flush after shutdown is requested.
        let shutdown = ctx.cancel_token().child_token();
        let modules = SessionManager::new(ctx.clone(), config.modules.stagger())
            .with_shutdown(shutdown.clone());
        Ok(Self {
            ctx,
            modules: Arc::new(RwLock::new(modules)),
            shutdown,
        })
    }

    pub async fn register(&self, module: Arc<dyn FeatureModule>) -> Result<(), ModuleError> {
        self.modules.write().await.register(module)
    }

    /// Handle one event against the modules active right now.
    pub async fn handle_event(&self, event: &Event) -> Result<bool, ModuleError> {
        let active = self.modules.read().await.active_modules();
        handle(&self.ctx, &active, event).await
    }

    /// Stop `run` after in-flight events finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Main event loop: load modules with stagger, then spawn one task per
    /// inbound event until shutdown or the channel closes, then drain
    /// in-flight tasks and unload every module.
    pub async fn run(&self, mut events: mpsc::Receiver<Event>) {
        // Loading holds the write lock, so events queue in the channel
        // until every module has had its turn.
        self.modules.write().await.load_all().await;
        info!("bot ready, entering main loop");

        let cancel = self.shutdown.clone();
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("event source closed");
                        break;
                    };
                    let active = self.modules.read().await.active_modules();
                    let ctx = self.ctx.clone();
                    in_flight.spawn(async move {
                        let _ = handle(&ctx, &active, &event).await;
                    });
                }
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "event task panicked");
                    }
                }
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(pending, "waiting for in-flight events");
        }
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "event task panicked");
            }
        }

        self.modules.write().await.unload_all().await;
        let metrics = self.ctx.metrics.snapshot();
        info!(
            events = metrics.events_total,
            failed = metrics.events_failed,
            sends = metrics.sends_ok,
            denied = metrics.sends_denied,
            "bot stopped"
        );
    }
}

async fn handle(
    ctx: &CoreContext,
    active: &[Arc<dyn FeatureModule>],
    event: &Event,
) -> Result<bool, ModuleError> {
    ctx.metrics.record_event();
    let result = dispatch_to(ctx, active, event).await;
    if let Err(e) = &result {
        ctx.metrics.record_event_failure();
        warn!(actor = %event.actor, error = %e, "event handling failed");
    }
    result
}
