use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Event, FeatureModule, ModuleInfo, ModuleState};
use crate::context::CoreContext;
use crate::error::ModuleError;

struct ModuleHandle {
    module: Arc<dyn FeatureModule>,
    state: ModuleState,
    loaded_at: Option<chrono::DateTime<Utc>>,
}

/// Owns the ordered set of feature modules and drives their lifecycle.
pub struct SessionManager {
    ctx: CoreContext,
    stagger: Duration,
    shutdown: CancellationToken,
    modules: Vec<ModuleHandle>,
}

impl SessionManager {
    pub fn new(ctx: CoreContext, stagger: Duration) -> Self {
        let shutdown = ctx.cancel_token().child_token();
        Self {
            ctx,
            stagger,
            shutdown,
            modules: Vec::new(),
        }
    }

    /// Abort staggered loading when `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Add a module in `Unloaded` state. Load order follows registration order.
    pub fn register(&mut self, module: Arc<dyn FeatureModule>) -> Result<(), ModuleError> {
        let name = module.name().to_string();
        if self.position(&name).is_some() {
            return Err(ModuleError::Duplicate(name));
        }
        info!(module = %name, "registering module");
        self.modules.push(ModuleHandle {
            module,
            state: ModuleState::Unloaded,
            loaded_at: None,
        });
        Ok(())
    }

    /// Load every `Unloaded` module in order, pausing `stagger` between one
    /// load finishing and the next starting. A failing module is marked
    /// `Failed` and the rest still load. Returns how many became active.
    pub async fn load_all(&mut self) -> usize {
        let mut attempted = 0;
        let mut loaded = 0;
        for idx in 0..self.modules.len() {
            if self.modules[idx].state != ModuleState::Unloaded {
                continue;
            }
            if attempted > 0 && !self.stagger.is_zero() {
                let name = self.modules[idx].module.name().to_string();
                info!(module = %name, delay = ?self.stagger, "waiting before next module load");
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        warn!("shutdown requested, aborting module loading");
                        break;
                    }
                    _ = tokio::time::sleep(self.stagger) => {}
                }
            }
            attempted += 1;
            if self.load_at(idx).await.is_ok() {
                loaded += 1;
            }
        }
        info!(loaded, total = self.modules.len(), "module loading finished");
        loaded
    }

    /// Load a single module immediately, without stagger.
    pub async fn load(&mut self, name: &str) -> Result<(), ModuleError> {
        let idx = self.index(name)?;
        self.load_at(idx).await
    }

    /// Tear a module down, waiting for its flush, and mark it `Unloaded`.
    /// A failed teardown still unloads the module but reports the error.
    pub async fn unload(&mut self, name: &str) -> Result<(), ModuleError> {
        let idx = self.index(name)?;
        self.transition(idx, ModuleState::Unloading)?;

        let module = self.modules[idx].module.clone();
        let ctx = self.ctx.clone();
        let result = match tokio::spawn(async move { module.teardown(&ctx).await }).await {
            Ok(result) => result,
            Err(join) => Err(ModuleError::Teardown {
                module: name.to_string(),
                reason: panic_reason(join),
            }),
        };

        self.transition(idx, ModuleState::Unloaded)?;
        self.modules[idx].loaded_at = None;
        match result {
            Ok(()) => {
                info!(module = %name, "module unloaded");
                Ok(())
            }
            Err(e) => {
                error!(module = %name, error = %e, "module teardown failed");
                Err(e)
            }
        }
    }

    /// Unload every active module in reverse load order.
    pub async fn unload_all(&mut self) {
        let names: Vec<String> = self
            .modules
            .iter()
            .rev()
            .filter(|h| h.state == ModuleState::Active)
            .map(|h| h.module.name().to_string())
            .collect();
        for name in names {
            info!(module = %name, "shutting down module");
            // Errors are already logged by unload.
            let _ = self.unload(&name).await;
        }
    }

    /// Unload then load an active module.
    pub async fn reload(&mut self, name: &str) -> Result<(), ModuleError> {
        self.unload(name).await?;
        self.load(name).await
    }

    /// Deliver an event to every active module in order. Returns whether any
    /// module consumed it.
    pub async fn dispatch(&self, event: &Event) -> Result<bool, ModuleError> {
        dispatch_to(&self.ctx, &self.active_modules(), event).await
    }

    /// Snapshot of the active modules, so events can be handled without
    /// holding the manager.
    pub fn active_modules(&self) -> Vec<Arc<dyn FeatureModule>> {
        self.modules
            .iter()
            .filter(|h| h.state == ModuleState::Active)
            .map(|h| h.module.clone())
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.position(name).map(|idx| self.modules[idx].state.clone())
    }

    pub fn list(&self) -> Vec<ModuleInfo> {
        self.modules
            .iter()
            .map(|h| ModuleInfo {
                name: h.module.name().to_string(),
                state: h.state.clone(),
                loaded_at: h.loaded_at,
                owned_keys: h.module.owned_keys(),
                owned_scopes: h.module.owned_scopes(),
            })
            .collect()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn active_count(&self) -> usize {
        self.modules
            .iter()
            .filter(|h| h.state == ModuleState::Active)
            .count()
    }

    async fn load_at(&mut self, idx: usize) -> Result<(), ModuleError> {
        self.transition(idx, ModuleState::Loading)?;

        let module = self.modules[idx].module.clone();
        let name = module.name().to_string();
        for scope in module.owned_scopes() {
            self.ctx.governor.ensure_scope(&scope);
        }

        info!(module = %name, "loading module");
        let ctx = self.ctx.clone();
        let init = tokio::spawn(async move { module.init(&ctx).await }).await;
        let result = match init {
            Ok(result) => result,
            Err(join) => Err(ModuleError::Init {
                module: name.clone(),
                reason: panic_reason(join),
            }),
        };

        match result {
            Ok(()) => {
                self.transition(idx, ModuleState::Active)?;
                self.modules[idx].loaded_at = Some(Utc::now());
                info!(module = %name, "module loaded");
                Ok(())
            }
            Err(e) => {
                error!(module = %name, error = %e, "failed to load module");
                self.transition(idx, ModuleState::Failed(e.to_string()))?;
                Err(e)
            }
        }
    }

    fn transition(&mut self, idx: usize, next: ModuleState) -> Result<(), ModuleError> {
        let handle = &mut self.modules[idx];
        if !handle.state.can_transition_to(&next) {
            return Err(ModuleError::InvalidTransition {
                module: handle.module.name().to_string(),
                from: handle.state.label(),
                to: next.label(),
            });
        }
        handle.state = next;
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|h| h.module.name() == name)
    }

    fn index(&self, name: &str) -> Result<usize, ModuleError> {
        self.position(name)
            .ok_or_else(|| ModuleError::Unknown(name.to_string()))
    }
}

/// Run `event` through `modules`. One module's error is logged and does
/// not stop the others; the first error is returned after all have run.
pub async fn dispatch_to(
    ctx: &CoreContext,
    modules: &[Arc<dyn FeatureModule>],
    event: &Event,
) -> Result<bool, ModuleError> {
    let mut consumed = false;
    let mut first_err = None;
    for module in modules {
        match module.handle(ctx, event).await {
            Ok(true) => consumed = true,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    module = %module.name(),
                    actor = %event.actor,
                    error = %e,
                    "module failed to handle event"
                );
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(consumed),
    }
}

fn panic_reason(join: tokio::task::JoinError) -> String {
    if join.is_panic() {
        let payload = join.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panicked".to_string())
    } else {
        "cancelled".to_string()
    }
}
