//! Pluggable feature modules and their lifecycle.

pub mod manager;
pub mod notes;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::CoreContext;
use crate::error::ModuleError;

pub use manager::SessionManager;

/// Inbound event as extracted by the platform connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable id of the user who triggered the event
    pub actor: String,
    /// Where replies go
    pub channel: String,
    pub content: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl Event {
    pub fn new(
        actor: impl Into<String>,
        channel: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            channel: channel.into(),
            content: content.into(),
            is_admin: false,
        }
    }

    pub fn as_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    /// Split `!command arg1 arg2` into the command name and its arguments.
    pub fn command(&self) -> Option<(&str, Vec<&str>)> {
        let mut parts = self.content.trim().strip_prefix('!')?.split_whitespace();
        let name = parts.next()?;
        Some((name, parts.collect()))
    }
}

/// Capability interface every feature module implements.
///
/// `init` and `teardown` are called by the [`SessionManager`] only; `handle`
/// may run concurrently for many events, so modules keep mutable state behind
/// their own synchronization and persist through the [`CoreContext`].
#[async_trait]
pub trait FeatureModule: Send + Sync {
    fn name(&self) -> &str;

    /// Document key namespaces this module writes under
    fn owned_keys(&self) -> Vec<String>;

    /// Rate scopes this module sends through
    fn owned_scopes(&self) -> Vec<String>;

    async fn init(&self, ctx: &CoreContext) -> Result<(), ModuleError>;

    /// Must flush any in-memory state through the store before returning.
    async fn teardown(&self, ctx: &CoreContext) -> Result<(), ModuleError>;

    /// Returns `Ok(true)` when the event was consumed.
    async fn handle(&self, ctx: &CoreContext, event: &Event) -> Result<bool, ModuleError>;
}

/// Module lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModuleState {
    Unloaded,
    Loading,
    Active,
    Unloading,
    /// Terminal: init failed
    Failed(String),
}

impl ModuleState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Unloading => "unloading",
            Self::Failed(_) => "failed",
        }
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: &ModuleState) -> bool {
        matches!(
            (self, next),
            (Self::Unloaded, Self::Loading)
                | (Self::Loading, Self::Active)
                | (Self::Loading, Self::Failed(_))
                | (Self::Active, Self::Unloading)
                | (Self::Unloading, Self::Unloaded)
        )
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Module summary for status listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub state: ModuleState,
    pub loaded_at: Option<DateTime<Utc>>,
    pub owned_keys: Vec<String>,
    pub owned_scopes: Vec<String>,
}
