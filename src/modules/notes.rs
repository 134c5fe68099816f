//! Nyx Notes: per-user points with a leaderboard.
//!
//! Each user's balance lives in its own document (`notes.<user_id>`) and
//! every change is a locked read-modify-write, so concurrent awards never
//! lose an update. Command usage counters are kept in memory and flushed to
//! `stats.notes` when the module is torn down.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Event, FeatureModule};
use crate::context::CoreContext;
use crate::error::{CoreError, ModuleError};
use crate::outbound::SendOutcome;
use crate::store::{doc_key, validate_key, Document};

pub const NAMESPACE: &str = "notes";
pub const REPLY_SCOPE: &str = "notes.reply";
const STATS_KEY: &str = "stats.notes";
const LEADERBOARD_DEFAULT: usize = 10;
const LEADERBOARD_MAX: usize = 20;

#[derive(Default)]
pub struct NotesModule {
    usage: Mutex<HashMap<String, u64>>,
}

impl NotesModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` (may be negative) to a user's points, never going below
    /// zero. Returns the new total.
    pub async fn add_points(
        &self,
        ctx: &CoreContext,
        user: &str,
        amount: i64,
    ) -> Result<i64, CoreError> {
        ctx.update(&doc_key(NAMESPACE, user), |doc| {
            let old = points_of(doc);
            let new = old.saturating_add(amount).max(0);
            set_points_in(doc, new);
            debug!(user, old, new, amount, "points changed");
            new
        })
        .await
    }

    /// Overwrite a user's points, clamped to zero.
    pub async fn set_points(
        &self,
        ctx: &CoreContext,
        user: &str,
        amount: i64,
    ) -> Result<i64, CoreError> {
        let amount = amount.max(0);
        ctx.update(&doc_key(NAMESPACE, user), |doc| set_points_in(doc, amount))
            .await?;
        Ok(amount)
    }

    pub async fn get_points(&self, ctx: &CoreContext, user: &str) -> Result<i64, CoreError> {
        Ok(ctx
            .read(&doc_key(NAMESPACE, user))
            .await?
            .map(|doc| points_of(&doc))
            .unwrap_or(0))
    }

    /// Top users by points, highest first; ties ordered by user id.
    pub async fn leaderboard(
        &self,
        ctx: &CoreContext,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, CoreError> {
        let prefix = format!("{NAMESPACE}.");
        let mut rows = Vec::new();
        for key in ctx.store.keys(NAMESPACE).await? {
            let Some(user) = key.strip_prefix(&prefix) else { continue };
            if let Some(doc) = ctx.read(&key).await? {
                rows.push((user.to_string(), points_of(&doc)));
            }
        }
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn count_usage(&self, command: &str) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        *usage.entry(command.to_string()).or_insert(0) += 1;
    }

    async fn reply(&self, ctx: &CoreContext, event: &Event, text: &str) {
        match ctx.send(REPLY_SCOPE, &event.channel, text).await {
            Ok(SendOutcome::Sent) => {}
            Ok(outcome) => debug!(channel = %event.channel, ?outcome, "reply skipped"),
            Err(e) => warn!(channel = %event.channel, error = %e, "reply failed"),
        }
    }

    async fn run_command(
        &self,
        ctx: &CoreContext,
        event: &Event,
        name: &str,
        args: &[&str],
    ) -> Result<(), CoreError> {
        match name {
            "nyxnotes" => {
                let Some(user) = parse_user(args.first().copied().unwrap_or(&event.actor)) else {
                    self.reply(ctx, event, "Usage: !nyxnotes [user]").await;
                    return Ok(());
                };
                let points = self.get_points(ctx, &user).await?;
                self.reply(ctx, event, &format!("{user}'s Nyx Notes: {points} 🪙")).await;
            }
            "leaderboard" => {
                let limit = leaderboard_limit(args.first().copied());
                let rows = self.leaderboard(ctx, limit).await?;
                let text = if rows.is_empty() {
                    "No users found with Nyx Notes yet!".to_string()
                } else {
                    format_leaderboard(&rows)
                };
                self.reply(ctx, event, &text).await;
            }
            "givepoints" => {
                if !event.is_admin {
                    self.reply(ctx, event, "Only administrators can give Nyx Notes.").await;
                    return Ok(());
                }
                let user = args.first().copied().and_then(parse_user);
                let amount = args.get(1).and_then(|a| a.parse::<i64>().ok());
                let (Some(user), Some(amount)) = (user, amount) else {
                    self.reply(ctx, event, "Usage: !givepoints <user> <amount>").await;
                    return Ok(());
                };
                let total = self.add_points(ctx, &user, amount).await?;
                info!(actor = %event.actor, user = %user, amount, total, "points awarded");
                self.reply(
                    ctx,
                    event,
                    &format!("Gave {amount} 🪙 to {user}. New total: {total} 🪙"),
                )
                .await;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl FeatureModule for NotesModule {
    fn name(&self) -> &str {
        "notes"
    }

    fn owned_keys(&self) -> Vec<String> {
        vec![NAMESPACE.to_string(), STATS_KEY.to_string()]
    }

    fn owned_scopes(&self) -> Vec<String> {
        vec![REPLY_SCOPE.to_string()]
    }

    async fn init(&self, ctx: &CoreContext) -> Result<(), ModuleError> {
        let users = ctx.store.keys(NAMESPACE).await.map_err(CoreError::from)?.len();
        info!(users, "notes module ready");
        Ok(())
    }

    async fn teardown(&self, ctx: &CoreContext) -> Result<(), ModuleError> {
        let pending: HashMap<String, u64> = {
            let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *usage)
        };
        if pending.is_empty() {
            return Ok(());
        }

        let flushed = ctx
            .update(STATS_KEY, |doc| {
                for (command, count) in &pending {
                    let total = doc.get(command).and_then(Value::as_u64).unwrap_or(0) + count;
                    doc.insert(command.clone(), json!(total));
                }
            })
            .await;
        if let Err(e) = flushed {
            // Put the counters back so a later teardown can retry.
            let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
            for (command, count) in pending {
                *usage.entry(command).or_insert(0) += count;
            }
            return Err(e.into());
        }
        info!("notes usage flushed");
        Ok(())
    }

    async fn handle(&self, ctx: &CoreContext, event: &Event) -> Result<bool, ModuleError> {
        let Some((name, args)) = event.command() else {
            return Ok(false);
        };
        if !matches!(name, "nyxnotes" | "leaderboard" | "givepoints") {
            return Ok(false);
        }
        self.count_usage(name);

        if let Err(e) = self.run_command(ctx, event, name, &args).await {
            self.reply(ctx, event, e.user_message()).await;
            return Err(e.into());
        }
        Ok(true)
    }
}

/// Resolve a user argument to an id usable in a document key. Accepts a bare
/// id or a `<@id>` / `<@!id>` mention.
fn parse_user(arg: &str) -> Option<String> {
    let id = arg
        .strip_prefix("<@")
        .and_then(|rest| rest.strip_suffix('>'))
        .map(|rest| rest.trim_start_matches('!'))
        .unwrap_or(arg);
    if id.is_empty() {
        return None;
    }
    validate_key(&doc_key(NAMESPACE, id)).ok()?;
    Some(id.to_string())
}

fn points_of(doc: &Document) -> i64 {
    doc.get("points").and_then(Value::as_i64).unwrap_or(0)
}

fn set_points_in(doc: &mut Document, points: i64) {
    doc.insert("points".into(), json!(points));
    doc.insert("updated_at".into(), json!(Utc::now().to_rfc3339()));
}

fn leaderboard_limit(arg: Option<&str>) -> usize {
    match arg.and_then(|a| a.parse::<i64>().ok()) {
        Some(n) if n > LEADERBOARD_MAX as i64 => LEADERBOARD_MAX,
        Some(n) if n >= 1 => n as usize,
        _ => LEADERBOARD_DEFAULT,
    }
}

fn format_leaderboard(rows: &[(String, i64)]) -> String {
    let lines: Vec<String> = rows
        .iter()
        .enumerate()
        .map(|(i, (user, points))| {
            let rank = match i {
                0 => "🥇".to_string(),
                1 => "🥈".to_string(),
                2 => "🥉".to_string(),
                n => format!("{}.", n + 1),
            };
            format!("{rank} {user} - {points} 🪙")
        })
        .collect();
    format!("🏆 Nyx Notes Leaderboard\n{}", lines.join("\n"))
}
