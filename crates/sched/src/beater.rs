use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use takt_core::{apply_mutations, Mutation, QuotaRow, ResourceRow, TaktError, TaskRow};

use crate::component::{Stage, TickContext};

/// Snapshot extra key under which a FeedBacker publishes its mutation list.
pub const MUTATIONS_KEY: &str = "mutations";

/// The external snapshot-provider contract: produces the authoritative
/// cluster/task/user state each tick.
pub trait SnapshotProvider {
    fn resources(&mut self) -> Result<Vec<ResourceRow>, TaktError>;
    fn tasks(&mut self) -> Result<Vec<TaskRow>, TaktError>;
    fn quotas(&mut self) -> Result<Vec<QuotaRow>, TaktError>;
}

/// Durable record of task priority changes. The Beater is the single place
/// priority changes are recorded, independent of who or what changed them.
pub trait PriorityAudit {
    fn record(&mut self, task_id: i64, priority: i32, at: DateTime<Utc>) -> Result<(), TaktError>;
}

/// First pipeline stage: samples authoritative state on a wall-clock-aligned
/// cadence and publishes the tick's baseline snapshot, after applying any
/// pending feedback mutations.
pub struct Beater<P, A> {
    provider: P,
    audit: A,
    interval: Duration,
    /// Resource groups this pipeline schedules; empty = all.
    groups: Vec<String>,
    warmed_up: bool,
    prev_priorities: HashMap<i64, i32>,
}

impl<P: SnapshotProvider, A: PriorityAudit> Beater<P, A> {
    pub fn new(provider: P, audit: A, interval: Duration, groups: Vec<String>) -> Self {
        Self {
            provider,
            audit,
            interval,
            groups,
            warmed_up: false,
            prev_priorities: HashMap::new(),
        }
    }

    fn in_scope(&self, group: &str) -> bool {
        self.groups.is_empty() || self.groups.iter().any(|g| g == group)
    }

    /// Apply each FeedBacker's declared mutations; an offline or invalid
    /// FeedBacker poisons the whole tick.
    fn apply_feedback(&mut self, ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
        let mut pending: Vec<(String, Vec<Mutation>)> = Vec::new();

        for (name, reader) in ctx.upstreams.iter_mut() {
            if reader.header_seq()? == 0 {
                warn!(feedbacker = %name, "feedbacker has not published yet, tick invalid");
                ctx.out.valid = false;
                continue;
            }
            let snap = reader.get()?;
            if !snap.valid {
                warn!(feedbacker = %name, "feedbacker invalid, tick invalid");
                ctx.out.valid = false;
                continue;
            }
            if let Some(raw) = snap.extra.get(MUTATIONS_KEY) {
                let mutations: Vec<Mutation> = serde_json::from_value(raw.clone())
                    .map_err(|e| TaktError::Config(format!("bad mutation list from {name}: {e}")))?;
                pending.push((name.clone(), mutations));
            }
        }

        for (name, mutations) in pending {
            debug!(feedbacker = %name, count = mutations.len(), "applying feedback mutations");
            apply_mutations(ctx.out, &mutations)?;
        }
        Ok(())
    }

    /// Record every priority that differs from the previous tick's value.
    fn audit_priorities(&mut self, tasks: &[TaskRow]) -> Result<(), TaktError> {
        let now = Utc::now();
        let mut current = HashMap::with_capacity(tasks.len());
        for task in tasks {
            current.insert(task.id, task.priority);
            if let Some(prev) = self.prev_priorities.get(&task.id) {
                if *prev != task.priority {
                    info!(
                        task_id = task.id,
                        from = prev,
                        to = task.priority,
                        "task priority changed"
                    );
                    self.audit.record(task.id, task.priority, now)?;
                }
            }
        }
        self.prev_priorities = current;
        Ok(())
    }
}

impl<P: SnapshotProvider, A: PriorityAudit> Stage for Beater<P, A> {
    fn name(&self) -> &str {
        "beater"
    }

    fn registered_config(&self) -> Vec<(String, serde_json::Value)> {
        vec![("feedback_enabled".into(), serde_json::json!(true))]
    }

    fn pace(&mut self) {
        sleep_until_aligned(self.interval);
    }

    fn process(&mut self, ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
        ctx.out.resource = self
            .provider
            .resources()?
            .into_iter()
            .filter(|r| self.in_scope(&r.group))
            .collect();
        ctx.out.task = self
            .provider
            .tasks()?
            .into_iter()
            .filter(|t| self.in_scope(&t.group))
            .collect();
        ctx.out.user = self
            .provider
            .quotas()?
            .into_iter()
            .filter(|q| q.group == "*" || self.in_scope(&q.group))
            .collect();

        if !self.warmed_up {
            // FeedBackers get one tick to come online before their output is
            // trusted; nothing downstream acts on this snapshot.
            self.warmed_up = true;
            ctx.out.valid = false;
        } else {
            let feedback_enabled = ctx
                .config
                .get("feedback_enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if feedback_enabled {
                self.apply_feedback(ctx)?;
            }
        }

        self.audit_priorities(&ctx.out.task)?;

        ctx.out
            .metrics
            .insert("beater_tasks".into(), ctx.out.task.len() as f64);
        ctx.out
            .metrics
            .insert("beater_nodes".into(), ctx.out.resource.len() as f64);
        Ok(())
    }
}

/// Sleep until the next wall-clock multiple of `interval`, so independent
/// Beaters across a cluster stay roughly in phase.
fn sleep_until_aligned(interval: Duration) {
    let interval_ms = interval.as_millis().max(1) as u64;
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let next = (now_ms / interval_ms + 1) * interval_ms;
    std::thread::sleep(Duration::from_millis(next - now_ms));
}

// ── Tests ────────────────────────────────────────────────────────────
