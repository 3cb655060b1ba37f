use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use takt_core::{AssignResult, QueueStatus, QuotaRow, TaktError, TickSnapshot};

use crate::component::{Stage, TickContext, REGISTERED_CONFIG_KEY};

/// How long to wait for a fresh Beater snapshot before publishing an invalid
/// heartbeat tick instead.
const UPSTREAM_WAIT: Duration = Duration::from_secs(2);

/// Second pipeline stage: per-task entitlement. Pure function of the tick's
/// snapshot; never touches the database or any physical node binding.
pub struct Assigner {
    last_seq: u64,
    wait_timeout: Duration,
}

impl Assigner {
    pub fn new() -> Self {
        Self {
            last_seq: 0,
            wait_timeout: UPSTREAM_WAIT,
        }
    }

    #[cfg(test)]
    fn with_wait_timeout(timeout: Duration) -> Self {
        Self {
            last_seq: 0,
            wait_timeout: timeout,
        }
    }
}

impl Default for Assigner {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Assigner {
    fn name(&self) -> &str {
        "assigner"
    }

    fn process(&mut self, ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
        let reader = ctx
            .upstreams
            .get_mut("beater")
            .ok_or_else(|| TaktError::Channel("assigner has no beater upstream".into()))?;

        let Some(snap) = reader.wait_for_next(self.last_seq, Some(self.wait_timeout))? else {
            warn!(last_seq = self.last_seq, "no fresh beater snapshot, heartbeat only");
            ctx.out.valid = false;
            return Ok(());
        };
        self.last_seq = snap.seq;

        ctx.out.valid = ctx.out.valid && snap.valid;
        ctx.out.resource = snap.resource;
        ctx.out.task = snap.task;
        ctx.out.user = snap.user;
        ctx.out.metrics.extend(snap.metrics);
        for (key, value) in snap.extra {
            // Our own registered-config echo must not be clobbered by the
            // upstream's.
            if key != REGISTERED_CONFIG_KEY {
                ctx.out.extra.entry(key).or_insert(value);
            }
        }

        if ctx.out.valid {
            assign(ctx.out);
        }
        Ok(())
    }
}

// ── Quota table ──────────────────────────────────────────────────────

/// `(user, priority, group) -> remaining quota`, built from active quota
/// rows. The most specific matching scope wins: an exact group row shadows a
/// `"*"` wildcard row.
struct QuotaTable<'a> {
    rows: Vec<&'a QuotaRow>,
    remaining: HashMap<(String, i32, String), i64>,
}

impl<'a> QuotaTable<'a> {
    fn new(rows: &'a [QuotaRow]) -> Self {
        Self {
            rows: rows.iter().filter(|r| r.active).collect(),
            remaining: HashMap::new(),
        }
    }

    /// Static ceiling for the tuple, independent of what this tick already
    /// debited.
    fn ceiling(&self, user: &str, priority: i32, group: &str) -> u32 {
        let exact = self
            .rows
            .iter()
            .find(|r| r.user_name == user && r.priority == priority && r.group == group);
        if let Some(row) = exact {
            return row.quota;
        }
        self.rows
            .iter()
            .find(|r| r.user_name == user && r.priority == priority && r.group == "*")
            .map(|r| r.quota)
            .unwrap_or(0)
    }

    /// Debit `nodes` from the tuple's remaining quota if it fits.
    fn try_debit(&mut self, user: &str, priority: i32, group: &str, nodes: u32) -> bool {
        let ceiling = self.ceiling(user, priority, group) as i64;
        let remaining = self
            .remaining
            .entry((user.to_string(), priority, group.to_string()))
            .or_insert(ceiling);
        if *remaining >= nodes as i64 {
            *remaining -= nodes as i64;
            true
        } else {
            false
        }
    }

    /// Priority levels the user holds any quota at in this group, highest
    /// first.
    fn levels(&self, user: &str, group: &str) -> Vec<i32> {
        let mut levels: Vec<i32> = self
            .rows
            .iter()
            .filter(|r| r.user_name == user && (r.group == group || r.group == "*"))
            .map(|r| r.priority)
            .collect();
        levels.sort_unstable_by(|a, b| b.cmp(a));
        levels.dedup();
        levels
    }

    /// Largest ceiling the user could ever hold in this group, across all
    /// priority levels.
    fn max_ceiling(&self, user: &str, group: &str) -> u32 {
        self.levels(user, group)
            .into_iter()
            .map(|p| self.ceiling(user, p, group))
            .max()
            .unwrap_or(0)
    }
}

// ── Entitlement algorithm ────────────────────────────────────────────

/// FIFO-with-quota entitlement over one tick's snapshot.
///
/// Queued and scheduled tasks both flow through (a running task must keep
/// debiting its quota or it loses entitlement). Tasks with auto priority are
/// resolved to the highest priority level with room, and the resolved level
/// is written back into the snapshot row for this tick only.
pub fn assign(snap: &mut TickSnapshot) {
    let mut quotas = QuotaTable::new(&snap.user);

    // Ready, active, not claimed by a concurrent pipeline. Working nodes
    // still count: their scheduled tasks consume the capacity prefix below.
    let mut capacity: HashMap<String, i64> = HashMap::new();
    for node in &snap.resource {
        let slot = capacity.entry(node.group.clone()).or_insert(0);
        if node.is_schedulable() {
            *slot += 1;
        }
    }

    // Priority is the primary order, FIFO `(custom_rank, first_id)` breaks
    // ties within a priority. Two passes with a stable sort.
    let mut order: Vec<usize> = (0..snap.task.len())
        .filter(|&i| snap.task[i].queue_status != QueueStatus::Finished)
        .collect();
    order.sort_by_key(|&i| snap.task[i].fifo_key());
    order.sort_by(|&a, &b| snap.task[b].priority.cmp(&snap.task[a].priority));

    for &i in &order {
        let (user, group, nodes, auto) = {
            let t = &snap.task[i];
            (
                t.user_name.clone(),
                t.group.clone(),
                t.nodes,
                t.has_auto_priority(),
            )
        };

        if !capacity.contains_key(&group) {
            let t = &mut snap.task[i];
            t.assign_result = AssignResult::NodeError;
            t.scheduler_msg = Some(format!("no nodes in group {group}"));
            continue;
        }

        if auto {
            let levels = quotas.levels(&user, &group);
            let fit = levels
                .iter()
                .find(|&&level| quotas.try_debit(&user, level, &group, nodes))
                .copied();
            let t = &mut snap.task[i];
            match fit {
                Some(level) => {
                    debug!(task_id = t.id, level, "auto priority resolved");
                    t.priority = level;
                    t.assign_result = AssignResult::NotSure;
                    t.scheduler_msg = None;
                }
                None if quotas.max_ceiling(&user, &group) < nodes => {
                    t.assign_result = AssignResult::QuotaExceeded;
                    t.scheduler_msg = Some(format!(
                        "quota exceeded: needs {nodes} nodes, best ceiling in {group} is {}",
                        quotas.max_ceiling(&user, &group)
                    ));
                }
                None => {
                    t.assign_result = AssignResult::OutOfQuota;
                    t.scheduler_msg = Some(format!("out of quota in group {group}"));
                }
            }
        } else {
            let priority = snap.task[i].priority;
            let fits = quotas.try_debit(&user, priority, &group, nodes);
            let ceiling = quotas.ceiling(&user, priority, &group);
            let t = &mut snap.task[i];
            if fits {
                t.assign_result = AssignResult::NotSure;
                t.scheduler_msg = None;
            } else if ceiling < nodes {
                // Can never fit regardless of current usage: terminal, do
                // not retry.
                t.assign_result = AssignResult::QuotaExceeded;
                t.scheduler_msg = Some(format!(
                    "quota exceeded: needs {nodes} nodes, ceiling at priority {priority} is {ceiling}"
                ));
            } else {
                t.assign_result = AssignResult::OutOfQuota;
                t.scheduler_msg = Some(format!("out of quota at priority {priority}"));
            }
        }
    }

    // Capacity prefix per group: re-rank provisional tasks (auto priorities
    // are resolved now) and admit the prefix whose cumulative node demand
    // fits the group's schedulable node count.
    let mut provisional: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&i| snap.task[i].assign_result == AssignResult::NotSure)
        .collect();
    provisional.sort_by_key(|&i| snap.task[i].fifo_key());
    provisional.sort_by(|&a, &b| snap.task[b].priority.cmp(&snap.task[a].priority));

    let mut used: HashMap<String, i64> = HashMap::new();
    let mut can_run = 0u64;
    for i in provisional {
        let group = snap.task[i].group.clone();
        let free = capacity.get(&group).copied().unwrap_or(0);
        let running = used.entry(group.clone()).or_insert(0);
        let t = &mut snap.task[i];
        if *running + t.nodes as i64 <= free {
            *running += t.nodes as i64;
            t.assign_result = AssignResult::CanRun;
            t.scheduler_msg = None;
            can_run += 1;
        } else {
            t.assign_result = AssignResult::CanNotRun;
            t.scheduler_msg = Some(format!("waiting for free nodes in group {group}"));
        }
    }

    snap.metrics
        .insert("assign_can_run".into(), can_run as f64);
}

// ── Tests ────────────────────────────────────────────────────────────
