use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use takt_core::{
    AssignResult, GroupKind, MatchResult, QueueStatus, TaktError, TickSnapshot,
};

use crate::component::{Stage, TickContext, REGISTERED_CONFIG_KEY};
use crate::db::TaskStore;
use crate::signal::{SignalSink, StopAction};

const UPSTREAM_WAIT: Duration = Duration::from_secs(2);

/// Stop code delivered with a preemption interrupt.
const SUSPEND_STOP_CODE: i32 = 1;

/// Re-signal attempts before the sweep starts alerting about a stuck launch.
const DEFAULT_ALERT_ATTEMPTS: u64 = 5;

// ── Plan types ───────────────────────────────────────────────────────

/// Concrete node binding for one task entering `STARTUP`.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupBinding {
    pub task_id: i64,
    pub nodes: Vec<String>,
    pub gpus: Vec<u32>,
    pub cpu: u32,
    pub memory: u64,
}

/// Everything one tick decided, in the order it must be applied.
#[derive(Debug, Default)]
pub struct MatchPlan {
    pub startup: Vec<StartupBinding>,
    pub suspend: Vec<i64>,
    pub stop: Vec<i64>,
    pub keep: Vec<i64>,
    /// Scheduler messages to persist for tasks that cannot run.
    pub messages: Vec<(i64, String)>,
}

// ── Classification ───────────────────────────────────────────────────

/// Per-node occupancy within one tick's view. Keep-running footprints are
/// deducted here exactly once so co-tenant tasks cannot double-claim a node.
struct FreeView {
    /// Node name -> number of tasks placed on it this tick (working counts
    /// as one).
    load: HashMap<String, u32>,
    deducted: HashSet<i64>,
}

impl FreeView {
    fn new(snap: &TickSnapshot) -> Self {
        let mut load = HashMap::new();
        for node in &snap.resource {
            if node.is_schedulable() {
                load.insert(node.name.clone(), 0);
            }
        }
        Self {
            load,
            deducted: HashSet::new(),
        }
    }

    fn occupy(&mut self, node: &str) {
        if let Some(count) = self.load.get_mut(node) {
            *count += 1;
        }
    }

    fn is_free(&self, node: &str) -> bool {
        self.load.get(node).is_some_and(|&count| count == 0)
    }

    /// Deduct a running task's nodes, once per task per tick.
    fn deduct_running(&mut self, task_id: i64, nodes: &[String]) {
        if !self.deducted.insert(task_id) {
            return;
        }
        for node in nodes {
            self.occupy(node);
        }
    }
}

/// Turn Assigner verdicts into the tick's transition plan, writing each
/// task's `match_result` back into the snapshot.
pub fn classify(snap: &mut TickSnapshot) -> MatchPlan {
    let mut plan = MatchPlan::default();
    let mut free = FreeView::new(snap);

    let group_kind: HashMap<String, GroupKind> = snap
        .resource
        .iter()
        .map(|r| (r.group.clone(), r.group_kind))
        .collect();

    // Scheduled tasks first: their footprint must be deducted before any
    // queued task is placed.
    let mut order: Vec<usize> = (0..snap.task.len()).collect();
    order.sort_by_key(|&i| snap.task[i].queue_status != QueueStatus::Scheduled);

    for i in order {
        let t = &snap.task[i];
        let verdict = match (t.queue_status, t.assign_result) {
            (QueueStatus::Scheduled, AssignResult::CanRun) => {
                let nodes_valid = !t.assigned_nodes.is_empty()
                    && t.assigned_nodes.iter().all(|n| {
                        snap.resource_by_name(n)
                            .is_some_and(|r| r.is_schedulable() && r.group == t.group)
                    });
                if nodes_valid {
                    free.deduct_running(t.id, &t.assigned_nodes);
                    plan.keep.push(t.id);
                    MatchResult::KeepRunning
                } else {
                    plan.messages
                        .push((t.id, format!("assigned nodes gone from group {}", t.group)));
                    MatchResult::DoNothing
                }
            }
            (QueueStatus::Scheduled, _) => {
                // Lost entitlement: preempt.
                plan.suspend.push(t.id);
                plan.messages.push((t.id, "preempted: entitlement lost".into()));
                MatchResult::Suspend
            }
            (QueueStatus::Queued, AssignResult::CanRun) => {
                let kind = group_kind
                    .get(&t.group)
                    .copied()
                    .unwrap_or(GroupKind::Dedicated);
                match place(snap, &free, i, kind) {
                    Some(binding) => {
                        for node in &binding.nodes {
                            free.occupy(node);
                        }
                        let t = &mut snap.task[i];
                        t.assigned_nodes = binding.nodes.clone();
                        t.assigned_gpus = binding.gpus.clone();
                        t.assigned_cpu = binding.cpu;
                        t.assigned_memory = binding.memory;
                        plan.startup.push(binding);
                        MatchResult::Startup
                    }
                    None => {
                        plan.messages
                            .push((t.id, format!("no free nodes in group {}", t.group)));
                        MatchResult::DoNothing
                    }
                }
            }
            (QueueStatus::Queued, _) => {
                let external = snap.user_role(&t.user_name) == Some("external");
                let dedicated = group_kind.get(&t.group) == Some(&GroupKind::Dedicated);
                // Never-started external tasks on a dedicated group are not
                // restartable by policy: stop outright instead of letting
                // them wait forever.
                if external && dedicated && t.assign_result == AssignResult::QuotaExceeded {
                    plan.stop.push(t.id);
                    MatchResult::Stop
                } else {
                    // The entitlement explanation lives only in this tick's
                    // snapshot; persist it so the waiting task row is not
                    // silent.
                    if let Some(msg) = &t.scheduler_msg {
                        plan.messages.push((t.id, msg.clone()));
                    }
                    MatchResult::DoNothing
                }
            }
            _ => MatchResult::DoNothing,
        };
        snap.task[i].match_result = verdict;
    }

    plan
}

/// Pick concrete nodes for a queued task. Dedicated groups take whole free
/// nodes; shared pools take the least-loaded schedulable node.
fn place(
    snap: &TickSnapshot,
    free: &FreeView,
    task_idx: usize,
    kind: GroupKind,
) -> Option<StartupBinding> {
    let t = &snap.task[task_idx];
    match kind {
        GroupKind::Dedicated => {
            let chosen: Vec<&takt_core::ResourceRow> = snap
                .resource
                .iter()
                .filter(|r| r.group == t.group && !r.working && free.is_free(&r.name))
                .take(t.nodes as usize)
                .collect();
            if chosen.len() < t.nodes as usize {
                return None;
            }
            let first = chosen[0];
            Some(StartupBinding {
                task_id: t.id,
                nodes: chosen.iter().map(|r| r.name.clone()).collect(),
                gpus: (0..first.gpu_num).collect(),
                cpu: first.cpu,
                memory: first.memory,
            })
        }
        GroupKind::Shared => {
            // Shared jobs are single-node; pack onto the least-loaded node.
            let node = snap
                .resource
                .iter()
                .filter(|r| r.group == t.group && r.is_schedulable())
                .min_by_key(|r| free.load.get(&r.name).copied().unwrap_or(u32::MAX))?;
            Some(StartupBinding {
                task_id: t.id,
                nodes: vec![node.name.clone()],
                gpus: Vec::new(),
                cpu: 0,
                memory: 0,
            })
        }
    }
}

// ── Stage ────────────────────────────────────────────────────────────

/// Third pipeline stage: node binding, conflict-safe persistence, signal
/// emission, and the periodic re-signal sweep for stuck launches.
pub struct Matcher<S: TaskStore, K: SignalSink> {
    store: S,
    sink: K,
    shard_count: u32,
    re_signal: Duration,
    last_seq: u64,
    wait_timeout: Duration,
    last_sweep: Instant,
    /// Re-signal attempts per stuck task, driving the escalating shard
    /// offset.
    sweep_attempts: HashMap<i64, u64>,
}

impl<S: TaskStore, K: SignalSink> Matcher<S, K> {
    pub fn new(store: S, sink: K, shard_count: u32, re_signal: Duration) -> Self {
        Self {
            store,
            sink,
            shard_count: shard_count.max(1),
            re_signal,
            last_seq: 0,
            wait_timeout: UPSTREAM_WAIT,
            last_sweep: Instant::now(),
            sweep_attempts: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    fn shard_for(&self, task_id: i64, offset: u64) -> u32 {
        ((task_id.unsigned_abs() + offset) % self.shard_count as u64) as u32
    }

    fn send_signals(&mut self, plan: &MatchPlan) -> Result<(), TaktError> {
        for &task_id in &plan.suspend {
            self.sink.push_suspend(task_id, SUSPEND_STOP_CODE)?;
        }
        for &task_id in &plan.stop {
            self.sink.push_stop(task_id, StopAction::Stop)?;
        }
        for binding in &plan.startup {
            let shard = self.shard_for(binding.task_id, 0);
            self.sink.notify_start(binding.task_id, shard)?;
        }
        Ok(())
    }

    /// Find `scheduled` tasks with no running pod and re-send their start
    /// signal, rotating the target shard each attempt.
    fn resignal_sweep(&mut self, alert_attempts: u64) -> Result<(), TaktError> {
        let stuck = self.store.unlaunched_scheduled()?;
        let stuck_set: HashSet<i64> = stuck.iter().copied().collect();
        self.sweep_attempts.retain(|id, _| stuck_set.contains(id));

        for task_id in stuck {
            let attempt = self.sweep_attempts.entry(task_id).or_insert(0);
            *attempt += 1;
            let attempt = *attempt;
            let shard = self.shard_for(task_id, attempt);
            if attempt > alert_attempts {
                warn!(task_id, attempt, "task stuck mid-launch, re-signalling");
            } else {
                info!(task_id, attempt, shard, "re-sending start signal");
            }
            self.sink.notify_start(task_id, shard)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn sink(&self) -> &K {
        &self.sink
    }
}

impl<S: TaskStore, K: SignalSink> Stage for Matcher<S, K> {
    fn name(&self) -> &str {
        "matcher"
    }

    fn registered_config(&self) -> Vec<(String, serde_json::Value)> {
        vec![(
            "resignal_alert_attempts".into(),
            serde_json::json!(DEFAULT_ALERT_ATTEMPTS),
        )]
    }

    fn process(&mut self, ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
        let reader = ctx
            .upstreams
            .get_mut("assigner")
            .ok_or_else(|| TaktError::Channel("matcher has no assigner upstream".into()))?;

        let Some(snap) = reader.wait_for_next(self.last_seq, Some(self.wait_timeout))? else {
            warn!(last_seq = self.last_seq, "no fresh assigner snapshot, heartbeat only");
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
            if key != REGISTERED_CONFIG_KEY {
                ctx.out.extra.entry(key).or_insert(value);
            }
        }

        if ctx.out.valid {
            let plan = classify(ctx.out);
            match self.store.apply(&plan) {
                Ok(()) => {
                    self.send_signals(&plan)?;
                    ctx.out
                        .metrics
                        .insert("match_startup".into(), plan.startup.len() as f64);
                    ctx.out
                        .metrics
                        .insert("match_suspend".into(), plan.suspend.len() as f64);
                    ctx.out
                        .metrics
                        .insert("match_keep".into(), plan.keep.len() as f64);
                }
                Err(TaktError::TaskRaced { task_id }) => {
                    // Lost to a concurrent writer; nothing was persisted and
                    // no signals go out. Retried automatically next tick.
                    info!(task_id, "tick abandoned: task changed under us");
                    ctx.out.metrics.insert("match_raced".into(), 1.0);
                }
                Err(e) => return Err(e),
            }
        }

        if self.last_sweep.elapsed() >= self.re_signal {
            self.last_sweep = Instant::now();
            let alert_attempts = ctx
                .config
                .get_u64("resignal_alert_attempts")
                .unwrap_or(DEFAULT_ALERT_ATTEMPTS);
            self.resignal_sweep(alert_attempts)?;
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use takt_channel::{ChannelReader, ChannelWriter};
    use takt_core::{NodeStatus, QuotaRow, ResourceRow, TaskRow};

    use crate::component::GlobalConfigView;
    use crate::signal::{MemorySignalSink, SignalEvent};

    fn node(name: &str, group: &str, kind: GroupKind) -> ResourceRow {
        ResourceRow {
            name: name.into(),
            status: NodeStatus::Ready,
            group: group.into(),
            origin_group: group.into(),
            group_kind: kind,
            cpu: 64,
            memory: 512 << 30,
            gpu_num: 8,
            schedule_zone: "A".into(),
            working: false,
            working_user: None,
            working_task_type: None,
            active: true,
            allocated: false,
        }
    }

    fn task(id: i64, user: &str, group: &str, nodes: u32) -> TaskRow {
        TaskRow {
            id,
            first_id: id,
            nb_name: format!("t{id}"),
            user_name: user.into(),
            group: group.into(),
            nodes,
            assigned_nodes: vec![],
            backend: "train".into(),
            task_type: "training".into(),
            queue_status: QueueStatus::Queued,
            priority: 20,
            custom_rank: 0,
            created_seconds: 0,
            running_seconds: 0,
            runtime_config: serde_json::json!({}),
            assign_result: AssignResult::CanRun,
            match_result: MatchResult::NotSure,
            scheduler_msg: None,
            assigned_gpus: vec![],
            assigned_cpu: 0,
            assigned_memory: 0,
        }
    }

    fn quota_row(user: &str, role: &str) -> QuotaRow {
        QuotaRow {
            user_name: user.into(),
            resource: "node".into(),
            group: "*".into(),
            priority: 20,
            quota: 8,
            role: role.into(),
            active: true,
        }
    }

    fn match_of(snap: &TickSnapshot, id: i64) -> MatchResult {
        snap.task_by_id(id).unwrap().match_result
    }

    #[test]
    fn queued_can_run_starts_on_free_nodes() {
        let mut snap = TickSnapshot::fresh(1);
        snap.resource = vec![
            node("n1", "g1", GroupKind::Dedicated),
            node("n2", "g1", GroupKind::Dedicated),
        ];
        snap.task = vec![task(1, "alice", "g1", 2)];
        snap.user = vec![quota_row("alice", "internal")];

        let plan = classify(&mut snap);
        assert_eq!(match_of(&snap, 1), MatchResult::Startup);
        assert_eq!(plan.startup.len(), 1);
        assert_eq!(plan.startup[0].nodes, vec!["n1", "n2"]);
        assert_eq!(plan.startup[0].gpus.len(), 8);
        assert_eq!(snap.task_by_id(1).unwrap().assigned_nodes, vec!["n1", "n2"]);
    }

    #[test]
    fn keep_running_footprint_is_deducted_exactly_once() {
        let mut snap = TickSnapshot::fresh(1);
        snap.resource = vec![
            node("n1", "g1", GroupKind::Dedicated),
            node("n2", "g1", GroupKind::Dedicated),
        ];
        let mut running = task(1, "alice", "g1", 1);
        running.queue_status = QueueStatus::Scheduled;
        running.assigned_nodes = vec!["n1".into()];
        snap.task = vec![task(2, "bob", "g1", 1), running];
        snap.user = vec![quota_row("alice", "internal"), quota_row("bob", "internal")];

        let plan = classify(&mut snap);
        assert_eq!(match_of(&snap, 1), MatchResult::KeepRunning);
        assert_eq!(match_of(&snap, 2), MatchResult::Startup);
        // The queued task must land on the remaining node, not n1.
        assert_eq!(plan.startup[0].nodes, vec!["n2"]);

        // Re-running classification on an identical snapshot gives the same
        // placement: the deduction is per tick, not cumulative.
        let mut again = TickSnapshot::fresh(2);
        again.resource = snap.resource.clone();
        again.task = snap.task.clone();
        again.user = snap.user.clone();
        again.task_by_id_mut(2).unwrap().queue_status = QueueStatus::Queued;
        again.task_by_id_mut(2).unwrap().assigned_nodes = vec![];
        let plan2 = classify(&mut again);
        assert_eq!(plan2.startup[0].nodes, vec!["n2"]);
    }

    #[test]
    fn shared_pool_places_on_least_loaded_node() {
        let mut snap = TickSnapshot::fresh(1);
        let mut busy = node("n1", "pool", GroupKind::Shared);
        busy.working = true;
        snap.resource = vec![busy, node("n2", "pool", GroupKind::Shared)];
        snap.task = vec![task(1, "alice", "pool", 1)];
        snap.user = vec![quota_row("alice", "internal")];

        // n1 carries a running task's footprint this tick.
        let mut running = task(9, "bob", "pool", 1);
        running.queue_status = QueueStatus::Scheduled;
        running.assigned_nodes = vec!["n1".into()];
        snap.task.push(running);
        snap.user.push(quota_row("bob", "internal"));

        let plan = classify(&mut snap);
        let binding = plan
            .startup
            .iter()
            .find(|b| b.task_id == 1)
            .expect("task 1 placed");
        assert_eq!(binding.nodes, vec!["n2"]);
    }

    #[test]
    fn scheduled_losing_entitlement_is_suspended() {
        let mut snap = TickSnapshot::fresh(1);
        snap.resource = vec![node("n1", "g1", GroupKind::Dedicated)];
        let mut running = task(1, "alice", "g1", 1);
        running.queue_status = QueueStatus::Scheduled;
        running.assigned_nodes = vec!["n1".into()];
        running.assign_result = AssignResult::CanNotRun;
        snap.task = vec![running];
        snap.user = vec![quota_row("alice", "internal")];

        let plan = classify(&mut snap);
        assert_eq!(match_of(&snap, 1), MatchResult::Suspend);
        assert_eq!(plan.suspend, vec![1]);
    }

    #[test]
    fn external_quota_exceeded_on_dedicated_group_stops() {
        let mut snap = TickSnapshot::fresh(1);
        snap.resource = vec![node("n1", "g1", GroupKind::Dedicated)];
        let mut t = task(1, "eve", "g1", 4);
        t.assign_result = AssignResult::QuotaExceeded;
        snap.task = vec![t];
        snap.user = vec![quota_row("eve", "external")];

        let plan = classify(&mut snap);
        assert_eq!(match_of(&snap, 1), MatchResult::Stop);
        assert_eq!(plan.stop, vec![1]);
    }

    #[test]
    fn internal_quota_exceeded_waits_instead_of_stopping() {
        let mut snap = TickSnapshot::fresh(1);
        snap.resource = vec![node("n1", "g1", GroupKind::Dedicated)];
        let mut t = task(1, "alice", "g1", 4);
        t.assign_result = AssignResult::QuotaExceeded;
        snap.task = vec![t];
        snap.user = vec![quota_row("alice", "internal")];

        let plan = classify(&mut snap);
        assert_eq!(match_of(&snap, 1), MatchResult::DoNothing);
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn quota_denial_reason_is_persisted_while_waiting() {
        let mut snap = TickSnapshot::fresh(1);
        snap.resource = vec![node("n1", "g1", GroupKind::Dedicated)];
        let mut t = task(1, "alice", "g1", 6);
        t.assign_result = AssignResult::QuotaExceeded;
        t.scheduler_msg = Some("quota exceeded: needs 6 nodes, ceiling at priority 20 is 4".into());
        snap.task = vec![t];
        snap.user = vec![quota_row("alice", "internal")];

        let plan = classify(&mut snap);
        assert_eq!(match_of(&snap, 1), MatchResult::DoNothing);
        assert!(plan
            .messages
            .iter()
            .any(|(id, msg)| *id == 1 && msg.contains("quota exceeded")));
    }

    #[test]
    fn external_out_of_quota_waits_for_quota_to_free() {
        let mut snap = TickSnapshot::fresh(1);
        snap.resource = vec![node("n1", "g1", GroupKind::Dedicated)];
        let mut t = task(1, "eve", "g1", 1);
        t.assign_result = AssignResult::OutOfQuota;
        t.scheduler_msg = Some("out of quota in group g1".into());
        snap.task = vec![t];
        snap.user = vec![quota_row("eve", "external")];

        // OutOfQuota is transient: quota frees up when another task ends, so
        // even an external user's task keeps waiting. Only the terminal
        // QuotaExceeded verdict stops it.
        let plan = classify(&mut snap);
        assert_eq!(match_of(&snap, 1), MatchResult::DoNothing);
        assert!(plan.stop.is_empty());
        assert!(plan.messages.iter().any(|(id, _)| *id == 1));
    }

    #[test]
    fn no_free_nodes_means_do_nothing_this_tick() {
        let mut snap = TickSnapshot::fresh(1);
        let mut only = node("n1", "g1", GroupKind::Dedicated);
        only.working = true;
        snap.resource = vec![only];
        snap.task = vec![task(1, "alice", "g1", 1)];
        snap.user = vec![quota_row("alice", "internal")];

        let plan = classify(&mut snap);
        assert_eq!(match_of(&snap, 1), MatchResult::DoNothing);
        assert!(plan.startup.is_empty());
    }

    // ── Stage plumbing ───────────────────────────────────────────────

    /// Store that records plans; optionally loses the race once.
    #[derive(Default)]
    struct FakeStore {
        applied: Vec<usize>,
        race_on: Option<i64>,
        stuck: Vec<i64>,
    }

    impl TaskStore for FakeStore {
        fn apply(&mut self, plan: &MatchPlan) -> Result<(), TaktError> {
            if let Some(task_id) = self.race_on.take() {
                return Err(TaktError::TaskRaced { task_id });
            }
            self.applied.push(plan.startup.len());
            Ok(())
        }

        fn unlaunched_scheduled(&mut self) -> Result<Vec<i64>, TaktError> {
            Ok(self.stuck.clone())
        }
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("takt-matcher-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn upstream_with(dir: &PathBuf, snap: &mut TickSnapshot) -> BTreeMap<String, ChannelReader> {
        let mut writer = ChannelWriter::create(dir, "assigner", 2).unwrap();
        writer.put(snap).unwrap();
        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "assigner".to_string(),
            ChannelReader::open(dir, "assigner").unwrap(),
        );
        upstreams
    }

    fn run_stage<S: TaskStore, K: SignalSink>(
        matcher: &mut Matcher<S, K>,
        upstreams: &mut BTreeMap<String, ChannelReader>,
    ) -> TickSnapshot {
        let mut out = TickSnapshot::fresh(0);
        let view = GlobalConfigView {
            values: BTreeMap::new(),
            complete: true,
        };
        let mut ctx = TickContext {
            upstreams,
            out: &mut out,
            config: &view,
        };
        matcher.process(&mut ctx).unwrap();
        out
    }

    #[test]
    fn committed_tick_emits_signals_once() {
        let dir = temp_dir();
        let mut snap = TickSnapshot::fresh(0);
        snap.resource = vec![node("n1", "g1", GroupKind::Dedicated)];
        snap.task = vec![task(1, "alice", "g1", 1)];
        snap.user = vec![quota_row("alice", "internal")];
        let mut upstreams = upstream_with(&dir, &mut snap);

        let mut matcher = Matcher::new(
            FakeStore::default(),
            MemorySignalSink::default(),
            3,
            Duration::from_secs(3600),
        )
        .with_wait_timeout(Duration::from_millis(30));

        let out = run_stage(&mut matcher, &mut upstreams);
        assert!(out.valid);
        assert_eq!(
            matcher.sink().events,
            vec![SignalEvent::Start { task_id: 1, shard: 1 }]
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn raced_tick_sends_no_signals() {
        let dir = temp_dir();
        let mut snap = TickSnapshot::fresh(0);
        snap.resource = vec![node("n1", "g1", GroupKind::Dedicated)];
        snap.task = vec![task(1, "alice", "g1", 1)];
        snap.user = vec![quota_row("alice", "internal")];
        let mut upstreams = upstream_with(&dir, &mut snap);

        let store = FakeStore {
            race_on: Some(1),
            ..Default::default()
        };
        let mut matcher = Matcher::new(
            store,
            MemorySignalSink::default(),
            3,
            Duration::from_secs(3600),
        )
        .with_wait_timeout(Duration::from_millis(30));

        let out = run_stage(&mut matcher, &mut upstreams);
        assert!(matcher.sink().events.is_empty());
        assert_eq!(out.metrics.get("match_raced"), Some(&1.0));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn preemption_signal_is_sent_exactly_once_per_tick() {
        let dir = temp_dir();
        let mut snap = TickSnapshot::fresh(0);
        snap.resource = vec![node("n1", "g1", GroupKind::Dedicated)];
        let mut running = task(1, "alice", "g1", 1);
        running.queue_status = QueueStatus::Scheduled;
        running.assigned_nodes = vec!["n1".into()];
        running.assign_result = AssignResult::CanNotRun;
        snap.task = vec![running];
        snap.user = vec![quota_row("alice", "internal")];
        let mut upstreams = upstream_with(&dir, &mut snap);

        let mut matcher = Matcher::new(
            FakeStore::default(),
            MemorySignalSink::default(),
            3,
            Duration::from_secs(3600),
        )
        .with_wait_timeout(Duration::from_millis(30));

        run_stage(&mut matcher, &mut upstreams);
        let suspends: Vec<_> = matcher
            .sink()
            .events
            .iter()
            .filter(|e| matches!(e, SignalEvent::Suspend { task_id: 1, .. }))
            .collect();
        assert_eq!(suspends.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn resignal_sweep_rotates_shards() {
        let store = FakeStore {
            stuck: vec![4],
            ..Default::default()
        };
        let mut matcher = Matcher::new(store, MemorySignalSink::default(), 3, Duration::ZERO);

        matcher.resignal_sweep(5).unwrap();
        matcher.resignal_sweep(5).unwrap();
        matcher.resignal_sweep(5).unwrap();

        // Task 4 with shard_count 3: base shard 1, rotated each attempt.
        assert_eq!(
            matcher.sink().events,
            vec![
                SignalEvent::Start { task_id: 4, shard: 2 },
                SignalEvent::Start { task_id: 4, shard: 0 },
                SignalEvent::Start { task_id: 4, shard: 1 },
            ]
        );
    }

    #[test]
    fn sweep_forgets_tasks_that_launched() {
        let store = FakeStore {
            stuck: vec![7],
            ..Default::default()
        };
        let mut matcher = Matcher::new(store, MemorySignalSink::default(), 3, Duration::ZERO);
        matcher.resignal_sweep(5).unwrap();
        assert_eq!(matcher.sweep_attempts.get(&7), Some(&1));

        matcher.store.stuck.clear();
        matcher.resignal_sweep(5).unwrap();
        assert!(matcher.sweep_attempts.is_empty());
    }
}
