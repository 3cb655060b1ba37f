use serde::{Deserialize, Serialize};

/// Sentinel priority meaning "let the scheduler pick the best level the
/// user's quota allows" (scanned highest to lowest).
pub const AUTO_PRIORITY: i32 = -1;

/// Kubernetes-level readiness of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Ready,
    NotReady,
}

/// Whether a resource group is time-shared among many small jobs or
/// exclusively bound to one job at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKind {
    Shared,
    Dedicated,
}

/// Queue lifecycle of a task row in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Queued,
    Scheduled,
    Finished,
}

/// Assigner's verdict on entitlement, independent of physical node binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignResult {
    /// Provisionally entitled; awaiting the per-group capacity check.
    NotSure,
    CanRun,
    CanNotRun,
    /// Exceeds *current* remaining quota; retried every tick.
    OutOfQuota,
    /// Exceeds the *static* quota ceiling; terminal, never retried.
    QuotaExceeded,
    NodeError,
}

/// Matcher's verdict on physical binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchResult {
    NotSure,
    KeepRunning,
    Startup,
    Suspend,
    Stop,
    DoNothing,
}

/// One row per cluster node, refreshed by the Beater each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRow {
    /// Node name; stable primary key across ticks.
    pub name: String,
    pub status: NodeStatus,
    pub group: String,
    /// Group the node originally belonged to before any rebalancing.
    pub origin_group: String,
    pub group_kind: GroupKind,
    pub cpu: u32,
    /// Memory in bytes.
    pub memory: u64,
    pub gpu_num: u32,
    pub schedule_zone: String,
    /// Currently occupied by a running task.
    pub working: bool,
    pub working_user: Option<String>,
    pub working_task_type: Option<String>,
    /// Participates in this tick.
    pub active: bool,
    /// Claimed by a concurrent pipeline within this tick's in-memory view.
    pub allocated: bool,
}

impl ResourceRow {
    /// Free for new placement in this tick's view.
    pub fn is_free(&self) -> bool {
        self.status == NodeStatus::Ready && self.active && !self.working && !self.allocated
    }

    /// Counts toward a group's schedulable capacity. Working nodes still
    /// count: the tasks occupying them hold part of the same capacity.
    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Ready && self.active && !self.allocated
    }
}

/// One row per task needing a scheduling decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    /// Task row id; stable primary key across ticks.
    pub id: i64,
    /// Chain id: the first task row of this logical job across restarts.
    pub first_id: i64,
    pub nb_name: String,
    pub user_name: String,
    pub group: String,
    /// Number of nodes the task requires.
    pub nodes: u32,
    pub assigned_nodes: Vec<String>,
    pub backend: String,
    pub task_type: String,
    pub queue_status: QueueStatus,
    /// Explicit priority, or [`AUTO_PRIORITY`].
    pub priority: i32,
    /// Explicit ordering rank; lower runs first within a priority.
    pub custom_rank: i64,
    pub created_seconds: i64,
    pub running_seconds: i64,
    pub runtime_config: serde_json::Value,
    pub assign_result: AssignResult,
    pub match_result: MatchResult,
    /// Human-readable reason shown to the user when the task cannot run.
    pub scheduler_msg: Option<String>,
    /// Scratch fields written by the Matcher on STARTUP.
    pub assigned_gpus: Vec<u32>,
    pub assigned_cpu: u32,
    pub assigned_memory: u64,
}

impl TaskRow {
    pub fn has_auto_priority(&self) -> bool {
        self.priority == AUTO_PRIORITY
    }

    /// FIFO ordering key: explicit rank first, then chain creation order.
    pub fn fifo_key(&self) -> (i64, i64) {
        (self.custom_rank, self.first_id)
    }
}

/// One quota ceiling per (user, resource-key, group, priority).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRow {
    pub user_name: String,
    /// Resource key the quota counts, e.g. "node".
    pub resource: String,
    pub group: String,
    pub priority: i32,
    pub quota: u32,
    /// "internal" or "external"; external users cannot restart on dedicated groups.
    pub role: String,
    pub active: bool,
}
