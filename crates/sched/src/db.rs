//! Postgres persistence surface of the scheduler.
//!
//! Stages run synchronous tick loops, so database access goes through a
//! process-local [`Db`] handle owning a current-thread runtime; queries are
//! plain `block_on` calls. All statements a Matcher issues for one tick
//! execute inside one transaction.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

use takt_core::{
    AssignResult, GroupKind, MatchResult, NodeStatus, QueueStatus, QuotaRow, ResourceRow,
    TaktError, TaskRow,
};

use crate::beater::{PriorityAudit, SnapshotProvider};
use crate::matcher::MatchPlan;

// ── Connection handle ────────────────────────────────────────────────

/// Shared pool plus the runtime that drives it.
pub struct Db {
    rt: tokio::runtime::Runtime,
    pool: PgPool,
}

impl Db {
    pub fn connect(url: &str) -> Result<Arc<Self>, TaktError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let pool = rt.block_on(
            PgPoolOptions::new()
                .max_connections(4)
                .connect(url),
        )?;
        info!("database pool established");
        Ok(Arc::new(Self { rt, pool }))
    }

    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ── Task store ───────────────────────────────────────────────────────

/// Persistence contract the Matcher applies its decisions through.
pub trait TaskStore {
    /// Persist one tick's transitions atomically. A [`TaktError::TaskRaced`]
    /// means a conditional update lost to a concurrent writer; the whole
    /// tick was rolled back.
    fn apply(&mut self, plan: &MatchPlan) -> Result<(), TaktError>;

    /// Ids of `scheduled` tasks that still have no running pod, for the
    /// re-signal sweep.
    fn unlaunched_scheduled(&mut self) -> Result<Vec<i64>, TaktError>;
}

pub struct PgTaskStore {
    db: Arc<Db>,
}

impl PgTaskStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

impl TaskStore for PgTaskStore {
    fn apply(&mut self, plan: &MatchPlan) -> Result<(), TaktError> {
        let db = self.db.clone();
        db.block_on(async {
            let mut tx = db.pool().begin().await?;

            for s in &plan.startup {
                let assigned = serde_json::json!({
                    "assigned_nodes": s.nodes,
                    "assigned_gpus": s.gpus,
                    "assigned_cpu": s.cpu,
                    "assigned_memory": s.memory,
                });
                // Conditional on the status we decided from: zero rows means
                // another writer (concurrent pipeline, user cancel) got there
                // first and this tick must not commit.
                let won: Option<(i64,)> = sqlx::query_as(
                    "UPDATE tasks
                     SET queue_status = 'scheduled',
                         assigned_nodes = $2,
                         runtime_config = runtime_config || $3,
                         scheduler_msg = NULL
                     WHERE id = $1 AND queue_status = 'queued'
                     RETURNING id",
                )
                .bind(s.task_id)
                .bind(&s.nodes)
                .bind(&assigned)
                .fetch_optional(&mut *tx)
                .await?;
                if won.is_none() {
                    tx.rollback().await?;
                    return Err(TaktError::TaskRaced { task_id: s.task_id });
                }
            }

            for &task_id in &plan.stop {
                sqlx::query(
                    "UPDATE tasks
                     SET queue_status = 'finished',
                         scheduler_msg = 'stopped: not restartable on this group'
                     WHERE id = $1 AND queue_status = 'queued'",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                // Ban marker keeps an in-flight restart from resurrecting
                // the task. Idempotent.
                sqlx::query(
                    "INSERT INTO task_bans (task_id, created_at)
                     VALUES ($1, now())
                     ON CONFLICT (task_id) DO NOTHING",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            }

            for (task_id, msg) in &plan.messages {
                sqlx::query(
                    "UPDATE tasks SET scheduler_msg = $2 WHERE id = $1",
                )
                .bind(task_id)
                .bind(msg)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            debug!(
                startup = plan.startup.len(),
                stop = plan.stop.len(),
                suspend = plan.suspend.len(),
                "tick transitions committed"
            );
            Ok(())
        })
    }

    fn unlaunched_scheduled(&mut self) -> Result<Vec<i64>, TaktError> {
        let db = self.db.clone();
        db.block_on(async {
            let rows: Vec<(i64,)> = sqlx::query_as(
                "SELECT t.id
                 FROM tasks t
                 WHERE t.queue_status = 'scheduled'
                   AND NOT EXISTS (
                       SELECT 1 FROM pods p
                       WHERE p.task_id = t.id AND p.phase = 'running'
                   )
                 ORDER BY t.id",
            )
            .fetch_all(db.pool())
            .await?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
    }
}

// ── Snapshot provider ────────────────────────────────────────────────

/// Feeds the Beater from the authoritative tables.
pub struct PgSnapshotProvider {
    db: Arc<Db>,
}

impl PgSnapshotProvider {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[derive(FromRow)]
struct DbResource {
    name: String,
    status: String,
    group: String,
    origin_group: String,
    group_kind: String,
    cpu: i32,
    memory: i64,
    gpu_num: i32,
    schedule_zone: String,
    working: bool,
    working_user: Option<String>,
    working_task_type: Option<String>,
    active: bool,
    allocated: bool,
}

#[derive(FromRow)]
struct DbTask {
    id: i64,
    first_id: i64,
    nb_name: String,
    user_name: String,
    group: String,
    nodes: i32,
    assigned_nodes: Vec<String>,
    backend: String,
    task_type: String,
    queue_status: String,
    priority: i32,
    custom_rank: i64,
    created_seconds: i64,
    running_seconds: i64,
    runtime_config: serde_json::Value,
}

#[derive(FromRow)]
struct DbQuota {
    user_name: String,
    resource: String,
    group: String,
    priority: i32,
    quota: i32,
    role: String,
    active: bool,
}

impl SnapshotProvider for PgSnapshotProvider {
    fn resources(&mut self) -> Result<Vec<ResourceRow>, TaktError> {
        let db = self.db.clone();
        let rows: Vec<DbResource> = db.block_on(
            sqlx::query_as(
                r#"SELECT name, status, resource_group AS "group", origin_group,
                          group_kind, cpu, memory, gpu_num, schedule_zone,
                          working, working_user, working_task_type, active, allocated
                   FROM resources
                   ORDER BY name"#,
            )
            .fetch_all(db.pool()),
        )?;
        rows.into_iter().map(resource_from_db).collect()
    }

    fn tasks(&mut self) -> Result<Vec<TaskRow>, TaktError> {
        let db = self.db.clone();
        let rows: Vec<DbTask> = db.block_on(
            sqlx::query_as(
                r#"SELECT id, first_id, nb_name, user_name, task_group AS "group",
                          nodes, assigned_nodes, backend, task_type, queue_status,
                          priority, custom_rank,
                          EXTRACT(EPOCH FROM created_at)::BIGINT AS created_seconds,
                          COALESCE(EXTRACT(EPOCH FROM (now() - started_at)), 0)::BIGINT
                              AS running_seconds,
                          runtime_config
                   FROM tasks
                   WHERE queue_status IN ('queued', 'scheduled')
                   ORDER BY id"#,
            )
            .fetch_all(db.pool()),
        )?;
        rows.into_iter().map(task_from_db).collect()
    }

    fn quotas(&mut self) -> Result<Vec<QuotaRow>, TaktError> {
        let db = self.db.clone();
        let rows: Vec<DbQuota> = db.block_on(
            sqlx::query_as(
                r#"SELECT user_name, resource, quota_group AS "group",
                          priority, quota, role, active
                   FROM user_quotas
                   WHERE active = true
                   ORDER BY user_name, priority DESC"#,
            )
            .fetch_all(db.pool()),
        )?;
        rows.into_iter().map(quota_from_db).collect()
    }
}

// ── Priority audit ───────────────────────────────────────────────────

/// Append-only priority history, one row per observed change.
pub struct PgPriorityAudit {
    db: Arc<Db>,
}

impl PgPriorityAudit {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

impl PriorityAudit for PgPriorityAudit {
    fn record(&mut self, task_id: i64, priority: i32, at: DateTime<Utc>) -> Result<(), TaktError> {
        let db = self.db.clone();
        db.block_on(
            sqlx::query(
                "INSERT INTO task_priority_history (task_id, priority, recorded_at)
                 VALUES ($1, $2, $3)",
            )
            .bind(task_id)
            .bind(priority)
            .bind(at)
            .execute(db.pool()),
        )?;
        Ok(())
    }
}

// ── Row conversion ───────────────────────────────────────────────────

fn resource_from_db(row: DbResource) -> Result<ResourceRow, TaktError> {
    Ok(ResourceRow {
        status: parse_node_status(&row.status, &row.name)?,
        group_kind: parse_group_kind(&row.group_kind, &row.name)?,
        name: row.name,
        group: row.group,
        origin_group: row.origin_group,
        cpu: row.cpu.max(0) as u32,
        memory: row.memory.max(0) as u64,
        gpu_num: row.gpu_num.max(0) as u32,
        schedule_zone: row.schedule_zone,
        working: row.working,
        working_user: row.working_user,
        working_task_type: row.working_task_type,
        active: row.active,
        allocated: row.allocated,
    })
}

fn task_from_db(row: DbTask) -> Result<TaskRow, TaktError> {
    Ok(TaskRow {
        queue_status: parse_queue_status(&row.queue_status, row.id)?,
        id: row.id,
        first_id: row.first_id,
        nb_name: row.nb_name,
        user_name: row.user_name,
        group: row.group,
        nodes: row.nodes.max(0) as u32,
        assigned_nodes: row.assigned_nodes,
        backend: row.backend,
        task_type: row.task_type,
        priority: row.priority,
        custom_rank: row.custom_rank,
        created_seconds: row.created_seconds,
        running_seconds: row.running_seconds,
        runtime_config: row.runtime_config,
        assign_result: AssignResult::NotSure,
        match_result: MatchResult::NotSure,
        scheduler_msg: None,
        assigned_gpus: Vec::new(),
        assigned_cpu: 0,
        assigned_memory: 0,
    })
}

fn quota_from_db(row: DbQuota) -> Result<QuotaRow, TaktError> {
    Ok(QuotaRow {
        user_name: row.user_name,
        resource: row.resource,
        group: row.group,
        priority: row.priority,
        quota: row.quota.max(0) as u32,
        role: row.role,
        active: row.active,
    })
}

fn parse_node_status(s: &str, node: &str) -> Result<NodeStatus, TaktError> {
    match s {
        "ready" => Ok(NodeStatus::Ready),
        "not_ready" => Ok(NodeStatus::NotReady),
        other => Err(TaktError::UnknownRow(format!(
            "node {node}: bad status '{other}'"
        ))),
    }
}

fn parse_group_kind(s: &str, node: &str) -> Result<GroupKind, TaktError> {
    match s {
        "shared" => Ok(GroupKind::Shared),
        "dedicated" => Ok(GroupKind::Dedicated),
        other => Err(TaktError::UnknownRow(format!(
            "node {node}: bad group_kind '{other}'"
        ))),
    }
}

fn parse_queue_status(s: &str, task_id: i64) -> Result<QueueStatus, TaktError> {
    match s {
        "queued" => Ok(QueueStatus::Queued),
        "scheduled" => Ok(QueueStatus::Scheduled),
        "finished" => Ok(QueueStatus::Finished),
        other => Err(TaktError::UnknownRow(format!(
            "task {task_id}: bad queue_status '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_task_converts_with_fresh_verdicts() {
        let task = task_from_db(DbTask {
            id: 9,
            first_id: 3,
            nb_name: "nb".into(),
            user_name: "alice".into(),
            group: "g1".into(),
            nodes: 2,
            assigned_nodes: vec!["n1".into()],
            backend: "train".into(),
            task_type: "training".into(),
            queue_status: "scheduled".into(),
            priority: 20,
            custom_rank: 0,
            created_seconds: 100,
            running_seconds: 50,
            runtime_config: serde_json::json!({"image": "x"}),
        })
        .unwrap();

        assert_eq!(task.queue_status, QueueStatus::Scheduled);
        assert_eq!(task.assign_result, AssignResult::NotSure);
        assert_eq!(task.match_result, MatchResult::NotSure);
        assert!(task.scheduler_msg.is_none());
    }

    #[test]
    fn bad_status_string_is_an_error() {
        assert!(parse_node_status("Ready", "n1").is_err());
        assert!(parse_queue_status("running", 1).is_err());
        assert!(parse_group_kind("pooled", "n1").is_err());
    }

    #[test]
    fn negative_counts_clamp_to_zero() {
        let res = resource_from_db(DbResource {
            name: "n1".into(),
            status: "ready".into(),
            group: "g1".into(),
            origin_group: "g1".into(),
            group_kind: "shared".into(),
            cpu: -1,
            memory: -1,
            gpu_num: -1,
            schedule_zone: "A".into(),
            working: false,
            working_user: None,
            working_task_type: None,
            active: true,
            allocated: false,
        })
        .unwrap();
        assert_eq!(res.cpu, 0);
        assert_eq!(res.memory, 0);
        assert_eq!(res.gpu_num, 0);
    }
}
