use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TaktError;
use crate::row::{NodeStatus, QueueStatus, QuotaRow};
use crate::snapshot::TickSnapshot;

/// Task columns a FeedBacker is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskField {
    Priority,
    CustomRank,
    QueueStatus,
    SchedulerMsg,
    Nodes,
}

/// Resource columns a FeedBacker is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceField {
    Active,
    Allocated,
    Group,
    Status,
}

/// A declarative mutation produced by a FeedBacker and applied by the Beater
/// to the in-memory tables before publication. A closed command set: the
/// feedback contract stays "declare, don't compute".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    SetTaskField {
        id: i64,
        field: TaskField,
        value: serde_json::Value,
    },
    SetResourceField {
        name: String,
        field: ResourceField,
        value: serde_json::Value,
    },
    SetQuota {
        user_name: String,
        resource: String,
        group: String,
        priority: i32,
        quota: u32,
    },
    DeleteTask {
        id: i64,
    },
}

fn as_i64(v: &serde_json::Value) -> Result<i64, TaktError> {
    v.as_i64()
        .ok_or_else(|| TaktError::Config(format!("expected integer, got {v}")))
}

fn as_bool(v: &serde_json::Value) -> Result<bool, TaktError> {
    v.as_bool()
        .ok_or_else(|| TaktError::Config(format!("expected bool, got {v}")))
}

fn as_str(v: &serde_json::Value) -> Result<&str, TaktError> {
    v.as_str()
        .ok_or_else(|| TaktError::Config(format!("expected string, got {v}")))
}

/// Apply feedback mutations in order.
///
/// A mutation addressing a row that no longer exists is logged and skipped:
/// a FeedBacker may legitimately race a task that finished between its tick
/// and the Beater's. Type mismatches are real contract violations and fail.
pub fn apply_mutations(snap: &mut TickSnapshot, mutations: &[Mutation]) -> Result<(), TaktError> {
    for m in mutations {
        match m {
            Mutation::SetTaskField { id, field, value } => {
                let Some(task) = snap.task_by_id_mut(*id) else {
                    warn!(task_id = id, "feedback mutation targets unknown task, skipped");
                    continue;
                };
                match field {
                    TaskField::Priority => task.priority = as_i64(value)? as i32,
                    TaskField::CustomRank => task.custom_rank = as_i64(value)?,
                    TaskField::Nodes => task.nodes = as_i64(value)? as u32,
                    TaskField::SchedulerMsg => task.scheduler_msg = Some(as_str(value)?.to_string()),
                    TaskField::QueueStatus => {
                        task.queue_status = match as_str(value)? {
                            "queued" => QueueStatus::Queued,
                            "scheduled" => QueueStatus::Scheduled,
                            "finished" => QueueStatus::Finished,
                            other => {
                                return Err(TaktError::Config(format!(
                                    "unknown queue_status {other:?}"
                                )))
                            }
                        }
                    }
                }
            }
            Mutation::SetResourceField { name, field, value } => {
                let Some(res) = snap.resource_by_name_mut(name) else {
                    warn!(node = %name, "feedback mutation targets unknown node, skipped");
                    continue;
                };
                match field {
                    ResourceField::Active => res.active = as_bool(value)?,
                    ResourceField::Allocated => res.allocated = as_bool(value)?,
                    ResourceField::Group => res.group = as_str(value)?.to_string(),
                    ResourceField::Status => {
                        res.status = match as_str(value)? {
                            "ready" => NodeStatus::Ready,
                            "not_ready" => NodeStatus::NotReady,
                            other => {
                                return Err(TaktError::Config(format!("unknown status {other:?}")))
                            }
                        }
                    }
                }
            }
            Mutation::SetQuota {
                user_name,
                resource,
                group,
                priority,
                quota,
            } => {
                let existing = snap.user.iter_mut().find(|q| {
                    q.user_name == *user_name
                        && q.resource == *resource
                        && q.group == *group
                        && q.priority == *priority
                });
                match existing {
                    Some(q) => q.quota = *quota,
                    None => snap.user.push(QuotaRow {
                        user_name: user_name.clone(),
                        resource: resource.clone(),
                        group: group.clone(),
                        priority: *priority,
                        quota: *quota,
                        role: "internal".into(),
                        active: true,
                    }),
                }
            }
            Mutation::DeleteTask { id } => {
                snap.task.retain(|t| t.id != *id);
            }
        }
    }
    Ok(())
}
