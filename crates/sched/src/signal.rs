//! Start/stop signalling toward the external lifecycle manager.
//!
//! The scheduler never creates or destroys pods itself; it enqueues signal
//! rows that the lifecycle manager consumes. The sink is a trait so the
//! Matcher's decision logic can be exercised without a database.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use takt_core::TaktError;

use crate::db::Db;

/// How a task's pods should be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    Stop,
    StopSinglePod,
    StopManager,
}

impl StopAction {
    fn as_str(self) -> &'static str {
        match self {
            StopAction::Stop => "stop",
            StopAction::StopSinglePod => "stop_single_pod",
            StopAction::StopManager => "stop_manager",
        }
    }
}

/// One enqueued signal, as the lifecycle manager will see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalEvent {
    Stop { task_id: i64, action: StopAction },
    Suspend { task_id: i64, stop_code: i32 },
    Start { task_id: i64, shard: u32 },
}

/// Sink for signals emitted after a successfully committed tick.
pub trait SignalSink {
    fn push_stop(&mut self, task_id: i64, action: StopAction) -> Result<(), TaktError>;
    fn push_suspend(&mut self, task_id: i64, stop_code: i32) -> Result<(), TaktError>;
    fn notify_start(&mut self, task_id: i64, shard: u32) -> Result<(), TaktError>;
}

// ── In-memory sink ───────────────────────────────────────────────────

/// Records signals instead of delivering them. Used in tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySignalSink {
    pub events: Vec<SignalEvent>,
}

impl SignalSink for MemorySignalSink {
    fn push_stop(&mut self, task_id: i64, action: StopAction) -> Result<(), TaktError> {
        self.events.push(SignalEvent::Stop { task_id, action });
        Ok(())
    }

    fn push_suspend(&mut self, task_id: i64, stop_code: i32) -> Result<(), TaktError> {
        self.events.push(SignalEvent::Suspend { task_id, stop_code });
        Ok(())
    }

    fn notify_start(&mut self, task_id: i64, shard: u32) -> Result<(), TaktError> {
        self.events.push(SignalEvent::Start { task_id, shard });
        Ok(())
    }
}

// ── Postgres sink ────────────────────────────────────────────────────

/// Appends signal rows to `scheduler_signals`; the lifecycle manager polls
/// and deletes them.
pub struct PgSignalSink {
    db: Arc<Db>,
}

impl PgSignalSink {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    fn insert(&self, task_id: i64, kind: &str, payload: serde_json::Value) -> Result<(), TaktError> {
        self.db.block_on(async {
            sqlx::query(
                "INSERT INTO scheduler_signals (task_id, kind, payload, created_at)
                 VALUES ($1, $2, $3, now())",
            )
            .bind(task_id)
            .bind(kind)
            .bind(&payload)
            .execute(self.db.pool())
            .await
        })?;
        Ok(())
    }
}

impl SignalSink for PgSignalSink {
    fn push_stop(&mut self, task_id: i64, action: StopAction) -> Result<(), TaktError> {
        info!(task_id, action = action.as_str(), "stop signal enqueued");
        self.insert(task_id, "stop", serde_json::json!({ "action": action.as_str() }))
    }

    fn push_suspend(&mut self, task_id: i64, stop_code: i32) -> Result<(), TaktError> {
        info!(task_id, stop_code, "suspend signal enqueued");
        self.insert(task_id, "suspend", serde_json::json!({ "stop_code": stop_code }))
    }

    fn notify_start(&mut self, task_id: i64, shard: u32) -> Result<(), TaktError> {
        info!(task_id, shard, "start signal enqueued");
        self.insert(
            task_id,
            "start",
            serde_json::json!({
                "trigger_name": "task_launch",
                "data": { (task_id.to_string()): shard }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let mut sink = MemorySignalSink::default();
        sink.push_suspend(1, 137).unwrap();
        sink.push_stop(2, StopAction::Stop).unwrap();
        sink.notify_start(3, 2).unwrap();

        assert_eq!(
            sink.events,
            vec![
                SignalEvent::Suspend { task_id: 1, stop_code: 137 },
                SignalEvent::Stop { task_id: 2, action: StopAction::Stop },
                SignalEvent::Start { task_id: 3, shard: 2 },
            ]
        );
    }

    #[test]
    fn stop_action_serializes_snake_case() {
        let json = serde_json::to_value(StopAction::StopSinglePod).unwrap();
        assert_eq!(json, serde_json::json!("stop_single_pod"));
    }
}
