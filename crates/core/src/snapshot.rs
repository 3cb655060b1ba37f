use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TaktError;
use crate::row::{QuotaRow, ResourceRow, TaskRow};

/// Immutable value exchanged between pipeline stages.
///
/// Produced by exactly one writer per channel, consumed by 0..N readers.
/// Serialized with MessagePack for the shared-memory transport. Row identity
/// (`ResourceRow::name`, `TaskRow::id`, quota tuple) is stable across ticks
/// even though mutable columns change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSnapshot {
    /// Monotonic per channel; readers only accept `seq > last_seen`.
    pub seq: u64,

    /// Whether downstream should treat this snapshot as authoritative.
    /// False during warmup or when upstream config is incomplete; consumers
    /// must not act on task/resource data of an invalid snapshot.
    pub valid: bool,

    pub resource: Vec<ResourceRow>,
    pub task: Vec<TaskRow>,
    pub user: Vec<QuotaRow>,

    /// Pipeline-specific side channel (registered-config echo, mutation
    /// lists, cross-group node sets).
    pub extra: BTreeMap<String, serde_json::Value>,

    /// Self-reported metrics, aggregated by the Monitor.
    pub metrics: BTreeMap<String, f64>,
}

impl TickSnapshot {
    /// A fresh, empty, valid snapshot for the given sequence number.
    pub fn fresh(seq: u64) -> Self {
        Self {
            seq,
            valid: true,
            resource: Vec::new(),
            task: Vec::new(),
            user: Vec::new(),
            extra: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TaktError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TaktError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn task_by_id(&self, id: i64) -> Option<&TaskRow> {
        self.task.iter().find(|t| t.id == id)
    }

    pub fn task_by_id_mut(&mut self, id: i64) -> Option<&mut TaskRow> {
        self.task.iter_mut().find(|t| t.id == id)
    }

    pub fn resource_by_name(&self, name: &str) -> Option<&ResourceRow> {
        self.resource.iter().find(|r| r.name == name)
    }

    pub fn resource_by_name_mut(&mut self, name: &str) -> Option<&mut ResourceRow> {
        self.resource.iter_mut().find(|r| r.name == name)
    }

    /// Role of a user as recorded in the quota table, if known.
    pub fn user_role(&self, user_name: &str) -> Option<&str> {
        self.user
            .iter()
            .find(|q| q.user_name == user_name)
            .map(|q| q.role.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_bytes() {
        let mut snap = TickSnapshot::fresh(7);
        snap.extra
            .insert("k".into(), serde_json::json!({"nested": [1, 2]}));
        snap.metrics.insert("beater_tick_ms".into(), 1.5);

        let bytes = snap.to_bytes().unwrap();
        let decoded = TickSnapshot::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.seq, 7);
        assert!(decoded.valid);
        assert_eq!(decoded.extra["k"]["nested"][1], 2);
        assert_eq!(decoded.metrics["beater_tick_ms"], 1.5);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(TickSnapshot::from_bytes(&[0xff, 0x00, 0x13]).is_err());
    }
}
