pub mod config;
pub mod error;
pub mod mutation;
pub mod row;
pub mod snapshot;

pub use config::{GlobalConfig, MonitorConfig, PipelineConfig, TaktConfig};
pub use error::TaktError;
pub use mutation::{apply_mutations, Mutation, ResourceField, TaskField};
pub use row::{
    AssignResult, GroupKind, MatchResult, NodeStatus, QueueStatus, QuotaRow, ResourceRow, TaskRow,
    AUTO_PRIORITY,
};
pub use snapshot::TickSnapshot;
