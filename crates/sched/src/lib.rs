//! The scheduling pipeline: periodically-ticking stages exchanging immutable
//! snapshots over shared-memory channels.
//!
//! One OS process per stage, wired `Beater -> Assigner -> Matcher`; several
//! pipelines may exist per resource pool. A single [`Monitor`](monitor::Monitor)
//! subscribes to every stage and supervises the process group.

pub mod assigner;
pub mod beater;
pub mod builder;
pub mod component;
pub mod db;
pub mod feedback;
pub mod matcher;
pub mod monitor;
pub mod perf;
pub mod signal;

pub use assigner::{assign, Assigner};
pub use beater::{Beater, PriorityAudit, SnapshotProvider, MUTATIONS_KEY};
pub use builder::{channel_name, PipelineBuilder, CONFIG_CHANNEL};
pub use component::{
    spawn_stop_watcher, ComponentRunner, GlobalConfigView, Stage, TickContext,
    REGISTERED_CONFIG_KEY,
};
pub use db::{Db, PgPriorityAudit, PgSnapshotProvider, PgTaskStore, TaskStore};
pub use feedback::{FeedBacker, FeedbackSource, SnapshotConsumer, Subscriber};
pub use matcher::{classify, MatchPlan, Matcher, StartupBinding};
pub use monitor::{spawn_http, Monitor, MonitorState, StageWatch};
pub use perf::PerfCounter;
pub use signal::{MemorySignalSink, PgSignalSink, SignalEvent, SignalSink, StopAction};
