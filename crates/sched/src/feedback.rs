//! Extension stages around the core pipeline.
//!
//! A [`FeedBacker`] publishes declarative mutation lists that the next
//! Beater tick applies before anything downstream sees the data. A
//! [`Subscriber`] is a pure sink: it merges upstream snapshots and performs
//! read-only side effects, with no feedback path and no signals.

use std::collections::HashMap;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, warn};

use takt_core::{Mutation, QuotaRow, ResourceRow, TaktError, TaskRow, TickSnapshot};

use crate::beater::MUTATIONS_KEY;
use crate::component::{Stage, TickContext};

// ── FeedBacker ───────────────────────────────────────────────────────

/// Produces this tick's mutation list. Implementors observe whatever they
/// like (databases, HTTP, heuristics over a Subscriber feed) but only ever
/// declare mutations; they never compute on the pipeline's tables directly.
pub trait FeedbackSource {
    fn mutations(&mut self) -> Result<Vec<Mutation>, TaktError>;
}

/// Runs a [`FeedbackSource`] on its own cadence and publishes its mutations
/// in the snapshot's extension map, for consumption by exactly one Beater.
pub struct FeedBacker<F: FeedbackSource> {
    name: String,
    source: F,
    interval: Duration,
}

impl<F: FeedbackSource> FeedBacker<F> {
    pub fn new(name: impl Into<String>, source: F, interval: Duration) -> Self {
        Self {
            name: name.into(),
            source,
            interval,
        }
    }
}

impl<F: FeedbackSource> Stage for FeedBacker<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn pace(&mut self) {
        std::thread::sleep(self.interval);
    }

    fn process(&mut self, ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
        let mutations = self.source.mutations()?;
        debug!(feedbacker = %self.name, count = mutations.len(), "mutations published");
        ctx.out.extra.insert(
            MUTATIONS_KEY.to_string(),
            serde_json::to_value(&mutations)
                .map_err(|e| TaktError::Config(format!("mutation encode: {e}")))?,
        );
        Ok(())
    }
}

// ── Subscriber ───────────────────────────────────────────────────────

/// Read-only side effect over the merged view, e.g. a statistics exporter.
pub trait SnapshotConsumer {
    fn consume(&mut self, snap: &TickSnapshot) -> Result<(), TaktError>;
}

/// Merges every upstream's latest snapshot, deduplicating rows by primary
/// key (first upstream wins), and hands the result to its consumer.
pub struct Subscriber<C: SnapshotConsumer> {
    name: String,
    consumer: C,
    interval: Duration,
    last_seqs: HashMap<String, u64>,
}

impl<C: SnapshotConsumer> Subscriber<C> {
    pub fn new(name: impl Into<String>, consumer: C, interval: Duration) -> Self {
        Self {
            name: name.into(),
            consumer,
            interval,
            last_seqs: HashMap::new(),
        }
    }
}

impl<C: SnapshotConsumer> Stage for Subscriber<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn pace(&mut self) {
        std::thread::sleep(self.interval);
    }

    fn process(&mut self, ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
        let mut tasks: IndexMap<i64, TaskRow> = IndexMap::new();
        let mut resources: IndexMap<String, ResourceRow> = IndexMap::new();
        let mut quotas: IndexMap<(String, String, String, i32), QuotaRow> = IndexMap::new();
        let mut consumed = 0usize;

        for (upstream, reader) in ctx.upstreams.iter_mut() {
            if reader.header_seq()? == 0 {
                warn!(subscriber = %self.name, %upstream, "upstream not published yet");
                ctx.out.valid = false;
                continue;
            }
            let snap = reader.get()?;
            if !snap.valid {
                ctx.out.valid = false;
            }
            self.last_seqs.insert(upstream.clone(), snap.seq);
            consumed += 1;

            for task in snap.task {
                tasks.entry(task.id).or_insert(task);
            }
            for resource in snap.resource {
                resources.entry(resource.name.clone()).or_insert(resource);
            }
            for quota in snap.user {
                let key = (
                    quota.user_name.clone(),
                    quota.resource.clone(),
                    quota.group.clone(),
                    quota.priority,
                );
                quotas.entry(key).or_insert(quota);
            }
            for (key, value) in snap.metrics {
                ctx.out.metrics.insert(format!("{upstream}_{key}"), value);
            }
        }

        ctx.out.task = tasks.into_values().collect();
        ctx.out.resource = resources.into_values().collect();
        ctx.out.user = quotas.into_values().collect();

        if consumed == 0 {
            return Ok(());
        }
        self.consumer.consume(ctx.out)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
