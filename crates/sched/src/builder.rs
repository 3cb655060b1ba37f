//! Explicit construction of the component graph.
//!
//! Each stage process builds exactly the runner it needs from the typed
//! configuration; upstream/downstream wiring is constructor input, never
//! post-hoc registration. Channel files are named `<pipeline>-<stage>` under
//! the configured channel directory.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use takt_channel::{channel_path, ChannelReader, ChannelWriter};
use takt_core::{PipelineConfig, TaktConfig, TaktError};

use crate::assigner::Assigner;
use crate::beater::{Beater, PriorityAudit, SnapshotProvider};
use crate::component::ComponentRunner;
use crate::db::TaskStore;
use crate::feedback::{FeedBacker, FeedbackSource, SnapshotConsumer, Subscriber};
use crate::matcher::Matcher;
use crate::signal::SignalSink;

/// Channel carrying the Monitor's GlobalConfig broadcasts.
pub const CONFIG_CHANNEL: &str = "global-config";

/// Retries while waiting for an upstream process to create its channel.
const OPEN_ATTEMPTS: u32 = 150;
const OPEN_RETRY: Duration = Duration::from_millis(200);

pub fn channel_name(pipeline: &str, stage: &str) -> String {
    format!("{pipeline}-{stage}")
}

/// Builds the runners of one pipeline from its configuration.
pub struct PipelineBuilder<'a> {
    config: &'a TaktConfig,
    pipeline: &'a PipelineConfig,
    stop: Arc<AtomicBool>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(
        config: &'a TaktConfig,
        pipeline_name: &str,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, TaktError> {
        let pipeline = config.pipeline_by_name(pipeline_name).ok_or_else(|| {
            TaktError::Config(format!("unknown pipeline {pipeline_name:?}"))
        })?;
        Ok(Self {
            config,
            pipeline,
            stop,
        })
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        self.pipeline
    }

    fn create_out(&self, stage: &str) -> Result<ChannelWriter, TaktError> {
        let name = channel_name(&self.pipeline.name, stage);
        std::fs::create_dir_all(&self.config.channel_dir)?;
        info!(channel = %name, "outbound channel created");
        ChannelWriter::create(&self.config.channel_dir, &name, self.pipeline.rotate_num)
    }

    /// Open another process's channel, waiting for it to appear; stage
    /// start order is not guaranteed.
    fn open_upstream(&self, name: &str) -> Result<ChannelReader, TaktError> {
        let path = channel_path(&self.config.channel_dir, name);
        for attempt in 0..OPEN_ATTEMPTS {
            match ChannelReader::open(&self.config.channel_dir, name) {
                Ok(reader) => {
                    debug!(channel = %name, attempt, "upstream channel opened");
                    return Ok(reader);
                }
                Err(_) => std::thread::sleep(OPEN_RETRY),
            }
        }
        Err(TaktError::Channel(format!(
            "upstream channel {} never appeared",
            path.display()
        )))
    }

    fn config_reader(&self) -> Result<ChannelReader, TaktError> {
        self.open_upstream(CONFIG_CHANNEL)
    }

    /// Beater runner; `feedbackers` are the stage names of FeedBackers
    /// publishing into this pipeline.
    pub fn beater<P: SnapshotProvider, A: PriorityAudit>(
        &self,
        provider: P,
        audit: A,
        feedbackers: &[String],
    ) -> Result<ComponentRunner<Beater<P, A>>, TaktError> {
        let out = self.create_out("beater")?;
        let config_reader = self.config_reader()?;
        let mut upstreams = BTreeMap::new();
        for fb in feedbackers {
            let channel = channel_name(&self.pipeline.name, fb);
            upstreams.insert(fb.clone(), self.open_upstream(&channel)?);
        }
        let beater = Beater::new(
            provider,
            audit,
            Duration::from_millis(self.pipeline.interval_ms),
            self.pipeline.groups.clone(),
        );
        Ok(ComponentRunner::new(
            beater,
            upstreams,
            out,
            Some(config_reader),
            self.stop.clone(),
        ))
    }

    pub fn assigner(&self) -> Result<ComponentRunner<Assigner>, TaktError> {
        let out = self.create_out("assigner")?;
        let config_reader = self.config_reader()?;
        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "beater".to_string(),
            self.open_upstream(&channel_name(&self.pipeline.name, "beater"))?,
        );
        Ok(ComponentRunner::new(
            Assigner::new(),
            upstreams,
            out,
            Some(config_reader),
            self.stop.clone(),
        ))
    }

    pub fn matcher<S: TaskStore, K: SignalSink>(
        &self,
        store: S,
        sink: K,
    ) -> Result<ComponentRunner<Matcher<S, K>>, TaktError> {
        let out = self.create_out("matcher")?;
        let config_reader = self.config_reader()?;
        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "assigner".to_string(),
            self.open_upstream(&channel_name(&self.pipeline.name, "assigner"))?,
        );
        let matcher = Matcher::new(
            store,
            sink,
            self.pipeline.shard_count,
            Duration::from_secs(self.pipeline.re_signal_secs),
        );
        Ok(ComponentRunner::new(
            matcher,
            upstreams,
            out,
            Some(config_reader),
            self.stop.clone(),
        ))
    }

    pub fn feedbacker<F: FeedbackSource>(
        &self,
        name: &str,
        source: F,
    ) -> Result<ComponentRunner<FeedBacker<F>>, TaktError> {
        let out = self.create_out(name)?;
        let config_reader = self.config_reader()?;
        let fb = FeedBacker::new(
            name,
            source,
            Duration::from_millis(self.pipeline.interval_ms),
        );
        Ok(ComponentRunner::new(
            fb,
            BTreeMap::new(),
            out,
            Some(config_reader),
            self.stop.clone(),
        ))
    }

    /// Subscriber over arbitrary full channel names, possibly spanning
    /// pipelines.
    pub fn subscriber<C: SnapshotConsumer>(
        &self,
        name: &str,
        consumer: C,
        upstream_channels: &[String],
    ) -> Result<ComponentRunner<Subscriber<C>>, TaktError> {
        let out = self.create_out(name)?;
        let config_reader = self.config_reader()?;
        let mut upstreams = BTreeMap::new();
        for channel in upstream_channels {
            upstreams.insert(channel.clone(), self.open_upstream(channel)?);
        }
        let sub = Subscriber::new(
            name,
            consumer,
            Duration::from_millis(self.pipeline.interval_ms),
        );
        Ok(ComponentRunner::new(
            sub,
            upstreams,
            out,
            Some(config_reader),
            self.stop.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use takt_core::TickSnapshot;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("takt-builder-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config_for(dir: &PathBuf) -> TaktConfig {
        TaktConfig::from_toml(&format!(
            r#"
channel_dir = "{}"

[[pipeline]]
name = "training"
interval_ms = 10
rotate_num = 4
"#,
            dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn channel_names_compose_pipeline_and_stage() {
        assert_eq!(channel_name("training", "beater"), "training-beater");
        assert_eq!(channel_name("jupyter", "matcher"), "jupyter-matcher");
    }

    #[test]
    fn unknown_pipeline_is_a_config_error() {
        let dir = temp_dir();
        let config = config_for(&dir);
        let stop = Arc::new(AtomicBool::new(false));
        assert!(PipelineBuilder::new(&config, "nope", stop).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn assigner_wires_to_the_beater_channel() {
        let dir = temp_dir();
        let config = config_for(&dir);
        let stop = Arc::new(AtomicBool::new(false));

        // Stand in for the Monitor and the Beater process.
        let _config_writer = ChannelWriter::create(&dir, CONFIG_CHANNEL, 2).unwrap();
        let mut beater_writer = ChannelWriter::create(&dir, "training-beater", 4).unwrap();
        beater_writer.put(&mut TickSnapshot::fresh(0)).unwrap();

        let builder = PipelineBuilder::new(&config, "training", stop).unwrap();
        let mut runner = builder.assigner().unwrap();

        // One tick flows through: the assigner consumes the beater snapshot
        // and publishes its own.
        runner.tick().unwrap();
        let mut out = ChannelReader::open(&dir, "training-assigner").unwrap();
        assert_eq!(out.header_seq().unwrap(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
