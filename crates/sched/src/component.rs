use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use takt_channel::{ChannelReader, ChannelWriter};
use takt_core::{TaktError, TickSnapshot};

use crate::perf::PerfCounter;

/// Backoff after an unexpected `process()` error; the stage never exits on
/// business-logic failures.
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Grace period before hard exit, letting an in-flight database write finish.
const STOP_GRACE: Duration = Duration::from_millis(500);

const PERF_WINDOW: usize = 64;
const PERF_SLOW_MS: f64 = 1000.0;

/// Snapshot extra key carrying a stage's registered config defaults.
pub const REGISTERED_CONFIG_KEY: &str = "registered_global_config";

// ── Stage trait ──────────────────────────────────────────────────────

/// One pipeline stage's per-tick computation.
///
/// Implementors read upstream channels through the [`TickContext`] and fill
/// in the outbound snapshot. The [`ComponentRunner`] owns the loop: config
/// gating, metrics, publication, and error containment.
pub trait Stage {
    /// Stage name, used for metric prefixes and logging.
    fn name(&self) -> &str;

    /// GlobalConfig keys this stage depends on, with their defaults. The
    /// Monitor adopts defaults for keys that have no value yet; until every
    /// key resolves, the stage publishes `valid = false`.
    fn registered_config(&self) -> Vec<(String, serde_json::Value)> {
        Vec::new()
    }

    /// Block until this stage's next tick is due. Runs before the tick timer
    /// starts, so pacing delay never counts toward tick latency.
    fn pace(&mut self) {}

    fn process(&mut self, ctx: &mut TickContext<'_>) -> Result<(), TaktError>;
}

/// Resolved GlobalConfig values visible to a stage this tick.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfigView {
    pub values: BTreeMap<String, serde_json::Value>,
    /// All of the stage's registered keys resolved to a value.
    pub complete: bool,
}

impl GlobalConfigView {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(|v| v.as_u64())
    }
}

/// Everything a stage may touch during one tick.
pub struct TickContext<'a> {
    /// Named upstream channels (e.g. "beater", "feedback-rebalance").
    pub upstreams: &'a mut BTreeMap<String, ChannelReader>,
    /// The snapshot being built this tick. `valid` starts from the config
    /// gate; stages may only lower it.
    pub out: &'a mut TickSnapshot,
    pub config: &'a GlobalConfigView,
}

// ── Runner ───────────────────────────────────────────────────────────

/// Owns a stage's tick loop: one outbound channel, named upstream readers, a
/// GlobalConfig reader, a stop flag, and perf counters.
pub struct ComponentRunner<S: Stage> {
    stage: S,
    upstreams: BTreeMap<String, ChannelReader>,
    out: ChannelWriter,
    config_reader: Option<ChannelReader>,
    stop: Arc<AtomicBool>,
    perf: PerfCounter,
}

impl<S: Stage> ComponentRunner<S> {
    pub fn new(
        stage: S,
        upstreams: BTreeMap<String, ChannelReader>,
        out: ChannelWriter,
        config_reader: Option<ChannelReader>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stage,
            upstreams,
            out,
            config_reader,
            stop,
            perf: PerfCounter::new(PERF_WINDOW, PERF_SLOW_MS),
        }
    }

    /// Tick forever. Business-logic errors are logged and retried after a
    /// fixed backoff; only the stop flag ends the process.
    pub fn run(mut self) -> ! {
        info!(stage = self.stage.name(), "stage started");
        loop {
            match self.tick() {
                Ok(seq) => {
                    tracing::debug!(stage = self.stage.name(), seq, "tick published");
                }
                Err(e) => {
                    error!(stage = self.stage.name(), error = %e, "tick failed, backing off");
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
    }

    /// One tick: stop check, config gate, `process()`, publish.
    pub fn tick(&mut self) -> Result<u64, TaktError> {
        if self.stop.load(Ordering::SeqCst) {
            info!(stage = self.stage.name(), "stop requested, exiting");
            std::thread::sleep(STOP_GRACE);
            std::process::exit(0);
        }

        self.stage.pace();

        let started = Instant::now();

        let view = self.load_config();
        let mut snap = TickSnapshot::fresh(0);
        snap.valid = view.complete;

        // Echo registered defaults so the Monitor can adopt missing keys.
        let registered: BTreeMap<String, serde_json::Value> =
            self.stage.registered_config().into_iter().collect();
        if !registered.is_empty() {
            snap.extra.insert(
                REGISTERED_CONFIG_KEY.to_string(),
                serde_json::to_value(&registered)
                    .map_err(|e| TaktError::Config(e.to_string()))?,
            );
        }

        {
            let mut ctx = TickContext {
                upstreams: &mut self.upstreams,
                out: &mut snap,
                config: &view,
            };
            self.stage.process(&mut ctx)?;
        }

        let ms = started.elapsed().as_secs_f64() * 1000.0;
        self.perf.record(ms);
        self.perf
            .export(&format!("{}_tick", self.stage.name()), &mut snap.metrics);

        self.out.put(&mut snap)
    }

    /// Resolve the stage's registered keys against the latest config
    /// snapshot. Any unresolved key makes this tick invalid; the snapshot is
    /// still published so liveness checks see a heartbeat.
    fn load_config(&mut self) -> GlobalConfigView {
        let registered = self.stage.registered_config();
        let values = match &mut self.config_reader {
            Some(reader) => match reader.header_seq() {
                Ok(seq) if seq > 0 => match reader.get() {
                    Ok(snap) => snap.extra,
                    Err(e) => {
                        warn!(stage = self.stage.name(), error = %e, "config channel read failed");
                        BTreeMap::new()
                    }
                },
                _ => BTreeMap::new(),
            },
            None => BTreeMap::new(),
        };

        let missing: Vec<&str> = registered
            .iter()
            .filter(|(key, _)| !values.contains_key(key))
            .map(|(key, _)| key.as_str())
            .collect();
        if !missing.is_empty() {
            warn!(
                stage = self.stage.name(),
                ?missing,
                "global config incomplete, publishing invalid tick"
            );
        }

        GlobalConfigView {
            complete: missing.is_empty(),
            values,
        }
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }
}

// ── Stop flag ────────────────────────────────────────────────────────

/// Spawn a watcher thread that sets the returned flag on SIGINT/SIGTERM.
///
/// The flag is the process's only cancellation primitive; stages poll it
/// once per tick.
pub fn spawn_stop_watcher() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let watcher_flag = flag.clone();

    std::thread::Builder::new()
        .name("stop-watcher".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to build stop-watcher runtime");
                    return;
                }
            };
            rt.block_on(os_signal());
            info!("shutdown signal received");
            watcher_flag.store(true, Ordering::SeqCst);
        })
        .ok();

    flag
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("takt-comp-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Stage that stamps a marker and counts its own ticks.
    struct MarkerStage {
        ticks: u64,
        registered: Vec<(String, serde_json::Value)>,
    }

    impl Stage for MarkerStage {
        fn name(&self) -> &str {
            "marker"
        }

        fn registered_config(&self) -> Vec<(String, serde_json::Value)> {
            self.registered.clone()
        }

        fn process(&mut self, ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
            self.ticks += 1;
            ctx.out
                .extra
                .insert("ticks".into(), serde_json::json!(self.ticks));
            Ok(())
        }
    }

    /// Stage that always fails.
    struct FailingStage;

    impl Stage for FailingStage {
        fn name(&self) -> &str {
            "failing"
        }

        fn process(&mut self, _ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
            Err(TaktError::Other("boom".into()))
        }
    }

    #[test]
    fn tick_publishes_with_metrics() {
        let dir = temp_dir();
        let out = ChannelWriter::create(&dir, "marker", 4).unwrap();
        let stage = MarkerStage {
            ticks: 0,
            registered: vec![],
        };
        let mut runner = ComponentRunner::new(
            stage,
            BTreeMap::new(),
            out,
            None,
            Arc::new(AtomicBool::new(false)),
        );

        let seq = runner.tick().unwrap();
        assert_eq!(seq, 1);
        runner.tick().unwrap();

        let mut reader = ChannelReader::open(&dir, "marker").unwrap();
        let snap = reader.get().unwrap();
        assert_eq!(snap.seq, 2);
        assert!(snap.valid);
        assert_eq!(snap.extra["ticks"], serde_json::json!(2));
        assert!(snap.metrics.contains_key("marker_tick_ms"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_registered_config_publishes_invalid() {
        let dir = temp_dir();
        let mut config_writer = ChannelWriter::create(&dir, "config", 2).unwrap();
        let mut config_snap = TickSnapshot::fresh(0);
        config_snap
            .extra
            .insert("known_key".into(), serde_json::json!(1));
        config_writer.put(&mut config_snap).unwrap();

        let out = ChannelWriter::create(&dir, "marker", 4).unwrap();
        let config_reader = ChannelReader::open(&dir, "config").unwrap();
        let stage = MarkerStage {
            ticks: 0,
            registered: vec![
                ("known_key".into(), serde_json::json!(1)),
                ("unknown_key".into(), serde_json::json!("default")),
            ],
        };
        let mut runner = ComponentRunner::new(
            stage,
            BTreeMap::new(),
            out,
            Some(config_reader),
            Arc::new(AtomicBool::new(false)),
        );

        runner.tick().unwrap();

        let mut reader = ChannelReader::open(&dir, "marker").unwrap();
        let snap = reader.get().unwrap();
        // Still published (heartbeat) but marked not authoritative.
        assert!(!snap.valid);
        // Registered defaults are echoed for the Monitor to adopt.
        assert_eq!(
            snap.extra[REGISTERED_CONFIG_KEY]["unknown_key"],
            serde_json::json!("default")
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn config_complete_once_monitor_adopts() {
        let dir = temp_dir();
        let mut config_writer = ChannelWriter::create(&dir, "config", 2).unwrap();
        let mut config_snap = TickSnapshot::fresh(0);
        config_snap
            .extra
            .insert("threshold".into(), serde_json::json!(5));
        config_writer.put(&mut config_snap).unwrap();

        let out = ChannelWriter::create(&dir, "marker", 4).unwrap();
        let config_reader = ChannelReader::open(&dir, "config").unwrap();
        let stage = MarkerStage {
            ticks: 0,
            registered: vec![("threshold".into(), serde_json::json!(10))],
        };
        let mut runner = ComponentRunner::new(
            stage,
            BTreeMap::new(),
            out,
            Some(config_reader),
            Arc::new(AtomicBool::new(false)),
        );

        runner.tick().unwrap();

        let mut reader = ChannelReader::open(&dir, "marker").unwrap();
        assert!(reader.get().unwrap().valid);

        std::fs::remove_dir_all(&dir).ok();
    }

    /// Stage that spends its time in pacing, not in processing.
    struct PacedStage {
        pause: Duration,
    }

    impl Stage for PacedStage {
        fn name(&self) -> &str {
            "paced"
        }

        fn pace(&mut self) {
            std::thread::sleep(self.pause);
        }

        fn process(&mut self, _ctx: &mut TickContext<'_>) -> Result<(), TaktError> {
            Ok(())
        }
    }

    #[test]
    fn pacing_delay_is_excluded_from_tick_latency() {
        let dir = temp_dir();
        let out = ChannelWriter::create(&dir, "paced", 4).unwrap();
        let mut runner = ComponentRunner::new(
            PacedStage {
                pause: Duration::from_millis(80),
            },
            BTreeMap::new(),
            out,
            None,
            Arc::new(AtomicBool::new(false)),
        );

        runner.tick().unwrap();

        let mut reader = ChannelReader::open(&dir, "paced").unwrap();
        let snap = reader.get().unwrap();
        // The 80 ms pause happens before the tick timer starts.
        assert!(snap.metrics["paced_tick_ms"] < 40.0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn process_error_skips_publication() {
        let dir = temp_dir();
        let out = ChannelWriter::create(&dir, "failing", 4).unwrap();
        let mut runner = ComponentRunner::new(
            FailingStage,
            BTreeMap::new(),
            out,
            None,
            Arc::new(AtomicBool::new(false)),
        );

        assert!(runner.tick().is_err());

        let mut reader = ChannelReader::open(&dir, "failing").unwrap();
        assert_eq!(reader.header_seq().unwrap(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
