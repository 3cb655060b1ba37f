//! Process-group supervisor, configuration authority, and metrics sink.
//!
//! One Monitor per pod. It polls child liveness once per second, watches
//! every stage's outbound channel for staleness, adopts registered
//! GlobalConfig defaults, and serves `/metrics` and `/healthz` over HTTP.
//! A dead child terminates the whole pod; the external supervisor restarts
//! everything rather than this process attempting a selective restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info, warn};

use takt_channel::{ChannelReader, ChannelWriter};
use takt_core::{GlobalConfig, TaktError, TickSnapshot};

use crate::component::REGISTERED_CONFIG_KEY;

const POLL_PERIOD: Duration = Duration::from_secs(1);

/// One supervised stage channel.
pub struct StageWatch {
    name: String,
    reader: ChannelReader,
    last_seq: u64,
    last_advance: Instant,
}

impl StageWatch {
    pub fn new(name: impl Into<String>, reader: ChannelReader) -> Self {
        Self {
            name: name.into(),
            reader,
            last_seq: 0,
            last_advance: Instant::now(),
        }
    }
}

/// What the HTTP surface reports.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorState {
    pub healthy: bool,
    /// Stage channels whose `seq` has not advanced within `check_interval`.
    pub stale: Vec<String>,
    /// Latest metrics per stage, keys namespaced `<stage>_<metric>`.
    pub metrics: BTreeMap<String, f64>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            healthy: true,
            stale: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }
}

pub struct Monitor {
    children: Vec<(String, u32)>,
    watches: Vec<StageWatch>,
    config: GlobalConfig,
    config_path: PathBuf,
    config_out: ChannelWriter,
    check_interval: Duration,
    state: Arc<Mutex<MonitorState>>,
    stop: Arc<AtomicBool>,
}

impl Monitor {
    pub fn new(
        config_path: impl AsRef<Path>,
        config_out: ChannelWriter,
        check_interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, TaktError> {
        let config = GlobalConfig::load(config_path.as_ref())?;
        info!(
            keys = config.values.len(),
            path = %config_path.as_ref().display(),
            "global config loaded"
        );
        Ok(Self {
            children: Vec::new(),
            watches: Vec::new(),
            config,
            config_path: config_path.as_ref().to_path_buf(),
            config_out,
            check_interval,
            state: Arc::new(Mutex::new(MonitorState::default())),
            stop,
        })
    }

    pub fn add_child(&mut self, name: impl Into<String>, pid: u32) {
        self.children.push((name.into(), pid));
    }

    pub fn add_watch(&mut self, watch: StageWatch) {
        self.watches.push(watch);
    }

    pub fn state(&self) -> Arc<Mutex<MonitorState>> {
        self.state.clone()
    }

    /// Supervise until the stop flag is set. A dead child tears the whole
    /// pod down with exit code 1.
    pub fn run(&mut self) -> Result<(), TaktError> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("monitor stopping");
                return Ok(());
            }

            let dead = self.dead_children();
            if !dead.is_empty() {
                if let Ok(mut state) = self.state.lock() {
                    state.healthy = false;
                }
                for (name, pid) in &dead {
                    error!(child = %name, pid, "child process died");
                }
                self.kill_children();
                std::process::exit(1);
            }

            if let Err(e) = self.observe_stages() {
                warn!(error = %e, "stage observation failed");
            }
            if let Err(e) = self.publish_config() {
                warn!(error = %e, "config rebroadcast failed");
            }

            std::thread::sleep(POLL_PERIOD);
        }
    }

    fn dead_children(&self) -> Vec<(String, u32)> {
        self.children
            .iter()
            .filter(|(_, pid)| !Path::new(&format!("/proc/{pid}")).exists())
            .cloned()
            .collect()
    }

    fn kill_children(&self) {
        for (name, pid) in &self.children {
            info!(child = %name, pid, "killing child");
            Command::new("kill")
                .args(["-9", &pid.to_string()])
                .status()
                .ok();
        }
    }

    /// Read every stage channel: track seq advancement, merge metrics, and
    /// adopt any registered config defaults we have no value for.
    fn observe_stages(&mut self) -> Result<(), TaktError> {
        let mut adopted_total = 0;
        let mut stale = Vec::new();
        let mut metrics = BTreeMap::new();

        for watch in &mut self.watches {
            let seq = match watch.reader.header_seq() {
                Ok(seq) => seq,
                Err(e) => {
                    warn!(stage = %watch.name, error = %e, "channel unreadable");
                    stale.push(watch.name.clone());
                    continue;
                }
            };
            if seq > watch.last_seq {
                watch.last_seq = seq;
                watch.last_advance = Instant::now();

                let snap = watch.reader.get()?;
                for (key, value) in &snap.metrics {
                    metrics.insert(format!("{}_{key}", watch.name), *value);
                }
                if let Some(registered) = snap.extra.get(REGISTERED_CONFIG_KEY) {
                    let registered: BTreeMap<String, serde_json::Value> =
                        serde_json::from_value(registered.clone()).map_err(|e| {
                            TaktError::Config(format!(
                                "bad registered config from {}: {e}",
                                watch.name
                            ))
                        })?;
                    adopted_total += self.config.adopt_defaults(&registered);
                }
            } else if watch.last_advance.elapsed() > self.check_interval {
                warn!(
                    stage = %watch.name,
                    seq,
                    stuck_for = ?watch.last_advance.elapsed(),
                    "pipeline stage is stuck"
                );
                stale.push(watch.name.clone());
            }
        }

        if adopted_total > 0 {
            info!(adopted = adopted_total, "adopted registered config defaults");
            self.config.save(&self.config_path)?;
        }

        if let Ok(mut state) = self.state.lock() {
            state.healthy = stale.is_empty();
            state.stale = stale;
            state.metrics.extend(metrics);
        }
        Ok(())
    }

    /// Rebroadcast the full config map every poll so late-starting stages
    /// converge without a request path.
    fn publish_config(&mut self) -> Result<(), TaktError> {
        let mut snap = TickSnapshot::fresh(0);
        snap.extra = self.config.values.clone();
        self.config_out.put(&mut snap)?;
        Ok(())
    }
}

// ── HTTP surface ─────────────────────────────────────────────────────

/// Serve `/metrics` and `/healthz` on a dedicated thread.
pub fn spawn_http(state: Arc<Mutex<MonitorState>>, port: u16) {
    std::thread::Builder::new()
        .name("monitor-http".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to build http runtime");
                    return;
                }
            };
            rt.block_on(async move {
                let app = Router::new()
                    .route("/healthz", get(healthz))
                    .route("/metrics", get(metrics))
                    .with_state(state);
                let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(l) => l,
                    Err(e) => {
                        error!(port, error = %e, "failed to bind metrics port");
                        return;
                    }
                };
                info!(port, "metrics server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "metrics server exited");
                }
            });
        })
        .ok();
}

async fn healthz(State(state): State<Arc<Mutex<MonitorState>>>) -> StatusCode {
    let healthy = state.lock().map(|s| s.healthy).unwrap_or(false);
    if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<Arc<Mutex<MonitorState>>>) -> Json<MonitorState> {
    let snapshot = state
        .lock()
        .map(|s| s.clone())
        .unwrap_or_else(|_| MonitorState {
            healthy: false,
            stale: Vec::new(),
            metrics: BTreeMap::new(),
        });
    Json(snapshot)
}

// ── Tests ────────────────────────────────────────────────────────────
