//! takt-launcher — spawns every pipeline stage and supervises the pod.
//!
//! Reads `takt.toml`, launches one `takt-pipeline` child per stage with
//! colored log prefixes (like docker-compose), then runs the Monitor in
//! this process: liveness polling, channel staleness checks, GlobalConfig
//! authority, and the `/metrics` + `/healthz` HTTP surface. A dead child
//! tears the whole pod down; the external supervisor restarts it.
//!
//! # Usage
//!
//! ```bash
//! takt-launcher --config config/takt.toml
//! takt-launcher --config config/takt.toml --only training
//! ```

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use clap::Parser;

use takt_channel::{ChannelReader, ChannelWriter};
use takt_core::TaktConfig;
use takt_sched::{
    channel_name, spawn_http, spawn_stop_watcher, Monitor, StageWatch, CONFIG_CHANNEL,
};

const STAGES: &[&str] = &["beater", "assigner", "matcher"];

const COLORS: &[&str] = &[
    "\x1b[36m", // cyan
    "\x1b[33m", // yellow
    "\x1b[32m", // green
    "\x1b[35m", // magenta
    "\x1b[34m", // blue
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
];
const RESET: &str = "\x1b[0m";

/// Launch and supervise all scheduling pipelines of one pod.
#[derive(Parser, Debug)]
#[command(name = "takt-launcher", version, about)]
struct Cli {
    /// Path to the scheduler configuration file.
    #[arg(long, default_value = "config/takt.toml")]
    config: String,

    /// Comma-separated pipeline names to start (default: all).
    #[arg(long, value_delimiter = ',')]
    only: Option<Vec<String>>,
}

struct ManagedChild {
    name: String,
    child: Child,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = TaktConfig::from_file(&cli.config)?;
    let stop = spawn_stop_watcher();

    let pipelines: Vec<_> = config
        .pipeline
        .iter()
        .filter(|p| {
            cli.only
                .as_ref()
                .map_or(true, |only| only.contains(&p.name))
        })
        .collect();
    if pipelines.is_empty() {
        anyhow::bail!(
            "no matching pipelines for --only {:?}. Available: {:?}",
            cli.only.unwrap_or_default(),
            config.pipeline.iter().map(|p| &p.name).collect::<Vec<_>>()
        );
    }

    // The config channel must exist before any stage gates on it.
    std::fs::create_dir_all(&config.channel_dir)?;
    let config_out = ChannelWriter::create(&config.channel_dir, CONFIG_CHANNEL, 4)?;
    let mut monitor = Monitor::new(
        &config.monitor.global_config_path,
        config_out,
        Duration::from_secs(config.monitor.check_interval_secs),
        stop,
    )?;

    let stage_bin = sibling_binary("takt-pipeline")?;
    let max_name_len = pipelines
        .iter()
        .flat_map(|p| STAGES.iter().map(move |s| p.name.len() + 1 + s.len()))
        .max()
        .unwrap_or(0);

    let mut children: Vec<ManagedChild> = Vec::new();
    for (idx, pipeline) in pipelines.iter().enumerate() {
        for (stage_idx, stage) in STAGES.iter().enumerate() {
            let name = channel_name(&pipeline.name, stage);
            let color = COLORS[(idx * STAGES.len() + stage_idx) % COLORS.len()];
            tracing::info!(process = %name, "spawning stage");
            let child = spawn_stage(
                &stage_bin,
                &cli.config,
                &pipeline.name,
                stage,
                &name,
                color,
                max_name_len,
            )?;
            monitor.add_child(&name, child.id());
            children.push(ManagedChild { name, child });
        }
    }

    // Stages create their channels on startup; wait for each and register
    // it for staleness supervision.
    for pipeline in &pipelines {
        for stage in STAGES {
            let name = channel_name(&pipeline.name, stage);
            let reader = wait_for_channel(&config.channel_dir, &name)?;
            monitor.add_watch(StageWatch::new(&name, reader));
        }
    }

    spawn_http(monitor.state(), config.monitor.metrics_port);
    tracing::info!(
        children = children.len(),
        port = config.monitor.metrics_port,
        "pod is up"
    );

    // Returns only on the stop flag; a dead child exits the process inside.
    monitor.run()?;

    shutdown(&mut children);
    tracing::info!("takt-launcher exited");
    Ok(())
}

/// The stage binary installed next to this one.
fn sibling_binary(name: &str) -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve binary directory"))?;
    Ok(dir.join(name))
}

/// Spawn one stage child and pipe its output through a colored prefix.
fn spawn_stage(
    bin: &Path,
    config: &str,
    pipeline: &str,
    role: &str,
    name: &str,
    color: &str,
    max_name_len: usize,
) -> anyhow::Result<Child> {
    let mut child = Command::new(bin)
        .args(["--config", config, "--pipeline", pipeline, "--role", role])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let prefix = format!("{color}{name:>max_name_len$}{RESET} │ ");
    if let Some(stdout) = child.stdout.take() {
        let prefix = prefix.clone();
        std::thread::spawn(move || {
            for line in std::io::BufReader::new(stdout).lines().map_while(Result::ok) {
                println!("{prefix}{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        std::thread::spawn(move || {
            for line in std::io::BufReader::new(stderr).lines().map_while(Result::ok) {
                eprintln!("{prefix}{line}");
            }
        });
    }
    Ok(child)
}

/// Wait for a stage to create its channel file.
fn wait_for_channel(dir: &Path, name: &str) -> anyhow::Result<ChannelReader> {
    for _ in 0..150 {
        if let Ok(reader) = ChannelReader::open(dir, name) {
            return Ok(reader);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    anyhow::bail!("channel {name} never appeared under {}", dir.display())
}

/// SIGTERM everything, give it five seconds, then SIGKILL the rest.
fn shutdown(children: &mut [ManagedChild]) {
    for managed in children.iter_mut() {
        let pid = managed.child.id();
        tracing::info!(process = %managed.name, pid, "sending SIGTERM");
        Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .ok();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let all_exited = children
            .iter_mut()
            .all(|m| matches!(m.child.try_wait(), Ok(Some(_))));
        if all_exited {
            tracing::info!("all stages exited gracefully");
            return;
        }
        if Instant::now() >= deadline {
            for managed in children.iter_mut() {
                if !matches!(managed.child.try_wait(), Ok(Some(_))) {
                    tracing::warn!(process = %managed.name, "force killing");
                    managed.child.kill().ok();
                }
            }
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
