use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TaktError;

// ── Static deployment config ────────────────────────────────────────

/// Full static configuration for one scheduler pod.
///
/// Parsed from `takt.toml` with environment variable overrides. Cluster-wide
/// *tunables* live in [`GlobalConfig`] instead and are redistributed at
/// runtime; this struct only wires the process topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaktConfig {
    /// Directory holding the shared-memory channel files.
    #[serde(default = "default_channel_dir")]
    pub channel_dir: PathBuf,

    /// Postgres connection string.
    #[serde(default)]
    pub database_url: String,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// One entry per scheduling pipeline (e.g. training pool, jupyter pool).
    #[serde(default)]
    pub pipeline: Vec<PipelineConfig>,
}

fn default_channel_dir() -> PathBuf {
    PathBuf::from("/tmp/taktwerk/channels")
}

/// Monitor section: supervision thresholds and HTTP exposure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// A stage whose channel `seq` has not advanced within this window is
    /// reported stuck.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Port for `GET /metrics` and `GET /healthz`.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Persistent store for the distributed [`GlobalConfig`].
    #[serde(default = "default_global_config_path")]
    pub global_config_path: PathBuf,
}

fn default_check_interval() -> u64 {
    30
}

fn default_metrics_port() -> u16 {
    7410
}

fn default_global_config_path() -> PathBuf {
    PathBuf::from("/tmp/taktwerk/global_config.json")
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            metrics_port: default_metrics_port(),
            global_config_path: default_global_config_path(),
        }
    }
}

/// One scheduling pipeline: Beater → Assigner → Matcher over one node pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Unique pipeline name; channel files are derived from it.
    pub name: String,

    /// Tick period in milliseconds; Beaters align to wall-clock multiples.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Retained-frame depth per channel.
    #[serde(default = "default_rotate_num")]
    pub rotate_num: usize,

    /// Resource groups this pipeline schedules. Empty = all groups.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Re-send start signals for tasks stuck mid-launch after this many seconds.
    #[serde(default = "default_re_signal")]
    pub re_signal_secs: u64,

    /// Launcher shard fan-out count for start signals.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_rotate_num() -> usize {
    8
}

fn default_re_signal() -> u64 {
    60
}

fn default_shard_count() -> u32 {
    3
}

impl TaktConfig {
    /// Parse config from a TOML string, apply env overrides, validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, TaktError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TaktError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// `TAKT_DATABASE_URL` and `TAKT_CHANNEL_DIR` override the file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TAKT_DATABASE_URL") {
            if !url.is_empty() {
                self.database_url = url;
            }
        }
        if let Ok(dir) = std::env::var("TAKT_CHANNEL_DIR") {
            if !dir.is_empty() {
                self.channel_dir = PathBuf::from(dir);
            }
        }
    }

    fn validate(&self) -> Result<(), TaktError> {
        if self.pipeline.is_empty() {
            return Err(TaktError::Config("no [[pipeline]] entries".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for p in &self.pipeline {
            if p.name.is_empty() {
                return Err(TaktError::Config("pipeline name must not be empty".into()));
            }
            if !seen.insert(&p.name) {
                return Err(TaktError::Config(format!(
                    "duplicate pipeline name {:?}",
                    p.name
                )));
            }
            if p.interval_ms == 0 {
                return Err(TaktError::Config(format!(
                    "pipeline {:?}: interval_ms must be > 0",
                    p.name
                )));
            }
            if p.rotate_num == 0 {
                return Err(TaktError::Config(format!(
                    "pipeline {:?}: rotate_num must be > 0",
                    p.name
                )));
            }
        }
        Ok(())
    }

    pub fn pipeline_by_name(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipeline.iter().find(|p| p.name == name)
    }
}

// ── GlobalConfig ────────────────────────────────────────────────────

/// Flat key→JSON map of cluster-wide tunables.
///
/// The Monitor owns the persisted copy and is the only writer of keys that
/// are missing; components register defaults via their published
/// `extra["registered_global_config"]` map and read values back from the
/// config channel each tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    pub values: BTreeMap<String, serde_json::Value>,
}

impl GlobalConfig {
    /// Load from the persistent store; a missing file is an empty config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaktError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => {
                let values = serde_json::from_str(&content)
                    .map_err(|e| TaktError::Config(format!("global config parse: {e}")))?;
                Ok(Self { values })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TaktError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.values)
            .map_err(|e| TaktError::Config(format!("global config encode: {e}")))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Adopt defaults for keys with no current value. Returns the number of
    /// newly adopted keys (the bootstrap mechanism for cluster tunables).
    pub fn adopt_defaults(&mut self, registered: &BTreeMap<String, serde_json::Value>) -> usize {
        let mut adopted = 0;
        for (key, default) in registered {
            if !self.values.contains_key(key) {
                self.values.insert(key.clone(), default.clone());
                adopted += 1;
            }
        }
        adopted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
channel_dir = "/tmp/takt-test/channels"
database_url = "postgres://localhost/takt"

[monitor]
check_interval_secs = 10
metrics_port = 7411

[[pipeline]]
name = "training"
interval_ms = 500
rotate_num = 4
groups = ["g1", "g2"]

[[pipeline]]
name = "jupyter"
"#;

    #[test]
    fn parse_sample() {
        let cfg = TaktConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.pipeline.len(), 2);
        assert_eq!(cfg.monitor.check_interval_secs, 10);

        let training = cfg.pipeline_by_name("training").unwrap();
        assert_eq!(training.interval_ms, 500);
        assert_eq!(training.groups, vec!["g1", "g2"]);

        // Defaults fill the sparse entry.
        let jupyter = cfg.pipeline_by_name("jupyter").unwrap();
        assert_eq!(jupyter.interval_ms, 1000);
        assert_eq!(jupyter.rotate_num, 8);
        assert_eq!(jupyter.shard_count, 3);
    }

    #[test]
    fn rejects_empty_and_duplicate_pipelines() {
        assert!(TaktConfig::from_toml("channel_dir = \"/tmp/x\"").is_err());

        let dup = r#"
[[pipeline]]
name = "a"
[[pipeline]]
name = "a"
"#;
        assert!(TaktConfig::from_toml(dup).is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        let bad = r#"
[[pipeline]]
name = "a"
interval_ms = 0
"#;
        assert!(TaktConfig::from_toml(bad).is_err());
    }

    #[test]
    fn global_config_adopts_only_missing() {
        let mut gc = GlobalConfig::default();
        gc.set("interval_ms", serde_json::json!(1000));

        let mut registered = BTreeMap::new();
        registered.insert("interval_ms".to_string(), serde_json::json!(500));
        registered.insert("re_signal_secs".to_string(), serde_json::json!(60));

        let adopted = gc.adopt_defaults(&registered);
        assert_eq!(adopted, 1);
        // Existing value wins over the registered default.
        assert_eq!(gc.get("interval_ms").unwrap(), &serde_json::json!(1000));
        assert_eq!(gc.get("re_signal_secs").unwrap(), &serde_json::json!(60));
    }

    #[test]
    fn global_config_save_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("takt-gc-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("global_config.json");

        let mut gc = GlobalConfig::default();
        gc.set("check_interval_secs", serde_json::json!(30));
        gc.save(&path).unwrap();

        let loaded = GlobalConfig::load(&path).unwrap();
        assert_eq!(loaded, gc);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_global_config_file_is_empty() {
        let gc = GlobalConfig::load("/nonexistent/takt/global.json").unwrap();
        assert!(gc.values.is_empty());
    }
}
