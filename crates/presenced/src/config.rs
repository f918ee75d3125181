use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `PRESENCE_CONFIG`, then `PRESENCE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine distance below which a gallery entry is accepted. Belongs to
    /// the embedding model; 0.68 for ArcFace w600k_r50.
    pub distance_threshold: f64,
    /// Upper bound on one embedding extraction, in seconds.
    pub extract_timeout_secs: u64,
    /// Pending extraction requests allowed before callers wait.
    pub engine_queue: usize,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        Self {
            model_dir: presence_core::default_model_dir(),
            db_path: data_dir.join("presence.db"),
            distance_threshold: presence_core::ARCFACE_DISTANCE_THRESHOLD,
            extract_timeout_secs: 10,
            engine_queue: 4,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load the layered configuration from the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override fields from `PRESENCE_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&var, "PRESENCE_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        override_parsed(&var, "PRESENCE_EXTRACT_TIMEOUT_SECS", &mut self.extract_timeout_secs);
        override_parsed(&var, "PRESENCE_ENGINE_QUEUE", &mut self.engine_queue);
        override_parsed(&var, "PRESENCE_BUS", &mut self.bus);
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs.max(1))
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn override_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config override"),
    }
}
