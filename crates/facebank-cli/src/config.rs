use anyhow::{Context, Result};
use facebank_core::detector::DetectorConfig;
use facebank_core::store::DEFAULT_SIMILARITY_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application configuration: an optional TOML file, then `FACEBANK_*`
/// environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Similarity a best match must reach to be reported.
    pub similarity_threshold: f32,
    /// Worker threads for the rayon pool (0 = one per core).
    pub threads: usize,
    /// Square input side of the embedding network.
    pub embedding_input_size: u32,
    /// Length of the vectors the embedding network emits.
    pub embedding_dimension: usize,
    /// Where face crops are written while debug logging is on.
    pub debug_dir: Option<PathBuf>,
    /// Cascade parameters (`[detector]` table).
    pub detector: DetectorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            threads: 0,
            embedding_input_size: 160,
            embedding_dimension: 512,
            debug_dir: None,
            detector: DetectorConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACEBANK_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("FACEBANK_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
            .detector
            .validate()
            .context("invalid detector configuration")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override fields from `FACEBANK_*` variables. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("FACEBANK_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("FACEBANK_DEBUG_DIR") {
            self.debug_dir = Some(PathBuf::from(dir));
        }
        let detector = &mut self.detector;
        detector.min_face_size = parsed(&var, "FACEBANK_MIN_FACE_SIZE", detector.min_face_size);
        detector.scale_factor = parsed(&var, "FACEBANK_SCALE_FACTOR", detector.scale_factor);
        self.similarity_threshold = parsed(
            &var,
            "FACEBANK_SIMILARITY_THRESHOLD",
            self.similarity_threshold,
        );
        self.threads = parsed(&var, "FACEBANK_THREADS", self.threads);
    }

    /// Path to the proposal (stage 1) model.
    pub fn proposal_model_path(&self) -> String {
        self.model_path("pnet.onnx")
    }

    /// Path to the refinement (stage 2) model.
    pub fn refinement_model_path(&self) -> String {
        self.model_path("rnet.onnx")
    }

    /// Path to the output (stage 3) model.
    pub fn output_model_path(&self) -> String {
        self.model_path("onet.onnx")
    }

    /// Path to the embedding model.
    pub fn embedding_model_path(&self) -> String {
        self.model_path("facenet.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facebank/models")
}

fn parsed<T: std::str::FromStr>(var: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
