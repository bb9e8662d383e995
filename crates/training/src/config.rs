use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Flat run configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub max_num_training_steps: usize,
    pub num_output_steps: usize,
    pub num_summary_steps: usize,
    pub num_checkpoint_steps: usize,
    pub step_size_schedule: Vec<(usize, f64)>,
    #[serde(default)]
    pub weight_decay: f64,
    pub training_batch_size: usize,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default)]
    pub lambda: f64,
    #[serde(default = "default_approx_factor")]
    pub approx_factor: usize,
    #[serde(default)]
    pub continue_train: bool,
    pub model_dir: PathBuf,
    pub data_path: PathBuf,
    #[serde(default = "default_training_objective")]
    pub training_objective: String,

    pub epsilon: f64,
    pub num_steps: usize,
    pub step_size: f64,
    #[serde(default)]
    pub random_start: bool,
    #[serde(default = "default_loss_func")]
    pub loss_func: String,

    #[serde(default = "default_seed")]
    pub tf_random_seed: u64,
    #[serde(default = "default_seed")]
    pub np_random_seed: u64,

    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
    #[serde(default = "default_input_shape")]
    pub input_shape: [usize; 3],
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default)]
    pub separate_step_timers: bool,

    /// File the configuration was read from; copied into `model_dir`.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            TrainingError::ConfigFormat(format!(
                "failed to read config {}: {err}",
                path.display()
            ))
        })?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") | None => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.source_path = Some(path.to_path_buf());
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.num_output_steps == 0 {
            errors.push("num_output_steps must be greater than 0".to_string());
        }
        if self.num_summary_steps == 0 {
            errors.push("num_summary_steps must be greater than 0".to_string());
        }
        if self.num_checkpoint_steps == 0 {
            errors.push("num_checkpoint_steps must be greater than 0".to_string());
        }
        if self.training_batch_size == 0 {
            errors.push("training_batch_size must be greater than 0".to_string());
        }

        if self.step_size_schedule.is_empty() {
            errors.push("step_size_schedule must not be empty".to_string());
        }
        for pair in self.step_size_schedule.windows(2) {
            if pair[1].0 <= pair[0].0 {
                errors.push(format!(
                    "step_size_schedule thresholds must be strictly increasing ({} then {})",
                    pair[0].0, pair[1].0
                ));
            }
        }
        for (threshold, rate) in &self.step_size_schedule {
            if !rate.is_finite() || *rate < 0.0 {
                errors.push(format!(
                    "step_size_schedule rate at threshold {} must be finite and >= 0",
                    threshold
                ));
            }
        }

        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            errors.push("weight_decay must be >= 0".to_string());
        }
        if !self.momentum.is_finite() || self.momentum < 0.0 {
            errors.push("momentum must be >= 0".to_string());
        }
        if self.m == 0 {
            errors.push("m must be greater than 0".to_string());
        }
        if self.approx_factor == 0 {
            errors.push("approx_factor must be greater than 0".to_string());
        }
        if !self.lambda.is_finite() {
            errors.push("lambda must be finite".to_string());
        }

        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            errors.push("epsilon must be >= 0".to_string());
        }
        if !self.step_size.is_finite() || self.step_size < 0.0 {
            errors.push("step_size must be >= 0".to_string());
        }

        if self.model_dir.as_os_str().is_empty() {
            errors.push("model_dir must not be empty".to_string());
        }
        if self.data_path.as_os_str().is_empty() {
            errors.push("data_path must not be empty".to_string());
        }
        if self.max_to_keep == 0 {
            errors.push("max_to_keep must be greater than 0".to_string());
        }
        if self.input_shape.iter().any(|&dim| dim == 0) {
            errors.push("input_shape must not contain zero dimensions".to_string());
        }
        if self.num_classes < 2 {
            errors.push("num_classes must be at least 2".to_string());
        }
        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.model_dir, base);
        absolutize_in_place(&mut self.data_path, base);
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_momentum() -> f64 {
    0.9
}

fn default_m() -> usize {
    10
}

fn default_approx_factor() -> usize {
    1
}

fn default_training_objective() -> String {
    "adv_ar".to_string()
}

fn default_loss_func() -> String {
    "xent".to_string()
}

fn default_seed() -> u64 {
    451760341
}

fn default_max_to_keep() -> usize {
    30
}

fn default_input_shape() -> [usize; 3] {
    [128, 128, 3]
}

fn default_num_classes() -> usize {
    17
}

fn default_hidden_size() -> usize {
    256
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("failed to restore checkpoint: {0}")]
    Restore(String),

    #[error("batch shape mismatch: {0}")]
    Shape(String),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn restore(message: impl Into<String>) -> Self {
        Self::Restore(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}
