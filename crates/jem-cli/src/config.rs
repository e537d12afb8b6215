//! TOML config loading for the JEM CLI.
//!
//! Deserializes `configs/jem.toml`, which has `[model]`, `[sampler]` and
//! `[training]` sections. Every field is optional and overrides the library
//! defaults; CLI flags override both.

use std::path::Path;

use jem::{JemTrainingConfig, SamplerConfig, ShallowCnnConfig};
use serde::Deserialize;

/// Image shape of the 56x56 grayscale glyph dataset.
pub const DEFAULT_IMG_SHAPE: [usize; 3] = [1, 56, 56];

/// Default batch size for training and sampling.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Top-level structure matching `configs/jem.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JemToml {
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub sampler: SamplerOverrides,
    #[serde(default)]
    pub training: TrainingOverrides,
}

/// Optional overrides for `ShallowCnnConfig`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelOverrides {
    pub in_channels: Option<usize>,
    pub hidden_features: Option<usize>,
    pub num_classes: Option<usize>,
    pub dropout: Option<f64>,
}

/// Optional overrides for `SamplerConfig`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplerOverrides {
    pub img_shape: Option<[usize; 3]>,
    pub batch_size: Option<usize>,
    pub cbuffer_size: Option<usize>,
    pub max_len: Option<usize>,
    pub num_steps: Option<usize>,
    pub step_size: Option<f64>,
    pub noise_std: Option<f64>,
    pub grad_clip: Option<f64>,
    pub fresh_ratio: Option<f64>,
    pub max_fresh_attempts: Option<usize>,
    pub seed: Option<u64>,
}

/// Optional overrides for `JemTrainingConfig`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingOverrides {
    pub lr: Option<f64>,
    pub alpha: Option<f64>,
    pub pyx_weight: Option<f64>,
    pub ccond_sample: Option<bool>,
    pub num_epochs: Option<usize>,
    pub max_grad_norm: Option<f64>,
    pub log_interval: Option<usize>,
    pub checkpoint_dir: Option<String>,
}

/// Load and deserialize a `JemToml` from a TOML file.
pub fn load_jem_toml(path: &Path) -> anyhow::Result<JemToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: JemToml = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded JEM config");
    Ok(config)
}

/// Load the TOML file if given, otherwise use library defaults.
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<JemToml> {
    match path {
        Some(path) => load_jem_toml(path),
        None => Ok(JemToml::default()),
    }
}

/// Build a `ShallowCnnConfig` from defaults and TOML overrides.
pub fn build_model_config(overrides: &ModelOverrides) -> ShallowCnnConfig {
    let mut config = ShallowCnnConfig::new();
    if let Some(v) = overrides.in_channels {
        config.in_channels = v;
    }
    if let Some(v) = overrides.hidden_features {
        config.hidden_features = v;
    }
    if let Some(v) = overrides.num_classes {
        config.num_classes = v;
    }
    if let Some(v) = overrides.dropout {
        config.dropout = v;
    }
    config
}

/// CLI flags that take priority over the `[sampler]` section.
#[derive(Debug, Default, Clone)]
pub struct SamplerCliOverrides {
    pub batch_size: Option<usize>,
    pub num_steps: Option<usize>,
    pub step_size: Option<f64>,
    pub seed: Option<u64>,
}

/// Build a `SamplerConfig` for a model with `num_classes` outputs.
///
/// Priority chain: library defaults < TOML values < CLI flags.
pub fn build_sampler_config(
    overrides: &SamplerOverrides,
    num_classes: usize,
    cli: &SamplerCliOverrides,
) -> anyhow::Result<SamplerConfig> {
    let img_shape = overrides.img_shape.unwrap_or(DEFAULT_IMG_SHAPE);
    let batch_size = cli
        .batch_size
        .or(overrides.batch_size)
        .unwrap_or(DEFAULT_BATCH_SIZE);
    let mut config = SamplerConfig::new(img_shape, batch_size, num_classes);

    if let Some(v) = overrides.cbuffer_size {
        config.cbuffer_size = v;
    }
    if let Some(v) = overrides.max_len {
        config.max_len = v;
    }
    if let Some(v) = overrides.noise_std {
        config.noise_std = v;
    }
    if let Some(v) = overrides.grad_clip {
        config.grad_clip = v;
    }
    if let Some(v) = overrides.fresh_ratio {
        config.fresh_ratio = v;
    }
    if let Some(v) = overrides.max_fresh_attempts {
        config.max_fresh_attempts = v;
    }
    if let Some(v) = cli.num_steps.or(overrides.num_steps) {
        config.num_steps = v;
    }
    if let Some(v) = cli.step_size.or(overrides.step_size) {
        config.step_size = v;
    }
    config.seed = cli.seed.or(overrides.seed);

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid sampler config: {e}"))?;
    Ok(config)
}

/// Build a `JemTrainingConfig` from defaults, TOML overrides and CLI flags.
pub fn build_training_config(
    overrides: &TrainingOverrides,
    num_epochs_cli: Option<usize>,
    checkpoint_dir_cli: Option<&Path>,
) -> JemTrainingConfig {
    let mut config = JemTrainingConfig::new();
    if let Some(v) = overrides.lr {
        config.lr = v;
    }
    if let Some(v) = overrides.alpha {
        config.alpha = v;
    }
    if let Some(v) = overrides.pyx_weight {
        config.pyx_weight = v;
    }
    if let Some(v) = overrides.ccond_sample {
        config.ccond_sample = v;
    }
    if let Some(v) = overrides.max_grad_norm {
        config.max_grad_norm = v;
    }
    if let Some(v) = overrides.log_interval {
        config.log_interval = v;
    }
    if let Some(v) = num_epochs_cli.or(overrides.num_epochs) {
        config.num_epochs = v;
    }
    if let Some(dir) = checkpoint_dir_cli {
        config.checkpoint_dir = dir.to_string_lossy().into_owned();
    } else if let Some(dir) = &overrides.checkpoint_dir {
        config.checkpoint_dir = dir.clone();
    }
    config
}
