//! JEM training loop: Adam with beta1 = 0 over in-memory image batches.
//!
//! Each step draws a fresh SGLD batch from the sampler, computes the joint
//! loss and updates the model. Validation reuses the same loss without a
//! parameter update. At the end of every epoch the model is written to
//! `{checkpoint_dir}/last`; with validation data the lowest validation loss
//! so far is also kept in `{checkpoint_dir}/best`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;

use crate::model::energy::EnergyModel;
use crate::model::shallow_cnn::{ShallowCnn, ShallowCnnConfig};
use crate::sampler::SgldSampler;
use crate::training::data::ImageBatch;
use crate::training::loss::joint_loss;
use crate::training::metrics::{CalibrationBins, ConfusionMatrix, JemMetrics, RunningAvg};

/// Subdirectory holding the checkpoint of the most recent epoch.
pub const LAST_CHECKPOINT: &str = "last";
/// Subdirectory holding the checkpoint with the lowest validation loss.
pub const BEST_CHECKPOINT: &str = "best";

/// Confidence bins used for the calibration error.
const CALIBRATION_BINS: usize = 10;

/// Metadata saved alongside each checkpoint.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub step: usize,
    /// Mean validation loss after this epoch, if validation ran.
    #[serde(default)]
    pub val_loss: Option<f64>,
}

/// Loss averages plus classification scores over an evaluation set.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub metrics: JemMetrics,
    pub confusion: ConfusionMatrix,
    pub calibration: CalibrationBins,
}

impl std::fmt::Display for EvalReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | {} ece={:.3}",
            self.metrics,
            self.confusion,
            self.calibration.expected_calibration_error()
        )
    }
}

/// Configuration for JEM training.
#[derive(Config, Debug)]
pub struct JemTrainingConfig {
    /// Adam learning rate.
    #[config(default = 1e-4)]
    pub lr: f64,
    /// Weight of the L2 penalty on data and synthesized scores.
    #[config(default = 0.1)]
    pub alpha: f64,
    /// Weight of the classification term in the joint loss.
    #[config(default = 0.1)]
    pub pyx_weight: f64,
    /// Train class-conditionally (per-class buffers plus the p(y|x) term).
    #[config(default = false)]
    pub ccond_sample: bool,
    #[config(default = 20)]
    pub num_epochs: usize,
    /// Maximum gradient norm for clipping.
    #[config(default = 0.1)]
    pub max_grad_norm: f64,
    /// Steps between metric logging.
    #[config(default = 50)]
    pub log_interval: usize,
    /// Directory for saving checkpoints.
    #[config(default = "String::from(\"checkpoints/jem\")")]
    pub checkpoint_dir: String,
}

/// Save model weights and metadata into `dir`.
pub fn save_checkpoint<B: Backend, M: Module<B>>(
    model: &M,
    dir: &Path,
    meta: &CheckpointMeta,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(dir.join("model"), &recorder)
        .map_err(|e| anyhow::anyhow!("Failed to save model to {}: {e}", dir.display()))?;

    let meta_path = dir.join("meta.json");
    serde_json::to_writer(std::fs::File::create(&meta_path)?, meta)?;
    tracing::info!(dir = %dir.display(), epoch = meta.epoch, step = meta.step, "Checkpoint saved");
    Ok(())
}

/// Pick the weights directory inside a training output directory.
///
/// `dir` itself if it holds `model.mpk`, else `dir/best` if present, else `dir/last`.
pub fn resolve_checkpoint_dir(dir: &Path) -> PathBuf {
    if dir.join("model.mpk").exists() {
        return dir.to_path_buf();
    }
    let best = dir.join(BEST_CHECKPOINT);
    if best.join("model.mpk").exists() {
        return best;
    }
    dir.join(LAST_CHECKPOINT)
}

/// Load a ShallowCnn from a checkpoint directory written by [`save_checkpoint`]
/// or from a training output directory (see [`resolve_checkpoint_dir`]).
///
/// Creates a fresh model from config, then loads saved weights on top.
pub fn load_checkpoint<B: Backend>(
    dir: &Path,
    config: &ShallowCnnConfig,
    device: &B::Device,
) -> anyhow::Result<ShallowCnn<B>> {
    let dir = resolve_checkpoint_dir(dir);
    let model = config
        .init::<B>(device)
        .load_file(
            dir.join("model"),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", dir.display()))?;
    Ok(model)
}

/// Read `meta.json` from a checkpoint directory, resolved like [`load_checkpoint`].
pub fn load_checkpoint_meta(dir: &Path) -> anyhow::Result<CheckpointMeta> {
    let meta_path = resolve_checkpoint_dir(dir).join("meta.json");
    let file = std::fs::File::open(&meta_path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?;
    serde_json::from_reader(file)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))
}

/// Average the joint loss over `batches` and score the classifier on them,
/// without updating the model.
///
/// Synthesis still runs, so the sampler buffers advance. Returns `None` for
/// an empty batch list.
pub fn evaluate<B: AutodiffBackend, M: EnergyModel<B>>(
    config: &JemTrainingConfig,
    model: &mut M,
    sampler: &mut SgldSampler<B>,
    batches: &[ImageBatch],
    device: &B::Device,
) -> anyhow::Result<Option<EvalReport>> {
    let shape = sampler.config().img_shape;
    let mut avg = RunningAvg::default();
    let mut confusion = ConfusionMatrix::new(sampler.config().num_classes);
    let mut calibration = CalibrationBins::new(CALIBRATION_BINS);

    for batch in batches.iter().filter(|b| !b.is_empty()) {
        let (images, labels) = batch.to_tensors::<B>(shape, device)?;
        let loss = joint_loss(model, sampler, images, labels.clone(), config)?;
        avg.update(&JemMetrics::compute(&loss, labels));

        let probs = softmax(loss.logits.inner(), 1);
        let confidences: Vec<f64> = probs
            .clone()
            .max_dim(1)
            .into_data()
            .convert::<f64>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("Failed to read confidences: {e:?}"))?;
        let predictions: Vec<usize> = probs
            .argmax(1)
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("Failed to read predictions: {e:?}"))?
            .into_iter()
            .map(|c| c as usize)
            .collect();
        let correct: Vec<bool> = predictions
            .iter()
            .zip(&batch.labels)
            .map(|(p, t)| p == t)
            .collect();
        confusion.update(&predictions, &batch.labels);
        calibration.update(&confidences, &correct);
    }

    Ok(avg.average().map(|metrics| EvalReport {
        metrics,
        confusion,
        calibration,
    }))
}

/// Run the JEM training loop.
///
/// Returns the model with the lowest validation loss when `val_batches` is
/// non-empty, otherwise the model after the last epoch.
///
/// # Arguments
/// - `config`: training hyperparameters
/// - `model`: initialized energy model (consumed and returned updated)
/// - `sampler`: SGLD sampler providing synthesized batches; its buffers persist across steps
/// - `train_batches`: data batches, iterated once per epoch
/// - `val_batches`: evaluated after each epoch when non-empty
/// - `device`: burn device for tensor operations
pub fn train<B, M>(
    config: &JemTrainingConfig,
    mut model: M,
    sampler: &mut SgldSampler<B>,
    train_batches: &[ImageBatch],
    val_batches: &[ImageBatch],
    device: &B::Device,
) -> anyhow::Result<M>
where
    B: AutodiffBackend,
    M: EnergyModel<B> + AutodiffModule<B>,
{
    anyhow::ensure!(!train_batches.is_empty(), "no training batches");
    let checkpoint_dir = Path::new(&config.checkpoint_dir);
    std::fs::create_dir_all(checkpoint_dir)?;

    let shape = sampler.config().img_shape;
    tracing::info!(
        lr = config.lr,
        alpha = config.alpha,
        ccond_sample = config.ccond_sample,
        num_epochs = config.num_epochs,
        batches = train_batches.len(),
        "Starting JEM training"
    );

    let mut optimizer = AdamConfig::new()
        .with_beta_1(0.0)
        .with_beta_2(0.999)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.max_grad_norm as f32)))
        .init();

    let mut running_avg = RunningAvg::default();
    let mut best: Option<(f64, usize, M)> = None;
    let train_start = Instant::now();
    let mut step = 0_usize;

    for epoch in 0..config.num_epochs {
        for batch in train_batches.iter().filter(|b| !b.is_empty()) {
            let (images, labels) = batch.to_tensors::<B>(shape, device)?;
            let loss = joint_loss(&mut model, sampler, images, labels.clone(), config)?;
            let metrics = JemMetrics::compute(&loss, labels);
            running_avg.update(&metrics);

            let grads = GradientsParams::from_grads(loss.loss.backward(), &model);
            model = optimizer.step(config.lr, model, grads);

            if config.log_interval > 0 && step % config.log_interval == 0 {
                if let Some(avg) = running_avg.average() {
                    let warnings = avg.health_check();
                    if !warnings.is_empty() {
                        tracing::warn!(step, "Health check warnings: {:?}", warnings);
                    }
                    tracing::info!(epoch, step, "avg({}) {}", running_avg.count(), avg);
                }
                running_avg.reset();
            }
            step += 1;
        }

        let val_loss = if val_batches.is_empty() {
            None
        } else {
            match evaluate(config, &mut model, sampler, val_batches, device)? {
                Some(report) => {
                    tracing::info!(epoch, "val {}", report);
                    Some(report.metrics.loss)
                }
                None => {
                    tracing::debug!(epoch, "No validation data");
                    None
                }
            }
        };

        let meta = CheckpointMeta {
            epoch,
            step,
            val_loss,
        };
        save_checkpoint::<B, _>(&model, &checkpoint_dir.join(LAST_CHECKPOINT), &meta)?;

        if let Some(loss) = val_loss.filter(|l| l.is_finite()) {
            if best.as_ref().map_or(true, |(best_loss, _, _)| loss < *best_loss) {
                save_checkpoint::<B, _>(&model, &checkpoint_dir.join(BEST_CHECKPOINT), &meta)?;
                tracing::info!(epoch, val_loss = loss, "New best checkpoint");
                best = Some((loss, epoch, model.clone()));
            }
        }
    }

    tracing::info!(
        steps = step,
        best_epoch = best.as_ref().map(|(_, epoch, _)| *epoch),
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training complete"
    );
    Ok(match best {
        Some((_, _, best_model)) => best_model,
        None => model,
    })
}
