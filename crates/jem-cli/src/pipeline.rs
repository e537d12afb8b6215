//! Train, sample and score pipelines behind the `jem` subcommands.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::config::Config;
use burn::tensor::backend::Backend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use jem::model::bridge::tensor_to_images;
use jem::training::data::{ImageDataset, LabeledImage};
use jem::training::trainer::{load_checkpoint, load_checkpoint_meta, train, BEST_CHECKPOINT};
use jem::{auprc, auroc, JemScorer, SgldSampler, ShallowCnn, ShallowCnnConfig};

use crate::config::{
    build_model_config, build_sampler_config, build_training_config, load_or_default, JemToml,
    SamplerCliOverrides, DEFAULT_IMG_SHAPE,
};

type CpuBackend = NdArray<f32>;
type TrainBackend = Autodiff<CpuBackend>;

/// File name of the model config stored next to the weights.
const MODEL_CONFIG_FILE: &str = "model_config.json";

/// Images per forward pass when scoring.
const SCORE_CHUNK: usize = 256;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the JEM config TOML file.
    pub config: Option<PathBuf>,
    /// JSON array of labelled training images.
    pub data: PathBuf,
    /// Optional JSON array of labelled validation images.
    pub val_data: Option<PathBuf>,
    /// Overrides `[training].checkpoint_dir`.
    pub checkpoint_dir: Option<PathBuf>,
    /// Warm-start from this checkpoint directory.
    pub resume_from: Option<PathBuf>,
    pub num_epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub seed: Option<u64>,
}

/// Arguments for the `sample` subcommand.
#[derive(Debug)]
pub struct SampleArgs {
    pub config: Option<PathBuf>,
    /// Checkpoint directory; an untrained model is used if omitted.
    pub checkpoint: Option<PathBuf>,
    /// Output JSON file.
    pub output: PathBuf,
    /// Run one class-conditional chain per class instead of one unconditional chain.
    pub conditional: bool,
    /// Restrict conditional sampling to these classes.
    pub classes: Option<Vec<usize>>,
    pub steps: usize,
    pub step_size: f64,
    pub batch_size: usize,
    pub seed: Option<u64>,
}

/// Which score to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    /// Unnormalized log-density: logsumexp of the logits.
    Px,
    /// Classifier confidence: max softmax probability.
    Py,
}

/// Arguments for the `score` subcommand.
#[derive(Debug)]
pub struct ScoreArgs {
    pub config: Option<PathBuf>,
    pub checkpoint: PathBuf,
    /// JSON array of images (plain pixel arrays or labelled records).
    pub input: PathBuf,
    /// Out-of-distribution images; enables the AUROC report.
    pub ood: Option<PathBuf>,
    pub kind: ScoreKind,
    /// Write the report here instead of stdout.
    pub output: Option<PathBuf>,
}

/// One sampled chain as written by `jem sample`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Conditioning class, `None` for unconditional chains.
    pub label: Option<usize>,
    /// 1-based Langevin step of each entry in `frames`.
    pub frame_steps: Vec<usize>,
    /// Row 0 of the batch at each selected step.
    pub frames: Vec<Vec<f32>>,
    /// Every row of the batch after the last step.
    pub final_images: Vec<Vec<f32>>,
}

/// Top-level `jem sample` output.
#[derive(Debug, Serialize, Deserialize)]
pub struct SampleOutput {
    pub img_shape: [usize; 3],
    pub num_steps: usize,
    pub step_size: f64,
    pub samples: Vec<SampleRecord>,
}

/// `jem score` report.
#[derive(Debug, Serialize)]
pub struct ScoreReport {
    pub kind: ScoreKind,
    pub scores: Vec<f64>,
    pub predictions: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ood_scores: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auroc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auprc: Option<f64>,
}

/// Image files accepted by `jem score`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImageFile {
    Plain(Vec<Vec<f32>>),
    Labeled(Vec<LabeledImage>),
}

/// Read a JSON array of images, either plain pixel arrays or `{pixels, label}` records.
pub fn read_images(path: &Path) -> anyhow::Result<Vec<Vec<f32>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
    let parsed: ImageFile = serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("Failed to parse images in {}: {e}", path.display()))?;
    Ok(match parsed {
        ImageFile::Plain(images) => images,
        ImageFile::Labeled(records) => records.into_iter().map(|r| r.pixels).collect(),
    })
}

/// Trajectory steps to keep: the first, then every `num_steps / 8`-th,
/// always ending with the last.
pub fn frame_indices(num_steps: usize) -> Vec<usize> {
    if num_steps == 0 {
        return vec![];
    }
    let stride = (num_steps / 8).max(1);
    let mut indices: Vec<usize> = std::iter::once(0)
        .chain((stride - 1..num_steps).step_by(stride))
        .collect();
    indices.dedup();
    if indices.last() != Some(&(num_steps - 1)) {
        indices.push(num_steps - 1);
    }
    indices
}

/// Model config saved with a checkpoint wins over the TOML file.
///
/// Looked up in the checkpoint directory and its parent, so both the training
/// output directory and its `best/` or `last/` subdirectory work.
fn resolve_model_config(toml: &JemToml, checkpoint: Option<&Path>) -> anyhow::Result<ShallowCnnConfig> {
    let candidates = checkpoint
        .into_iter()
        .flat_map(|dir| std::iter::once(dir).chain(dir.parent()));
    for dir in candidates {
        let path = dir.join(MODEL_CONFIG_FILE);
        if path.exists() {
            let config = ShallowCnnConfig::load(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", path.display()))?;
            tracing::info!(path = %path.display(), "Using model config from checkpoint");
            return Ok(config);
        }
    }
    Ok(build_model_config(&toml.model))
}

fn check_channels(img_shape: [usize; 3], model: &ShallowCnnConfig) -> anyhow::Result<()> {
    anyhow::ensure!(
        img_shape[0] == model.in_channels,
        "img_shape {img_shape:?} has {} channels but the model expects {}",
        img_shape[0],
        model.in_channels
    );
    Ok(())
}

fn progress_bar(len: u64) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

/// Train a ShallowCnn JEM on a JSON dataset and write checkpoints.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Resolve configs
    let toml = load_or_default(args.config.as_deref())?;
    let model_config = resolve_model_config(&toml, args.resume_from.as_deref())?;
    let sampler_config = build_sampler_config(
        &toml.sampler,
        model_config.num_classes,
        &SamplerCliOverrides {
            batch_size: args.batch_size,
            seed: args.seed,
            ..Default::default()
        },
    )?;
    let training_config =
        build_training_config(&toml.training, args.num_epochs, args.checkpoint_dir.as_deref());
    let img_shape = sampler_config.img_shape;
    check_channels(img_shape, &model_config)?;

    // 2. Load data
    let num_classes = model_config.num_classes;
    let batch_size = sampler_config.batch_size;
    let mut rng = match sampler_config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let train_data = ImageDataset::load_json(&args.data, img_shape, num_classes)?;
    anyhow::ensure!(!train_data.is_empty(), "training data {} is empty", args.data.display());
    let train_batches = train_data.batches(batch_size, Some(&mut rng));
    let val_batches = match &args.val_data {
        Some(path) => ImageDataset::load_json(path, img_shape, num_classes)?.batches(batch_size, None::<&mut StdRng>),
        None => Vec::new(),
    };

    // 3. Build model and sampler
    let device = Default::default();
    if let Some(seed) = sampler_config.seed {
        TrainBackend::seed(seed);
    }
    let model = match &args.resume_from {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Resuming from checkpoint");
            load_checkpoint::<TrainBackend>(dir, &model_config, &device)?
        }
        None => model_config.init::<TrainBackend>(&device),
    };
    let mut sampler = SgldSampler::<TrainBackend>::new(sampler_config, device)?;

    // 4. Train
    let checkpoint_dir = PathBuf::from(&training_config.checkpoint_dir);
    std::fs::create_dir_all(&checkpoint_dir)?;
    model_config
        .save(checkpoint_dir.join(MODEL_CONFIG_FILE))
        .map_err(|e| anyhow::anyhow!("Failed to save model config: {e}"))?;

    train(
        &training_config,
        model,
        &mut sampler,
        &train_batches,
        &val_batches,
        &device,
    )?;
    let best = load_checkpoint_meta(&checkpoint_dir.join(BEST_CHECKPOINT)).ok();

    println!("\n--- Training Summary ---");
    println!("Train images: {}", train_data.len());
    println!("Batches/epoch: {}", train_batches.len());
    println!("Epochs: {}", training_config.num_epochs);
    println!("Checkpoint: {}", checkpoint_dir.display());
    match best {
        Some(meta) => println!(
            "Best: epoch {} (val loss {:.4})",
            meta.epoch,
            meta.val_loss.unwrap_or(f64::NAN)
        ),
        None => println!("Best: n/a (no validation data, using last epoch)"),
    }
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Run SGLD chains from a (trained) model and write selected frames as JSON.
pub fn run_sample(args: SampleArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.steps > 0, "--steps must be >= 1");

    let toml = load_or_default(args.config.as_deref())?;
    let model_config = resolve_model_config(&toml, args.checkpoint.as_deref())?;
    let sampler_config = build_sampler_config(
        &toml.sampler,
        model_config.num_classes,
        &SamplerCliOverrides {
            batch_size: Some(args.batch_size),
            num_steps: Some(args.steps),
            step_size: Some(args.step_size),
            seed: args.seed,
        },
    )?;
    let img_shape = sampler_config.img_shape;
    check_channels(img_shape, &model_config)?;

    let device = Default::default();
    let mut model = match &args.checkpoint {
        Some(dir) => load_checkpoint::<TrainBackend>(dir, &model_config, &device)?,
        None => {
            tracing::warn!("No checkpoint given, sampling from an untrained model");
            model_config.init::<TrainBackend>(&device)
        }
    };

    let labels: Vec<Option<usize>> = if args.conditional {
        let classes = args
            .classes
            .clone()
            .unwrap_or_else(|| (0..model_config.num_classes).collect());
        if let Some(&bad) = classes.iter().find(|&&c| c >= model_config.num_classes) {
            anyhow::bail!("class {bad} out of range (num_classes = {})", model_config.num_classes);
        }
        classes.into_iter().map(Some).collect()
    } else {
        vec![None]
    };

    let mut sampler = SgldSampler::<TrainBackend>::new(sampler_config, device)?;
    let indices = frame_indices(args.steps);
    let pb = progress_bar(labels.len() as u64)?;
    let mut samples = Vec::with_capacity(labels.len());

    for label in labels {
        pb.set_message(match label {
            Some(c) => format!("class {c}"),
            None => "unconditional".to_string(),
        });
        let batch_labels = label.map(|c| vec![c; args.batch_size]);
        let trajectory = sampler.synthesize_trajectory(
            &mut model,
            batch_labels.as_deref(),
            args.steps,
            args.step_size,
        )?;

        let [_, _, c, h, w] = trajectory.dims();
        let mut frames = Vec::with_capacity(indices.len());
        for &i in &indices {
            let row0 = trajectory.clone().slice([i..i + 1, 0..1]).reshape([1, c, h, w]);
            frames.extend(tensor_to_images(row0)?);
        }
        let last = trajectory
            .slice([args.steps - 1..args.steps])
            .squeeze::<4>(0);
        let final_images = tensor_to_images(last)?;

        samples.push(SampleRecord {
            label,
            frame_steps: indices.iter().map(|i| i + 1).collect(),
            frames,
            final_images,
        });
        pb.inc(1);
    }
    pb.finish_with_message("done");

    let output = SampleOutput {
        img_shape,
        num_steps: args.steps,
        step_size: args.step_size,
        samples,
    };
    if let Some(parent) = args.output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    serde_json::to_writer(std::fs::File::create(&args.output)?, &output)?;
    tracing::info!(
        output = %args.output.display(),
        chains = output.samples.len(),
        frames_per_chain = indices.len(),
        "Wrote samples"
    );
    Ok(())
}

fn score_all(
    scorer: &JemScorer<CpuBackend, ShallowCnn<CpuBackend>>,
    images: &[Vec<f32>],
    kind: ScoreKind,
) -> anyhow::Result<(Vec<f64>, Vec<usize>)> {
    let mut scores = Vec::with_capacity(images.len());
    let mut predictions = Vec::with_capacity(images.len());
    for chunk in images.chunks(SCORE_CHUNK) {
        scores.extend(match kind {
            ScoreKind::Px => scorer.score_px(chunk)?,
            ScoreKind::Py => scorer.score_py(chunk)?,
        });
        predictions.extend(scorer.predict(chunk)?);
    }
    Ok((scores, predictions))
}

/// Score images with a checkpoint and optionally report AUROC against OOD images.
pub fn run_score(args: ScoreArgs) -> anyhow::Result<()> {
    let toml = load_or_default(args.config.as_deref())?;
    let model_config = resolve_model_config(&toml, Some(&args.checkpoint))?;
    let img_shape = toml.sampler.img_shape.unwrap_or(DEFAULT_IMG_SHAPE);

    let scorer = JemScorer::<CpuBackend, ShallowCnn<CpuBackend>>::load(
        &args.checkpoint,
        &model_config,
        img_shape,
        Default::default(),
    )?;

    let images = read_images(&args.input)?;
    let (scores, predictions) = score_all(&scorer, &images, args.kind)?;

    let (ood_scores, auc, ap) = match &args.ood {
        Some(path) => {
            let ood_images = read_images(path)?;
            let (ood_scores, _) = score_all(&scorer, &ood_images, args.kind)?;
            let auc = auroc(&scores, &ood_scores);
            let ap = auprc(&scores, &ood_scores);
            match (auc, ap) {
                (Some(auc), Some(ap)) => tracing::info!(
                    auroc = auc,
                    auprc = ap,
                    in_count = scores.len(),
                    ood_count = ood_scores.len(),
                    "OOD separation"
                ),
                _ => tracing::warn!("AUROC/AUPRC undefined (empty or NaN scores)"),
            }
            (Some(ood_scores), auc, ap)
        }
        None => (None, None, None),
    };

    let report = ScoreReport {
        kind: args.kind,
        scores,
        predictions,
        ood_scores,
        auroc: auc,
        auprc: ap,
    };
    match &args.output {
        Some(path) => {
            serde_json::to_writer_pretty(std::fs::File::create(path)?, &report)?;
            tracing::info!(output = %path.display(), "Wrote scores");
        }
        None => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_frame_indices_reference_run() {
        // 256 steps: first frame plus every 32nd step.
        let idx = frame_indices(256);
        assert_eq!(idx, vec![0, 31, 63, 95, 127, 159, 191, 223, 255]);
    }

    #[test]
    fn test_frame_indices_short_runs() {
        assert_eq!(frame_indices(0), Vec::<usize>::new());
        assert_eq!(frame_indices(1), vec![0]);
        assert_eq!(frame_indices(3), vec![0, 1, 2]);
        // 60 steps: stride 7, last step appended.
        let idx = frame_indices(60);
        assert_eq!(idx.first(), Some(&0));
        assert_eq!(idx.last(), Some(&59));
        assert!(idx.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_read_images_both_formats() {
        let mut plain = tempfile::NamedTempFile::new().unwrap();
        plain.write_all(b"[[0.0, 0.5], [1.0, -1.0]]").unwrap();
        assert_eq!(read_images(plain.path()).unwrap(), vec![vec![0.0, 0.5], vec![1.0, -1.0]]);

        let mut labeled = tempfile::NamedTempFile::new().unwrap();
        labeled
            .write_all(br#"[{"pixels": [0.25, 0.75], "label": 3}]"#)
            .unwrap();
        assert_eq!(read_images(labeled.path()).unwrap(), vec![vec![0.25, 0.75]]);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        bad.write_all(b"{\"not\": \"images\"}").unwrap();
        assert!(read_images(bad.path()).is_err());
    }

    #[test]
    fn test_model_config_from_checkpoint_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let saved = ShallowCnnConfig::new().with_num_classes(5).with_hidden_features(3);
        saved.save(tmp.path().join(MODEL_CONFIG_FILE)).unwrap();

        let toml: JemToml = toml::from_str("[model]\nnum_classes = 9\n").unwrap();
        let resolved = resolve_model_config(&toml, Some(tmp.path())).unwrap();
        assert_eq!((resolved.num_classes, resolved.hidden_features), (5, 3));

        let nested = tmp.path().join("best");
        std::fs::create_dir_all(&nested).unwrap();
        let resolved = resolve_model_config(&toml, Some(&nested)).unwrap();
        assert_eq!(resolved.num_classes, 5);

        let fallback = resolve_model_config(&toml, None).unwrap();
        assert_eq!(fallback.num_classes, 9);
    }
}
