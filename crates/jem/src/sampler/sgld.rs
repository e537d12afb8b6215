//! Stochastic Gradient Langevin Dynamics with a persistent replay buffer.
//!
//! Each call starts a short chain from a mix of fresh uniform noise
//! (about `fresh_ratio` of the batch) and images drawn from the replay
//! buffers, runs `num_steps` noisy gradient-ascent steps on the model score
//! with respect to the pixels, and writes the final images back to the
//! buffers.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Distribution as RandDistribution;
use rand_distr::{Binomial, Normal};

use crate::model::energy::EnergyModel;
use crate::sampler::buffer::{ClassBuffers, ReplayBuffer};
use crate::sampler::error::SamplerError;
use crate::sampler::mode::SamplingMode;

/// A single graph-free image `(C, H, W)` as stored in the replay buffers.
pub type BufferImage<B> = Tensor<<B as AutodiffBackend>::InnerBackend, 3>;

type InnerBatch<B> = Tensor<<B as AutodiffBackend>::InnerBackend, 4>;

/// Configuration for the SGLD sampler and its replay buffers.
#[derive(Config, Debug)]
pub struct SamplerConfig {
    /// Image shape `[channels, height, width]`.
    pub img_shape: [usize; 3],
    /// Number of images synthesized per call.
    pub batch_size: usize,
    /// Number of classes, one replay buffer each.
    pub num_classes: usize,
    /// Images kept per class buffer; also the initial size of the
    /// unconditional buffer.
    #[config(default = 128)]
    pub cbuffer_size: usize,
    /// Capacity of the unconditional buffer.
    #[config(default = 1024)]
    pub max_len: usize,
    /// Default number of Langevin steps.
    #[config(default = 60)]
    pub num_steps: usize,
    /// Default Langevin step size.
    #[config(default = 10.0)]
    pub step_size: f64,
    /// Standard deviation of the Gaussian noise added each step.
    #[config(default = 0.005)]
    pub noise_std: f64,
    /// Elementwise bound applied to the input gradient.
    #[config(default = 0.03)]
    pub grad_clip: f64,
    /// Binomial probability that a batch row starts from fresh noise.
    #[config(default = 0.2)]
    pub fresh_ratio: f64,
    /// Binomial redraws allowed before giving up on a zero fresh count.
    #[config(default = 100)]
    pub max_fresh_attempts: usize,
    /// Seed for every random draw the sampler makes. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl SamplerConfig {
    /// Check the construction-time invariants.
    pub fn validate(&self) -> Result<(), SamplerError> {
        let fail = |msg: String| Err(SamplerError::InvalidConfig(msg));
        if self.img_shape.contains(&0) {
            return fail(format!("img_shape {:?} has a zero dimension", self.img_shape));
        }
        if self.batch_size == 0 {
            return fail("batch_size must be >= 1".into());
        }
        if self.num_classes == 0 {
            return fail("num_classes must be >= 1".into());
        }
        if self.cbuffer_size == 0 {
            return fail("cbuffer_size must be >= 1".into());
        }
        if self.max_len < self.cbuffer_size {
            return fail(format!(
                "max_len ({}) must be >= cbuffer_size ({})",
                self.max_len, self.cbuffer_size
            ));
        }
        if !(self.fresh_ratio > 0.0 && self.fresh_ratio <= 1.0) {
            return fail(format!("fresh_ratio {} not in (0, 1]", self.fresh_ratio));
        }
        if self.max_fresh_attempts == 0 {
            return fail("max_fresh_attempts must be >= 1".into());
        }
        if !(self.noise_std >= 0.0 && self.noise_std.is_finite()) {
            return fail(format!("noise_std {} must be finite and >= 0", self.noise_std));
        }
        if !(self.grad_clip > 0.0) {
            return fail(format!("grad_clip {} must be > 0", self.grad_clip));
        }
        check_chain_args(self.num_steps, self.step_size)
    }
}

fn check_chain_args(num_steps: usize, step_size: f64) -> Result<(), SamplerError> {
    if num_steps == 0 {
        return Err(SamplerError::InvalidConfig("num_steps must be >= 1".into()));
    }
    if !(step_size > 0.0 && step_size.is_finite()) {
        return Err(SamplerError::InvalidConfig(format!(
            "step_size {step_size} must be finite and > 0"
        )));
    }
    Ok(())
}

/// Return the first nonzero value produced by `draw` within `max_attempts`.
pub(crate) fn first_nonzero_draw(max_attempts: usize, mut draw: impl FnMut() -> u64) -> Option<usize> {
    (0..max_attempts).map(|_| draw()).find(|&n| n > 0).map(|n| n as usize)
}

fn uniform_values(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0_f32..1.0)).collect()
}

fn uniform_image<B: Backend>(rng: &mut StdRng, shape: [usize; 3], device: &B::Device) -> Tensor<B, 3> {
    let [c, h, w] = shape;
    Tensor::from_data(TensorData::new(uniform_values(rng, c * h * w), shape), device)
}

struct Chain<B: AutodiffBackend> {
    state: InnerBatch<B>,
    frames: Vec<InnerBatch<B>>,
}

/// SGLD sampler owning the replay buffers.
///
/// The energy model is not owned: it is borrowed mutably for the duration of
/// each call so its parameters can be frozen and restored.
pub struct SgldSampler<B: AutodiffBackend> {
    config: SamplerConfig,
    device: B::Device,
    rng: StdRng,
    fresh_count: Binomial,
    langevin_noise: Normal<f32>,
    unconditional: ReplayBuffer<BufferImage<B>>,
    conditional: ClassBuffers<BufferImage<B>>,
}

impl<B: AutodiffBackend> SgldSampler<B> {
    /// Validate `config` and pre-populate every buffer with `cbuffer_size`
    /// uniform noise images in `[-1, 1)`.
    pub fn new(config: SamplerConfig, device: B::Device) -> Result<Self, SamplerError> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let fresh_count = Binomial::new(config.batch_size as u64, config.fresh_ratio)
            .map_err(|e| SamplerError::InvalidConfig(format!("fresh_ratio: {e:?}")))?;
        let langevin_noise = Normal::new(0.0_f32, config.noise_std as f32)
            .map_err(|e| SamplerError::InvalidConfig(format!("noise_std: {e:?}")))?;

        let shape = config.img_shape;
        let unconditional_seed = (0..config.cbuffer_size)
            .map(|_| uniform_image::<B::InnerBackend>(&mut rng, shape, &device))
            .collect();
        let unconditional = ReplayBuffer::from_items(unconditional_seed, config.max_len);
        let conditional = ClassBuffers::new(config.num_classes, config.cbuffer_size, |_| {
            uniform_image::<B::InnerBackend>(&mut rng, shape, &device)
        });

        tracing::info!(
            img_shape = ?config.img_shape,
            batch_size = config.batch_size,
            num_classes = config.num_classes,
            cbuffer_size = config.cbuffer_size,
            max_len = config.max_len,
            seed = ?config.seed,
            "SGLD sampler initialized"
        );

        Ok(Self {
            config,
            device,
            rng,
            fresh_count,
            langevin_noise,
            unconditional,
            conditional,
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn unconditional_buffer(&self) -> &ReplayBuffer<BufferImage<B>> {
        &self.unconditional
    }

    pub fn class_buffer(&self, class: usize) -> Result<&ReplayBuffer<BufferImage<B>>, SamplerError> {
        self.conditional.get(class)
    }

    /// Draw `n` class ids uniformly from `[0, num_classes)` with the sampler rng.
    pub fn random_labels(&mut self, n: usize) -> Vec<usize> {
        let num_classes = self.config.num_classes;
        (0..n).map(|_| self.rng.gen_range(0..num_classes)).collect()
    }

    /// [`synthesize`](Self::synthesize) with the configured step count and size.
    pub fn synthesize_default<M: EnergyModel<B>>(
        &mut self,
        model: &mut M,
        labels: Option<&[usize]>,
    ) -> Result<Tensor<B, 4>, SamplerError> {
        let (num_steps, step_size) = (self.config.num_steps, self.config.step_size);
        self.synthesize(model, labels, num_steps, step_size)
    }

    /// Run one SGLD chain and store its final images in the replay buffers.
    ///
    /// `labels`, when given, must hold one class id per batch row; row `i`
    /// is initialized from and written back to the buffer of `labels[i]`.
    /// Without labels the unconditional buffer is used and the model is
    /// scored without conditioning.
    ///
    /// The returned batch lives on the autodiff backend as a fresh leaf, so
    /// scoring it with the model again tracks parameter gradients.
    pub fn synthesize<M: EnergyModel<B>>(
        &mut self,
        model: &mut M,
        labels: Option<&[usize]>,
        num_steps: usize,
        step_size: f64,
    ) -> Result<Tensor<B, 4>, SamplerError> {
        let chain = self.run_chain(model, labels, num_steps, step_size, false)?;
        self.store(chain.state.clone(), labels)?;
        Ok(Tensor::from_inner(chain.state))
    }

    /// Run one SGLD chain and return every intermediate state, shaped
    /// `(num_steps, batch, C, H, W)`. The replay buffers are left untouched.
    pub fn synthesize_trajectory<M: EnergyModel<B>>(
        &mut self,
        model: &mut M,
        labels: Option<&[usize]>,
        num_steps: usize,
        step_size: f64,
    ) -> Result<Tensor<B::InnerBackend, 5>, SamplerError> {
        let chain = self.run_chain(model, labels, num_steps, step_size, true)?;
        let frames = chain
            .frames
            .into_iter()
            .map(|frame| frame.unsqueeze_dim::<5>(0))
            .collect();
        Ok(Tensor::cat(frames, 0))
    }

    fn run_chain<M: EnergyModel<B>>(
        &mut self,
        model: &mut M,
        labels: Option<&[usize]>,
        num_steps: usize,
        step_size: f64,
        capture: bool,
    ) -> Result<Chain<B>, SamplerError> {
        check_chain_args(num_steps, step_size)?;
        self.check_labels(labels)?;
        self.check_device(&*model)?;

        let batch_size = self.config.batch_size;
        let label_tensor = labels.map(|labels| {
            let ids: Vec<i64> = labels.iter().map(|&c| c as i64).collect();
            Tensor::<B, 1, Int>::from_data(TensorData::new(ids, [labels.len()]), &self.device)
        });
        let mut state = self.initial_state(labels)?;

        let mode = SamplingMode::enter(model);
        let mut frames = Vec::with_capacity(if capture { num_steps } else { 0 });

        for step in 0..num_steps {
            let noise = self.langevin_noise_like(state.dims());
            let noisy = (state + noise).clamp(-1.0, 1.0);

            let x = Tensor::<B, 4>::from_inner(noisy.clone()).require_grad();
            let score = mode.score(x.clone(), label_tensor.clone());
            let [scored] = score.dims();
            if scored != batch_size {
                return Err(SamplerError::ShapeMismatch {
                    expected: vec![batch_size],
                    got: vec![scored],
                });
            }
            let grads = score.neg().sum().backward();
            let grad = x
                .grad(&grads)
                .unwrap_or_else(|| Tensor::zeros(noisy.dims(), &self.device));

            // Clamping may swallow NaN, so check the raw gradient as well.
            let grad_total: f64 = grad.clone().sum().into_scalar().elem();
            let grad = grad.clamp(-self.config.grad_clip, self.config.grad_clip);

            if tracing::enabled!(tracing::Level::TRACE) {
                let mean_abs: f64 = grad.clone().abs().mean().into_scalar().elem();
                tracing::trace!(step, mean_abs_grad = mean_abs, "Langevin step");
            }

            let updated = noisy - grad.mul_scalar(step_size);
            let total: f64 = updated.clone().sum().into_scalar().elem();
            if !(total.is_finite() && grad_total.is_finite()) {
                tracing::warn!(step, num_steps, step_size, "SGLD state became non-finite");
                return Err(SamplerError::Diverged { step });
            }
            state = updated.clamp(-1.0, 1.0);

            if capture {
                frames.push(state.clone());
            }
        }
        drop(mode);

        Ok(Chain { state, frames })
    }

    /// Mix fresh noise (rows `0..g`) with buffer draws (rows `g..batch`).
    fn initial_state(&mut self, labels: Option<&[usize]>) -> Result<InnerBatch<B>, SamplerError> {
        let batch_size = self.config.batch_size;
        let shape = self.config.img_shape;
        let [c, h, w] = shape;

        let fresh_count = &self.fresh_count;
        let rng = &mut self.rng;
        let fresh = first_nonzero_draw(self.config.max_fresh_attempts, || fresh_count.sample(rng))
            .ok_or(SamplerError::NoFreshSamples {
                attempts: self.config.max_fresh_attempts,
            })?;

        let reservoir = match labels {
            Some(labels) => labels[fresh..]
                .iter()
                .map(|&class| {
                    self.conditional
                        .get(class)?
                        .sample(1, &mut self.rng)?
                        .pop()
                        .ok_or(SamplerError::EmptyBuffer)
                })
                .collect::<Result<Vec<_>, SamplerError>>()?,
            None => self.unconditional.sample(batch_size - fresh, &mut self.rng)?,
        };

        tracing::debug!(
            fresh,
            reservoir = reservoir.len(),
            conditional = labels.is_some(),
            "Initialized SGLD chain"
        );

        let noise = uniform_values(&mut self.rng, fresh * c * h * w);
        let mut parts = vec![Tensor::<B::InnerBackend, 4>::from_data(
            TensorData::new(noise, [fresh, c, h, w]),
            &self.device,
        )];
        for image in reservoir {
            let dims = image.dims();
            if dims != shape {
                return Err(SamplerError::ShapeMismatch {
                    expected: shape.to_vec(),
                    got: dims.to_vec(),
                });
            }
            parts.push(image.unsqueeze_dim::<4>(0));
        }
        Ok(Tensor::cat(parts, 0))
    }

    /// Gaussian noise `N(0, std)` of shape `dims` drawn from the sampler rng,
    /// so seeded runs stay reproducible outside the chain as well.
    pub fn gaussian_noise(&mut self, dims: [usize; 4], std: f64) -> Result<InnerBatch<B>, SamplerError> {
        let normal = Normal::new(0.0_f32, std as f32)
            .map_err(|e| SamplerError::InvalidConfig(format!("noise std {std}: {e:?}")))?;
        let n = dims.iter().product();
        let values: Vec<f32> = (0..n).map(|_| normal.sample(&mut self.rng)).collect();
        Ok(Tensor::from_data(TensorData::new(values, dims), &self.device))
    }

    fn langevin_noise_like(&mut self, dims: [usize; 4]) -> InnerBatch<B> {
        let n = dims.iter().product();
        let values: Vec<f32> = (0..n)
            .map(|_| self.langevin_noise.sample(&mut self.rng))
            .collect();
        Tensor::from_data(TensorData::new(values, dims), &self.device)
    }

    /// Split the final batch into rows and prepend them to the buffers.
    ///
    /// Conditional rows are grouped by label in row order, so a homogeneous
    /// batch ends up at the front of its class buffer in the same order.
    fn store(&mut self, images: InnerBatch<B>, labels: Option<&[usize]>) -> Result<(), SamplerError> {
        let [batch, ..] = images.dims();
        let rows: Vec<BufferImage<B>> = images
            .chunk(batch, 0)
            .into_iter()
            .map(|row| row.squeeze::<3>(0))
            .collect();

        match labels {
            None => self.unconditional.insert(rows),
            Some(labels) => {
                let mut groups: Vec<(usize, Vec<BufferImage<B>>)> = Vec::new();
                for (&class, row) in labels.iter().zip(rows) {
                    match groups.iter_mut().find(|(c, _)| *c == class) {
                        Some((_, group)) => group.push(row),
                        None => groups.push((class, vec![row])),
                    }
                }
                for (class, group) in groups {
                    self.conditional.get_mut(class)?.insert(group);
                }
            }
        }
        Ok(())
    }

    fn check_labels(&self, labels: Option<&[usize]>) -> Result<(), SamplerError> {
        let Some(labels) = labels else {
            return Ok(());
        };
        if labels.len() != self.config.batch_size {
            return Err(SamplerError::LabelCount {
                expected: self.config.batch_size,
                got: labels.len(),
            });
        }
        let num_classes = self.config.num_classes;
        if let Some(&class) = labels.iter().find(|&&c| c >= num_classes) {
            return Err(SamplerError::ClassOutOfRange { class, num_classes });
        }
        Ok(())
    }

    fn check_device<M: Module<B>>(&self, model: &M) -> Result<(), SamplerError> {
        check_devices(&self.device, model.devices())
    }
}

/// Fail on the first device in `found` that differs from `expected`.
fn check_devices<D: PartialEq + std::fmt::Debug>(
    expected: &D,
    found: impl IntoIterator<Item = D>,
) -> Result<(), SamplerError> {
    match found.into_iter().find(|d| d != expected) {
        Some(device) => Err(SamplerError::DeviceMismatch {
            expected: format!("{expected:?}"),
            got: format!("{device:?}"),
        }),
        None => Ok(()),
    }
}
