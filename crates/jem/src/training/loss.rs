//! JEM losses: contrastive divergence for p(x) and cross-entropy for p(y|x).
//!
//! Convention: higher score = more likely under the model. The p(x) term
//! pushes data scores up and synthesized scores down, with an L2 penalty on
//! both to keep their magnitudes bounded.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;

use crate::model::energy::EnergyModel;
use crate::sampler::{SamplerError, SgldSampler};
use crate::training::trainer::JemTrainingConfig;

/// Standard deviation of the Gaussian jitter added to data images.
pub const REAL_JITTER_STD: f64 = 0.005;

/// Add small Gaussian noise to data images and clamp back to `[-1, 1]`.
///
/// The noise comes from the sampler rng, so a seeded sampler makes the whole
/// loss reproducible.
pub fn jitter<B: AutodiffBackend>(
    images: Tensor<B, 4>,
    sampler: &mut SgldSampler<B>,
) -> Result<Tensor<B, 4>, SamplerError> {
    let noise = sampler.gaussian_noise(images.dims(), REAL_JITTER_STD)?;
    let noise = Tensor::<B, 4>::from_inner(noise).to_device(&images.device());
    Ok((images + noise).clamp(-1.0, 1.0))
}

/// Truncate two score vectors to their common length.
///
/// Happens when the last data batch is smaller than the sampler batch.
pub fn align_batch<B: Backend>(
    real: Tensor<B, 1>,
    fake: Tensor<B, 1>,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let [n_real] = real.dims();
    let [n_fake] = fake.dims();
    if n_real == n_fake {
        return (real, fake);
    }
    let kept = n_real.min(n_fake);
    tracing::warn!(n_real, n_fake, kept, "Data and synthesized batch sizes differ, truncating");
    (real.slice([0..kept]), fake.slice([0..kept]))
}

/// `alpha * mean(real² + fake²) + mean(fake - real)` over equal-length scores.
pub fn contrastive_divergence<B: Backend>(
    real: Tensor<B, 1>,
    fake: Tensor<B, 1>,
    alpha: f64,
) -> Tensor<B, 1> {
    let reg = (real.clone().powf_scalar(2.0) + fake.clone().powf_scalar(2.0))
        .mean()
        .mul_scalar(alpha);
    let cdiv = (fake - real).mean();
    reg + cdiv
}

/// Cross-entropy of class logits against labels.
pub fn pyx_loss<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, labels)
}

/// Output of [`px_loss`]; scores are kept for metrics.
pub struct PxLoss<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub real_score: Tensor<B, 1>,
    pub fake_score: Tensor<B, 1>,
}

/// Contrastive-divergence loss of data images against a fresh SGLD batch.
///
/// With `conditional`, fake labels are drawn uniformly from the sampler rng,
/// the chain runs per-label and both sides are scored with their labels.
/// Otherwise the unconditional buffer and scores are used.
pub fn px_loss<B: AutodiffBackend, M: EnergyModel<B>>(
    model: &mut M,
    sampler: &mut SgldSampler<B>,
    real: Tensor<B, 4>,
    labels: Tensor<B, 1, Int>,
    alpha: f64,
    conditional: bool,
) -> Result<PxLoss<B>, SamplerError> {
    // Sample before scoring data: entering sampling mode re-creates the
    // parameter tensors, which would detach any graph built earlier.
    let (real_score, fake_score) = if conditional {
        let fake_labels = sampler.random_labels(sampler.config().batch_size);
        let fake = sampler.synthesize_default(model, Some(&fake_labels))?;
        let ids: Vec<i64> = fake_labels.iter().map(|&c| c as i64).collect();
        let fake_label_tensor =
            Tensor::<B, 1, Int>::from_data(TensorData::new(ids, [fake_labels.len()]), &real.device());
        (
            model.score(real, Some(labels)),
            model.score(fake, Some(fake_label_tensor)),
        )
    } else {
        let fake = sampler.synthesize_default(model, None)?;
        (model.score(real, None), model.score(fake, None))
    };

    let (real_score, fake_score) = align_batch(real_score, fake_score);
    let loss = contrastive_divergence(real_score.clone(), fake_score.clone(), alpha);
    Ok(PxLoss {
        loss,
        real_score,
        fake_score,
    })
}

/// Output of [`joint_loss`].
pub struct JointLoss<B: Backend> {
    /// The optimized objective.
    pub loss: Tensor<B, 1>,
    pub px: PxLoss<B>,
    /// Only computed in class-conditional mode.
    pub pyx: Option<Tensor<B, 1>>,
    /// Logits of the jittered data batch.
    pub logits: Tensor<B, 2>,
}

/// `px + pyx_weight * pyx` when `config.ccond_sample`, else `px` alone.
pub fn joint_loss<B: AutodiffBackend, M: EnergyModel<B>>(
    model: &mut M,
    sampler: &mut SgldSampler<B>,
    images: Tensor<B, 4>,
    labels: Tensor<B, 1, Int>,
    config: &JemTrainingConfig,
) -> Result<JointLoss<B>, SamplerError> {
    let real = jitter(images, sampler)?;
    let px = px_loss(
        model,
        sampler,
        real.clone(),
        labels.clone(),
        config.alpha,
        config.ccond_sample,
    )?;
    let logits = model.logits(real);

    let (loss, pyx) = if config.ccond_sample {
        let pyx = pyx_loss(logits.clone(), labels);
        (px.loss.clone() + pyx.clone().mul_scalar(config.pyx_weight), Some(pyx))
    } else {
        (px.loss.clone(), None)
    };

    Ok(JointLoss {
        loss,
        px,
        pyx,
        logits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::shallow_cnn::ShallowCnnConfig;
    use crate::sampler::SamplerConfig;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn scores(values: &[f32]) -> Tensor<TestBackend, 1> {
        Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), &Default::default())
    }

    fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
        t.into_scalar().elem()
    }

    #[test]
    fn test_cdiv_sign() {
        // Data scored above samples gives a negative divergence term.
        let good = scalar(contrastive_divergence(scores(&[2.0, 2.0]), scores(&[-2.0, -2.0]), 0.0));
        assert!((good + 4.0).abs() < 1e-6, "got {good}");

        let bad = scalar(contrastive_divergence(scores(&[-2.0, -2.0]), scores(&[2.0, 2.0]), 0.0));
        assert!((bad - 4.0).abs() < 1e-6, "got {bad}");
    }

    #[test]
    fn test_regularization_term() {
        // reg = 0.1 * mean([1 + 0, 1 + 0]) = 0.1, cdiv = mean([-1, -1]) = -1
        let loss = scalar(contrastive_divergence(scores(&[1.0, 1.0]), scores(&[0.0, 0.0]), 0.1));
        assert!((loss + 0.9).abs() < 1e-6, "got {loss}");

        // Equal scores leave only the penalty.
        let loss = scalar(contrastive_divergence(scores(&[3.0]), scores(&[3.0]), 0.5));
        assert!((loss - 9.0).abs() < 1e-5, "got {loss}");
    }

    #[test]
    fn test_align_batch_truncates() {
        let (real, fake) = align_batch(scores(&[1.0, 2.0, 3.0]), scores(&[4.0, 5.0]));
        assert_eq!(real.dims(), [2]);
        assert_eq!(fake.dims(), [2]);
        let real: Vec<f32> = real.into_data().to_vec().unwrap();
        assert_eq!(real, vec![1.0, 2.0]);

        let (real, fake) = align_batch(scores(&[1.0]), scores(&[4.0]));
        assert_eq!((real.dims(), fake.dims()), ([1], [1]));
    }

    #[test]
    fn test_pyx_loss_confident_vs_uniform() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0_i64, 1]), &device);

        let confident = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[10.0_f32, -10.0, -10.0], [-10.0, 10.0, -10.0]]),
            &device,
        );
        let low = scalar(pyx_loss(confident, labels.clone()));
        assert!(low < 0.01, "confident logits should give near-zero loss, got {low}");

        let uniform = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        let mid = scalar(pyx_loss(uniform, labels));
        assert!((mid - 3.0_f32.ln()).abs() < 1e-4, "expected ln(3), got {mid}");
    }


    fn setup(batch: usize) -> (
        crate::model::shallow_cnn::ShallowCnn<TestAutodiffBackend>,
        SgldSampler<TestAutodiffBackend>,
    ) {
        let device = Default::default();
        let model = ShallowCnnConfig::new()
            .with_hidden_features(2)
            .with_num_classes(3)
            .init::<TestAutodiffBackend>(&device);
        let sampler = SgldSampler::new(
            SamplerConfig::new([1, 8, 8], batch, 3)
                .with_cbuffer_size(4)
                .with_max_len(8)
                .with_num_steps(2)
                .with_seed(Some(3)),
            device,
        )
        .unwrap();
        (model, sampler)
    }

    fn data(n: usize) -> (Tensor<TestAutodiffBackend, 4>, Tensor<TestAutodiffBackend, 1, Int>) {
        let device = Default::default();
        let images = Tensor::random([n, 1, 8, 8], Distribution::Uniform(-1.0, 1.0), &device);
        let ids: Vec<i64> = (0..n as i64).map(|i| i % 3).collect();
        let labels = Tensor::from_data(TensorData::new(ids, [n]), &device);
        (images, labels)
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let (_, mut sampler) = setup(2);
        let images = Tensor::<TestAutodiffBackend, 4>::ones([2, 1, 4, 4], &Default::default());
        let out: Vec<f32> = jitter(images, &mut sampler).unwrap().into_data().to_vec().unwrap();
        assert!(out.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!(out.iter().all(|v| (v - 1.0).abs() < 0.05));
        assert!(out.iter().any(|v| *v < 1.0), "noise should move some pixels");
    }

    #[test]
    fn test_seeded_joint_loss_reproducible() {
        let (model, _) = setup(4);
        let (images, labels) = data(4);
        let config = JemTrainingConfig::new().with_ccond_sample(true);

        let run = || {
            let (_, mut sampler) = setup(4);
            let mut model = model.clone();
            let out = joint_loss(&mut model, &mut sampler, images.clone(), labels.clone(), &config)
                .unwrap();
            let real: Vec<f32> = out.px.real_score.into_data().to_vec().unwrap();
            let fake: Vec<f32> = out.px.fake_score.into_data().to_vec().unwrap();
            let loss: f32 = out.loss.into_scalar().elem();
            (real, fake, loss)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_joint_loss_conditional_has_pyx_and_param_grads() {
        let (mut model, mut sampler) = setup(4);
        let (images, labels) = data(4);
        let config = JemTrainingConfig::new().with_ccond_sample(true);

        let out = joint_loss(&mut model, &mut sampler, images, labels, &config).unwrap();
        assert!(out.pyx.is_some());
        assert_eq!(out.logits.dims(), [4, 3]);
        let value: f32 = out.loss.clone().into_scalar().elem();
        assert!(value.is_finite());

        let grads = out.loss.backward();
        let params = burn::optim::GradientsParams::from_grads(grads, &model);
        assert!(!params.is_empty(), "loss must reach model parameters");
    }

    #[test]
    fn test_px_loss_unconditional_aligns_short_batch() {
        // Three data images against a sampler batch of four.
        let (mut model, mut sampler) = setup(4);
        let (images, labels) = data(3);

        let out = px_loss(&mut model, &mut sampler, images, labels, 0.1, false).unwrap();
        assert_eq!(out.real_score.dims(), [3]);
        assert_eq!(out.fake_score.dims(), [3]);
        let value: f32 = out.loss.into_scalar().elem();
        assert!(value.is_finite());
    }
}
