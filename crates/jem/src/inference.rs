//! Batch scoring of images with a trained JEM.
//!
//! [`JemScorer`] wraps an energy model in evaluation mode and exposes the
//! three scores used for out-of-distribution analysis: the unnormalized
//! log-density `log p(x)`, the classifier confidence `max_y p(y|x)`, and the
//! predicted class. [`auroc`] turns two score lists into a single
//! separability number.

use std::cmp::Ordering;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::model::bridge::{images_to_tensor, tensor_to_vec};
use crate::model::energy::{gather_label_logits, EnergyModel};
use crate::model::shallow_cnn::{ShallowCnn, ShallowCnnConfig};
use crate::training::trainer::load_checkpoint;

/// Scores flattened images with an [`EnergyModel`].
///
/// Convention: **higher score = more in-distribution**.
pub struct JemScorer<B: Backend, M: EnergyModel<B>> {
    model: M,
    img_shape: [usize; 3],
    device: B::Device,
}

impl<B: Backend, M: EnergyModel<B>> JemScorer<B, M> {
    /// Wrap `model`, switching it to evaluation mode.
    pub fn new(model: M, img_shape: [usize; 3], device: B::Device) -> Self {
        Self {
            model: model.set_training(false),
            img_shape,
            device,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn img_shape(&self) -> [usize; 3] {
        self.img_shape
    }

    fn logits(&self, images: &[Vec<f32>]) -> anyhow::Result<Tensor<B, 2>> {
        let tensor = images_to_tensor::<B>(images, self.img_shape, &self.device)?;
        Ok(self.model.logits(tensor))
    }

    /// `log p(x)` up to a constant: logsumexp over the class logits.
    pub fn score_px(&self, images: &[Vec<f32>]) -> anyhow::Result<Vec<f64>> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let tensor = images_to_tensor::<B>(images, self.img_shape, &self.device)?;
        tensor_to_vec(self.model.score(tensor, None))
    }

    /// `p(x, y)` up to a constant: `exp` of each image's label logit.
    pub fn score_pxy(&self, images: &[Vec<f32>], labels: &[usize]) -> anyhow::Result<Vec<f64>> {
        anyhow::ensure!(
            images.len() == labels.len(),
            "{} images but {} labels",
            images.len(),
            labels.len()
        );
        if images.is_empty() {
            return Ok(vec![]);
        }
        let logits = self.logits(images)?;
        let [_, num_classes] = logits.dims();
        if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
            anyhow::bail!("label {bad} out of range (num_classes = {num_classes})");
        }
        let ids: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let labels = Tensor::<B, 1, Int>::from_data(
            burn::tensor::TensorData::new(ids, [labels.len()]),
            &self.device,
        );
        tensor_to_vec(gather_label_logits(logits, labels).exp())
    }

    /// Classifier confidence `max_y p(y|x)`.
    pub fn score_py(&self, images: &[Vec<f32>]) -> anyhow::Result<Vec<f64>> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let probs = softmax(self.logits(images)?, 1);
        tensor_to_vec(probs.max_dim(1).squeeze::<1>(1))
    }

    /// Argmax class per image.
    pub fn predict(&self, images: &[Vec<f32>]) -> anyhow::Result<Vec<usize>> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let classes = self.logits(images)?.argmax(1).squeeze::<1>(1);
        let data = classes
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("Failed to read predictions: {e:?}"))?;
        Ok(data.into_iter().map(|c| c as usize).collect())
    }
}

impl<B: Backend> JemScorer<B, ShallowCnn<B>> {
    /// Load a scorer from a checkpoint directory.
    ///
    /// Creates a fresh ShallowCnn from config and loads saved weights.
    pub fn load(
        dir: &Path,
        config: &ShallowCnnConfig,
        img_shape: [usize; 3],
        device: B::Device,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            img_shape[0] == config.in_channels,
            "image shape {img_shape:?} does not match model in_channels {}",
            config.in_channels
        );
        let model = load_checkpoint::<B>(dir, config, &device)?;
        tracing::info!(dir = %dir.display(), "Loaded JEM scorer");
        Ok(Self::new(model, img_shape, device))
    }
}

/// Area under the ROC curve separating in-distribution scores (positive
/// class) from out-of-distribution scores.
///
/// Equals the probability that a random in-distribution score is higher than
/// a random OOD score, ties counting one half. Returns `None` if either side
/// is empty or any score is NaN.
pub fn auroc(in_scores: &[f64], ood_scores: &[f64]) -> Option<f64> {
    if in_scores.is_empty() || ood_scores.is_empty() {
        return None;
    }
    if in_scores.iter().chain(ood_scores).any(|s| s.is_nan()) {
        return None;
    }

    let mut ood = ood_scores.to_vec();
    ood.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let wins: f64 = in_scores
        .iter()
        .map(|&s| {
            let below = ood.partition_point(|&o| o < s);
            let not_above = ood.partition_point(|&o| o <= s);
            below as f64 + 0.5 * (not_above - below) as f64
        })
        .sum();
    Some(wins / (in_scores.len() as f64 * ood.len() as f64))
}

/// Area under the precision-recall curve (average precision) with
/// in-distribution scores as the positive class.
///
/// Tied scores share one threshold. Returns `None` if either side is empty
/// or any score is NaN.
pub fn auprc(in_scores: &[f64], ood_scores: &[f64]) -> Option<f64> {
    if in_scores.is_empty() || ood_scores.is_empty() {
        return None;
    }
    if in_scores.iter().chain(ood_scores).any(|s| s.is_nan()) {
        return None;
    }

    let mut ranked: Vec<(f64, bool)> = in_scores
        .iter()
        .map(|&s| (s, true))
        .chain(ood_scores.iter().map(|&s| (s, false)))
        .collect();
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let positives = in_scores.len() as f64;
    let (mut tp, mut seen, mut prev_recall, mut area) = (0.0, 0.0, 0.0, 0.0);
    let mut i = 0;
    while i < ranked.len() {
        let threshold = ranked[i].0;
        while i < ranked.len() && ranked[i].0 == threshold {
            if ranked[i].1 {
                tp += 1.0;
            }
            seen += 1.0;
            i += 1;
        }
        let recall = tp / positives;
        area += (recall - prev_recall) * (tp / seen);
        prev_recall = recall;
    }
    Some(area)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn scorer() -> JemScorer<TestBackend, ShallowCnn<TestBackend>> {
        let device = Default::default();
        let model = ShallowCnnConfig::new()
            .with_hidden_features(2)
            .with_num_classes(3)
            .init::<TestBackend>(&device);
        JemScorer::new(model, [1, 8, 8], device)
    }

    fn images(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| (0..64).map(|p| ((i * 64 + p) as f32 * 0.37).sin()).collect())
            .collect()
    }

    #[test]
    fn test_scores_finite_and_shaped() {
        let s = scorer();
        assert!(!s.model().is_training());

        let px = s.score_px(&images(5)).unwrap();
        let py = s.score_py(&images(5)).unwrap();
        let classes = s.predict(&images(5)).unwrap();
        assert_eq!((px.len(), py.len(), classes.len()), (5, 5, 5));
        assert!(px.iter().all(|v| v.is_finite()));
        assert!(py.iter().all(|&p| p > 1.0 / 3.0 - 1e-6 && p <= 1.0 + 1e-6));
        assert!(classes.iter().all(|&c| c < 3));
    }

    #[test]
    fn test_px_bounds_pxy() {
        let s = scorer();
        let px = s.score_px(&images(3)).unwrap();
        for label in 0..3 {
            let pxy = s.score_pxy(&images(3), &[label; 3]).unwrap();
            for (a, b) in px.iter().zip(&pxy) {
                assert!(*b > 0.0);
                assert!(a + 1e-5 >= b.ln(), "logsumexp {a} < logit {}", b.ln());
            }
        }
        assert!(s.score_pxy(&images(2), &[0]).is_err());
    }

    #[test]
    fn test_pxy_rejects_unknown_label() {
        let s = scorer();
        let err = s.score_pxy(&images(2), &[0, 7]).unwrap_err();
        assert!(err.to_string().contains("out of range"), "unexpected error: {err}");
    }

    #[test]
    fn test_empty_and_bad_input() {
        let s = scorer();
        assert!(s.score_px(&[]).unwrap().is_empty());
        assert!(s.predict(&[]).unwrap().is_empty());
        assert!(s.score_px(&[vec![0.0; 10]]).is_err());
    }

    #[test]
    fn test_load_from_checkpoint() {
        use crate::training::trainer::{save_checkpoint, CheckpointMeta};

        let tmp = tempfile::tempdir().unwrap();
        let original = scorer();
        save_checkpoint::<TestBackend, _>(original.model(), tmp.path(), &CheckpointMeta { epoch: 0, step: 0, val_loss: None })
            .unwrap();

        let config = ShallowCnnConfig::new().with_hidden_features(2).with_num_classes(3);
        let loaded =
            JemScorer::<TestBackend, ShallowCnn<TestBackend>>::load(tmp.path(), &config, [1, 8, 8], Default::default()).unwrap();
        let a = original.score_px(&images(2)).unwrap();
        let b = loaded.score_px(&images(2)).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }

        assert!(JemScorer::<TestBackend, ShallowCnn<TestBackend>>::load(tmp.path(), &config, [3, 8, 8], Default::default()).is_err());
    }

    #[test]
    fn test_auroc_separable() {
        let auc = auroc(&[0.9, 0.8, 0.7], &[0.1, 0.2]).unwrap();
        assert!((auc - 1.0).abs() < 1e-12);
        let auc = auroc(&[0.1, 0.2], &[0.9, 0.8, 0.7]).unwrap();
        assert!(auc.abs() < 1e-12);
    }

    #[test]
    fn test_auroc_ties_and_mixed() {
        // All tied: 0.5
        let auc = auroc(&[1.0, 1.0], &[1.0, 1.0, 1.0]).unwrap();
        assert!((auc - 0.5).abs() < 1e-12);

        // Pairs: (3>1, 3>2), (2>1, 2=2) -> 3.5 / 4
        let auc = auroc(&[3.0, 2.0], &[1.0, 2.0]).unwrap();
        assert!((auc - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_auprc_values() {
        let ap = auprc(&[0.9, 0.8, 0.7], &[0.1, 0.2]).unwrap();
        assert!((ap - 1.0).abs() < 1e-12);

        // OOD ranked first: thresholds at 0.2 (P=1/4, R=1/2) and 0.1 (P=2/5, R=1).
        let ap = auprc(&[0.1, 0.2], &[0.9, 0.8, 0.7]).unwrap();
        assert!((ap - 0.325).abs() < 1e-12, "got {ap}");

        // All tied: one threshold at precision 2/5.
        let ap = auprc(&[1.0, 1.0], &[1.0, 1.0, 1.0]).unwrap();
        assert!((ap - 0.4).abs() < 1e-12, "got {ap}");

        assert!(auprc(&[], &[1.0]).is_none());
        assert!(auprc(&[1.0], &[f64::NAN]).is_none());
    }

    #[test]
    fn test_auroc_degenerate() {
        assert!(auroc(&[], &[1.0]).is_none());
        assert!(auroc(&[1.0], &[]).is_none());
        assert!(auroc(&[f64::NAN], &[1.0]).is_none());
    }
}
