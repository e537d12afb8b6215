//! The scoring interface the sampler, trainer and scorer consume.
//!
//! A JEM reads classifier logits `f(x)[y]` as negative energies:
//! `log p(x) ∝ logsumexp_y f(x)[y]` and `p(x, y) ∝ exp(f(x)[y])`.

use burn::prelude::*;

/// A network that defines both an unnormalized density over images and a
/// classifier over `num_classes` labels.
///
/// Convention: **higher score = more probable** (score = negative energy).
pub trait EnergyModel<B: Backend>: Module<B> {
    /// Class logits for a batch of images.
    ///
    /// Input shape: `(batch, channels, height, width)`
    /// Output shape: `(batch, num_classes)`
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Per-image score.
    ///
    /// Without labels this is `logsumexp` over the logits (log p(x) up to a
    /// constant). With labels it is `exp` of each image's own label logit,
    /// the unnormalized joint density p(x, y).
    ///
    /// Output shape: `(batch,)`
    fn score(&self, images: Tensor<B, 4>, labels: Option<Tensor<B, 1, Int>>) -> Tensor<B, 1> {
        let logits = self.logits(images);
        match labels {
            Some(labels) => gather_label_logits(logits, labels).exp(),
            None => log_sum_exp(logits),
        }
    }

    /// Whether training-only layers (dropout) are active.
    fn is_training(&self) -> bool;

    /// Switch between training and evaluation behaviour.
    fn set_training(self, training: bool) -> Self;
}

/// Numerically stable `log(sum(exp(logits), dim=1))`.
pub fn log_sum_exp<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1> {
    let max = logits.clone().max_dim(1).detach(); // (batch, 1)
    let shifted = logits - max.clone();
    (shifted.exp().sum_dim(1).log() + max).squeeze::<1>(1)
}

/// Pick `logits[i, labels[i]]` for every row.
pub fn gather_label_logits<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    logits
        .gather(1, labels.unsqueeze_dim::<2>(1))
        .squeeze::<1>(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_log_sum_exp_matches_naive() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.0_f32, 1.0, 2.0], [-1.0, -1.0, -1.0]]),
            &device,
        );
        let lse: Vec<f32> = log_sum_exp(logits).into_data().to_vec().unwrap();

        let row0 = (0.0_f32.exp() + 1.0_f32.exp() + 2.0_f32.exp()).ln();
        let row1 = -1.0 + 3.0_f32.ln();
        assert!((lse[0] - row0).abs() < 1e-5, "row 0: {} vs {row0}", lse[0]);
        assert!((lse[1] - row1).abs() < 1e-5, "row 1: {} vs {row1}", lse[1]);
    }

    #[test]
    fn test_log_sum_exp_large_logits_stay_finite() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1000.0_f32, 1000.0]]),
            &device,
        );
        let lse: Vec<f32> = log_sum_exp(logits).into_data().to_vec().unwrap();
        assert!((lse[0] - (1000.0 + 2.0_f32.ln())).abs() < 1e-3, "got {}", lse[0]);
    }

    #[test]
    fn test_gather_label_logits() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.5_f32, 1.5, 2.5], [3.0, 4.0, 5.0]]),
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([2_i64, 0]), &device);
        let picked: Vec<f32> = gather_label_logits(logits, labels)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(picked, vec![2.5, 3.0]);
    }
}
