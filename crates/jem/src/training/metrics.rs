//! Training metrics with health checks.

use burn::prelude::*;

use crate::training::loss::JointLoss;

/// Scalar summary of one JEM step (or an average over several).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JemMetrics {
    /// Total optimized loss.
    pub loss: f64,
    /// Contrastive-divergence term including the L2 penalty.
    pub px_loss: f64,
    /// Classification term; 0 in unconditional mode.
    pub pyx_loss: f64,
    /// Mean score of the (jittered) data batch.
    pub real_score_mean: f64,
    /// Mean score of the synthesized batch.
    pub fake_score_mean: f64,
    /// Argmax accuracy of the logits on the data batch.
    pub accuracy: f64,
}

fn mean<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.mean().into_scalar().elem()
}

/// Fraction of rows whose argmax logit matches the label.
pub fn accuracy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> f64 {
    let [batch, _] = logits.dims();
    if batch == 0 {
        return 0.0;
    }
    let predicted = logits.argmax(1).squeeze::<1>(1);
    let correct: i64 = predicted.equal(labels).int().sum().into_scalar().elem();
    correct as f64 / batch as f64
}

impl JemMetrics {
    /// Read the scalars out of a computed loss. Call before `backward()`.
    pub fn compute<B: Backend>(loss: &JointLoss<B>, labels: Tensor<B, 1, Int>) -> Self {
        Self {
            loss: loss.loss.clone().into_scalar().elem(),
            px_loss: loss.px.loss.clone().into_scalar().elem(),
            pyx_loss: loss
                .pyx
                .clone()
                .map(|pyx| pyx.into_scalar().elem())
                .unwrap_or(0.0),
            real_score_mean: mean(loss.px.real_score.clone()),
            fake_score_mean: mean(loss.px.fake_score.clone()),
            accuracy: accuracy(loss.logits.clone(), labels),
        }
    }

    /// Data score minus synthesized score; positive when the model separates them.
    pub fn score_gap(&self) -> f64 {
        self.real_score_mean - self.fake_score_mean
    }

    /// Warnings for common JEM failure modes.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.loss.is_finite() {
            warnings.push(format!("loss is not finite ({})", self.loss));
        }
        if self.real_score_mean.abs() > 1e3 || self.fake_score_mean.abs() > 1e3 {
            warnings.push(format!(
                "score magnitude exploding (real={:.1}, fake={:.1}); raise alpha",
                self.real_score_mean, self.fake_score_mean
            ));
        }
        if self.score_gap() < -1.0 {
            warnings.push(format!(
                "synthesized samples score above data (gap={:.2}); sampler may be too strong",
                self.score_gap()
            ));
        }
        warnings
    }
}

/// Running mean of [`JemMetrics`] over a logging interval.
#[derive(Debug, Default)]
pub struct RunningAvg {
    sum: JemMetrics,
    count: usize,
}

impl RunningAvg {
    pub fn update(&mut self, m: &JemMetrics) {
        self.sum.loss += m.loss;
        self.sum.px_loss += m.px_loss;
        self.sum.pyx_loss += m.pyx_loss;
        self.sum.real_score_mean += m.real_score_mean;
        self.sum.fake_score_mean += m.fake_score_mean;
        self.sum.accuracy += m.accuracy;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn average(&self) -> Option<JemMetrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(JemMetrics {
            loss: self.sum.loss / n,
            px_loss: self.sum.px_loss / n,
            pyx_loss: self.sum.pyx_loss / n,
            real_score_mean: self.sum.real_score_mean / n,
            fake_score_mean: self.sum.fake_score_mean / n,
            accuracy: self.sum.accuracy / n,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl std::fmt::Display for JemMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "loss={:.4} px={:.4} pyx={:.4} real={:.3} fake={:.3} gap={:.3} acc={:.3}",
            self.loss,
            self.px_loss,
            self.pyx_loss,
            self.real_score_mean,
            self.fake_score_mean,
            self.score_gap(),
            self.accuracy
        )
    }
}

/// Multi-class confusion counts, indexed `[true class][predicted class]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        self.counts[truth * self.num_classes + predicted]
    }

    /// Count `(prediction, label)` pairs. Pairs with an out-of-range class are skipped.
    pub fn update(&mut self, predictions: &[usize], labels: &[usize]) {
        let k = self.num_classes;
        for (&p, &t) in predictions.iter().zip(labels) {
            if p < k && t < k {
                self.counts[t * k + p] += 1;
            } else {
                tracing::warn!(predicted = p, label = t, num_classes = k, "Class out of range, skipped");
            }
        }
    }

    fn row_sum(&self, truth: usize) -> u64 {
        (0..self.num_classes).map(|p| self.get(truth, p)).sum()
    }

    fn col_sum(&self, predicted: usize) -> u64 {
        (0..self.num_classes).map(|t| self.get(t, predicted)).sum()
    }

    fn correct(&self) -> u64 {
        (0..self.num_classes).map(|c| self.get(c, c)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Per-class `(precision, recall, f1)` for classes that occur as label or prediction.
    fn per_class(&self) -> Vec<(f64, f64, f64)> {
        (0..self.num_classes)
            .filter_map(|c| {
                let tp = self.get(c, c);
                let support = self.row_sum(c);
                let predicted = self.col_sum(c);
                if support == 0 && predicted == 0 {
                    return None;
                }
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                Some((precision, recall, f1))
            })
            .collect()
    }

    fn macro_average(&self, pick: impl Fn(&(f64, f64, f64)) -> f64) -> f64 {
        let classes = self.per_class();
        if classes.is_empty() {
            return 0.0;
        }
        classes.iter().map(pick).sum::<f64>() / classes.len() as f64
    }

    pub fn macro_precision(&self) -> f64 {
        self.macro_average(|c| c.0)
    }

    pub fn macro_recall(&self) -> f64 {
        self.macro_average(|c| c.1)
    }

    pub fn macro_f1(&self) -> f64 {
        self.macro_average(|c| c.2)
    }

    /// Micro-averaged F1; equals accuracy for single-label predictions.
    pub fn micro_f1(&self) -> f64 {
        self.accuracy()
    }

    /// Cohen's kappa: agreement corrected for chance. 0 when undefined.
    pub fn cohen_kappa(&self) -> f64 {
        let n = self.total() as f64;
        if n == 0.0 {
            return 0.0;
        }
        let observed = self.accuracy();
        let expected: f64 = (0..self.num_classes)
            .map(|c| self.row_sum(c) as f64 * self.col_sum(c) as f64)
            .sum::<f64>()
            / (n * n);
        if (1.0 - expected).abs() < f64::EPSILON {
            return 0.0;
        }
        (observed - expected) / (1.0 - expected)
    }

    /// Multi-class Matthews correlation coefficient. 0 when undefined.
    pub fn mcc(&self) -> f64 {
        let s = self.total() as f64;
        let c = self.correct() as f64;
        let (mut pt, mut pp, mut tt) = (0.0, 0.0, 0.0);
        for k in 0..self.num_classes {
            let t = self.row_sum(k) as f64;
            let p = self.col_sum(k) as f64;
            pt += p * t;
            pp += p * p;
            tt += t * t;
        }
        let denom = ((s * s - pp) * (s * s - tt)).sqrt();
        if denom == 0.0 {
            return 0.0;
        }
        (c * s - pt) / denom
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} acc={:.3} macro_p={:.3} macro_r={:.3} macro_f1={:.3} kappa={:.3} mcc={:.3}",
            self.total(),
            self.accuracy(),
            self.macro_precision(),
            self.macro_recall(),
            self.macro_f1(),
            self.cohen_kappa(),
            self.mcc()
        )
    }
}

/// Equal-width confidence bins for the expected calibration error.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBins {
    count: Vec<u64>,
    confidence: Vec<f64>,
    correct: Vec<u64>,
}

impl CalibrationBins {
    pub fn new(num_bins: usize) -> Self {
        let num_bins = num_bins.max(1);
        Self {
            count: vec![0; num_bins],
            confidence: vec![0.0; num_bins],
            correct: vec![0; num_bins],
        }
    }

    /// Add predictions with their max-softmax confidence in `[0, 1]`.
    pub fn update(&mut self, confidences: &[f64], correct: &[bool]) {
        let bins = self.count.len();
        for (&conf, &hit) in confidences.iter().zip(correct) {
            let conf = conf.clamp(0.0, 1.0);
            let bin = ((conf * bins as f64) as usize).min(bins - 1);
            self.count[bin] += 1;
            self.confidence[bin] += conf;
            self.correct[bin] += u64::from(hit);
        }
    }

    /// `sum_b |B_b| / n * |acc(B_b) - conf(B_b)|`; 0 for no samples.
    pub fn expected_calibration_error(&self) -> f64 {
        let n: u64 = self.count.iter().sum();
        if n == 0 {
            return 0.0;
        }
        (0..self.count.len())
            .filter(|&b| self.count[b] > 0)
            .map(|b| {
                let size = self.count[b] as f64;
                let acc = self.correct[b] as f64 / size;
                let conf = self.confidence[b] / size;
                size / n as f64 * (acc - conf).abs()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn healthy() -> JemMetrics {
        JemMetrics {
            loss: -0.2,
            px_loss: -0.3,
            pyx_loss: 1.0,
            real_score_mean: 0.5,
            fake_score_mean: 0.1,
            accuracy: 0.6,
        }
    }

    #[test]
    fn test_accuracy() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[2.0_f32, 0.0], [0.0, 1.0], [3.0, 1.0], [0.0, 5.0]]),
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0_i64, 1, 1, 0]), &device);
        assert!((accuracy(logits, labels) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_health_check_clean() {
        assert!(healthy().health_check().is_empty());
        assert!((healthy().score_gap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_health_check_flags_problems() {
        let m = JemMetrics {
            loss: f64::NAN,
            ..healthy()
        };
        assert!(m.health_check().iter().any(|w| w.contains("not finite")));

        let m = JemMetrics {
            real_score_mean: 5e3,
            ..healthy()
        };
        assert!(m.health_check().iter().any(|w| w.contains("exploding")));

        let m = JemMetrics {
            real_score_mean: -2.0,
            fake_score_mean: 1.0,
            ..healthy()
        };
        assert!(m.health_check().iter().any(|w| w.contains("score above data")));
    }

    #[test]
    fn test_running_avg() {
        let mut avg = RunningAvg::default();
        assert!(avg.average().is_none());

        avg.update(&healthy());
        avg.update(&JemMetrics {
            loss: 0.2,
            accuracy: 1.0,
            ..healthy()
        });
        assert_eq!(avg.count(), 2);
        let m = avg.average().unwrap();
        assert!(m.loss.abs() < 1e-9);
        assert!((m.accuracy - 0.8).abs() < 1e-9);

        avg.reset();
        assert_eq!(avg.count(), 0);
    }

    #[test]
    fn test_confusion_matrix_scores() {
        // labels:      0 0 1 1 2 2
        // predictions: 0 1 1 1 2 0
        let mut cm = ConfusionMatrix::new(3);
        cm.update(&[0, 1, 1, 1, 2, 0], &[0, 0, 1, 1, 2, 2]);
        assert_eq!(cm.total(), 6);
        assert_eq!(cm.get(0, 1), 1);
        assert!((cm.accuracy() - 4.0 / 6.0).abs() < 1e-12);
        assert!((cm.micro_f1() - cm.accuracy()).abs() < 1e-12);

        // precision: 1/2, 2/3, 1; recall: 1/2, 1, 1/2
        let p = (0.5 + 2.0 / 3.0 + 1.0) / 3.0;
        let r = (0.5 + 1.0 + 0.5) / 3.0;
        let f1 = (0.5 + 0.8 + 2.0 / 3.0) / 3.0;
        assert!((cm.macro_precision() - p).abs() < 1e-12);
        assert!((cm.macro_recall() - r).abs() < 1e-12);
        assert!((cm.macro_f1() - f1).abs() < 1e-12, "macro f1 {}", cm.macro_f1());

        // p_e = (2*2 + 2*3 + 2*1) / 36 = 1/3, kappa = (2/3 - 1/3) / (2/3) = 0.5
        assert!((cm.cohen_kappa() - 0.5).abs() < 1e-12);
        assert!(cm.mcc() > 0.0 && cm.mcc() < 1.0);
    }

    #[test]
    fn test_confusion_matrix_perfect_and_empty() {
        let mut cm = ConfusionMatrix::new(2);
        assert_eq!((cm.accuracy(), cm.macro_f1(), cm.cohen_kappa(), cm.mcc()), (0.0, 0.0, 0.0, 0.0));

        cm.update(&[0, 1, 1, 5], &[0, 1, 1, 0]);
        assert_eq!(cm.total(), 3, "out-of-range pair is skipped");
        assert!((cm.macro_f1() - 1.0).abs() < 1e-12);
        assert!((cm.cohen_kappa() - 1.0).abs() < 1e-12);
        assert!((cm.mcc() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_expected_calibration_error() {
        let mut bins = CalibrationBins::new(10);
        assert_eq!(bins.expected_calibration_error(), 0.0);

        // Confidence 0.95, always right: |1 - 0.95| = 0.05.
        bins.update(&[0.95, 0.95], &[true, true]);
        assert!((bins.expected_calibration_error() - 0.05).abs() < 1e-12);

        // Add two at 0.55 that are both wrong: 0.5 * 0.05 + 0.5 * 0.55.
        bins.update(&[0.55, 0.55], &[false, false]);
        assert!((bins.expected_calibration_error() - 0.3).abs() < 1e-12);

        // Confidence 1.0 lands in the last bin.
        let mut edge = CalibrationBins::new(4);
        edge.update(&[1.0], &[true]);
        assert_eq!(edge.expected_calibration_error(), 0.0);
    }
}
