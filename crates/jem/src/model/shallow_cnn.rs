use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::silu;

use crate::model::energy::EnergyModel;

/// Configuration for the ShallowCnn classifier.
///
/// Five strided convolutions with SiLU (swish) activations, global average
/// pooling and a linear head producing one logit per class.
///
/// ```text
/// (batch, in_channels, H, W)
///   → Conv(in→h,  k5 s2 p4) → SiLU
///   → Conv(h→2h,  k3 s2 p1) → SiLU
///   → Conv(2h→4h, k3 s2 p1) → SiLU
///   → Conv(4h→4h, k3 s2 p1) → SiLU
///   → Conv(4h→4h, k3 s2 p1) → SiLU
///   → AdaptiveAvgPool(1×1) → flatten → Dropout → Linear(4h→num_classes)
///   → logits: (batch, num_classes)
/// ```
#[derive(Config, Debug)]
pub struct ShallowCnnConfig {
    /// Image channels (1 for grayscale glyphs).
    #[config(default = 1)]
    pub in_channels: usize,
    /// Width of the first convolution; later layers use 2x and 4x.
    #[config(default = 32)]
    pub hidden_features: usize,
    /// Number of output logits. 1 gives a plain EBM.
    #[config(default = 42)]
    pub num_classes: usize,
    /// Dropout before the linear head, only applied in training mode.
    #[config(default = 0.0)]
    pub dropout: f64,
}

#[derive(Module, Debug)]
pub struct ShallowCnn<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    fc: Linear<B>,
    training: bool,
}

impl ShallowCnnConfig {
    /// Initialize a ShallowCnn in training mode.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ShallowCnn<B> {
        let c1 = self.hidden_features;
        let c2 = self.hidden_features * 2;
        let c3 = self.hidden_features * 4;

        let layers = [
            (self.in_channels, c1, 5, 4),
            (c1, c2, 3, 1),
            (c2, c3, 3, 1),
            (c3, c3, 3, 1),
            (c3, c3, 3, 1),
        ];
        let convs = layers
            .iter()
            .map(|&(c_in, c_out, kernel, padding)| {
                Conv2dConfig::new([c_in, c_out], [kernel, kernel])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(padding, padding))
                    .init(device)
            })
            .collect();

        ShallowCnn {
            convs,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc: LinearConfig::new(c3, self.num_classes).init(device),
            training: true,
        }
    }
}

impl<B: Backend> EnergyModel<B> for ShallowCnn<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.convs {
            x = silu(conv.forward(x));
        }
        let x = self.pool.forward(x).flatten::<2>(1, 3);
        let x = if self.training {
            self.dropout.forward(x)
        } else {
            x
        };
        self.fc.forward(x)
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }
}
