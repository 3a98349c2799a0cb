//! Model architectures for EMG gesture classification.
//!
//! Implements:
//! - `EmgConvNet`: 2-D CNN over a record treated as a one-channel image
//! - `UniLstm`: unidirectional LSTM over a sequence of window features
//!
//! Both take `[batch, rows, cols]` batches and return class logits.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Lstm,
        LstmConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use emg_core::ModelSettings;

/// Classifier over `[batch, rows, cols]` inputs
pub trait EmgModel<B: Backend> {
    /// Class logits of shape `[batch, num_classes]`
    fn forward(&self, inputs: Tensor<B, 3>) -> Tensor<B, 2>;

    fn num_classes(&self) -> usize;
}

/// Configuration for [`EmgConvNet`]
#[derive(Config, Debug)]
pub struct EmgConvNetConfig {
    pub num_classes: usize,

    /// Filters of the first block, doubled by each following block
    #[config(default = "16")]
    pub base_filters: usize,

    /// Width of the penultimate layer, i.e. the extracted features
    #[config(default = "128")]
    pub hidden_size: usize,

    #[config(default = "0.3")]
    pub dropout: f64,
}

impl EmgConvNetConfig {
    pub fn from_settings(settings: &ModelSettings, num_classes: usize) -> Self {
        Self::new(num_classes)
            .with_base_filters(settings.base_filters)
            .with_hidden_size(settings.hidden_size)
            .with_dropout(settings.dropout)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> EmgConvNet<B> {
        EmgConvNet::new(self, device)
    }
}

/// A CNN block with Conv2d, BatchNorm, ReLU, and optional MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        with_pool: bool,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let bn = BatchNormConfig::new(out_channels).init(device);

        let pool = if with_pool {
            Some(MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init())
        } else {
            None
        };

        Self {
            conv,
            bn,
            relu: Relu::new(),
            pool,
        }
    }

    /// Pooling is skipped once a spatial side has shrunk below 2, so narrow
    /// records (few electrodes, single frames) still pass through.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);

        let [_, _, height, width] = x.dims();
        match &self.pool {
            Some(pool) if height >= 2 && width >= 2 => pool.forward(x),
            _ => x,
        }
    }
}

/// EMG gesture CNN
///
/// Architecture:
/// - 3 convolutional blocks (16 -> 32 -> 64 filters by default)
/// - Global average pooling, so any window width is accepted
/// - Hidden linear layer (the feature prefix ends here)
/// - Dropout and the final classification layer
#[derive(Module, Debug)]
pub struct EmgConvNet<B: Backend> {
    pub conv1: ConvBlock<B>,
    pub conv2: ConvBlock<B>,
    pub conv3: ConvBlock<B>,
    pub global_pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub dropout: Dropout,
    pub fc2: Linear<B>,
    hidden_size: usize,
    num_classes: usize,
}

impl<B: Backend> EmgConvNet<B> {
    pub fn new(config: &EmgConvNetConfig, device: &B::Device) -> Self {
        let base = config.base_filters;

        let conv1 = ConvBlock::new(1, base, 3, true, device);
        let conv2 = ConvBlock::new(base, base * 2, 3, true, device);
        let conv3 = ConvBlock::new(base * 2, base * 4, 3, false, device);

        let global_pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();

        let fc1 = LinearConfig::new(base * 4, config.hidden_size).init(device);
        let dropout = DropoutConfig::new(config.dropout).init();
        let fc2 = LinearConfig::new(config.hidden_size, config.num_classes).init(device);

        Self {
            conv1,
            conv2,
            conv3,
            global_pool,
            fc1,
            dropout,
            fc2,
            hidden_size: config.hidden_size,
            num_classes: config.num_classes,
        }
    }

    /// Penultimate activations of shape `[batch, feature_width]`
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, rows, cols]
    pub fn forward_features(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        // [B, H, W] -> [B, 1, H, W]
        let x = x.unsqueeze_dim::<4>(1);

        let x = self.conv1.forward(x);
        let x = self.conv2.forward(x);
        let x = self.conv3.forward(x);

        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.fc1.forward(x);
        Relu::new().forward(x)
    }

    /// Width of the vectors returned by [`Self::forward_features`]
    pub fn feature_width(&self) -> usize {
        self.hidden_size
    }
}

impl<B: Backend> EmgModel<B> for EmgConvNet<B> {
    fn forward(&self, inputs: Tensor<B, 3>) -> Tensor<B, 2> {
        let x = self.forward_features(inputs);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Configuration for [`UniLstm`]
#[derive(Config, Debug)]
pub struct UniLstmConfig {
    /// Width of one timestep, the extractor's feature width
    pub input_size: usize,
    pub num_classes: usize,
    #[config(default = "64")]
    pub hidden_size: usize,
}

impl UniLstmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UniLstm<B> {
        UniLstm {
            lstm: LstmConfig::new(self.input_size, self.hidden_size, true).init(device),
            fc: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            num_classes: self.num_classes,
        }
    }
}

/// Unidirectional LSTM classifying a feature sequence by its last timestep
#[derive(Module, Debug)]
pub struct UniLstm<B: Backend> {
    lstm: Lstm<B>,
    fc: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> EmgModel<B> for UniLstm<B> {
    /// `inputs` is `[batch, seq_len, input_size]`
    fn forward(&self, inputs: Tensor<B, 3>) -> Tensor<B, 2> {
        let (output, _state) = self.lstm.forward(inputs, None);
        let [batch_size, seq_len, hidden] = output.dims();
        let last = output
            .slice([0..batch_size, seq_len - 1..seq_len, 0..hidden])
            .reshape([batch_size, hidden]);
        self.fc.forward(last)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_convnet_output_shape() {
        let device = Default::default();
        let model = EmgConvNetConfig::new(5)
            .with_base_filters(4)
            .with_hidden_size(12)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::zeros([2, 8, 40], &device);
        assert_eq!(model.forward(input.clone()).dims(), [2, 5]);
        assert_eq!(model.forward_features(input).dims(), [2, 12]);
        assert_eq!(model.feature_width(), 12);
        assert_eq!(model.num_classes(), 5);
    }

    #[test]
    fn test_convnet_accepts_single_row() {
        let device = Default::default();
        let model = EmgConvNetConfig::new(3)
            .with_base_filters(2)
            .with_hidden_size(4)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::zeros([1, 1, 10], &device);
        assert_eq!(model.forward(input).dims(), [1, 3]);
    }

    #[test]
    fn test_lstm_output_shape() {
        let device = Default::default();
        let model = UniLstmConfig::new(6, 4)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::zeros([3, 7, 6], &device);
        assert_eq!(model.forward(input).dims(), [3, 4]);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = ModelSettings {
            base_filters: 8,
            hidden_size: 32,
            dropout: 0.1,
        };
        let config = EmgConvNetConfig::from_settings(&settings, 7);
        assert_eq!(config.num_classes, 7);
        assert_eq!(config.base_filters, 8);
        assert_eq!(config.hidden_size, 32);
    }
}
