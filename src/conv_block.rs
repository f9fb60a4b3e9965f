/*!
# Downsampling convolution block

Distilling block placed after the encoder embedding. Each variable's run of
tokens is convolved independently, normalized, activated and max-pooled with
stride 2, so every block roughly halves the per-variable sequence length.
*/

use burn::{
    config::Config,
    module::Module,
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig1d,
        conv::{Conv1d, Conv1dConfig},
        pool::{MaxPool1d, MaxPool1dConfig},
    },
    tensor::{Tensor, activation, backend::Backend},
};

/// Configuration for a downsampling block
#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    /// Number of independent runs the token axis is split into
    pub split_length_into: usize,
    /// Model width (conv channels)
    pub d_model: usize,
    /// Convolution kernel size
    #[config(default = "3")]
    pub conv_kernel_size: usize,
    /// Pooling kernel size
    #[config(default = "3")]
    pub pool_kernel_size: usize,
    /// Pooling stride
    #[config(default = "2")]
    pub pool_stride: usize,
}

impl ConvBlockConfig {
    /// Initialize a new downsampling block
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        let conv = Conv1dConfig::new(self.d_model, self.d_model, self.conv_kernel_size)
            .with_padding(PaddingConfig1d::Explicit(self.conv_kernel_size / 2))
            .init(device);
        let norm = BatchNormConfig::new(self.d_model).init(device);
        let pool = MaxPool1dConfig::new(self.pool_kernel_size)
            .with_stride(self.pool_stride)
            .with_padding(PaddingConfig1d::Explicit(self.pool_kernel_size / 2))
            .init();

        ConvBlock {
            conv,
            norm,
            pool,
            split_length_into: self.split_length_into,
        }
    }
}

/// Conv → BatchNorm → GELU → MaxPool over each variable's token run
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    /// Convolution over the token axis
    pub conv: Conv1d<B>,
    /// Batch normalization over channels
    pub norm: BatchNorm<B, 1>,
    /// Strided max pooling
    pub pool: MaxPool1d,
    /// Number of independent runs in the token axis
    pub split_length_into: usize,
}

impl<B: Backend> ConvBlock<B> {
    /// Forward pass through the block
    ///
    /// # Arguments
    /// * `x` - Tokens [`batch_size`, `split_length_into * run_length`, `d_model`]
    ///
    /// # Returns
    /// * Tokens [`batch_size`, `split_length_into * new_run_length`, `d_model`]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch_size, length, d_model] = x.dims();
        let split = self.split_length_into;
        let run_length = length / split;

        // [batch * split, d_model, run_length]
        let x = x
            .reshape([batch_size * split, run_length, d_model])
            .swap_dims(1, 2);

        let x = self.conv.forward(x);
        let x = activation::gelu(self.norm.forward(x));
        let x = self.pool.forward(x);

        let [_, _, new_run_length] = x.dims();
        x.swap_dims(1, 2)
            .reshape([batch_size, split * new_run_length, d_model])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn_ndarray::NdArray<f32>;

    #[test]
    fn test_conv_block_halves_each_run() {
        let device = Default::default();
        let block = ConvBlockConfig::new(3, 16).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::random([2, 3 * 8, 16], Distribution::Default, &device);
        let output = block.forward(input);

        assert_eq!(output.dims(), [2, 3 * 4, 16]);
    }

    #[test]
    fn test_conv_block_odd_run_rounds_up() {
        let device = Default::default();
        let block = ConvBlockConfig::new(2, 8).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::random([1, 2 * 5, 8], Distribution::Default, &device);
        let output = block.forward(input);

        assert_eq!(output.dims(), [1, 2 * 3, 8]);
    }
}
