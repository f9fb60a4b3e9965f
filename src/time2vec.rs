/*!
# Time2Vec

Learned periodic embedding of continuous time features, after
"Time2Vec: Learning a Vector Representation of Time" (Kazemi et al., 2019).

Every scalar feature gets its own affine map into `embed_dim / input_dim`
components. The first component stays linear, the rest go through `sin`.
*/

use burn::{
    config::Config,
    module::{Module, Param},
    nn::Initializer,
    tensor::{Tensor, backend::Backend},
};

use crate::Error;

/// Configuration for the Time2Vec encoder
#[derive(Config, Debug)]
pub struct Time2VecConfig {
    /// Number of scalar time features
    pub input_dim: usize,
    /// Total output width, a multiple of `input_dim`
    pub embed_dim: usize,
    /// Weight initializer
    #[config(default = "Initializer::Normal{mean:0.0, std:1.0}")]
    pub initializer: Initializer,
}

impl Time2VecConfig {
    /// Initialize a new Time2Vec encoder
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<Time2Vec<B>> {
        if self.input_dim == 0 || self.embed_dim == 0 {
            return Err(Error::InvalidConfig(
                "time2vec needs at least one input feature and a non-empty embedding".into(),
            ));
        }
        if self.embed_dim % self.input_dim != 0 {
            return Err(Error::InvalidConfig(format!(
                "time2vec embed_dim {} is not a multiple of input_dim {}",
                self.embed_dim, self.input_dim
            )));
        }

        let per_feature = self.embed_dim / self.input_dim;
        let weight = self.initializer.init([self.input_dim, per_feature], device);
        let bias = self.initializer.init([self.input_dim, per_feature], device);

        Ok(Time2Vec {
            weight,
            bias,
            input_dim: self.input_dim,
            per_feature,
        })
    }
}

/// Time2Vec encoder
#[derive(Module, Debug)]
pub struct Time2Vec<B: Backend> {
    /// Frequencies, shape [`input_dim`, `per_feature`]
    pub weight: Param<Tensor<B, 2>>,
    /// Phases, shape [`input_dim`, `per_feature`]
    pub bias: Param<Tensor<B, 2>>,
    /// Number of scalar time features
    pub input_dim: usize,
    /// Width of each feature's embedding
    pub per_feature: usize,
}

impl<B: Backend> Time2Vec<B> {
    /// Embed time features
    ///
    /// # Arguments
    /// * `x` - Time features [`batch_size`, `seq_length`, `input_dim`]
    ///
    /// # Returns
    /// * Embedding [`batch_size`, `seq_length`, `input_dim * per_feature`]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch_size, seq_length, _] = x.dims();

        let weight = self.weight.val().unsqueeze::<4>();
        let bias = self.bias.val().unsqueeze::<4>();

        // [batch, seq, feature, 1] * [1, 1, feature, per_feature]
        let affine = x.unsqueeze_dim::<4>(3) * weight + bias;

        let embedded = if self.per_feature > 1 {
            let linear = affine.clone().slice([
                0..batch_size,
                0..seq_length,
                0..self.input_dim,
                0..1,
            ]);
            let periodic = affine
                .slice([
                    0..batch_size,
                    0..seq_length,
                    0..self.input_dim,
                    1..self.per_feature,
                ])
                .sin();
            Tensor::cat(alloc::vec![linear, periodic], 3)
        } else {
            affine
        };

        embedded.reshape([batch_size, seq_length, self.input_dim * self.per_feature])
    }

    /// Output width
    pub fn embed_dim(&self) -> usize {
        self.input_dim * self.per_feature
    }
}
