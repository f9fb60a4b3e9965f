/*!
# Spatiotemporal forecaster model

Wires the encoder embedding, the decoder embedding and the sequence model
together. The decoder sees the last `start_token_len` context steps followed
by the target window with its values zeroed.
*/

use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};
use tracing::info;

use crate::{
    DataDropout, EmbedMethod, Embedding, EmbeddingConfig, Error, ForecasterConfig,
    IdentityDropout, ReconstructionDropout, ReconstructionDropoutConfig, SequenceModel,
    SequenceModelConfig, SequenceOutput,
};

/// One training or evaluation batch
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// Context time features [`batch`, `context_len`, `d_x`]
    pub x_c: Tensor<B, 3>,
    /// Context values [`batch`, `context_len`, `d_y`, `value_dim`]
    pub y_c: Tensor<B, 4>,
    /// Target time features [`batch`, `target_len`, `d_x`]
    pub x_t: Tensor<B, 3>,
    /// Target values [`batch`, `target_len`, `d_y`, `value_dim`]
    pub y_t: Tensor<B, 4>,
}

impl<B: Backend> Batch<B> {
    /// Create a batch from four-dimensional value tensors
    pub fn new(x_c: Tensor<B, 3>, y_c: Tensor<B, 4>, x_t: Tensor<B, 3>, y_t: Tensor<B, 4>) -> Self {
        Self { x_c, y_c, x_t, y_t }
    }

    /// Create a batch from [`batch`, `time`, `d_y`] values with one value per variable
    pub fn from_series(
        x_c: Tensor<B, 3>,
        y_c: Tensor<B, 3>,
        x_t: Tensor<B, 3>,
        y_t: Tensor<B, 3>,
    ) -> Self {
        Self::new(x_c, y_c.unsqueeze_dim(3), x_t, y_t.unsqueeze_dim(3))
    }
}

/// A model the forecaster can compute losses for
pub trait ForecastModel<B: Backend> {
    /// Run embedding and sequence model over a batch
    ///
    /// `data_drop` is applied to the context values before they are embedded.
    fn forward_pass(
        &self,
        batch: &Batch<B>,
        data_drop: &dyn DataDropout<B>,
    ) -> crate::Result<SequenceOutput<B>>;
}

/// Configuration for the spatiotemporal forecaster
#[derive(Config, Debug)]
pub struct StFormerConfig {
    /// Number of variables
    pub d_y: usize,
    /// Number of time features
    pub d_x: usize,
    /// Position table capacity; must cover the context and start + target windows
    pub max_seq_len: usize,
    /// Width of each value vector
    #[config(default = "1")]
    pub value_dim: usize,
    /// Context steps repeated at the start of the decoder
    #[config(default = "4")]
    pub start_token_len: usize,
    /// Model width
    #[config(default = "200")]
    pub d_model: usize,
    /// Feed-forward width
    #[config(default = "800")]
    pub d_ff: usize,
    /// Attention heads
    #[config(default = "4")]
    pub n_heads: usize,
    /// Encoder layers
    #[config(default = "2")]
    pub e_layers: usize,
    /// Decoder layers
    #[config(default = "2")]
    pub d_layers: usize,
    /// Dropout on embedded tokens
    #[config(default = "0.1")]
    pub dropout_emb: f64,
    /// Dropout inside attention layers
    #[config(default = "0.2")]
    pub dropout_ff: f64,
    /// Time2Vec width per time feature
    #[config(default = "6")]
    pub time_emb_dim: usize,
    /// Tokenization method
    #[config(default = "EmbedMethod::SpatioTemporal")]
    pub embed_method: EmbedMethod,
    /// Downsampling blocks after the encoder embedding
    #[config(default = "0")]
    pub downsample_convs: usize,
    /// Null sentinel in the data
    #[config(default = "None")]
    pub null_value: Option<f64>,
    /// Pad sentinel in the data
    #[config(default = "None")]
    pub pad_value: Option<f64>,
    /// Embed values
    #[config(default = "true")]
    pub use_val: bool,
    /// Embed time features
    #[config(default = "true")]
    pub use_time: bool,
    /// Embed variable identity
    #[config(default = "true")]
    pub use_space: bool,
    /// Embed the given flag
    #[config(default = "true")]
    pub use_given: bool,
    /// Probability a sample skips reconstruction dropout
    #[config(default = "1.0")]
    pub recon_mask_skip_all: f64,
    /// Longest dropped run
    #[config(default = "5")]
    pub recon_mask_max_seq_len: usize,
    /// Probability of a dropped run per variable
    #[config(default = "0.1")]
    pub recon_mask_drop_seq: f64,
    /// Probability of dropping a single value
    #[config(default = "0.2")]
    pub recon_mask_drop_standard: f64,
    /// Probability of dropping a whole time step
    #[config(default = "0.05")]
    pub recon_mask_drop_full: f64,
}

impl StFormerConfig {
    /// Initialize a new forecaster model
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<StFormer<B>> {
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "d_model {} must be a positive multiple of n_heads {}",
                self.d_model, self.n_heads
            )));
        }

        let embedding = |is_encoder: bool| {
            EmbeddingConfig::new(self.d_y, self.d_x, self.d_model, self.max_seq_len)
                .with_value_dim(self.value_dim)
                .with_time_emb_dim(self.time_emb_dim)
                .with_method(self.embed_method)
                .with_null_value(self.null_value)
                .with_pad_value(self.pad_value)
                .with_is_encoder(is_encoder)
                .with_use_val(self.use_val)
                .with_use_time(self.use_time)
                .with_use_space(self.use_space)
                .with_use_given(self.use_given)
        };

        let enc_embedding = embedding(true)
            .with_downsample_convs(self.downsample_convs)
            .init(device)?;
        let dec_embedding = embedding(false)
            .with_start_token_len(self.start_token_len)
            .init(device)?;

        let sequence = SequenceModelConfig::new(
            self.d_y,
            self.d_model,
            self.d_ff,
            self.n_heads,
            self.e_layers,
            self.d_layers,
        )
        .with_value_dim(self.value_dim)
        .with_start_token_len(self.start_token_len)
        .with_dropout_emb(self.dropout_emb)
        .with_dropout_ff(self.dropout_ff)
        .with_method(self.embed_method)
        .init(device);

        let model = StFormer {
            enc_embedding,
            dec_embedding,
            sequence,
            start_token_len: self.start_token_len,
        };
        self.log_summary();
        Ok(model)
    }

    /// Reconstruction dropout described by the `recon_mask_*` options
    pub fn data_dropout(&self) -> ReconstructionDropout {
        ReconstructionDropoutConfig::new()
            .with_drop_full_timesteps(self.recon_mask_drop_full)
            .with_drop_standard(self.recon_mask_drop_standard)
            .with_drop_seq(self.recon_mask_drop_seq)
            .with_drop_max_seq_len(self.recon_mask_max_seq_len)
            .with_skip_all_drop(self.recon_mask_skip_all)
            .init()
    }

    /// Loss configuration sharing this model's embed method and null sentinel
    pub fn forecaster(&self) -> ForecasterConfig {
        ForecasterConfig::new()
            .with_embed_method(self.embed_method)
            .with_null_value(self.null_value)
    }

    fn log_summary(&self) {
        info!(
            d_model = self.d_model,
            d_ff = self.d_ff,
            e_layers = self.e_layers,
            d_layers = self.d_layers,
            n_heads = self.n_heads,
            dropout_emb = self.dropout_emb,
            dropout_ff = self.dropout_ff,
            embed_method = %self.embed_method,
            downsample_convs = self.downsample_convs,
            start_token_len = self.start_token_len,
            "initialized spatiotemporal forecaster"
        );
    }
}

/// Spatiotemporal encoder-decoder forecaster
#[derive(Module, Debug)]
pub struct StFormer<B: Backend> {
    /// Context embedding
    pub enc_embedding: Embedding<B>,
    /// Start + target embedding
    pub dec_embedding: Embedding<B>,
    /// Attention stack and output heads
    pub sequence: SequenceModel<B>,
    /// Context steps repeated at the start of the decoder
    pub start_token_len: usize,
}

impl<B: Backend> StFormer<B> {
    /// Forward pass over context and target windows
    ///
    /// # Arguments
    /// * `x_c` - Context time features [`batch_size`, `context_len`, `d_x`]
    /// * `y_c` - Context values [`batch_size`, `context_len`, `d_y`, `value_dim`]
    /// * `x_t` - Target time features [`batch_size`, `target_len`, `d_x`]
    /// * `y_t` - Target values, only the shape is used
    /// * `data_drop` - Regularization for the context values
    ///
    /// # Returns
    /// * Forecast [`batch_size`, `target_len`, `d_y`, `value_dim`], reconstruction
    ///   and classification outputs
    pub fn forward(
        &self,
        x_c: Tensor<B, 3>,
        y_c: Tensor<B, 4>,
        x_t: Tensor<B, 3>,
        y_t: Tensor<B, 4>,
        data_drop: &dyn DataDropout<B>,
    ) -> crate::Result<SequenceOutput<B>> {
        let [batch_size, context_len, d_y, value_dim] = y_c.dims();
        let [_, _, d_x] = x_c.dims();
        let start = self.start_token_len;

        let mut dec_x = x_t;
        let mut dec_y = y_t.zeros_like();
        if start > 0 {
            if start > context_len {
                return Err(Error::DimensionMismatch {
                    what: "context length for start tokens",
                    expected: start,
                    actual: context_len,
                });
            }
            let first = context_len - start;
            let start_y = y_c
                .clone()
                .slice([0..batch_size, first..context_len, 0..d_y, 0..value_dim]);
            let start_x = x_c
                .clone()
                .slice([0..batch_size, first..context_len, 0..d_x]);
            dec_y = Tensor::cat(alloc::vec![start_y, dec_y], 1);
            dec_x = Tensor::cat(alloc::vec![start_x, dec_x], 1);
        }

        let enc = self.enc_embedding.forward(x_c, y_c, data_drop)?;
        let dec = self.dec_embedding.forward(dec_x, dec_y, &IdentityDropout)?;

        Ok(self.sequence.forward(enc, dec))
    }
}

impl<B: Backend> ForecastModel<B> for StFormer<B> {
    fn forward_pass(
        &self,
        batch: &Batch<B>,
        data_drop: &dyn DataDropout<B>,
    ) -> crate::Result<SequenceOutput<B>> {
        self.forward(
            batch.x_c.clone(),
            batch.y_c.clone(),
            batch.x_t.clone(),
            batch.y_t.clone(),
            data_drop,
        )
    }
}
