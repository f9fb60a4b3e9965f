/*!
# Sequence model

Encoder-decoder attention stack that consumes the token embeddings. The
encoder reads the context tokens, the decoder reads the start + target tokens
and cross-attends to the encoder output. Three heads read the results:

* forecaster: decoder tokens → values of the target window,
* reconstructor: encoder tokens → values of the context window,
* classifier: encoder tokens → which variable each token belongs to.
*/

use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        Dropout, DropoutConfig, Linear, LinearConfig,
        transformer::{
            TransformerDecoder, TransformerDecoderConfig, TransformerDecoderInput,
            TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput,
        },
    },
    tensor::{Int, Tensor, backend::Backend},
};

use crate::{EmbedMethod, TokenEmbedding, unflatten_tokens};

/// Configuration for the sequence model
#[derive(Config, Debug)]
pub struct SequenceModelConfig {
    /// Number of variables
    pub d_y: usize,
    /// Model width
    pub d_model: usize,
    /// Feed-forward width
    pub d_ff: usize,
    /// Attention heads
    pub n_heads: usize,
    /// Encoder layers
    pub e_layers: usize,
    /// Decoder layers
    pub d_layers: usize,
    /// Width of each value vector
    #[config(default = "1")]
    pub value_dim: usize,
    /// Leading decoder time steps to strip from the forecast
    #[config(default = "0")]
    pub start_token_len: usize,
    /// Dropout on the embedded tokens
    #[config(default = "0.1")]
    pub dropout_emb: f64,
    /// Dropout inside the attention layers
    #[config(default = "0.2")]
    pub dropout_ff: f64,
    /// Tokenization method of both embeddings
    #[config(default = "EmbedMethod::SpatioTemporal")]
    pub method: EmbedMethod,
}

impl SequenceModelConfig {
    /// Initialize a new sequence model
    pub fn init<B: Backend>(&self, device: &B::Device) -> SequenceModel<B> {
        let encoder = TransformerEncoderConfig::new(
            self.d_model,
            self.d_ff,
            self.n_heads,
            self.e_layers,
        )
        .with_dropout(self.dropout_ff)
        .with_norm_first(true)
        .init(device);
        let decoder = TransformerDecoderConfig::new(
            self.d_model,
            self.d_ff,
            self.n_heads,
            self.d_layers,
        )
        .with_dropout(self.dropout_ff)
        .with_norm_first(true)
        .init(device);

        let head_width = match self.method {
            EmbedMethod::SpatioTemporal => self.value_dim,
            EmbedMethod::Temporal => self.d_y * self.value_dim,
        };
        let classifier = match self.method {
            EmbedMethod::SpatioTemporal => {
                Some(LinearConfig::new(self.d_model, self.d_y).init(device))
            }
            EmbedMethod::Temporal => None,
        };

        SequenceModel {
            encoder,
            decoder,
            emb_dropout: DropoutConfig::new(self.dropout_emb).init(),
            forecaster: LinearConfig::new(self.d_model, head_width).init(device),
            reconstructor: LinearConfig::new(self.d_model, head_width).init(device),
            classifier,
            method: Ignored(self.method),
            d_y: self.d_y,
            value_dim: self.value_dim,
            start_token_len: self.start_token_len,
        }
    }
}

/// Outputs of one sequence model pass
#[derive(Debug, Clone)]
pub struct SequenceOutput<B: Backend> {
    /// Forecast of the target window [`batch`, `target_len`, `d_y`, `value_dim`]
    pub forecast: Tensor<B, 4>,
    /// Reconstruction of the (possibly downsampled) context
    /// [`batch`, `context_len`, `d_y`, `value_dim`]
    pub recon: Tensor<B, 4>,
    /// Variable logits per encoder token [`batch`, `tokens`, `d_y`]
    pub class_logits: Option<Tensor<B, 3>>,
    /// True variable per encoder token [`batch`, `tokens`]
    pub class_labels: Option<Tensor<B, 2, Int>>,
}

/// Transformer encoder-decoder with forecast, reconstruction and classification heads
#[derive(Module, Debug)]
pub struct SequenceModel<B: Backend> {
    /// Context encoder
    pub encoder: TransformerEncoder<B>,
    /// Target decoder
    pub decoder: TransformerDecoder<B>,
    /// Dropout on embedded tokens
    pub emb_dropout: Dropout,
    /// Forecast head
    pub forecaster: Linear<B>,
    /// Reconstruction head
    pub reconstructor: Linear<B>,
    /// Variable classifier (spatio-temporal only)
    pub classifier: Option<Linear<B>>,
    /// Tokenization method
    pub method: Ignored<EmbedMethod>,
    /// Number of variables
    pub d_y: usize,
    /// Width of each value vector
    pub value_dim: usize,
    /// Leading decoder time steps to strip from the forecast
    pub start_token_len: usize,
}

impl<B: Backend> SequenceModel<B> {
    /// Forward pass through encoder and decoder
    ///
    /// # Arguments
    /// * `enc` - Context tokens
    /// * `dec` - Start + target tokens
    ///
    /// # Returns
    /// * Forecast, reconstruction and classification outputs
    pub fn forward(&self, enc: TokenEmbedding<B>, dec: TokenEmbedding<B>) -> SequenceOutput<B> {
        let enc_in = self.emb_dropout.forward(enc.tokens + enc.space);
        let mut enc_input = TransformerEncoderInput::new(enc_in);
        if let Some(mask) = enc.mask.clone() {
            enc_input = enc_input.mask_pad(mask);
        }
        let enc_out = self.encoder.forward(enc_input);

        let dec_in = self.emb_dropout.forward(dec.tokens + dec.space);
        let mut dec_input = TransformerDecoderInput::new(dec_in, enc_out.clone());
        if let Some(mask) = dec.mask {
            dec_input = dec_input.target_mask_pad(mask);
        }
        if let Some(mask) = enc.mask {
            dec_input = dec_input.memory_mask_pad(mask);
        }
        let dec_out = self.decoder.forward(dec_input);

        let forecast = self.fold(self.forecaster.forward(dec_out));
        let [batch_size, dec_len, d_y, value_dim] = forecast.dims();
        let forecast = forecast.slice([
            0..batch_size,
            self.start_token_len..dec_len,
            0..d_y,
            0..value_dim,
        ]);

        let recon = self.fold(self.reconstructor.forward(enc_out.clone()));
        let class_logits = self
            .classifier
            .as_ref()
            .map(|classifier| classifier.forward(enc_out));

        SequenceOutput {
            forecast,
            recon,
            class_logits,
            class_labels: enc.var_idx,
        }
    }

    /// Tokens [`batch`, `tokens`, `width`] back to [`batch`, `time`, `d_y`, `value_dim`]
    fn fold(&self, t: Tensor<B, 3>) -> Tensor<B, 4> {
        match *self.method {
            EmbedMethod::SpatioTemporal => unflatten_tokens(t, self.d_y),
            EmbedMethod::Temporal => {
                let [batch_size, time, _] = t.dims();
                t.reshape([batch_size, time, self.d_y, self.value_dim])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = burn_ndarray::NdArray<f32>;

    fn tokens(
        batch: usize,
        len: usize,
        d_model: usize,
        var_idx: bool,
        d_y: usize,
    ) -> TokenEmbedding<TestBackend> {
        let device = Default::default();
        let tokens = Tensor::random([batch, len, d_model], Distribution::Default, &device);
        let var_idx = var_idx.then(|| {
            let time = len / d_y;
            let idx: Vec<i64> = (0..batch * len).map(|i| ((i % len) / time) as i64).collect();
            Tensor::from_data(TensorData::new(idx, [batch, len]), &device)
        });
        TokenEmbedding {
            space: tokens.zeros_like(),
            tokens,
            var_idx,
            mask: None,
        }
    }

    #[test]
    fn test_spatio_temporal_outputs() {
        let device = Default::default();
        let model = SequenceModelConfig::new(3, 16, 32, 2, 1, 1)
            .with_start_token_len(2)
            .init::<TestBackend>(&device);

        // context: 5 steps, decoder: 2 start + 4 target steps
        let out = model.forward(tokens(2, 3 * 5, 16, true, 3), tokens(2, 3 * 6, 16, true, 3));

        assert_eq!(out.forecast.dims(), [2, 4, 3, 1]);
        assert_eq!(out.recon.dims(), [2, 5, 3, 1]);
        assert_eq!(out.class_logits.unwrap().dims(), [2, 15, 3]);
        assert_eq!(out.class_labels.unwrap().dims(), [2, 15]);
    }

    #[test]
    fn test_temporal_outputs() {
        let device = Default::default();
        let model = SequenceModelConfig::new(3, 16, 32, 2, 1, 1)
            .with_method(EmbedMethod::Temporal)
            .init::<TestBackend>(&device);

        let out = model.forward(tokens(2, 5, 16, false, 3), tokens(2, 4, 16, false, 3));

        assert_eq!(out.forecast.dims(), [2, 4, 3, 1]);
        assert_eq!(out.recon.dims(), [2, 5, 3, 1]);
        assert!(out.class_logits.is_none());
        assert!(out.class_labels.is_none());
    }
}
