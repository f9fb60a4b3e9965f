/*!
# Spatiotemporal token embedding

Turns an observation tensor [`batch`, `time`, `variables`, `value_dim`] and its
time features [`batch`, `time`, `d_x`] into the token sequence consumed by the
sequence model.

In spatio-temporal mode every (time step, variable) pair becomes a token.
Tokens are laid out variable-major: position `p = v * time + t`, so each
variable's series is one contiguous run. Values, time features, positions,
given flags, the pad mask and the variable index all follow this layout.

Each token carries the sum of
* a learned position embedding of its time step,
* a linear projection of its value concatenated with its Time2Vec features,
* a learned "given" embedding (was the value genuinely observed?),

plus a parallel space embedding of its variable.
*/

use core::{fmt, str::FromStr};

use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        Embedding as LookupTable, EmbeddingConfig as LookupTableConfig, Linear, LinearConfig,
    },
    tensor::{Bool, Int, Tensor, backend::Backend},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    ConvBlock, ConvBlockConfig, DataDropout, Error, Time2Vec, Time2VecConfig,
};

/// How observations are split into tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbedMethod {
    /// One token per (time step, variable) plus a space embedding stream
    SpatioTemporal,
    /// One token per time step carrying every variable
    Temporal,
}

impl FromStr for EmbedMethod {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "spatio-temporal" => Ok(Self::SpatioTemporal),
            "temporal" => Ok(Self::Temporal),
            other => Err(Error::InvalidEmbedMethod(other.to_string())),
        }
    }
}

impl fmt::Display for EmbedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpatioTemporal => f.write_str("spatio-temporal"),
            Self::Temporal => f.write_str("temporal"),
        }
    }
}

/// Configuration for the token embedding
#[derive(Config, Debug)]
pub struct EmbeddingConfig {
    /// Number of variables
    pub d_y: usize,
    /// Number of time features
    pub d_x: usize,
    /// Model width
    pub d_model: usize,
    /// Capacity of the position table; must cover every time step
    pub max_seq_len: usize,
    /// Width of each variable's value vector
    #[config(default = "1")]
    pub value_dim: usize,
    /// Time2Vec width per time feature
    #[config(default = "6")]
    pub time_emb_dim: usize,
    /// Tokenization method
    #[config(default = "EmbedMethod::SpatioTemporal")]
    pub method: EmbedMethod,
    /// Number of downsampling blocks (encoder only)
    #[config(default = "0")]
    pub downsample_convs: usize,
    /// Leading decoder time steps whose values are known
    #[config(default = "0")]
    pub start_token_len: usize,
    /// Sentinel marking missing values in the data itself
    #[config(default = "None")]
    pub null_value: Option<f64>,
    /// Sentinel marking padding
    #[config(default = "None")]
    pub pad_value: Option<f64>,
    /// Encoder or decoder side
    #[config(default = "true")]
    pub is_encoder: bool,
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
}

impl EmbeddingConfig {
    /// Initialize a new token embedding
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<Embedding<B>> {
        if self.d_y == 0 || self.d_x == 0 || self.d_model == 0 || self.value_dim == 0 {
            return Err(Error::InvalidConfig(
                "embedding dimensions must be non-zero".into(),
            ));
        }
        if self.max_seq_len == 0 {
            return Err(Error::InvalidConfig("max_seq_len must be non-zero".into()));
        }
        if self.time_emb_dim == 0 {
            return Err(Error::InvalidConfig("time_emb_dim must be non-zero".into()));
        }
        if self.is_encoder && self.start_token_len != 0 {
            return Err(Error::InvalidConfig(format!(
                "start_token_len must be 0 for an encoder embedding, got {}",
                self.start_token_len
            )));
        }

        let time_dim = self.time_emb_dim * self.d_x;
        let time_emb = Time2VecConfig::new(self.d_x, time_dim).init(device)?;

        let local_emb = LookupTableConfig::new(self.max_seq_len, self.d_model).init(device);

        let (value_width, space_emb, split_length_into) = match self.method {
            EmbedMethod::SpatioTemporal => (
                self.value_dim,
                Some(LookupTableConfig::new(self.d_y, self.d_model).init(device)),
                self.d_y,
            ),
            EmbedMethod::Temporal => (self.d_y * self.value_dim, None, 1),
        };
        let val_time_emb =
            LinearConfig::new(value_width + time_emb.embed_dim(), self.d_model).init(device);
        let given_emb = LookupTableConfig::new(2, self.d_model).init(device);

        let downsize_convs = (0..self.downsample_convs)
            .map(|_| ConvBlockConfig::new(split_length_into, self.d_model).init(device))
            .collect();

        Ok(Embedding {
            local_emb,
            time_emb,
            val_time_emb,
            space_emb,
            given_emb,
            downsize_convs,
            method: Ignored(self.method),
            d_y: self.d_y,
            d_x: self.d_x,
            d_model: self.d_model,
            value_dim: self.value_dim,
            max_seq_len: self.max_seq_len,
            start_token_len: self.start_token_len,
            null_value: self.null_value,
            pad_value: self.pad_value,
            is_encoder: self.is_encoder,
            use_val: self.use_val,
            use_time: self.use_time,
            use_space: self.use_space,
            use_given: self.use_given,
        })
    }
}

/// Output of the token embedding
#[derive(Debug, Clone)]
pub struct TokenEmbedding<B: Backend> {
    /// Fused position + value/time + given embedding [`batch`, `tokens`, `d_model`]
    pub tokens: Tensor<B, 3>,
    /// Variable identity embedding [`batch`, `tokens`, `d_model`]
    pub space: Tensor<B, 3>,
    /// Variable of each token [`batch`, `tokens`]; always faithful, even when
    /// the space embedding is switched off. `None` in temporal mode.
    pub var_idx: Option<Tensor<B, 2, Int>>,
    /// True on padding tokens [`batch`, `tokens`]; `None` without a pad sentinel
    pub mask: Option<Tensor<B, 2, Bool>>,
}

/// Token embedding with learned position, value/time, space and given tables
#[derive(Module, Debug)]
pub struct Embedding<B: Backend> {
    /// Position table
    pub local_emb: LookupTable<B>,
    /// Time feature encoder
    pub time_emb: Time2Vec<B>,
    /// Projection of value ++ time features
    pub val_time_emb: Linear<B>,
    /// Variable table (spatio-temporal only)
    pub space_emb: Option<LookupTable<B>>,
    /// Given flag table (row 0 = not given, row 1 = given)
    pub given_emb: LookupTable<B>,
    /// Downsampling blocks
    pub downsize_convs: alloc::vec::Vec<ConvBlock<B>>,
    /// Tokenization method
    pub method: Ignored<EmbedMethod>,
    /// Number of variables
    pub d_y: usize,
    /// Number of time features
    pub d_x: usize,
    /// Model width
    pub d_model: usize,
    /// Width of each value vector
    pub value_dim: usize,
    /// Position table capacity
    pub max_seq_len: usize,
    /// Known leading decoder steps
    pub start_token_len: usize,
    /// Null sentinel
    pub null_value: Option<f64>,
    /// Pad sentinel
    pub pad_value: Option<f64>,
    /// Encoder or decoder side
    pub is_encoder: bool,
    /// Embed values
    pub use_val: bool,
    /// Embed time features
    pub use_time: bool,
    /// Embed variable identity
    pub use_space: bool,
    /// Embed the given flag
    pub use_given: bool,
}

impl<B: Backend> Embedding<B> {
    /// Embed a window of observations
    ///
    /// # Arguments
    /// * `x` - Time features [`batch_size`, `time`, `d_x`], may contain NaN
    /// * `y` - Observations [`batch_size`, `time`, `d_y`, `value_dim`], may contain NaN
    /// * `data_drop` - Regularization applied to the sanitized values
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        y: Tensor<B, 4>,
        data_drop: &dyn DataDropout<B>,
    ) -> crate::Result<TokenEmbedding<B>> {
        self.check_shapes(&x, &y)?;

        match *self.method {
            EmbedMethod::SpatioTemporal => Ok(self.spatio_temporal_embed(x, y, data_drop)),
            EmbedMethod::Temporal => Ok(self.temporal_embed(x, y)),
        }
    }

    /// Padding mask over flattened tokens
    ///
    /// # Arguments
    /// * `y` - Flattened values [`batch_size`, `tokens`, `width`]
    ///
    /// # Returns
    /// * True where any entry of the token's value vector equals the pad
    ///   sentinel, or `None` when no sentinel is configured
    pub fn make_mask(&self, y: Tensor<B, 3>) -> Option<Tensor<B, 2, Bool>> {
        let pad = self.pad_value?;
        let [batch_size, tokens, _] = y.dims();
        Some(y.equal_elem(pad).any_dim(2).reshape([batch_size, tokens]))
    }

    fn check_shapes(&self, x: &Tensor<B, 3>, y: &Tensor<B, 4>) -> crate::Result<()> {
        let [batch_size, time, d_y, value_dim] = y.dims();
        let [x_batch, x_time, d_x] = x.dims();

        if d_y != self.d_y {
            return Err(Error::DimensionMismatch {
                what: "variables",
                expected: self.d_y,
                actual: d_y,
            });
        }
        if value_dim != self.value_dim {
            return Err(Error::DimensionMismatch {
                what: "value_dim",
                expected: self.value_dim,
                actual: value_dim,
            });
        }
        if d_x != self.d_x {
            return Err(Error::DimensionMismatch {
                what: "time features",
                expected: self.d_x,
                actual: d_x,
            });
        }
        if x_batch != batch_size {
            return Err(Error::DimensionMismatch {
                what: "time feature batch",
                expected: batch_size,
                actual: x_batch,
            });
        }
        if x_time != time {
            return Err(Error::DimensionMismatch {
                what: "time feature length",
                expected: time,
                actual: x_time,
            });
        }
        if time > self.max_seq_len {
            return Err(Error::SequenceTooLong {
                len: time,
                max_seq_len: self.max_seq_len,
            });
        }
        Ok(())
    }

    fn spatio_temporal_embed(
        &self,
        x: Tensor<B, 3>,
        y: Tensor<B, 4>,
        data_drop: &dyn DataDropout<B>,
    ) -> TokenEmbedding<B> {
        let device = y.device();
        let [batch_size, time, d_y, _] = y.dims();
        let tokens = d_y * time;

        // position of each token's time step: [0..time, 0..time, ...]
        let local_pos = Tensor::<B, 1, Int>::arange(0..time as i64, &device)
            .reshape([1, time])
            .repeat_dim(0, d_y)
            .reshape([1, tokens])
            .repeat_dim(0, batch_size);
        let local_emb = self.local_emb.forward(local_pos.clone());

        let x = if self.use_time { x } else { x.zeros_like() };
        let x = nan_to_zero(x)
            .unsqueeze_dim::<4>(1)
            .repeat_dim(1, d_y)
            .reshape([batch_size, tokens, self.d_x]);
        let time_emb = self.time_emb.forward(x);

        // NaNs are zeroed for the projection but remembered for the given flag
        let true_null = y.clone().is_nan();
        let y = nan_to_zero(y);
        let y = if self.use_val { y } else { y.zeros_like() };

        let y_original = flatten_tokens(y.clone());
        let y = flatten_tokens(data_drop.apply(y));

        let mut mask = self.make_mask(y.clone());

        let val_time_emb = self
            .val_time_emb
            .forward(Tensor::cat(alloc::vec![time_emb, y.clone()], 2));

        let mut emb = local_emb + val_time_emb;
        if self.use_given {
            let given = self.given_flags(local_pos, flatten_tokens(true_null), y, y_original);
            emb = emb + self.given_emb.forward(given);
        }

        let mut run_length = time;
        if self.is_encoder && !self.downsize_convs.is_empty() {
            for conv in &self.downsize_convs {
                emb = conv.forward(emb);
            }
            run_length = emb.dims()[1] / d_y;
            if mask.take().is_some() {
                warn!("pad mask dropped: it no longer aligns with downsampled tokens");
            }
        }

        let var_idx = Tensor::<B, 1, Int>::arange(0..d_y as i64, &device)
            .reshape([d_y, 1])
            .repeat_dim(1, run_length)
            .reshape([1, d_y * run_length])
            .repeat_dim(0, batch_size);

        let space = match &self.space_emb {
            Some(table) if self.use_space => table.forward(var_idx.clone()),
            _ => Tensor::zeros([batch_size, d_y * run_length, self.d_model], &device),
        };

        TokenEmbedding {
            tokens: emb,
            space,
            var_idx: Some(var_idx),
            mask,
        }
    }

    /// Given flag per token: observed, not a null sentinel, untouched by data
    /// dropout, and (in the decoder) inside the start tokens
    fn given_flags(
        &self,
        positions: Tensor<B, 2, Int>,
        true_null: Tensor<B, 3, Bool>,
        y: Tensor<B, 3>,
        y_original: Tensor<B, 3>,
    ) -> Tensor<B, 2, Int> {
        let [batch_size, tokens, _] = y.dims();
        let collapse = |t: Tensor<B, 3, Bool>| t.any_dim(2).reshape([batch_size, tokens]);

        let mut given = Tensor::<B, 2, Int>::ones([batch_size, tokens], &y.device());

        if !self.is_encoder {
            given = given * positions.lower_elem(self.start_token_len as i64).int();
        }

        given = given * collapse(true_null).bool_not().int();
        given = given * collapse(y.clone().not_equal(y_original)).bool_not().int();

        if let Some(null_value) = self.null_value {
            given = given * collapse(y.equal_elem(null_value)).bool_not().int();
        }

        given
    }

    fn temporal_embed(&self, x: Tensor<B, 3>, y: Tensor<B, 4>) -> TokenEmbedding<B> {
        let device = y.device();
        let [batch_size, time, d_y, value_dim] = y.dims();

        let local_pos = Tensor::<B, 1, Int>::arange(0..time as i64, &device)
            .reshape([1, time])
            .repeat_dim(0, batch_size);
        let local_emb = self.local_emb.forward(local_pos);

        let x = if self.use_time { x } else { x.zeros_like() };
        let time_emb = self.time_emb.forward(nan_to_zero(x));

        let y = nan_to_zero(y);
        let y = if self.use_val { y } else { y.zeros_like() };
        let y = y.reshape([batch_size, time, d_y * value_dim]);

        let mut mask = self.make_mask(y.clone());

        let val_time_emb = self
            .val_time_emb
            .forward(Tensor::cat(alloc::vec![time_emb, y], 2));
        let mut emb = local_emb + val_time_emb;

        if self.is_encoder && !self.downsize_convs.is_empty() {
            for conv in &self.downsize_convs {
                emb = conv.forward(emb);
            }
            if mask.take().is_some() {
                warn!("pad mask dropped: it no longer aligns with downsampled tokens");
            }
        }

        let space = emb.zeros_like();
        TokenEmbedding {
            tokens: emb,
            space,
            var_idx: None,
            mask,
        }
    }
}

/// Flatten [`batch`, `time`, `variables`, `width`] into variable-major tokens
/// [`batch`, `variables * time`, `width`]
pub fn flatten_tokens<B: Backend, K>(t: Tensor<B, 4, K>) -> Tensor<B, 3, K>
where
    K: burn::tensor::BasicOps<B>,
{
    let [batch_size, time, variables, width] = t.dims();
    t.swap_dims(1, 2)
        .reshape([batch_size, variables * time, width])
}

/// Inverse of [`flatten_tokens`]
pub fn unflatten_tokens<B: Backend>(t: Tensor<B, 3>, variables: usize) -> Tensor<B, 4> {
    let [batch_size, tokens, width] = t.dims();
    t.reshape([batch_size, variables, tokens / variables, width])
        .swap_dims(1, 2)
}

fn nan_to_zero<B: Backend, const D: usize>(t: Tensor<B, D>) -> Tensor<B, D> {
    let nan = t.clone().is_nan();
    t.mask_fill(nan, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentityDropout;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = burn_ndarray::NdArray<f32>;

    const BATCH: usize = 2;
    const TIME: usize = 4;
    const VARS: usize = 3;
    const D_MODEL: usize = 8;

    fn config() -> EmbeddingConfig {
        EmbeddingConfig::new(VARS, 2, D_MODEL, 16).with_time_emb_dim(2)
    }

    fn inputs(device: &<TestBackend as Backend>::Device) -> (Tensor<TestBackend, 3>, Tensor<TestBackend, 4>) {
        let x = Tensor::random([BATCH, TIME, 2], Distribution::Default, device);
        let y = Tensor::random([BATCH, TIME, VARS, 1], Distribution::Default, device);
        (x, y)
    }

    fn token(t: &Tensor<TestBackend, 3>, b: usize, p: usize) -> Vec<f32> {
        t.clone()
            .slice([b..b + 1, p..p + 1, 0..D_MODEL])
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    fn table_row(table: &LookupTable<TestBackend>, row: usize) -> Vec<f32> {
        table
            .weight
            .val()
            .slice([row..row + 1, 0..D_MODEL])
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-4, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn test_spatio_temporal_shapes() {
        let device = Default::default();
        let embedding = config().init::<TestBackend>(&device).unwrap();
        let (x, y) = inputs(&device);

        let out = embedding.forward(x, y, &IdentityDropout).unwrap();

        assert_eq!(out.tokens.dims(), [BATCH, TIME * VARS, D_MODEL]);
        assert_eq!(out.space.dims(), [BATCH, TIME * VARS, D_MODEL]);
        assert_eq!(out.var_idx.unwrap().dims(), [BATCH, TIME * VARS]);
        assert!(out.mask.is_none());
    }

    #[test]
    fn test_variable_index_matches_flattened_values() {
        let device = Default::default();
        let embedding = config().init::<TestBackend>(&device).unwrap();

        // y[b, t, v] = 10 * v + t
        let values: Vec<f32> = (0..BATCH * TIME * VARS)
            .map(|i| {
                let v = i % VARS;
                let t = (i / VARS) % TIME;
                (10 * v + t) as f32
            })
            .collect();
        let y = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(values, [BATCH, TIME, VARS, 1]),
            &device,
        );
        let x = Tensor::<TestBackend, 3>::zeros([BATCH, TIME, 2], &device);

        let var_idx = embedding
            .forward(x, y.clone(), &IdentityDropout)
            .unwrap()
            .var_idx
            .unwrap()
            .into_data()
            .to_vec::<i64>()
            .unwrap();
        let flat = flatten_tokens(y).into_data().to_vec::<f32>().unwrap();

        for b in 0..BATCH {
            for p in 0..TIME * VARS {
                let v = var_idx[b * TIME * VARS + p] as usize;
                assert_eq!(v, p / TIME);
                assert_eq!(flat[b * TIME * VARS + p], (10 * v + p % TIME) as f32);
            }
        }
    }

    #[test]
    fn test_ablation_preserves_shape() {
        let device = Default::default();
        let embedding = config().init::<TestBackend>(&device).unwrap();
        let (x, y) = inputs(&device);
        let full = embedding
            .forward(x.clone(), y.clone(), &IdentityDropout)
            .unwrap();

        for ablate in 0..4 {
            let mut ablated = embedding.clone();
            match ablate {
                0 => ablated.use_val = false,
                1 => ablated.use_time = false,
                2 => ablated.use_space = false,
                _ => ablated.use_given = false,
            }
            let out = ablated
                .forward(x.clone(), y.clone(), &IdentityDropout)
                .unwrap();
            assert_eq!(out.tokens.dims(), full.tokens.dims());
            assert_eq!(out.space.dims(), full.space.dims());
        }
    }

    /// Rows `rows` of the value/time projection as [`BATCH`, `rows`, `D_MODEL`]
    fn projection_rows(
        embedding: &Embedding<TestBackend>,
        rows: core::ops::Range<usize>,
    ) -> Tensor<TestBackend, 3> {
        embedding
            .val_time_emb
            .weight
            .val()
            .slice([rows, 0..D_MODEL])
            .unsqueeze::<3>()
            .repeat_dim(0, BATCH)
    }

    #[test]
    fn test_value_ablation_removes_exactly_the_value_projection() {
        let device = Default::default();
        let embedding = config().init::<TestBackend>(&device).unwrap();
        let (x, y) = inputs(&device);
        let time_dim = embedding.time_emb.embed_dim();

        let full = embedding
            .forward(x.clone(), y.clone(), &IdentityDropout)
            .unwrap();
        let mut ablated = embedding.clone();
        ablated.use_val = false;
        let without = ablated.forward(x, y.clone(), &IdentityDropout).unwrap();

        let diff = full.tokens - without.tokens;
        let expected = flatten_tokens(y).matmul(projection_rows(&embedding, time_dim..time_dim + 1));

        assert_close(
            &diff.into_data().to_vec::<f32>().unwrap(),
            &expected.into_data().to_vec::<f32>().unwrap(),
        );
    }

    #[test]
    fn test_time_ablation_removes_exactly_the_time_projection() {
        let device = Default::default();
        let embedding = config().init::<TestBackend>(&device).unwrap();
        let (x, y) = inputs(&device);
        let time_dim = embedding.time_emb.embed_dim();

        let full = embedding
            .forward(x.clone(), y.clone(), &IdentityDropout)
            .unwrap();
        let mut ablated = embedding.clone();
        ablated.use_time = false;
        let without = ablated.forward(x.clone(), y, &IdentityDropout).unwrap();

        // time features repeated per variable, in token order
        let x_tokens = x
            .unsqueeze_dim::<4>(1)
            .repeat_dim(1, VARS)
            .reshape([BATCH, TIME * VARS, 2]);
        let time_shift = embedding.time_emb.forward(x_tokens.clone())
            - embedding.time_emb.forward(x_tokens.zeros_like());
        let expected = time_shift.matmul(projection_rows(&embedding, 0..time_dim));

        let diff = full.tokens - without.tokens;
        assert_close(
            &diff.into_data().to_vec::<f32>().unwrap(),
            &expected.into_data().to_vec::<f32>().unwrap(),
        );
    }

    #[test]
    fn test_given_ablation_removes_exactly_the_given_embedding() {
        let device = Default::default();
        let embedding = config()
            .with_null_value(Some(-99.0))
            .init::<TestBackend>(&device)
            .unwrap();
        let (x, y) = inputs(&device);
        // batch 0: NaN at (t=1, v=2), null sentinel at (t=2, v=0)
        let y = y
            .slice_assign(
                [0..1, 1..2, 2..3, 0..1],
                Tensor::from_floats([[[[f32::NAN]]]], &device),
            )
            .slice_assign(
                [0..1, 2..3, 0..1, 0..1],
                Tensor::from_floats([[[[-99.0]]]], &device),
            );

        let full = embedding
            .forward(x.clone(), y.clone(), &IdentityDropout)
            .unwrap();
        let mut ablated = embedding.clone();
        ablated.use_given = false;
        let without = ablated.forward(x, y, &IdentityDropout).unwrap();

        let diff = full.tokens.clone() - without.tokens;
        let given = table_row(&embedding.given_emb, 1);
        let missing = table_row(&embedding.given_emb, 0);

        let nan_token = 2 * TIME + 1;
        let null_token = 2;
        for p in 0..TIME * VARS {
            let expected = if p == nan_token || p == null_token {
                &missing
            } else {
                &given
            };
            assert_close(&token(&diff, 0, p), expected);
            assert_close(&token(&diff, 1, p), &given);
        }
        assert!(!full.tokens.is_nan().any().into_scalar());
    }

    #[derive(Debug)]
    struct DropFirstVariable;

    impl DataDropout<TestBackend> for DropFirstVariable {
        fn apply(&self, y: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            let [batch_size, time, _, value_dim] = y.dims();
            let zeros = Tensor::zeros([batch_size, time, 1, value_dim], &y.device());
            y.slice_assign([0..batch_size, 0..time, 0..1, 0..value_dim], zeros)
        }
    }

    #[test]
    fn test_dropped_values_are_not_given() {
        let device = Default::default();
        let embedding = config().init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 3>::zeros([BATCH, TIME, 2], &device);
        let y = Tensor::<TestBackend, 4>::ones([BATCH, TIME, VARS, 1], &device);

        let full = embedding
            .forward(x.clone(), y.clone(), &DropFirstVariable)
            .unwrap();
        let mut ablated = embedding.clone();
        ablated.use_given = false;
        let without = ablated.forward(x, y, &DropFirstVariable).unwrap();

        let diff = full.tokens - without.tokens;
        for p in 0..TIME * VARS {
            let row = if p < TIME { 0 } else { 1 };
            assert_close(&token(&diff, 0, p), &table_row(&embedding.given_emb, row));
        }
    }

    #[test]
    fn test_decoder_targets_are_not_given() {
        let device = Default::default();
        let embedding = config()
            .with_is_encoder(false)
            .with_start_token_len(2)
            .init::<TestBackend>(&device)
            .unwrap();
        let (x, y) = inputs(&device);

        let full = embedding
            .forward(x.clone(), y.clone(), &IdentityDropout)
            .unwrap();
        let mut ablated = embedding.clone();
        ablated.use_given = false;
        let without = ablated.forward(x, y, &IdentityDropout).unwrap();

        let diff = full.tokens - without.tokens;
        for p in 0..TIME * VARS {
            let row = if p % TIME < 2 { 1 } else { 0 };
            assert_close(&token(&diff, 1, p), &table_row(&embedding.given_emb, row));
        }
    }

    #[test]
    fn test_space_disabled_keeps_true_index() {
        let device = Default::default();
        let embedding = config()
            .with_use_space(false)
            .init::<TestBackend>(&device)
            .unwrap();
        let (x, y) = inputs(&device);

        let out = embedding.forward(x, y, &IdentityDropout).unwrap();

        assert_eq!(out.space.abs().sum().into_scalar(), 0.0);
        let var_idx = out.var_idx.unwrap().into_data().to_vec::<i64>().unwrap();
        assert_eq!(var_idx[TIME * VARS - 1], (VARS - 1) as i64);
    }

    #[test]
    fn test_pad_mask_marks_exact_positions() {
        let device = Default::default();
        let embedding = config()
            .with_pad_value(Some(-1.0))
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 3>::zeros([1, TIME, 2], &device);
        let y = Tensor::<TestBackend, 4>::ones([1, TIME, VARS, 1], &device).slice_assign(
            [0..1, 3..4, 1..2, 0..1],
            Tensor::from_floats([[[[-1.0]]]], &device),
        );

        let mask = embedding
            .forward(x, y, &IdentityDropout)
            .unwrap()
            .mask
            .unwrap()
            .into_data()
            .to_vec::<bool>()
            .unwrap();

        let pad_token = TIME + 3;
        for (p, masked) in mask.iter().enumerate() {
            assert_eq!(*masked, p == pad_token);
        }
    }

    #[test]
    fn test_no_pad_value_means_no_mask() {
        let device = Default::default();
        let embedding = config().init::<TestBackend>(&device).unwrap();
        let y = Tensor::<TestBackend, 3>::zeros([1, 5, 1], &device);

        assert!(embedding.make_mask(y).is_none());
    }

    #[test]
    fn test_sequence_longer_than_table_is_rejected() {
        let device = Default::default();
        let embedding = EmbeddingConfig::new(VARS, 2, D_MODEL, 3)
            .init::<TestBackend>(&device)
            .unwrap();
        let (x, y) = inputs(&device);

        let result = embedding.forward(x, y, &IdentityDropout);

        assert!(matches!(
            result,
            Err(Error::SequenceTooLong {
                len: TIME,
                max_seq_len: 3
            })
        ));
    }

    #[test]
    fn test_downsampling_shrinks_each_variable_run() {
        let device = Default::default();
        let embedding = config()
            .with_downsample_convs(1)
            .with_pad_value(Some(-1.0))
            .init::<TestBackend>(&device)
            .unwrap();
        let (x, y) = inputs(&device);

        let out = embedding.forward(x, y, &IdentityDropout).unwrap();
        let half = TIME / 2;

        assert_eq!(out.tokens.dims(), [BATCH, VARS * half, D_MODEL]);
        assert_eq!(out.space.dims(), [BATCH, VARS * half, D_MODEL]);
        let var_idx = out.var_idx.unwrap().into_data().to_vec::<i64>().unwrap();
        for (p, v) in var_idx.iter().take(VARS * half).enumerate() {
            assert_eq!(*v as usize, p / half);
        }
        assert!(out.mask.is_none());
    }

    #[test]
    fn test_temporal_method() {
        let device = Default::default();
        let embedding = config()
            .with_method(EmbedMethod::Temporal)
            .init::<TestBackend>(&device)
            .unwrap();
        let (x, y) = inputs(&device);

        let out = embedding.forward(x, y, &IdentityDropout).unwrap();

        assert_eq!(out.tokens.dims(), [BATCH, TIME, D_MODEL]);
        assert!(out.var_idx.is_none());
        assert_eq!(out.space.abs().sum().into_scalar(), 0.0);
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let device = Default::default();
        let embedding = config().init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 3>::zeros([BATCH, TIME, 2], &device);
        let y = Tensor::<TestBackend, 4>::zeros([BATCH, TIME, VARS + 1, 1], &device);

        assert!(matches!(
            embedding.forward(x, y, &IdentityDropout),
            Err(Error::DimensionMismatch { what: "variables", .. })
        ));
    }

    #[test]
    fn test_embed_method_parsing() {
        assert_eq!(
            "spatio-temporal".parse::<EmbedMethod>().unwrap(),
            EmbedMethod::SpatioTemporal
        );
        assert_eq!("temporal".parse::<EmbedMethod>().unwrap(), EmbedMethod::Temporal);
        assert!(matches!(
            "spatial".parse::<EmbedMethod>(),
            Err(Error::InvalidEmbedMethod(_))
        ));
    }

    #[test]
    fn test_encoder_rejects_start_tokens() {
        let device = Default::default();
        let result = config().with_start_token_len(2).init::<TestBackend>(&device);

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
