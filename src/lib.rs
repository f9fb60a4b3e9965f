/*!
# stformer: spatiotemporal transformer forecasting

Multivariate time series forecasting with an encoder-decoder transformer
whose tokens are individual (time step, variable) pairs, so attention can
relate any variable at any time to any other.

## Components

- **Embedding**: value, Time2Vec time, position, variable and given-flag
  embeddings, with optional convolutional downsampling of the context
- **SequenceModel**: transformer encoder-decoder with forecast,
  reconstruction and variable classification heads
- **Forecaster**: masked forecast, reconstruction and classification losses
- **WarmupReduceLrOnPlateau**: linear warmup followed by reduce-on-plateau

## Example

```rust,no_run
use burn::backend::NdArray;
use stformer::{ForecasterConfig, StFormerConfig};

type Backend = NdArray;

let device = Default::default();
let config = StFormerConfig::new(7, 4, 128)
    .with_d_model(64)
    .with_start_token_len(8);

let model = config.init::<Backend>(&device).unwrap();
let forecaster = ForecasterConfig::new()
    .init::<Backend>()
    .with_data_dropout(config.data_dropout());
```
*/

extern crate alloc;

mod conv_block;
mod data_dropout;
mod embedding;
mod error;
mod forecaster;
mod model;
mod scheduler;
mod sequence;
mod time2vec;

pub use conv_block::{ConvBlock, ConvBlockConfig};
pub use data_dropout::{
    DataDropout, IdentityDropout, ReconstructionDropout, ReconstructionDropoutConfig,
};
pub use embedding::{
    EmbedMethod, Embedding, EmbeddingConfig, TokenEmbedding, flatten_tokens, unflatten_tokens,
};
pub use error::{Error, Result};
pub use forecaster::{
    EpochSummary, Forecaster, ForecasterConfig, LossBreakdown, LossKind, StepMetrics,
    StepOutput, mean_forecast_loss,
};
pub use model::{Batch, ForecastModel, StFormer, StFormerConfig};
pub use scheduler::{
    ScheduleEvent, SchedulePhase, WarmupReduceLrOnPlateau, WarmupReduceLrOnPlateauConfig,
};
pub use sequence::{SequenceModel, SequenceModelConfig, SequenceOutput};
pub use time2vec::{Time2Vec, Time2VecConfig};

pub const VERSION: &str = "0.1.0";
