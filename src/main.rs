/*!
Multivariate sine forecasting with the spatiotemporal transformer

Trains on synthetic phase-shifted sine waves with warmup + plateau learning
rate scheduling and reports validation metrics per epoch.
*/

use anyhow::Result;
use burn::{
    module::AutodiffModule,
    optim::{AdamWConfig, GradientsParams, Optimizer},
    tensor::{Tensor, TensorData, backend::Backend},
};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use rand::Rng;
use stformer::{
    Batch, EpochSummary, StFormerConfig, StepMetrics, WarmupReduceLrOnPlateauConfig,
};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

type MyBackend = Autodiff<NdArray<f32>>;
type EvalBackend = NdArray<f32>;

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Hyperparameters
    let d_y = 4;
    let context_len = 24;
    let target_len = 8;
    let batch_size = 16;
    let train_batches = 20;
    let val_batches = 4;
    let num_epochs = 5;
    let l2_coeff = 1e-6;

    let device = Default::default();

    let config = StFormerConfig::new(d_y, 1, 64)
        .with_d_model(32)
        .with_d_ff(64)
        .with_n_heads(4)
        .with_e_layers(2)
        .with_d_layers(2)
        .with_time_emb_dim(4)
        .with_start_token_len(4)
        .with_recon_mask_skip_all(0.5);
    let mut model = config.init::<MyBackend>(&device)?;

    // the last two target steps only count in validation
    let forecaster = config
        .forecaster()
        .with_recon_loss_imp(0.5)
        .with_time_masked_idx(Some(target_len - 2))
        .init::<MyBackend>()
        .with_data_dropout(config.data_dropout());
    let evaluator = forecaster.config().init::<EvalBackend>();
    let mut scheduler = WarmupReduceLrOnPlateauConfig::new()
        .with_init_lr(1e-6)
        .with_peak_lr(1e-3)
        .with_warmup_steps(40)
        .init()?;
    let mut optim = AdamWConfig::new().with_weight_decay(l2_coeff).init();

    let mut rng = rand::thread_rng();

    for epoch in 0..num_epochs {
        let mut train_steps: Vec<StepMetrics> = Vec::with_capacity(train_batches);
        for _ in 0..train_batches {
            let batch = sine_batch::<MyBackend>(&mut rng, batch_size, context_len, target_len, d_y, &device);

            let out = forecaster.step(&model, &batch, true)?;
            train_steps.push(out.metrics);

            let grads = GradientsParams::from_grads(out.loss.backward(), &model);
            model = optim.step(scheduler.lr(), model, grads);
            scheduler.per_step_advance();
        }

        let valid_model = model.valid();
        let mut val_steps: Vec<StepMetrics> = Vec::with_capacity(val_batches);
        for _ in 0..val_batches {
            let batch = sine_batch::<EvalBackend>(&mut rng, batch_size, context_len, target_len, d_y, &device);
            val_steps.push(evaluator.step(&valid_model, &batch, false)?.metrics);
        }

        let train = EpochSummary::from_steps(&train_steps);
        let val = EpochSummary::from_steps(&val_steps);
        if let Some(val_loss) = val.forecast_loss {
            scheduler.per_epoch_advance(val_loss)?;
        }

        info!(
            epoch = epoch + 1,
            train_loss = train.loss.unwrap_or_default(),
            train_acc = train.acc.unwrap_or(-1.0),
            train_recon = train.recon_loss.unwrap_or(-1.0),
            val_forecast_loss = val.forecast_loss.unwrap_or_default(),
            val_mae = val.mae.unwrap_or_default(),
            val_smape = val.smape.unwrap_or_default(),
            lr = scheduler.lr(),
            "epoch complete"
        );
    }

    info!("training complete");
    Ok(())
}

/// Phase-shifted sine waves with a shared time feature
fn sine_batch<B: Backend>(
    rng: &mut impl Rng,
    batch_size: usize,
    context_len: usize,
    target_len: usize,
    d_y: usize,
    device: &B::Device,
) -> Batch<B> {
    let total = context_len + target_len;
    let mut x = Vec::with_capacity(batch_size * total);
    let mut y = Vec::with_capacity(batch_size * total * d_y);

    for _ in 0..batch_size {
        let offset: f32 = rng.gen_range(0.0..100.0);
        let phases: Vec<f32> = (0..d_y).map(|_| rng.gen_range(0.0..core::f32::consts::TAU)).collect();
        for t in 0..total {
            let time = offset + t as f32 * 0.25;
            x.push(time / 100.0);
            for (v, phase) in phases.iter().enumerate() {
                let noise: f32 = rng.gen_range(-0.05..0.05);
                y.push((time * (1.0 + v as f32 * 0.5) + phase).sin() + noise);
            }
        }
    }

    let x = Tensor::<B, 3>::from_data(TensorData::new(x, [batch_size, total, 1]), device);
    let y = Tensor::<B, 3>::from_data(TensorData::new(y, [batch_size, total, d_y]), device);

    let x_c = x.clone().slice([0..batch_size, 0..context_len, 0..1]);
    let x_t = x.slice([0..batch_size, context_len..total, 0..1]);
    let y_c = y.clone().slice([0..batch_size, 0..context_len, 0..d_y]);
    let y_t = y.slice([0..batch_size, context_len..total, 0..d_y]);

    Batch::from_series(x_c, y_c, x_t, y_t)
}
