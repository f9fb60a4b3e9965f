/*!
# Loss orchestration

Runs a forward pass and combines three objectives:

* forecast loss: masked regression on the target window,
* reconstruction loss: masked regression on the context window,
* classification loss: cross-entropy recovering each encoder token's variable.

`loss = forecast + class_loss_imp * class + recon_loss_imp * recon`

Objectives switched off by configuration are reported with sentinels
(`recon_loss = -1`, `recon_mask = 0`, `class_loss = 0`, `acc = -1`) and take no
part in the total.
*/

use alloc::collections::BTreeMap;

use burn::{
    config::Config,
    nn::loss::CrossEntropyLossConfig,
    tensor::{ElementConversion, Int, Tensor, backend::Backend},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Batch, DataDropout, EmbedMethod, Error, ForecastModel, IdentityDropout};

/// Regression loss used for forecast and reconstruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// Mean squared error
    Mse,
    /// Mean absolute error
    Mae,
    /// Symmetric mean absolute percentage error
    Smape,
}

/// Configuration for the loss orchestrator
#[derive(Config, Debug)]
pub struct ForecasterConfig {
    /// Tokenization method of the model
    #[config(default = "EmbedMethod::SpatioTemporal")]
    pub embed_method: EmbedMethod,
    /// Weight of the variable classification loss
    #[config(default = "1e-3")]
    pub class_loss_imp: f64,
    /// Weight of the reconstruction loss
    #[config(default = "0.0")]
    pub recon_loss_imp: f64,
    /// Regression loss
    #[config(default = "LossKind::Mse")]
    pub loss: LossKind,
    /// Null sentinel excluded from regression targets
    #[config(default = "None")]
    pub null_value: Option<f64>,
    /// Target time steps from this index on are ignored during training
    #[config(default = "None")]
    pub time_masked_idx: Option<usize>,
}

impl ForecasterConfig {
    /// Initialize the orchestrator with the identity data dropout
    pub fn init<B: Backend>(&self) -> Forecaster<B> {
        Forecaster {
            config: self.clone(),
            data_drop: alloc::boxed::Box::new(IdentityDropout),
        }
    }
}

/// Named scalar metrics of one step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Weighted total
    pub loss: f64,
    /// Forecast loss
    pub forecast_loss: f64,
    /// Classification loss, 0 when not computed
    pub class_loss: f64,
    /// Reconstruction loss, -1 when not computed
    pub recon_loss: f64,
    /// Fraction of context entries in the reconstruction loss, 0 when not computed
    pub recon_mask: f64,
    /// Classification accuracy, -1 when not computed
    pub acc: f64,
    /// Masked forecast MSE
    pub mse: f64,
    /// Masked forecast MAE
    pub mae: f64,
    /// Masked forecast sMAPE
    pub smape: f64,
}

impl StepMetrics {
    /// Metrics keyed by name, as handed to the trainer
    pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("loss", self.loss),
            ("forecast_loss", self.forecast_loss),
            ("class_loss", self.class_loss),
            ("recon_loss", self.recon_loss),
            ("recon_mask", self.recon_mask),
            ("acc", self.acc),
            ("mse", self.mse),
            ("mae", self.mae),
            ("smape", self.smape),
        ])
    }

    /// Whether the reconstruction loss was computed
    pub fn has_recon(&self) -> bool {
        self.recon_loss >= 0.0
    }

    /// Whether the classification loss was computed
    pub fn has_class(&self) -> bool {
        self.acc >= 0.0
    }
}

/// Result of [`Forecaster::step`]
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// Differentiable weighted total
    pub loss: Tensor<B, 1>,
    /// Forecast [`batch`, `target_len`, `d_y`, `value_dim`]
    pub forecast: Tensor<B, 4>,
    /// Entries of the target that counted towards the forecast loss
    pub forecast_mask: Tensor<B, 4>,
    /// Scalar metrics
    pub metrics: StepMetrics,
}

/// Per-objective losses before weighting
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    /// Forecast loss
    pub forecast_loss: Tensor<B, 1>,
    /// Forecast output
    pub forecast: Tensor<B, 4>,
    /// Forecast mask
    pub forecast_mask: Tensor<B, 4>,
    /// Reconstruction loss and mask, when enabled
    pub recon: Option<(Tensor<B, 1>, Tensor<B, 4>)>,
    /// Classification loss and accuracy, when enabled
    pub class: Option<(Tensor<B, 1>, f64)>,
}

/// Computes and combines the training objectives
#[derive(Debug)]
pub struct Forecaster<B: Backend> {
    config: ForecasterConfig,
    data_drop: alloc::boxed::Box<dyn DataDropout<B>>,
}

impl<B: Backend> Forecaster<B> {
    /// Use `policy` on the context values of training steps
    pub fn with_data_dropout(mut self, policy: impl DataDropout<B> + 'static) -> Self {
        self.data_drop = alloc::boxed::Box::new(policy);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    /// Run one training or evaluation step
    ///
    /// Training applies the data dropout policy and the time mask;
    /// evaluation uses neither. Layer dropout and batch norm follow the
    /// backend, so evaluate a `model.valid()` copy with a forecaster on the
    /// inner backend for deterministic results.
    pub fn step<M: ForecastModel<B>>(
        &self,
        model: &M,
        batch: &Batch<B>,
        train: bool,
    ) -> crate::Result<StepOutput<B>> {
        let (time_mask, data_drop): (Option<usize>, &dyn DataDropout<B>) = if train {
            (self.config.time_masked_idx, self.data_drop.as_ref())
        } else {
            (None, &IdentityDropout)
        };

        let losses = self.compute_loss(model, batch, time_mask, data_drop)?;

        let mut loss = losses.forecast_loss.clone();
        if let Some((class_loss, _)) = &losses.class {
            loss = loss + class_loss.clone().mul_scalar(self.config.class_loss_imp);
        }
        if let Some((recon_loss, _)) = &losses.recon {
            loss = loss + recon_loss.clone().mul_scalar(self.config.recon_loss_imp);
        }

        let (recon_loss, recon_mask) = match &losses.recon {
            Some((recon_loss, mask)) => (scalar(recon_loss.clone()), scalar(mask.clone().mean())),
            None => (-1.0, 0.0),
        };
        let (class_loss, acc) = match &losses.class {
            Some((class_loss, acc)) => (scalar(class_loss.clone()), *acc),
            None => (0.0, -1.0),
        };

        let target = batch.y_t.clone();
        let mask = losses.forecast_mask.clone();
        let metrics = StepMetrics {
            loss: scalar(loss.clone()),
            forecast_loss: scalar(losses.forecast_loss.clone()),
            class_loss,
            recon_loss,
            recon_mask,
            acc,
            mse: scalar(masked_loss(LossKind::Mse, losses.forecast.clone(), target.clone(), mask.clone())),
            mae: scalar(masked_loss(LossKind::Mae, losses.forecast.clone(), target.clone(), mask.clone())),
            smape: scalar(masked_loss(LossKind::Smape, losses.forecast.clone(), target, mask)),
        };
        debug!(
            train,
            loss = metrics.loss,
            forecast_loss = metrics.forecast_loss,
            class_loss = metrics.class_loss,
            recon_loss = metrics.recon_loss,
            acc = metrics.acc,
            "step"
        );

        Ok(StepOutput {
            loss,
            forecast: losses.forecast,
            forecast_mask: losses.forecast_mask,
            metrics,
        })
    }

    /// Forward pass and unweighted objectives
    pub fn compute_loss<M: ForecastModel<B>>(
        &self,
        model: &M,
        batch: &Batch<B>,
        time_mask: Option<usize>,
        data_drop: &dyn DataDropout<B>,
    ) -> crate::Result<LossBreakdown<B>> {
        let out = model.forward_pass(batch, data_drop)?;

        check_same_dims("forecast", out.forecast.dims(), batch.y_t.dims())?;
        let (forecast_loss, forecast_mask) =
            self.forecasting_loss(out.forecast.clone(), batch.y_t.clone(), time_mask);

        let recon = if self.config.recon_loss_imp > 0.0 {
            check_same_dims("reconstruction", out.recon.dims(), batch.y_c.dims())?;
            Some(self.forecasting_loss(out.recon, batch.y_c.clone(), None))
        } else {
            None
        };

        let wants_class = self.config.embed_method == EmbedMethod::SpatioTemporal
            && self.config.class_loss_imp > 0.0;
        let class = match (&out.class_logits, &out.class_labels) {
            (Some(logits), Some(labels)) if wants_class => {
                Some(self.classification_loss(logits.clone(), labels.clone())?)
            }
            _ if wants_class => {
                return Err(Error::InvalidConfig(
                    "classification loss requested but the model produced no variable logits"
                        .into(),
                ));
            }
            _ => None,
        };

        Ok(LossBreakdown {
            forecast_loss,
            forecast: out.forecast,
            forecast_mask,
            recon,
            class,
        })
    }

    /// Masked regression loss against `target`
    ///
    /// # Arguments
    /// * `outputs` - Predictions [`batch`, `time`, `d_y`, `value_dim`]
    /// * `target` - Ground truth, same shape; NaN and null entries are excluded
    /// * `time_mask` - Time steps from this index on are excluded
    ///
    /// # Returns
    /// * Loss and the 0/1 mask it was computed over
    pub fn forecasting_loss(
        &self,
        outputs: Tensor<B, 4>,
        target: Tensor<B, 4>,
        time_mask: Option<usize>,
    ) -> (Tensor<B, 1>, Tensor<B, 4>) {
        let device = target.device();
        let [_, time, _, _] = target.dims();

        let mut mask = target.clone().is_nan().bool_not().float();
        if let Some(null_value) = self.config.null_value {
            mask = mask * target.clone().not_equal_elem(null_value).float();
        }
        if let Some(idx) = time_mask {
            let keep = Tensor::<B, 1, Int>::arange(0..time as i64, &device)
                .lower_elem(idx as i64)
                .float()
                .reshape([1, time, 1, 1]);
            mask = mask * keep;
        }

        let loss = masked_loss(self.config.loss, outputs, target, mask.clone());
        (loss, mask)
    }

    /// Cross-entropy and accuracy of variable classification
    ///
    /// # Arguments
    /// * `logits` - [`batch`, `tokens`, `classes`]
    /// * `labels` - [`batch`, `tokens`] variable indices
    pub fn classification_loss(
        &self,
        logits: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
    ) -> crate::Result<(Tensor<B, 1>, f64)> {
        let [batch_size, tokens, classes] = logits.dims();
        check_same_dims("classification labels", labels.dims(), [batch_size, tokens])?;

        let n = batch_size * tokens;
        let labels = labels.reshape([n]);
        let max_label: i64 = labels.clone().max().into_scalar().elem();
        let label_space = (max_label + 1) as usize;
        if label_space != classes {
            return Err(Error::DimensionMismatch {
                what: "classifier output",
                expected: label_space,
                actual: classes,
            });
        }

        let logits = logits.reshape([n, classes]);
        let class_loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), labels.clone());

        let correct: i64 = logits
            .argmax(1)
            .reshape([n])
            .equal(labels)
            .int()
            .sum()
            .into_scalar()
            .elem();

        Ok((class_loss, correct as f64 / n as f64))
    }
}

/// Averages of a run of steps, ignoring sentinel values
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Steps aggregated
    pub steps: usize,
    /// Mean weighted loss
    pub loss: Option<f64>,
    /// Mean forecast loss
    pub forecast_loss: Option<f64>,
    /// Mean classification loss over steps that computed it
    pub class_loss: Option<f64>,
    /// Mean reconstruction loss over steps that computed it
    pub recon_loss: Option<f64>,
    /// Mean accuracy over steps that computed it
    pub acc: Option<f64>,
    /// Mean forecast MSE
    pub mse: Option<f64>,
    /// Mean forecast MAE
    pub mae: Option<f64>,
    /// Mean forecast sMAPE
    pub smape: Option<f64>,
}

impl EpochSummary {
    /// Aggregate step metrics
    pub fn from_steps(steps: &[StepMetrics]) -> Self {
        let mean = |values: alloc::vec::Vec<f64>| {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };
        let all = |f: fn(&StepMetrics) -> f64| mean(steps.iter().map(f).collect());

        Self {
            steps: steps.len(),
            loss: all(|m| m.loss),
            forecast_loss: mean_forecast_loss(steps),
            class_loss: mean(steps.iter().filter(|m| m.has_class()).map(|m| m.class_loss).collect()),
            recon_loss: mean(steps.iter().filter(|m| m.has_recon()).map(|m| m.recon_loss).collect()),
            acc: mean(steps.iter().filter(|m| m.has_class()).map(|m| m.acc).collect()),
            mse: all(|m| m.mse),
            mae: all(|m| m.mae),
            smape: all(|m| m.smape),
        }
    }
}

/// Mean forecast loss of an evaluation pass, the metric fed to the scheduler
pub fn mean_forecast_loss(steps: &[StepMetrics]) -> Option<f64> {
    if steps.is_empty() {
        return None;
    }
    Some(steps.iter().map(|m| m.forecast_loss).sum::<f64>() / steps.len() as f64)
}

fn masked_loss<B: Backend>(
    kind: LossKind,
    outputs: Tensor<B, 4>,
    target: Tensor<B, 4>,
    mask: Tensor<B, 4>,
) -> Tensor<B, 1> {
    // NaN targets are masked out, but NaN * 0 would still poison the sum
    let nan = target.clone().is_nan();
    let target = target.mask_fill(nan, 0.0);

    let diff = outputs.clone() - target.clone();
    let err = match kind {
        LossKind::Mse => diff.powf_scalar(2.0),
        LossKind::Mae => diff.abs(),
        LossKind::Smape => {
            let denom = (outputs.abs() + target.abs()).clamp_min(1e-8);
            diff.abs().mul_scalar(2.0) / denom
        }
    };

    (err * mask.clone()).sum() / mask.sum().clamp_min(1.0)
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}

fn check_same_dims<const D: usize>(
    what: &'static str,
    actual: [usize; D],
    expected: [usize; D],
) -> crate::Result<()> {
    for (a, e) in actual.iter().zip(expected.iter()) {
        if a != e {
            return Err(Error::DimensionMismatch {
                what,
                expected: *e,
                actual: *a,
            });
        }
    }
    Ok(())
}
