/*!
# Warmup + reduce-on-plateau learning rate

The rate climbs linearly from `init_lr` to `peak_lr` over `warmup_steps`
optimizer steps, then holds and is multiplied by `factor` whenever the
validation metric fails to improve for `patience` consecutive epochs.

Optimizer steps and epoch ends are separate events: only
[`ScheduleEvent::Step`] advances warmup, only [`ScheduleEvent::EpochEnd`]
feeds the plateau detector.
*/

use burn::config::Config;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Error;

/// Configuration for [`WarmupReduceLrOnPlateau`]
#[derive(Config, Debug)]
pub struct WarmupReduceLrOnPlateauConfig {
    /// Rate at step 0
    #[config(default = "1e-10")]
    pub init_lr: f64,
    /// Rate reached at the end of warmup
    #[config(default = "5e-4")]
    pub peak_lr: f64,
    /// Optimizer steps spent warming up
    #[config(default = "1000")]
    pub warmup_steps: usize,
    /// Multiplier applied on a plateau
    #[config(default = "0.8")]
    pub factor: f64,
    /// Non-improving epochs tolerated before a reduction
    #[config(default = "3")]
    pub patience: usize,
    /// Relative improvement needed to count as better
    #[config(default = "1e-4")]
    pub threshold: f64,
    /// Floor for the rate
    #[config(default = "0.0")]
    pub min_lr: f64,
}

impl WarmupReduceLrOnPlateauConfig {
    /// Initialize the scheduler
    pub fn init(&self) -> crate::Result<WarmupReduceLrOnPlateau> {
        if !(self.peak_lr > 0.0) || self.init_lr < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "learning rates must satisfy init_lr >= 0 and peak_lr > 0, got {} and {}",
                self.init_lr, self.peak_lr
            )));
        }
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "plateau factor must be in (0, 1), got {}",
                self.factor
            )));
        }

        let (phase, lr) = if self.warmup_steps == 0 {
            (SchedulePhase::Plateau, self.peak_lr)
        } else {
            (SchedulePhase::Warmup, self.init_lr)
        };

        Ok(WarmupReduceLrOnPlateau {
            config: self.clone(),
            phase,
            lr,
            step: 0,
            best: None,
            bad_epochs: 0,
        })
    }
}

/// Phase of the schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePhase {
    /// Linear ramp towards the peak rate
    Warmup,
    /// Peak rate, reduced on validation plateaus
    Plateau,
}

/// Signal driving the schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleEvent {
    /// One optimizer step (every training batch)
    Step,
    /// End of an epoch with the aggregated validation metric
    EpochEnd(f64),
}

/// Linear warmup followed by reduce-on-plateau
#[derive(Debug, Clone)]
pub struct WarmupReduceLrOnPlateau {
    config: WarmupReduceLrOnPlateauConfig,
    phase: SchedulePhase,
    lr: f64,
    step: usize,
    best: Option<f64>,
    bad_epochs: usize,
}

impl WarmupReduceLrOnPlateau {
    /// Current learning rate
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Current phase
    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    /// Optimizer steps taken during warmup
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Best validation metric seen so far
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Epochs since the last improvement
    pub fn bad_epochs(&self) -> usize {
        self.bad_epochs
    }

    /// Advance after an optimizer step
    pub fn per_step_advance(&mut self) -> f64 {
        self.warmup_step();
        self.lr
    }

    /// Advance at the end of an epoch
    pub fn per_epoch_advance(&mut self, validation_metric: f64) -> crate::Result<f64> {
        self.advance(ScheduleEvent::EpochEnd(validation_metric))
    }

    /// Feed one event and return the resulting learning rate
    pub fn advance(&mut self, event: ScheduleEvent) -> crate::Result<f64> {
        match (self.phase, event) {
            (_, ScheduleEvent::Step) => self.warmup_step(),
            (_, ScheduleEvent::EpochEnd(metric)) if !metric.is_finite() => {
                return Err(Error::InvalidMetric(metric));
            }
            (SchedulePhase::Warmup, ScheduleEvent::EpochEnd(_)) => {}
            (SchedulePhase::Plateau, ScheduleEvent::EpochEnd(metric)) => {
                self.observe(metric);
            }
        }
        Ok(self.lr)
    }

    fn warmup_step(&mut self) {
        if self.phase != SchedulePhase::Warmup {
            return;
        }

        let cfg = &self.config;
        self.step += 1;
        if self.step >= cfg.warmup_steps {
            self.lr = cfg.peak_lr;
            self.phase = SchedulePhase::Plateau;
            info!(steps = self.step, lr = self.lr, "warmup complete");
        } else {
            let rate = (cfg.peak_lr - cfg.init_lr) / cfg.warmup_steps as f64;
            self.lr = cfg.init_lr + rate * self.step as f64;
        }
    }

    fn observe(&mut self, metric: f64) {
        let improved = match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.config.threshold),
        };

        if improved {
            self.best = Some(metric);
            self.bad_epochs = 0;
            return;
        }

        self.bad_epochs += 1;
        if self.bad_epochs >= self.config.patience {
            let reduced = (self.lr * self.config.factor).max(self.config.min_lr);
            if reduced < self.lr {
                info!(from = self.lr, to = reduced, "validation plateau, reducing learning rate");
                self.lr = reduced;
            }
            self.bad_epochs = 0;
        }
    }
}
