/*!
# Data dropout policies

Regularization applied to observed values before they are embedded. A dropped
value is set to zero, which the embedding detects by comparing against the
pre-dropout copy and then flags as not given.
*/

use burn::{
    config::Config,
    tensor::{Distribution, Tensor, TensorData, backend::Backend},
};
use rand::Rng;

/// Strategy that degrades a value tensor [`batch`, `time`, `variables`, `value_dim`]
pub trait DataDropout<B: Backend>: core::fmt::Debug {
    /// Return the (possibly) degraded values, same shape as the input
    fn apply(&self, y: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Leaves values untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDropout;

impl<B: Backend> DataDropout<B> for IdentityDropout {
    fn apply(&self, y: Tensor<B, 4>) -> Tensor<B, 4> {
        y
    }
}

/// Configuration for [`ReconstructionDropout`]
#[derive(Config, Debug)]
pub struct ReconstructionDropoutConfig {
    /// Probability of dropping every variable at a time step
    #[config(default = "0.05")]
    pub drop_full_timesteps: f64,
    /// Probability of dropping an individual value
    #[config(default = "0.2")]
    pub drop_standard: f64,
    /// Probability of starting a dropped run for a variable
    #[config(default = "0.1")]
    pub drop_seq: f64,
    /// Longest dropped run
    #[config(default = "5")]
    pub drop_max_seq_len: usize,
    /// Probability that a sample skips dropout entirely
    #[config(default = "1.0")]
    pub skip_all_drop: f64,
}

impl ReconstructionDropoutConfig {
    /// Initialize the policy
    pub fn init(&self) -> ReconstructionDropout {
        ReconstructionDropout {
            config: self.clone(),
        }
    }
}

/// Masks values in three ways (single elements, whole time steps, contiguous
/// runs per variable) so the encoder learns to reconstruct missing context
#[derive(Debug, Clone)]
pub struct ReconstructionDropout {
    config: ReconstructionDropoutConfig,
}

impl ReconstructionDropout {
    /// Per-(batch, variable) run mask with 0.0 on dropped time steps,
    /// laid out as [`batch`, `time`, `variables`, 1]
    fn sequence_mask(&self, batch: usize, time: usize, variables: usize) -> Vec<f32> {
        let mut mask = vec![1.0f32; batch * time * variables];
        if self.config.drop_seq <= 0.0 || self.config.drop_max_seq_len == 0 || time == 0 {
            return mask;
        }

        let mut rng = rand::thread_rng();
        for b in 0..batch {
            for v in 0..variables {
                if !rng.gen_bool(self.config.drop_seq.min(1.0)) {
                    continue;
                }
                let run = rng.gen_range(1..=self.config.drop_max_seq_len.min(time));
                let start = rng.gen_range(0..=time - run);
                for t in start..start + run {
                    mask[(b * time + t) * variables + v] = 0.0;
                }
            }
        }
        mask
    }
}

impl<B: Backend> DataDropout<B> for ReconstructionDropout {
    fn apply(&self, y: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.config.skip_all_drop >= 1.0 {
            return y;
        }

        let device = y.device();
        let [batch, time, variables, value_dim] = y.dims();

        let keep = |p: f64| Distribution::Bernoulli((1.0 - p).clamp(0.0, 1.0));

        let full_timestep_mask = Tensor::<B, 4>::random(
            [batch, time, 1, 1],
            keep(self.config.drop_full_timesteps),
            &device,
        );
        let standard_mask = Tensor::<B, 4>::random(
            [batch, time, variables, value_dim],
            keep(self.config.drop_standard),
            &device,
        );
        let seq_mask = Tensor::<B, 4>::from_data(
            TensorData::new(
                self.sequence_mask(batch, time, variables),
                [batch, time, variables, 1],
            ),
            &device,
        );
        let skip_mask = Tensor::<B, 4>::random(
            [batch, 1, 1, 1],
            Distribution::Bernoulli(self.config.skip_all_drop.clamp(0.0, 1.0)),
            &device,
        );

        let mask = (full_timestep_mask * standard_mask * seq_mask + skip_mask).clamp(0.0, 1.0);
        y * mask
    }
}
