//! Flow-matching Euler scheduler.
//!
//! Stateless: the schedule is computed once per session and every `step`
//! takes an explicit index into it, so the driver decides which iteration
//! runs.

use candle_core::{DType, Tensor};

use crate::config::{SchedulerConfig, ShiftBounds, ShiftInterpolation};
use crate::error::{PipelineError, Result};

/// Sigmas and timesteps for one session.
///
/// `sigmas` carries a trailing terminal zero, so it is one longer than
/// `timesteps`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestepSchedule {
    pub sigmas: Vec<f64>,
    pub timesteps: Vec<f64>,
}

impl TimestepSchedule {
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }
}

/// Default sigmas: `steps` values evenly spaced from 1.0 down to `1/steps`.
pub fn linear_sigmas(steps: usize) -> Vec<f64> {
    if steps == 0 {
        return Vec::new();
    }
    let end = 1.0 / steps as f64;
    if steps == 1 {
        return vec![1.0];
    }
    let span = (end - 1.0) / (steps - 1) as f64;
    let mut sigmas: Vec<f64> = (0..steps).map(|i| 1.0 + span * i as f64).collect();
    sigmas[steps - 1] = end;
    sigmas
}

/// `mu` grows linearly with the image sequence length between the bounds.
pub fn calculate_shift(image_seq_len: usize, bounds: &ShiftBounds) -> f64 {
    let m = (bounds.max_shift - bounds.base_shift)
        / (bounds.max_image_seq_len - bounds.base_image_seq_len) as f64;
    let b = bounds.base_shift - m * bounds.base_image_seq_len as f64;
    image_seq_len as f64 * m + b
}

/// Log-space variant: interpolates `ln(shift)` and clamps to the bounds.
pub fn calculate_shift_log_linear(image_seq_len: usize, bounds: &ShiftBounds) -> f64 {
    let t = (image_seq_len as f64 - bounds.base_image_seq_len as f64)
        / (bounds.max_image_seq_len - bounds.base_image_seq_len) as f64;
    let t = t.clamp(0.0, 1.0);
    let log_base = bounds.base_shift.ln();
    let log_max = bounds.max_shift.ln();
    log_base + (log_max - log_base) * t
}

/// Exponential time shift: `e^mu / (e^mu + (1/t - 1))`.
pub fn time_shift(mu: f64, t: f64) -> f64 {
    if t <= 0.0 {
        return 0.0;
    }
    let e = mu.exp();
    e / (e + (1.0 / t - 1.0))
}

#[derive(Debug, Clone)]
pub struct FlowMatchEulerScheduler {
    config: SchedulerConfig,
}

impl FlowMatchEulerScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Computes `mu` for a packed image sequence of `image_seq_len` tokens.
    pub fn calculate_mu(&self, image_seq_len: usize) -> Result<f64> {
        let bounds = self.config.shift_bounds()?;
        Ok(match self.config.shift_interpolation {
            ShiftInterpolation::Linear => calculate_shift(image_seq_len, &bounds),
            ShiftInterpolation::LogLinear => calculate_shift_log_linear(image_seq_len, &bounds),
        })
    }

    /// Builds the schedule from caller sigmas.
    ///
    /// With dynamic shifting the sigmas go through [`time_shift`] with `mu`,
    /// which must then be provided; otherwise the static `shift` applies.
    pub fn set_timesteps(&self, sigmas: &[f64], mu: Option<f64>) -> Result<TimestepSchedule> {
        if sigmas.is_empty() {
            return Err(PipelineError::validation("sigmas must not be empty"));
        }
        let shifted: Vec<f64> = if self.config.use_dynamic_shifting {
            let mu = mu.ok_or_else(|| {
                PipelineError::config("dynamic shifting is enabled but no mu was computed")
            })?;
            sigmas.iter().map(|&s| time_shift(mu, s)).collect()
        } else {
            let shift = self.config.shift;
            sigmas
                .iter()
                .map(|&s| shift * s / (1.0 + (shift - 1.0) * s))
                .collect()
        };

        let scale = self.config.num_train_timesteps as f64;
        let timesteps = shifted.iter().map(|s| s * scale).collect();
        let mut sigmas = shifted;
        sigmas.push(0.0);
        Ok(TimestepSchedule { sigmas, timesteps })
    }

    /// One Euler step: `x + (sigma[i+1] - sigma[i]) * v`.
    ///
    /// Computed in f32 and returned in the dtype of `model_output`.
    pub fn step(
        &self,
        schedule: &TimestepSchedule,
        step_index: usize,
        model_output: &Tensor,
        sample: &Tensor,
    ) -> candle_core::Result<Tensor> {
        if step_index + 1 >= schedule.sigmas.len() {
            candle_core::bail!(
                "step index {step_index} outside schedule of {} steps",
                schedule.len()
            );
        }
        let dt = schedule.sigmas[step_index + 1] - schedule.sigmas[step_index];
        let sample = sample.to_dtype(DType::F32)?;
        let velocity = model_output.to_dtype(DType::F32)?;
        let prev = (sample + (velocity * dt)?)?;
        prev.to_dtype(model_output.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn linear_sigmas_shape() {
        for steps in [1usize, 2, 4, 28, 40] {
            let sigmas = linear_sigmas(steps);
            assert_eq!(sigmas.len(), steps);
            assert_eq!(sigmas[0], 1.0);
            assert_eq!(*sigmas.last().unwrap(), 1.0 / steps as f64);
            assert!(sigmas.windows(2).all(|w| w[0] >= w[1]));
        }
        assert!(linear_sigmas(0).is_empty());
    }

    #[test]
    fn mu_matches_reference_values() {
        let bounds = SchedulerConfig::dev().shift_bounds().unwrap();
        assert!((calculate_shift(256, &bounds) - 0.5).abs() < 1e-12);
        assert!((calculate_shift(4096, &bounds) - 1.15).abs() < 1e-12);
        // 512x512 -> 32x32 packed tokens
        let mu = calculate_shift(1024, &bounds);
        assert!(mu > 0.5 && mu < 1.15);
    }

    #[test]
    fn log_linear_mu_clamps_and_exponentiates_to_bounds() {
        let bounds = SchedulerConfig::dev().shift_bounds().unwrap();
        let lo = calculate_shift_log_linear(16, &bounds);
        let hi = calculate_shift_log_linear(100_000, &bounds);
        assert!((lo.exp() - 0.5).abs() < 1e-12);
        assert!((hi.exp() - 1.15).abs() < 1e-12);
    }

    #[test]
    fn calculate_mu_requires_bounds() {
        let scheduler = FlowMatchEulerScheduler::new(SchedulerConfig {
            max_shift: None,
            ..SchedulerConfig::dev()
        });
        assert!(matches!(
            scheduler.calculate_mu(1024),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn dynamic_schedule_is_monotone_with_terminal_zero() {
        let scheduler = FlowMatchEulerScheduler::new(SchedulerConfig::dev());
        let mu = scheduler.calculate_mu(2304).unwrap();
        let schedule = scheduler.set_timesteps(&linear_sigmas(40), Some(mu)).unwrap();
        assert_eq!(schedule.len(), 40);
        assert_eq!(schedule.sigmas.len(), 41);
        assert_eq!(*schedule.sigmas.last().unwrap(), 0.0);
        assert!((schedule.sigmas[0] - 1.0).abs() < 1e-12);
        assert!(schedule.sigmas.windows(2).all(|w| w[0] >= w[1]));
        for (t, s) in schedule.timesteps.iter().zip(&schedule.sigmas) {
            assert!((t - s * 1000.0).abs() < 1e-9);
        }
    }

    #[test]
    fn static_shift_of_one_is_identity() {
        let scheduler = FlowMatchEulerScheduler::new(SchedulerConfig::schnell());
        let sigmas = linear_sigmas(4);
        let schedule = scheduler.set_timesteps(&sigmas, None).unwrap();
        for (a, b) in schedule.sigmas.iter().zip(&sigmas) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn dynamic_schedule_without_mu_is_config_error() {
        let scheduler = FlowMatchEulerScheduler::new(SchedulerConfig::dev());
        let err = scheduler.set_timesteps(&[1.0, 0.5], None).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn euler_step_moves_along_velocity() {
        let device = Device::Cpu;
        let scheduler = FlowMatchEulerScheduler::new(SchedulerConfig::schnell());
        let schedule = scheduler.set_timesteps(&[1.0, 0.5], None).unwrap();
        let sample = Tensor::ones((1, 4, 8), DType::F32, &device).unwrap();
        let velocity = Tensor::full(2f32, (1, 4, 8), &device).unwrap();

        let first = scheduler.step(&schedule, 0, &velocity, &sample).unwrap();
        // 1 + (0.5 - 1.0) * 2 = 0
        let values: Vec<f32> = first.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.abs() < 1e-6));

        let second = scheduler.step(&schedule, 1, &velocity, &sample).unwrap();
        let values: Vec<f32> = second.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.abs() < 1e-6));

        assert!(scheduler.step(&schedule, 2, &velocity, &sample).is_err());
    }

    #[test]
    fn euler_step_keeps_model_dtype() {
        let device = Device::Cpu;
        let scheduler = FlowMatchEulerScheduler::new(SchedulerConfig::schnell());
        let schedule = scheduler.set_timesteps(&[1.0], None).unwrap();
        let sample = Tensor::zeros((1, 2), DType::BF16, &device).unwrap();
        let velocity = Tensor::ones((1, 2), DType::BF16, &device).unwrap();
        let out = scheduler.step(&schedule, 0, &velocity, &sample).unwrap();
        assert_eq!(out.dtype(), DType::BF16);
    }
}
