use serde::{Deserialize, Serialize};

use crate::{
    LambErr, Result,
    param::{ParamGroup, Parameter},
};

/// Immutable hyperparameters of a 1-bit Lamb run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambConfig {
    pub lr: f32,
    /// The step at which warm-up ends and compressed communication starts.
    pub freeze_step: u64,
    pub bias_correction: bool,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    pub max_coeff: f32,
    pub min_coeff: f32,
    pub amsgrad: bool,
    /// Smoothing of the warm-up trust ratio, `1 / (1 - coeff_beta)` should not exceed `freeze_step`.
    pub coeff_beta: f32,
    pub factor_max: f32,
    pub factor_min: f32,
    pub factor_threshold: f32,
    /// The device handed to the reduction backend.
    pub local_rank: usize,
}

impl Default for LambConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            freeze_step: 100_000,
            bias_correction: true,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.,
            max_coeff: 10.,
            min_coeff: 0.01,
            amsgrad: false,
            coeff_beta: 0.99,
            factor_max: 4.5,
            factor_min: 0.5,
            factor_threshold: 0.1,
            local_rank: 0,
        }
    }
}

impl LambConfig {
    /// Checks every hyperparameter.
    ///
    /// # Returns
    /// A `LambErr::Config` naming the first invalid value, AMSGrad is always rejected.
    pub fn validate(&self) -> Result<()> {
        if self.amsgrad {
            return Err(config_err("1-bit Lamb does not support the AMSGrad variant"));
        }

        if self.freeze_step == 0 {
            return Err(config_err("freeze_step must be greater than 0"));
        }

        if !(0. ..1.).contains(&self.coeff_beta) {
            return Err(config_err(format!(
                "coeff_beta must be in [0, 1), got {}",
                self.coeff_beta
            )));
        }

        if self.factor_min > self.factor_max {
            return Err(config_err(format!(
                "factor_min ({}) cannot exceed factor_max ({})",
                self.factor_min, self.factor_max
            )));
        }

        // The rate limiter starts from a factor of 1.
        if !(self.factor_min..=self.factor_max).contains(&1.) {
            return Err(config_err(format!(
                "[factor_min, factor_max] = [{}, {}] must contain 1",
                self.factor_min, self.factor_max
            )));
        }

        if self.factor_threshold < 0. {
            return Err(config_err(format!(
                "factor_threshold must not be negative, got {}",
                self.factor_threshold
            )));
        }

        self.group_options().validate()
    }

    /// The per-group hyperparameters every group starts with.
    pub fn group_options(&self) -> GroupOptions {
        GroupOptions {
            lr: self.lr,
            betas: self.betas,
            eps: self.eps,
            weight_decay: self.weight_decay,
            bias_correction: self.bias_correction,
            max_coeff: self.max_coeff,
            min_coeff: self.min_coeff,
        }
    }

    /// Creates a `ParamGroup` using this configuration's defaults.
    ///
    /// # Arguments
    /// * `params` - The parameters of the group.
    ///
    /// # Returns
    /// A new `ParamGroup` instance.
    pub fn group(&self, params: Vec<Parameter>) -> ParamGroup {
        ParamGroup::new(params, self.group_options())
    }
}

/// Hyperparameters shared by the parameters of a group.
///
/// `bias_correction` is kept for the group and persisted in checkpoints, the moment
/// estimates are used uncorrected since the compression stage divides by the raw
/// second moment frozen at the end of warm-up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupOptions {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    pub bias_correction: bool,
    pub max_coeff: f32,
    pub min_coeff: f32,
}

impl GroupOptions {
    /// Checks the group's hyperparameters.
    pub fn validate(&self) -> Result<()> {
        if self.lr <= 0. {
            return Err(config_err(format!("lr must be positive, got {}", self.lr)));
        }

        if self.eps <= 0. {
            return Err(config_err(format!("eps must be positive, got {}", self.eps)));
        }

        let (b1, b2) = self.betas;
        if !(0. ..1.).contains(&b1) || !(0. ..1.).contains(&b2) {
            return Err(config_err(format!(
                "betas must be in [0, 1), got ({b1}, {b2})"
            )));
        }

        if self.weight_decay < 0. {
            return Err(config_err(format!(
                "weight_decay must not be negative, got {}",
                self.weight_decay
            )));
        }

        if self.min_coeff > self.max_coeff {
            return Err(config_err(format!(
                "min_coeff ({}) cannot exceed max_coeff ({})",
                self.min_coeff, self.max_coeff
            )));
        }

        Ok(())
    }
}

fn config_err(detail: impl Into<String>) -> LambErr {
    LambErr::Config(detail.into())
}
