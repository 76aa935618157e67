use log::warn;
use ndarray::{ArrayBase, ArrayD, ArrayViewMutD, Data, Dimension, IxDyn, Zip};

use crate::{
    config::{GroupOptions, LambConfig},
    state::StateEntry,
};

/// The bounds of the compression-stage correction factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorBounds {
    pub min: f32,
    pub max: f32,
    /// The largest relative change allowed between two consecutive factors.
    pub threshold: f32,
}

impl FactorBounds {
    /// Clamps a raw factor to `[min, max]` and then to `last * (1 ± threshold)`.
    ///
    /// # Arguments
    /// * `raw` - The factor computed for this step.
    /// * `last` - The factor applied on the previous step.
    ///
    /// # Returns
    /// The factor to apply and store for the next step.
    pub fn limit(&self, raw: f32, last: f32) -> f32 {
        let mut factor = raw;

        if factor > self.max {
            factor = self.max;
        }
        if factor < self.min {
            factor = self.min;
        }

        let upper = last * (1. + self.threshold);
        let lower = last * (1. - self.threshold);
        if factor > upper {
            factor = upper;
        }
        if factor < lower {
            factor = lower;
        }

        factor
    }
}

/// Computes the per-parameter Lamb update in both phases of a run.
#[derive(Debug, Clone)]
pub struct LambTrustRatioEngine {
    coeff_beta: f32,
    freeze_step: u64,
    bounds: FactorBounds,
}

impl LambTrustRatioEngine {
    /// Creates a new `LambTrustRatioEngine`.
    ///
    /// Warns if the trust ratio smoothing cannot settle before `freeze_step`.
    ///
    /// # Arguments
    /// * `config` - The run's hyperparameters.
    ///
    /// # Returns
    /// A new `LambTrustRatioEngine` instance.
    pub fn new(config: &LambConfig) -> Self {
        let horizon = 1. / (1. - config.coeff_beta);
        if horizon > config.freeze_step as f32 {
            warn!(
                coeff_beta = config.coeff_beta,
                freeze_step = config.freeze_step;
                "trust ratio smoothing horizon of {horizon:.0} steps exceeds the warm-up"
            );
        }

        Self {
            coeff_beta: config.coeff_beta,
            freeze_step: config.freeze_step,
            bounds: FactorBounds {
                min: config.factor_min,
                max: config.factor_max,
                threshold: config.factor_threshold,
            },
        }
    }

    pub fn bounds(&self) -> FactorBounds {
        self.bounds
    }

    /// Applies an uncompressed Lamb step to a parameter.
    ///
    /// The entry's step counter must already count this step.
    ///
    /// # Arguments
    /// * `options` - The hyperparameters of the parameter's group.
    /// * `entry` - The parameter's state and momentum.
    /// * `param` - The parameter to update.
    /// * `grad` - The parameter's gradient.
    ///
    /// # Returns
    /// The trust ratio applied to the update.
    pub fn warmup(
        &self,
        options: &GroupOptions,
        entry: StateEntry<'_>,
        param: &mut ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> f32 {
        let StateEntry {
            state,
            mut momentum,
        } = entry;
        let (beta1, beta2) = options.betas;

        Self::local_momentum(beta1, &mut momentum, grad);
        state
            .exp_avg_sq
            .zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1. - beta2) * g * g);

        if state.step == self.freeze_step {
            state.exp_avg_sq_back = state.exp_avg_sq.clone();
        }

        let mut update = preliminary_update(&momentum, &state.exp_avg_sq, options.eps);
        if options.weight_decay > 0. {
            update.scaled_add(options.weight_decay, param);
        }

        let coeff = trust_ratio(
            l2_norm(param),
            l2_norm(&update),
            options.min_coeff,
            options.max_coeff,
        );

        if coeff != 1. {
            state.lamb_coeff_freeze =
                self.coeff_beta * state.lamb_coeff_freeze + (1. - self.coeff_beta) * coeff;
        }

        param.scaled_add(-options.lr * coeff, &update);
        coeff
    }

    /// Folds a gradient into a momentum, `m = beta1 * m + (1 - beta1) * grad`.
    pub fn local_momentum(beta1: f32, momentum: &mut ArrayViewMutD<'_, f32>, grad: &ArrayD<f32>) {
        momentum.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1. - beta1) * g);
    }

    /// Applies a compressed Lamb step to a parameter.
    ///
    /// The entry's momentum must already hold the reduced, unscaled and masked momentum.
    ///
    /// # Arguments
    /// * `options` - The hyperparameters of the parameter's group.
    /// * `entry` - The parameter's state and momentum.
    /// * `previous` - The parameter's momentum before this step's local update.
    /// * `param` - The parameter to update.
    ///
    /// # Returns
    /// The trust ratio applied to the update.
    pub fn compression(
        &self,
        options: &GroupOptions,
        entry: StateEntry<'_>,
        previous: &ArrayD<f32>,
        param: &mut ArrayD<f32>,
    ) -> f32 {
        let StateEntry { state, momentum } = entry;
        let (beta1, beta2) = options.betas;
        let eps = options.eps;

        let reconstructed = Zip::from(&momentum)
            .and(previous)
            .map_collect(|&m, &prev| (m - prev * beta1) / (1. - beta1));
        state
            .exp_avg_sq_back
            .zip_mut_with(&reconstructed, |v, &g| *v = beta2 * *v + (1. - beta2) * g * g);

        let mut update = preliminary_update(&momentum, &state.exp_avg_sq, eps);
        let prelim_norm = l2_norm(&update);

        let mut factor = Zip::from(&state.exp_avg_sq)
            .and(&state.exp_avg_sq_back)
            .fold(f32::NEG_INFINITY, |acc, &v, &back| {
                acc.max((v.sqrt() + eps) / (back.sqrt() + eps))
            });

        if options.weight_decay > 0. {
            update.scaled_add(options.weight_decay, param);

            let update_norm = l2_norm(&update);
            let update_ratio = if update_norm == 0. {
                1.
            } else {
                (prelim_norm / update_norm).min(1.)
            };
            factor = factor * update_ratio + (1. - update_ratio);
        }

        let factor = self.bounds.limit(factor, state.last_factor);
        state.last_factor = factor;

        let coeff = state.lamb_coeff_freeze * factor;
        param.scaled_add(-options.lr * coeff, &update);
        coeff
    }
}

/// Computes `momentum / (sqrt(exp_avg_sq) + eps)`.
fn preliminary_update<S, T>(
    momentum: &ArrayBase<S, IxDyn>,
    exp_avg_sq: &ArrayBase<T, IxDyn>,
    eps: f32,
) -> ArrayD<f32>
where
    S: Data<Elem = f32>,
    T: Data<Elem = f32>,
{
    Zip::from(momentum)
        .and(exp_avg_sq)
        .map_collect(|&m, &v| m / (v.sqrt() + eps))
}

/// Returns `weight_norm / update_norm` clamped to `[min_coeff, max_coeff]`, or 1 if either norm is 0.
pub fn trust_ratio(weight_norm: f32, update_norm: f32, min_coeff: f32, max_coeff: f32) -> f32 {
    if weight_norm == 0. || update_norm == 0. {
        return 1.;
    }

    let mut coeff = weight_norm / update_norm;
    if coeff > max_coeff {
        coeff = max_coeff;
    }
    if coeff < min_coeff {
        coeff = min_coeff;
    }

    coeff
}

/// Returns the euclidean norm of every element in `array`.
pub fn l2_norm<S, D>(array: &ArrayBase<S, D>) -> f32
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    array.iter().map(|x| x * x).sum::<f32>().sqrt()
}
