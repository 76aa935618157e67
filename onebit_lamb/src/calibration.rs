use log::info;
use ndarray::ArrayViewD;
use serde::{Deserialize, Serialize};

use crate::{Result, flatten::MomentumFlattener, trust_ratio::l2_norm};

/// The per-parameter factors equalizing every momentum's share of the compression error.
///
/// Empty until calibrated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScalingCoeffs(Vec<Vec<f32>>);

impl ScalingCoeffs {
    pub fn new(coeffs: Vec<Vec<f32>>) -> Self {
        Self(coeffs)
    }

    /// Returns the coefficient of a parameter.
    pub fn get(&self, group: usize, param: usize) -> f32 {
        self.0[group][param]
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Vec<f32>] {
        &self.0
    }

    /// Returns whether there is exactly one coefficient per parameter.
    pub fn matches(&self, shapes: &[Vec<Vec<usize>>]) -> bool {
        self.0.len() == shapes.len()
            && self
                .0
                .iter()
                .zip(shapes)
                .all(|(coeffs, group)| coeffs.len() == group.len())
    }
}

/// Returns the root mean square of a momentum, `||m|| / sqrt(len)`.
pub fn momentum_magnitude(momentum: &ArrayViewD<'_, f32>) -> f32 {
    if momentum.is_empty() {
        return 0.;
    }

    l2_norm(momentum) / (momentum.len() as f32).sqrt()
}

/// Turns momentum magnitudes into scaling coefficients.
///
/// Every coefficient is `united_scale / magnitude`, where `united_scale` is the mean of
/// every magnitude. A zero magnitude gets a neutral coefficient of 1.
///
/// # Arguments
/// * `magnitudes` - The magnitude of every momentum, by group.
///
/// # Returns
/// The united scale and the coefficients.
pub fn scaling_coeffs(magnitudes: &[Vec<f32>]) -> (f32, ScalingCoeffs) {
    let count: usize = magnitudes.iter().map(Vec::len).sum();
    let total: f32 = magnitudes.iter().flatten().sum();
    let united_scale = if count == 0 { 0. } else { total / count as f32 };

    let coeffs = magnitudes
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|&magnitude| {
                    if magnitude == 0. {
                        1.
                    } else {
                        united_scale / magnitude
                    }
                })
                .collect()
        })
        .collect();

    (united_scale, ScalingCoeffs(coeffs))
}

/// Computes the scaling coefficients of the current momentum.
pub fn calibrate(momentum: &MomentumFlattener) -> Result<ScalingCoeffs> {
    let magnitudes = momentum
        .shapes()
        .iter()
        .enumerate()
        .map(|(i, group)| {
            (0..group.len())
                .map(|j| Ok(momentum_magnitude(&momentum.view(i, j)?)))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<Vec<f32>>>>()?;

    let (united_scale, coeffs) = scaling_coeffs(&magnitudes);
    info!(united_scale = united_scale; "momentum scaling coefficients calibrated");

    Ok(coeffs)
}
