//! The 1-bit Lamb optimizer.
//!
//! Training starts with uncompressed Lamb steps. Once any parameter reaches
//! `freeze_step` the trust ratio is frozen, the momentum of every parameter is fused
//! into a single buffer and averaged across ranks through a 1-bit compressed
//! all-reduce, and a correction factor derived from the reduced momentum keeps the
//! frozen trust ratio in check.

mod calibration;
mod checkpoint;
mod config;
mod error;
mod flatten;
mod optimizer;
mod param;
mod state;
mod switch;
mod trust_ratio;

pub use calibration::{ScalingCoeffs, calibrate, momentum_magnitude, scaling_coeffs};
pub use checkpoint::{Checkpoint, CompressionRecord, StateRecord};
pub use config::{GroupOptions, LambConfig};
pub use error::{LambErr, Result};
pub use flatten::{FusedMomentum, MomentumFlattener, alignment, divider};
pub use optimizer::{GradientOverrides, OnebitLamb, Phase};
pub use param::{Gradient, ParamGroup, Parameter, SparseGradient};
pub use state::{ParameterState, ParameterStateStore, StateEntry};
pub use switch::BackwardAllreduce;
pub use trust_ratio::{FactorBounds, LambTrustRatioEngine, l2_norm, trust_ratio};
