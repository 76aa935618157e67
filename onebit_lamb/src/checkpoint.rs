use std::io::{Read, Write};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{Result, calibration::ScalingCoeffs, config::GroupOptions, state::ParameterState};

/// The persisted state of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub step: u64,
    pub exp_avg: ArrayD<f32>,
    pub exp_avg_sq: ArrayD<f32>,
    pub exp_avg_sq_back: ArrayD<f32>,
    pub lamb_coeff_freeze: f32,
    pub last_factor: f32,
}

impl StateRecord {
    /// Creates a new `StateRecord` from a parameter's state and momentum.
    pub fn new(state: &ParameterState, exp_avg: ArrayD<f32>) -> Self {
        Self {
            step: state.step,
            exp_avg,
            exp_avg_sq: state.exp_avg_sq.clone(),
            exp_avg_sq_back: state.exp_avg_sq_back.clone(),
            lamb_coeff_freeze: state.lamb_coeff_freeze,
            last_factor: state.last_factor,
        }
    }

    /// Splits the record into the parameter's state and its momentum.
    pub fn into_parts(self) -> (ParameterState, ArrayD<f32>) {
        let state = ParameterState {
            step: self.step,
            exp_avg_sq: self.exp_avg_sq,
            exp_avg_sq_back: self.exp_avg_sq_back,
            lamb_coeff_freeze: self.lamb_coeff_freeze,
            last_factor: self.last_factor,
        };

        (state, self.exp_avg)
    }
}

/// The compression-stage state, only present in checkpoints taken while compressing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub worker_error: Vec<f32>,
    pub server_error: Vec<f32>,
    pub scaling_coeffs: ScalingCoeffs,
}

/// A snapshot of an optimizer taken between two steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub groups: Vec<GroupOptions>,
    /// Indexed by group and parameter, `None` for parameters never stepped.
    pub state: Vec<Vec<Option<StateRecord>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionRecord>,
}

impl Checkpoint {
    /// Returns the largest step counter of any parameter.
    pub fn step(&self) -> u64 {
        self.state
            .iter()
            .flatten()
            .flatten()
            .map(|record| record.step)
            .max()
            .unwrap_or(0)
    }

    /// Writes the checkpoint as json.
    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Reads a checkpoint written by `save`.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;
    use crate::{LambErr, config::LambConfig};

    fn record(step: u64) -> StateRecord {
        StateRecord {
            step,
            exp_avg: arr1(&[0.5, -0.25]).into_dyn(),
            exp_avg_sq: arr1(&[1e-3, 2e-3]).into_dyn(),
            exp_avg_sq_back: arr1(&[0., 0.]).into_dyn(),
            lamb_coeff_freeze: 0.75,
            last_factor: 1.,
        }
    }

    #[test]
    fn step_is_the_largest_counter() {
        let checkpoint = Checkpoint {
            groups: vec![LambConfig::default().group_options(); 2],
            state: vec![vec![Some(record(3)), None], vec![Some(record(7))]],
            compression: None,
        };

        assert_eq!(checkpoint.step(), 7);
    }

    #[test]
    fn json_keeps_every_field() {
        let checkpoint = Checkpoint {
            groups: vec![LambConfig::default().group_options()],
            state: vec![vec![Some(record(4)), None]],
            compression: Some(CompressionRecord {
                worker_error: vec![0.125; 8],
                server_error: vec![-0.5; 8],
                scaling_coeffs: ScalingCoeffs::new(vec![vec![1.5, 1.]]),
            }),
        };

        let mut buf = Vec::new();
        checkpoint.save(&mut buf).unwrap();
        let loaded = Checkpoint::load(buf.as_slice()).unwrap();

        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn warmup_checkpoints_omit_the_compression_state() {
        let checkpoint = Checkpoint {
            groups: vec![LambConfig::default().group_options()],
            state: vec![vec![None]],
            compression: None,
        };

        let json = serde_json::to_string(&checkpoint).unwrap();
        assert!(!json.contains("compression"));
        assert_eq!(Checkpoint::load(json.as_bytes()).unwrap(), checkpoint);
    }

    #[test]
    fn garbage_is_a_serde_error() {
        let err = Checkpoint::load(&b"{\"groups\": 3}"[..]).unwrap_err();
        assert!(matches!(err, LambErr::Serde(_)));
    }
}
