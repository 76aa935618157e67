use ndarray::{ArrayD, ArrayViewMutD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{Result, flatten::MomentumFlattener};

/// The persistent state of a single parameter, its momentum lives in the `MomentumFlattener`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    /// The amount of optimizer steps that updated this parameter.
    pub step: u64,
    pub exp_avg_sq: ArrayD<f32>,
    /// The second moment rebuilt from the reduced momentum while compressing.
    pub exp_avg_sq_back: ArrayD<f32>,
    /// The smoothed warm-up trust ratio, frozen once compression starts.
    pub lamb_coeff_freeze: f32,
    pub last_factor: f32,
}

impl ParameterState {
    /// Creates a new `ParameterState` for a parameter of the given shape.
    pub fn new(shape: &[usize]) -> Self {
        Self {
            step: 0,
            exp_avg_sq: ArrayD::zeros(IxDyn(shape)),
            exp_avg_sq_back: ArrayD::zeros(IxDyn(shape)),
            lamb_coeff_freeze: 0.,
            last_factor: 1.,
        }
    }

    /// Resets the trust ratio smoothing to its identity values.
    pub fn reset_smoothing(&mut self) {
        self.lamb_coeff_freeze = 0.;
        self.last_factor = 1.;
    }
}

/// A parameter's state together with a mutable view of its momentum.
#[derive(Debug)]
pub struct StateEntry<'a> {
    pub state: &'a mut ParameterState,
    pub momentum: ArrayViewMutD<'a, f32>,
}

/// Owns the state of every parameter, addressed by group and parameter index.
#[derive(Debug)]
pub struct ParameterStateStore {
    states: Vec<Vec<Option<ParameterState>>>,
    momentum: MomentumFlattener,
}

impl ParameterStateStore {
    /// Creates a new `ParameterStateStore` with no state yet.
    ///
    /// # Arguments
    /// * `shapes` - The shape of every parameter, by group.
    /// * `world_size` - The amount of ranks the fused momentum is split across.
    ///
    /// # Returns
    /// A new `ParameterStateStore` instance.
    pub fn new(shapes: Vec<Vec<Vec<usize>>>, world_size: usize) -> Self {
        let states = shapes.iter().map(|group| vec![None; group.len()]).collect();

        Self {
            states,
            momentum: MomentumFlattener::new(shapes, world_size),
        }
    }

    /// Returns the state of a parameter, if it was ever stepped.
    pub fn get(&self, group: usize, param: usize) -> Option<&ParameterState> {
        self.states[group][param].as_ref()
    }

    /// Returns the state and momentum of a parameter, initializing the state on first access.
    ///
    /// # Arguments
    /// * `group` - The index of the parameter's group.
    /// * `param` - The index of the parameter inside its group.
    ///
    /// # Returns
    /// The parameter's entry or a layout error if its momentum view cannot be built.
    pub fn get_or_init(&mut self, group: usize, param: usize) -> Result<StateEntry<'_>> {
        let shape = self.momentum.shape(group, param);
        let state = self.states[group][param].get_or_insert_with(|| ParameterState::new(shape));
        let momentum = self.momentum.view_mut(group, param)?;

        Ok(StateEntry { state, momentum })
    }

    pub fn momentum(&self) -> &MomentumFlattener {
        &self.momentum
    }

    pub fn momentum_mut(&mut self) -> &mut MomentumFlattener {
        &mut self.momentum
    }

    /// Returns the largest step counter across every parameter, 0 if none was stepped.
    pub fn max_step(&self) -> u64 {
        self.iter().map(|state| state.step).max().unwrap_or(0)
    }

    /// Returns whether any parameter holds state.
    pub fn has_state(&self) -> bool {
        self.iter().next().is_some()
    }

    /// Iterates over every initialized state.
    pub fn iter(&self) -> impl Iterator<Item = &ParameterState> {
        self.states.iter().flatten().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ParameterState> {
        self.states.iter_mut().flatten().flatten()
    }

    /// Replaces every state and momentum, leaving the momentum detached.
    ///
    /// # Arguments
    /// * `states` - The state of every parameter, `None` for parameters never stepped.
    /// * `momentum` - The momentum of every parameter.
    pub fn restore(
        &mut self,
        states: Vec<Vec<Option<ParameterState>>>,
        momentum: Vec<Vec<ArrayD<f32>>>,
    ) {
        self.states = states;
        self.momentum.replace(momentum);
    }
}
