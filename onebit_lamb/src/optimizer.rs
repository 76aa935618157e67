use std::io::{Read, Write};

use comms::CompressedBackend;
use log::{debug, info};
use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::{
    LambErr, Result,
    calibration::{ScalingCoeffs, calibrate},
    checkpoint::{Checkpoint, CompressionRecord, StateRecord},
    config::LambConfig,
    param::{Gradient, ParamGroup, Parameter},
    state::{ParameterState, ParameterStateStore},
    switch::BackwardAllreduce,
    trust_ratio::LambTrustRatioEngine,
};

/// Gradients overriding the ones stored in the parameters, by group and parameter.
///
/// A `None` entry falls back to the parameter's own gradient.
pub type GradientOverrides<'a> = &'a [Vec<Option<Gradient>>];

/// The synchronization stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Uncompressed Lamb steps, the training loop all-reduces raw gradients.
    Warmup,
    /// Momentum is averaged through the compressed backend, the trust ratio stays frozen.
    Compression,
}

/// The state that only lives while compressing, emptied whenever the fused layout is rebuilt.
#[derive(Debug, Default)]
struct CompressionState {
    scaling_coeffs: ScalingCoeffs,
    worker_error: Vec<f32>,
    server_error: Vec<f32>,
}

/// The 1-bit Lamb optimizer.
///
/// Runs uncompressed Lamb until `freeze_step`, then averages a single fused, 1-bit
/// compressed momentum across ranks through `B` and rebuilds the second moment from
/// the reduced momentum to correct the frozen trust ratio.
pub struct OnebitLamb<B: CompressedBackend> {
    config: LambConfig,
    groups: Vec<ParamGroup>,
    store: ParameterStateStore,
    engine: LambTrustRatioEngine,
    backend: B,
    phase: Phase,
    initialized: bool,
    compression: CompressionState,
    backward_allreduce: BackwardAllreduce,
    lamb_coeffs: Vec<f32>,
}

impl<B: CompressedBackend> OnebitLamb<B> {
    /// Creates a new `OnebitLamb`.
    ///
    /// # Arguments
    /// * `groups` - The parameter groups to optimize, their order fixes the fused momentum layout
    ///   and must be the same on every rank.
    /// * `config` - The run's hyperparameters.
    /// * `backend` - The compressed reduction transport.
    ///
    /// # Returns
    /// A new `OnebitLamb` instance or a `LambErr::Config` if the configuration is invalid.
    pub fn new(groups: Vec<ParamGroup>, config: LambConfig, backend: B) -> Result<Self> {
        config.validate()?;

        if groups.iter().all(|group| group.params.is_empty()) {
            return Err(LambErr::Config(
                "at least one parameter is required".to_string(),
            ));
        }

        let world_size = backend.world_size();
        if world_size == 0 {
            return Err(LambErr::Config(
                "the backend reports an empty world".to_string(),
            ));
        }

        for (i, group) in groups.iter().enumerate() {
            group.options.validate()?;
            for (j, param) in group.params.iter().enumerate() {
                check_mask(group.exp_avg_mask.as_ref(), i, j, param.data.shape())?;
            }
        }

        let shapes = groups
            .iter()
            .map(|group| {
                group
                    .params
                    .iter()
                    .map(|param| param.data.shape().to_vec())
                    .collect()
            })
            .collect();

        Ok(Self {
            engine: LambTrustRatioEngine::new(&config),
            store: ParameterStateStore::new(shapes, world_size),
            config,
            groups,
            backend,
            phase: Phase::Warmup,
            initialized: false,
            compression: CompressionState::default(),
            backward_allreduce: BackwardAllreduce::new(),
            lamb_coeffs: Vec::new(),
        })
    }

    /// Performs a single optimization step.
    ///
    /// The first call only fuses the momentum and, with more than one rank, runs a
    /// throwaway reduction so every rank fixes the same buffer layout, no parameter
    /// is updated.
    ///
    /// Inputs are checked before any state is touched. A transport failure however
    /// surfaces after the local momentum was already updated, leaving the state
    /// inconsistent, the run must then resume from a checkpoint.
    ///
    /// # Arguments
    /// * `grads` - Optional gradient overrides, `None` reads every parameter's own gradient.
    ///
    /// # Returns
    /// An error if a gradient is sparse or misshaped, or if the reduction fails.
    pub async fn step(&mut self, grads: Option<GradientOverrides<'_>>) -> Result<()> {
        self.check_inputs(grads)?;
        self.lamb_coeffs.clear();

        if !self.initialized {
            return self.bootstrap(grads).await;
        }

        match self.phase {
            Phase::Warmup => self.warmup_step(grads)?,
            Phase::Compression => self.compression_step(grads).await?,
        }

        if self.phase == Phase::Warmup && self.store.max_step() >= self.config.freeze_step {
            self.enter_compression()?;
        }

        Ok(())
    }

    async fn bootstrap(&mut self, grads: Option<GradientOverrides<'_>>) -> Result<()> {
        for (i, group) in self.groups.iter().enumerate() {
            for (j, param) in group.params.iter().enumerate() {
                if dense_gradient(grads, &param.grad, i, j)?.is_some() {
                    self.store.get_or_init(i, j)?.state.step += 1;
                }
            }
        }

        let world_size = self.backend.world_size();
        let fused = self.store.momentum_mut().flatten();

        if world_size > 1 {
            let mut worker_error = vec![0.; fused.corrected_size()];
            let mut server_error = vec![0.; fused.chunk_size()];

            self.backend
                .compressed_allreduce(
                    fused.as_mut_slice(),
                    &mut worker_error,
                    &mut server_error,
                    self.config.local_rank,
                )
                .await?;
        }

        self.initialized = true;
        info!(rank = self.config.local_rank; "finished the initialization step");

        Ok(())
    }

    fn warmup_step(&mut self, grads: Option<GradientOverrides<'_>>) -> Result<()> {
        let Self {
            groups,
            store,
            engine,
            lamb_coeffs,
            ..
        } = self;

        for (i, group) in groups.iter_mut().enumerate() {
            let options = group.options;

            for (j, param) in group.params.iter_mut().enumerate() {
                let Parameter { data, grad } = param;
                let Some(grad) = dense_gradient(grads, grad, i, j)? else {
                    continue;
                };

                let entry = store.get_or_init(i, j)?;
                entry.state.step += 1;
                lamb_coeffs.push(engine.warmup(&options, entry, data, grad));
            }
        }

        Ok(())
    }

    async fn compression_step(&mut self, grads: Option<GradientOverrides<'_>>) -> Result<()> {
        let Self {
            config,
            groups,
            store,
            engine,
            backend,
            compression,
            lamb_coeffs,
            ..
        } = self;

        let previous = store.momentum().snapshot()?;

        if compression.scaling_coeffs.is_empty() {
            compression.scaling_coeffs = calibrate(store.momentum())?;
        }
        let coeffs = &compression.scaling_coeffs;

        for (i, group) in groups.iter().enumerate() {
            let beta1 = group.options.betas.0;

            for (j, param) in group.params.iter().enumerate() {
                let grad = dense_gradient(grads, &param.grad, i, j)?;
                let mut entry = store.get_or_init(i, j)?;

                if let Some(grad) = grad {
                    entry.state.step += 1;
                    LambTrustRatioEngine::local_momentum(beta1, &mut entry.momentum, grad);
                }

                let coeff = coeffs.get(i, j);
                entry.momentum.mapv_inplace(|m| m * coeff);
            }
        }

        let fused = store.momentum_mut().flatten();
        if compression.worker_error.is_empty() {
            compression.worker_error = vec![0.; fused.corrected_size()];
            compression.server_error = vec![0.; fused.chunk_size()];
        }

        if backend.world_size() > 1 {
            backend
                .compressed_allreduce(
                    fused.as_mut_slice(),
                    &mut compression.worker_error,
                    &mut compression.server_error,
                    config.local_rank,
                )
                .await?;
        }

        for (i, group) in groups.iter_mut().enumerate() {
            let options = group.options;
            let mask = group.exp_avg_mask.as_ref();

            for (j, param) in group.params.iter_mut().enumerate() {
                let mut entry = store.get_or_init(i, j)?;

                let coeff = coeffs.get(i, j);
                entry.momentum.mapv_inplace(|m| m / coeff);
                if let Some(mask) = mask {
                    entry.momentum.zip_mut_with(mask, |m, &k| *m *= k);
                }

                let lamb_coeff = engine.compression(&options, entry, &previous[i][j], &mut param.data);
                lamb_coeffs.push(lamb_coeff);
            }
        }

        let (min_factor, max_factor) = store
            .iter()
            .map(|state| state.last_factor)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), f| {
                (lo.min(f), hi.max(f))
            });
        debug!(
            step = store.max_step(),
            min_factor = min_factor,
            max_factor = max_factor;
            "compressed step applied"
        );

        Ok(())
    }

    fn enter_compression(&mut self) -> Result<()> {
        self.phase = Phase::Compression;
        self.backward_allreduce.set_enabled(false);
        self.store.momentum_mut().unflatten()?;
        self.compression = CompressionState::default();

        info!(
            step = self.store.max_step(),
            freeze_step = self.config.freeze_step;
            "warm-up finished, switching to compressed communication"
        );

        Ok(())
    }

    /// Checks every gradient, parameter and mask against the layout fixed at construction.
    fn check_inputs(&self, grads: Option<GradientOverrides<'_>>) -> Result<()> {
        if let Some(grads) = grads {
            if grads.len() != self.groups.len() {
                return Err(LambErr::GradientCount {
                    group: None,
                    got: grads.len(),
                    expected: self.groups.len(),
                });
            }

            for (i, (overrides, group)) in grads.iter().zip(&self.groups).enumerate() {
                if overrides.len() != group.params.len() {
                    return Err(LambErr::GradientCount {
                        group: Some(i),
                        got: overrides.len(),
                        expected: group.params.len(),
                    });
                }
            }
        }

        let shapes = self.store.momentum().shapes();
        for (i, group) in self.groups.iter().enumerate() {
            for (j, param) in group.params.iter().enumerate() {
                let expected = &shapes[i][j];
                if param.data.shape() != expected.as_slice() {
                    return Err(shape_mismatch("parameter", i, j, param.data.shape(), expected));
                }

                if let Some(grad) = dense_gradient(grads, &param.grad, i, j)?
                    && grad.shape() != expected.as_slice()
                {
                    return Err(shape_mismatch("gradient", i, j, grad.shape(), expected));
                }

                check_mask(group.exp_avg_mask.as_ref(), i, j, expected)?;
            }
        }

        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns whether the initialization step already ran.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &LambConfig {
        &self.config
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Returns a parameter so the training loop can update its gradient.
    ///
    /// # Panics
    /// If `group` or `param` is out of range.
    pub fn param_mut(&mut self, group: usize, param: usize) -> &mut Parameter {
        &mut self.groups[group].params[param]
    }

    /// Replaces a group's momentum mask.
    ///
    /// # Returns
    /// A `LambErr::GroupOutOfRange` if there is no such group, or a `LambErr::ShapeMismatch`
    /// if the mask does not broadcast to every parameter of the group.
    pub fn set_exp_avg_mask(&mut self, group: usize, mask: Option<ArrayD<f32>>) -> Result<()> {
        let groups = self.groups.len();
        let target = self
            .groups
            .get_mut(group)
            .ok_or(LambErr::GroupOutOfRange { group, groups })?;

        for (j, param) in target.params.iter().enumerate() {
            check_mask(mask.as_ref(), group, j, param.data.shape())?;
        }

        target.exp_avg_mask = mask;
        Ok(())
    }

    /// Returns the state of a parameter, `None` until its first step.
    pub fn state(&self, group: usize, param: usize) -> Option<&ParameterState> {
        self.store.get(group, param)
    }

    pub fn momentum(&self, group: usize, param: usize) -> Result<ArrayViewD<'_, f32>> {
        self.store.momentum().view(group, param)
    }

    /// Returns the scaling coefficients of the current compression stage, once calibrated.
    pub fn scaling_coeffs(&self) -> Option<&ScalingCoeffs> {
        let coeffs = &self.compression.scaling_coeffs;
        (!coeffs.is_empty()).then_some(coeffs)
    }

    pub fn worker_error(&self) -> &[f32] {
        &self.compression.worker_error
    }

    pub fn server_error(&self) -> &[f32] {
        &self.compression.server_error
    }

    /// Returns the trust ratios applied by the last step, in parameter order.
    pub fn lamb_coeffs(&self) -> &[f32] {
        &self.lamb_coeffs
    }

    /// Returns a handle on the switch of the training loop's raw gradient all-reduce.
    pub fn backward_allreduce(&self) -> BackwardAllreduce {
        self.backward_allreduce.clone()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Captures the optimizer's state, the compression state is only included while compressing.
    pub fn state_dict(&self) -> Result<Checkpoint> {
        let momentum = self.store.momentum();

        let state = self
            .groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                (0..group.params.len())
                    .map(|j| match self.store.get(i, j) {
                        Some(state) => {
                            let exp_avg = momentum.view(i, j)?.to_owned();
                            Ok(Some(StateRecord::new(state, exp_avg)))
                        }
                        None => Ok(None),
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let compression = (self.phase == Phase::Compression).then(|| CompressionRecord {
            worker_error: self.compression.worker_error.clone(),
            server_error: self.compression.server_error.clone(),
            scaling_coeffs: self.compression.scaling_coeffs.clone(),
        });

        Ok(Checkpoint {
            groups: self.groups.iter().map(|group| group.options).collect(),
            state,
            compression,
        })
    }

    /// Restores a state captured by `state_dict`.
    ///
    /// The fused momentum is always rebuilt on the next step. A checkpoint taken before
    /// `freeze_step` resumes the warm-up with reset trust ratio smoothing, any other
    /// checkpoint must carry the compression state. Momentum masks are kept from the
    /// live groups. Nothing is modified if the checkpoint is rejected.
    ///
    /// # Arguments
    /// * `checkpoint` - The state to restore.
    ///
    /// # Returns
    /// An error if the checkpoint does not fit the optimizer's parameters.
    pub fn load_state_dict(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let shapes = self.store.momentum().shapes().to_vec();
        check_checkpoint_layout(&checkpoint, &shapes)?;

        let step = checkpoint.step();
        let freeze_step = self.config.freeze_step;

        let compression = if step >= freeze_step {
            let record = checkpoint
                .compression
                .ok_or(LambErr::MissingCompressionState { step, freeze_step })?;
            self.check_compression_record(&record, &shapes)?;
            Some(record)
        } else {
            None
        };

        let has_state = checkpoint.state.iter().flatten().any(Option::is_some);

        for (group, options) in self.groups.iter_mut().zip(checkpoint.groups) {
            group.options = options;
        }

        let (states, momentum): (Vec<Vec<_>>, Vec<Vec<_>>) = checkpoint
            .state
            .into_iter()
            .zip(&shapes)
            .map(|(records, group_shapes)| {
                records
                    .into_iter()
                    .zip(group_shapes)
                    .map(|(record, shape)| match record {
                        Some(record) => {
                            let (state, exp_avg) = record.into_parts();
                            (Some(state), exp_avg)
                        }
                        None => (None, ArrayD::zeros(IxDyn(shape))),
                    })
                    .unzip::<_, _, Vec<_>, Vec<_>>()
            })
            .unzip();

        self.store.restore(states, momentum);
        self.initialized = has_state;

        match compression {
            Some(record) => {
                self.phase = Phase::Compression;
                self.backward_allreduce.set_enabled(false);
                self.compression = CompressionState {
                    scaling_coeffs: record.scaling_coeffs,
                    worker_error: record.worker_error,
                    server_error: record.server_error,
                };

                info!(step = step; "checkpoint loaded, compression stage continues");
            }
            None => {
                self.phase = Phase::Warmup;
                self.backward_allreduce.set_enabled(true);
                self.compression = CompressionState::default();
                self.store.iter_mut().for_each(ParameterState::reset_smoothing);

                info!(step = step; "checkpoint loaded, warm-up stage starts or continues");
            }
        }

        Ok(())
    }

    fn check_compression_record(
        &self,
        record: &CompressionRecord,
        shapes: &[Vec<Vec<usize>>],
    ) -> Result<()> {
        let (corrected, chunk) = self.store.momentum().fused_sizes();
        let (corrected, chunk) = if record.worker_error.is_empty() {
            (0, 0)
        } else {
            (corrected, chunk)
        };

        if record.worker_error.len() != corrected {
            return Err(LambErr::CheckpointLayout {
                what: "worker error",
                got: record.worker_error.len(),
                expected: corrected,
            });
        }

        if record.server_error.len() != chunk {
            return Err(LambErr::CheckpointLayout {
                what: "server error",
                got: record.server_error.len(),
                expected: chunk,
            });
        }

        let coeffs = &record.scaling_coeffs;
        if !coeffs.is_empty() && !coeffs.matches(shapes) {
            return Err(LambErr::CheckpointLayout {
                what: "scaling coefficients",
                got: coeffs.as_slice().iter().map(Vec::len).sum(),
                expected: shapes.iter().map(Vec::len).sum(),
            });
        }

        Ok(())
    }

    /// Writes the optimizer's state as json.
    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        self.state_dict()?.save(writer)
    }

    /// Restores a state written by `save`.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<()> {
        self.load_state_dict(Checkpoint::load(reader)?)
    }
}

/// Resolves the dense gradient of a parameter, overrides first.
fn dense_gradient<'a>(
    grads: Option<GradientOverrides<'a>>,
    own: &'a Option<Gradient>,
    group: usize,
    param: usize,
) -> Result<Option<&'a ArrayD<f32>>> {
    let grad = grads
        .and_then(|grads| grads[group][param].as_ref())
        .or(own.as_ref());

    match grad {
        None => Ok(None),
        Some(Gradient::Dense(grad)) => Ok(Some(grad)),
        Some(Gradient::Sparse(_)) => Err(LambErr::SparseGradient { group, param }),
    }
}

fn check_mask(mask: Option<&ArrayD<f32>>, group: usize, param: usize, shape: &[usize]) -> Result<()> {
    match mask {
        Some(mask) if mask.broadcast(IxDyn(shape)).is_none() => Err(shape_mismatch(
            "momentum mask",
            group,
            param,
            mask.shape(),
            shape,
        )),
        _ => Ok(()),
    }
}

fn check_checkpoint_layout(checkpoint: &Checkpoint, shapes: &[Vec<Vec<usize>>]) -> Result<()> {
    if checkpoint.groups.len() != shapes.len() {
        return Err(LambErr::CheckpointLayout {
            what: "groups",
            got: checkpoint.groups.len(),
            expected: shapes.len(),
        });
    }

    if checkpoint.state.len() != shapes.len() {
        return Err(LambErr::CheckpointLayout {
            what: "state groups",
            got: checkpoint.state.len(),
            expected: shapes.len(),
        });
    }

    for (options, (i, (records, shapes))) in checkpoint
        .groups
        .iter()
        .zip(checkpoint.state.iter().zip(shapes).enumerate())
    {
        options.validate()?;

        if records.len() != shapes.len() {
            return Err(LambErr::CheckpointLayout {
                what: "group parameters",
                got: records.len(),
                expected: shapes.len(),
            });
        }

        for (j, (record, shape)) in records.iter().zip(shapes).enumerate() {
            let Some(record) = record else {
                continue;
            };

            for (what, array) in [
                ("exp_avg", &record.exp_avg),
                ("exp_avg_sq", &record.exp_avg_sq),
                ("exp_avg_sq_back", &record.exp_avg_sq_back),
            ] {
                if array.shape() != shape.as_slice() {
                    return Err(shape_mismatch(what, i, j, array.shape(), shape));
                }
            }
        }
    }

    Ok(())
}

fn shape_mismatch(
    what: &'static str,
    group: usize,
    param: usize,
    got: &[usize],
    expected: &[usize],
) -> LambErr {
    LambErr::ShapeMismatch {
        what,
        group,
        param,
        got: got.to_vec(),
        expected: expected.to_vec(),
    }
}
